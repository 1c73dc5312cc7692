//! CLI entry point for `inbox-triage`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;

use inbox_triage::channels::{Console, ImapInbox};
use inbox_triage::config::TriageConfig;
use inbox_triage::llm::create_provider;
use inbox_triage::pipeline::{Classifier, Disposition, HeuristicClassifier, LlmClassifier};
use inbox_triage::session::{TerminalKeys, TriageSession};
use inbox_triage::store::{LibSqlBackend, PatternKind, PreferenceStore};
use inbox_triage::voice::{VoiceBackend, create_renderer};

#[derive(Parser)]
#[command(name = "inbox-triage", version, about = "Triage your inbox by voice and single keypresses")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Messages per batch
    #[arg(short, long, global = true)]
    batch_size: Option<usize>,

    /// Auto-apply confidence threshold (0.0 - 1.0)
    #[arg(short, long, global = true)]
    threshold: Option<f32>,

    /// Print narration instead of speaking it
    #[arg(long, global = true)]
    no_voice: bool,

    /// Mirror logs to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory for the database and log file
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive triage session (default)
    Run,
    /// Show decision and opt-out statistics
    Stats,
    /// Inspect or edit learned preferences
    Prefs {
        #[command(subcommand)]
        action: PrefsAction,
    },
}

#[derive(Subcommand)]
enum PrefsAction {
    /// List the strongest preferences
    List {
        #[arg(short, long, default_value_t = 25)]
        limit: usize,
    },
    /// Add a preference by hand
    Add {
        /// sender, domain or subject_keyword
        kind: String,
        value: String,
        /// trash, revisit or action
        label: String,
        #[arg(short, long, default_value_t = 0.9)]
        confidence: f32,
    },
    /// Delete a preference by id
    Delete { id: i64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // rustls needs a process-wide provider before the first IMAP connection
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let mut config = TriageConfig::from_env()?;
    if let Some(dir) = cli.data_dir {
        config = config.with_data_dir(dir);
    }
    if let Some(size) = cli.batch_size {
        if size == 0 {
            bail!("--batch-size must be at least 1");
        }
        config.batch_size = size;
    }
    if let Some(threshold) = cli.threshold {
        if !(0.0..=1.0).contains(&threshold) {
            bail!("--threshold must be between 0.0 and 1.0");
        }
        config.threshold = threshold;
    }
    if cli.no_voice {
        config.voice = VoiceBackend::Console;
    }

    let _guard = setup_logging(&config.data_dir, cli.verbose);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cmd_run(config).await,
        Commands::Stats => cmd_stats(&config).await,
        Commands::Prefs { action } => cmd_prefs(&config, action).await,
    }
}

/// Log to `<data_dir>/inbox-triage.log`; stderr only with `--verbose`
/// since the session owns the terminal in raw mode.
fn setup_logging(data_dir: &Path, verbose: bool) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let stderr_layer = verbose.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    if std::fs::create_dir_all(data_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(data_dir, "inbox-triage.log");
        let (writer, guard) = tracing_appender::non_blocking(file_appender);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
        None
    }
}

async fn open_store(config: &TriageConfig) -> anyhow::Result<Arc<dyn PreferenceStore>> {
    let store = LibSqlBackend::new_local(&config.db_path)
        .await
        .with_context(|| format!("opening database at {}", config.db_path.display()))?;
    Ok(Arc::new(store))
}

async fn cmd_run(config: TriageConfig) -> anyhow::Result<()> {
    let Some(imap) = config.imap.clone() else {
        bail!("IMAP_HOST is not set; export IMAP_HOST, IMAP_USERNAME and IMAP_PASSWORD");
    };

    let store = open_store(&config).await?;

    let classifier: Arc<dyn Classifier> = match &config.llm {
        Some(llm) => {
            let provider = create_provider(llm)?;
            Arc::new(LlmClassifier::new(provider).with_store(Arc::clone(&store)))
        }
        None => {
            tracing::info!("ANTHROPIC_API_KEY not set, using heuristic classifier");
            Arc::new(HeuristicClassifier::default_rules().with_store(Arc::clone(&store)))
        }
    };

    eprintln!("📬 Inbox Triage v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Mailbox: {} on {}", imap.mailbox, imap.host);
    eprintln!(
        "   Classifier: {}",
        config.llm.as_ref().map(|l| l.model.as_str()).unwrap_or("heuristic rules")
    );
    eprintln!("   Batch size: {}, threshold: {:.2}", config.batch_size, config.threshold);
    eprintln!("   Log: {}\n", config.data_dir.join("inbox-triage.log").display());

    let inbox = Arc::new(ImapInbox::new(imap));
    let voice = create_renderer(&config.voice);
    let keys = TerminalKeys::start()?;

    let mut session = TriageSession::new(inbox, classifier, store, voice, Box::new(keys))
        .with_threshold(config.threshold)
        .with_grace_days(config.grace_days)
        .with_console(Console::new());

    let result = session.run(config.batch_size).await;
    // Leave raw mode before printing the summary.
    drop(session);

    let summary = result?;
    println!("\n{summary}");
    Ok(())
}

async fn cmd_stats(config: &TriageConfig) -> anyhow::Result<()> {
    let store = open_store(config).await?;

    let counts = store.decision_counts().await?;
    let total: u64 = counts.iter().map(|(_, n)| n).sum();
    println!("Decisions recorded: {total}");
    for (disposition, n) in &counts {
        println!("  {:<8} {n}", disposition.as_str());
    }

    let opt_outs = store.opt_out_stats().await?;
    println!(
        "Opt-outs: {} sender(s), {} request(s), {} escalated to spam",
        opt_outs.senders, opt_outs.total_requests, opt_outs.escalated
    );

    let prefs = store.list_preferences(5).await?;
    if !prefs.is_empty() {
        println!("Strongest preferences:");
        for p in prefs {
            println!(
                "  {:<16} {:<32} -> {:<8} ({:.2}, used {}x)",
                p.kind.as_str(),
                p.value,
                p.disposition.as_str(),
                p.confidence,
                p.usage_count
            );
        }
    }
    Ok(())
}

async fn cmd_prefs(config: &TriageConfig, action: PrefsAction) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    match action {
        PrefsAction::List { limit } => {
            let prefs = store.list_preferences(limit).await?;
            if prefs.is_empty() {
                println!("No preferences learned yet.");
            }
            for p in prefs {
                println!(
                    "{:>5}  {:<16} {:<32} -> {:<8} {:.2}  used {}x  {}",
                    p.id,
                    p.kind.as_str(),
                    p.value,
                    p.disposition.as_str(),
                    p.confidence,
                    p.usage_count,
                    p.updated_at.format("%Y-%m-%d")
                );
            }
        }
        PrefsAction::Add {
            kind,
            value,
            label,
            confidence,
        } => {
            let Some(kind) = PatternKind::parse(&kind) else {
                bail!("unknown pattern kind {kind:?} (sender, domain, subject_keyword)");
            };
            let disposition = match Disposition::parse(&label.to_lowercase()) {
                Some(d @ (Disposition::Trash | Disposition::Revisit | Disposition::Action)) => d,
                _ => bail!("unknown label {label:?} (trash, revisit, action)"),
            };
            if !(0.0..=1.0).contains(&confidence) {
                bail!("confidence must be between 0.0 and 1.0");
            }
            let value = value.trim().to_lowercase();
            let id = store
                .add_preference(kind, &value, disposition, confidence)
                .await?;
            println!("Added preference #{id}: {kind} {value} -> {disposition}");
        }
        PrefsAction::Delete { id } => {
            if store.delete_preference(id).await? {
                println!("Deleted preference #{id}");
            } else {
                bail!("no preference with id {id}");
            }
        }
    }
    Ok(())
}
