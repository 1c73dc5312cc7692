//! IMAP inbox: fetch untriaged mail and carry out dispositions.
//!
//! Speaks raw IMAP4rev1 over TLS (rustls + webpki roots). All socket I/O is
//! blocking and runs on `spawn_blocking`. Each call opens its own session.
//!
//! Triage state lives on the server as keywords, so a message tagged in an
//! earlier session is never offered again.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{Mailbox, header::ContentType};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::channels::parse::parse_message;
use crate::error::InboxError;
use crate::optout::erasure_draft;
use crate::pipeline::types::{Disposition, InboxProvider, Message};

const KEYWORD_REVISIT: &str = "TriageRevisit";
const KEYWORD_ACTION: &str = "TriageAction";
const KEYWORD_OPT_OUT: &str = "TriageOptOut";

const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Mailbox settings.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub mailbox: String,
    pub trash_folder: String,
    pub archive_folder: String,
    pub spam_folder: String,
    pub drafts_folder: String,
    /// Sender address for erasure drafts. Defaults to the username.
    pub from_address: String,
}

impl ImapConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>, password: SecretString) -> Self {
        let username = username.into();
        Self {
            host: host.into(),
            port: 993,
            from_address: username.clone(),
            username,
            password,
            mailbox: "INBOX".into(),
            trash_folder: "Trash".into(),
            archive_folder: "Archive".into(),
            spam_folder: "Junk".into(),
            drafts_folder: "Drafts".into(),
        }
    }
}

pub struct ImapInbox {
    config: ImapConfig,
}

impl ImapInbox {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, InboxError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession) -> Result<T, InboxError> + Send + 'static,
    {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::open(&config)?;
            let result = op(&mut session);
            session.logout();
            result
        })
        .await
        .map_err(|e| InboxError::Protocol(format!("IMAP task failed: {e}")))?
    }
}

#[async_trait]
impl InboxProvider for ImapInbox {
    fn name(&self) -> &str {
        "imap"
    }

    async fn fetch_unprocessed(&self, limit: usize) -> Result<Vec<Message>, InboxError> {
        let messages = self
            .blocking(move |s| {
                let response = s.command(&format!(
                    "UID SEARCH NOT DELETED NOT KEYWORD {KEYWORD_REVISIT} \
                     NOT KEYWORD {KEYWORD_ACTION} NOT KEYWORD {KEYWORD_OPT_OUT}"
                ))?;
                response.expect_ok("search")?;
                let uids = parse_search(&response.untagged);

                let mut messages = Vec::new();
                for uid in uids.into_iter().take(limit) {
                    let fetch = s.command(&format!("UID FETCH {uid} (UID BODY.PEEK[])"))?;
                    if fetch.status != Status::Ok {
                        warn!(uid, "Fetch failed: {}", fetch.text);
                        continue;
                    }
                    let Some(raw) = fetch.literals.first() else {
                        warn!(uid, "Fetch returned no body");
                        continue;
                    };
                    match parse_message(&uid.to_string(), raw) {
                        Some(m) => messages.push(m),
                        None => warn!(uid, "Unparseable message skipped"),
                    }
                }
                Ok(messages)
            })
            .await?;

        info!(count = messages.len(), "Fetched untriaged messages");
        Ok(messages)
    }

    async fn apply_disposition(
        &self,
        message: &Message,
        disposition: Disposition,
    ) -> Result<(), InboxError> {
        let uid: u32 = message.id.parse().map_err(|_| InboxError::Apply {
            message_id: message.id.clone(),
            disposition: disposition.to_string(),
            reason: "not an IMAP UID".into(),
        })?;
        let config = self.config.clone();
        let draft = (disposition == Disposition::OptOut)
            .then(|| build_erasure_draft(&config.from_address, message))
            .transpose()?;
        let message_id = message.id.clone();

        self.blocking(move |s| {
            let fail = |reason: String| InboxError::Apply {
                message_id: message_id.clone(),
                disposition: disposition.to_string(),
                reason,
            };
            match disposition {
                Disposition::Trash => {
                    s.store_flags(uid, "\\Seen").map_err(&fail)?;
                    s.move_message(uid, &config.trash_folder).map_err(&fail)?;
                }
                Disposition::Revisit => {
                    s.store_flags(uid, KEYWORD_REVISIT).map_err(&fail)?;
                    s.move_message(uid, &config.archive_folder).map_err(&fail)?;
                }
                Disposition::Action => {
                    s.store_flags(uid, &format!("{KEYWORD_ACTION} \\Flagged"))
                        .map_err(&fail)?;
                }
                Disposition::OptOut => {
                    s.store_flags(uid, KEYWORD_OPT_OUT).map_err(&fail)?;
                    if let Some(draft) = &draft {
                        s.append(&config.drafts_folder, "(\\Draft \\Seen)", draft)
                            .map_err(&fail)?;
                    }
                    s.move_message(uid, &config.archive_folder).map_err(&fail)?;
                }
                Disposition::Spam => {
                    s.move_message(uid, &config.spam_folder).map_err(&fail)?;
                }
            }
            Ok(())
        })
        .await?;

        debug!(id = %message.id, %disposition, "Disposition applied");
        Ok(())
    }
}

/// RFC 822 bytes of the erasure request reply.
fn build_erasure_draft(from: &str, message: &Message) -> Result<Vec<u8>, InboxError> {
    let draft = erasure_draft(&message.sender, &message.subject);
    let invalid = |what: &str, e: &dyn std::fmt::Display| InboxError::Apply {
        message_id: message.id.clone(),
        disposition: Disposition::OptOut.to_string(),
        reason: format!("invalid {what}: {e}"),
    };
    let from: Mailbox = from.parse().map_err(|e| invalid("from address", &e))?;
    let to: Mailbox = draft.to.parse().map_err(|e| invalid("sender address", &e))?;

    let email = lettre::Message::builder()
        .from(from)
        .to(to)
        .subject(draft.subject)
        .header(ContentType::TEXT_PLAIN)
        .body(draft.body)
        .map_err(|e| invalid("draft", &e))?;
    Ok(email.formatted())
}

// ── Protocol ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    No,
    Bad,
}

#[derive(Debug)]
struct Response {
    status: Status,
    /// Text after the status word on the tagged line.
    text: String,
    untagged: Vec<String>,
    literals: Vec<Vec<u8>>,
}

impl Response {
    fn expect_ok(&self, what: &str) -> Result<(), InboxError> {
        if self.status == Status::Ok {
            Ok(())
        } else {
            Err(InboxError::Protocol(format!("{what} failed: {}", self.text)))
        }
    }
}

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// One authenticated connection with the mailbox selected.
struct ImapSession<S = TlsStream> {
    stream: BufReader<S>,
    next_tag: u32,
}

impl ImapSession<TlsStream> {
    fn open(config: &ImapConfig) -> Result<Self, InboxError> {
        if config.username.is_empty() || config.password.expose_secret().is_empty() {
            return Err(InboxError::InvalidCredentials(
                "IMAP username and password are required".into(),
            ));
        }
        let connection_err = |reason: String| InboxError::Connection {
            host: config.host.clone(),
            reason,
        };

        let tcp = TcpStream::connect((config.host.as_str(), config.port))
            .map_err(|e| connection_err(e.to_string()))?;
        tcp.set_read_timeout(Some(READ_TIMEOUT))?;

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(config.host.clone())
            .map_err(|e| connection_err(e.to_string()))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| connection_err(e.to_string()))?;

        let mut session = Self {
            stream: BufReader::new(rustls::StreamOwned::new(conn, tcp)),
            next_tag: 1,
        };

        let greeting = session.read_line()?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(connection_err(format!("unexpected greeting: {}", greeting.trim())));
        }

        let login = session.command(&format!(
            "LOGIN {} {}",
            quote(&config.username),
            quote(config.password.expose_secret())
        ))?;
        if login.status != Status::Ok {
            return Err(InboxError::AuthFailed {
                account: config.username.clone(),
                reason: login.text,
            });
        }

        session
            .command(&format!("SELECT {}", quote(&config.mailbox)))?
            .expect_ok("select")?;
        debug!(host = %config.host, mailbox = %config.mailbox, "IMAP session open");
        Ok(session)
    }
}

impl<S: Read + Write> ImapSession<S> {
    fn tag(&mut self) -> String {
        let tag = format!("T{}", self.next_tag);
        self.next_tag += 1;
        tag
    }

    fn read_line(&mut self) -> Result<String, InboxError> {
        let mut buf = Vec::new();
        let n = self.stream.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Err(InboxError::Protocol("IMAP connection closed".into()));
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), InboxError> {
        let stream = self.stream.get_mut();
        stream.write_all(bytes)?;
        stream.flush()?;
        Ok(())
    }

    fn command(&mut self, cmd: &str) -> Result<Response, InboxError> {
        let tag = self.tag();
        self.send(format!("{tag} {cmd}\r\n").as_bytes())?;
        self.read_response(&tag)
    }

    fn read_response(&mut self, tag: &str) -> Result<Response, InboxError> {
        let mut untagged = Vec::new();
        let mut literals = Vec::new();
        loop {
            let line = self.read_line()?;
            if let Some(len) = literal_len(&line) {
                let mut buf = vec![0u8; len];
                self.stream.read_exact(&mut buf)?;
                literals.push(buf);
                untagged.push(line);
                continue;
            }
            if let Some(rest) = line.strip_prefix(tag).and_then(|r| r.strip_prefix(' ')) {
                let (status, text) = parse_status(rest);
                return Ok(Response {
                    status,
                    text,
                    untagged,
                    literals,
                });
            }
            untagged.push(line);
        }
    }

    fn store_flags(&mut self, uid: u32, flags: &str) -> Result<(), String> {
        let r = self
            .command(&format!("UID STORE {uid} +FLAGS.SILENT ({flags})"))
            .map_err(|e| e.to_string())?;
        if r.status == Status::Ok {
            Ok(())
        } else {
            Err(format!("STORE {flags}: {}", r.text))
        }
    }

    /// MOVE, or COPY + delete + UID EXPUNGE on servers without MOVE.
    fn move_message(&mut self, uid: u32, folder: &str) -> Result<(), String> {
        let r = self
            .command(&format!("UID MOVE {uid} {}", quote(folder)))
            .map_err(|e| e.to_string())?;
        if r.status == Status::Ok {
            return Ok(());
        }
        debug!(uid, "MOVE unsupported ({}), falling back to COPY", r.text.trim());

        let r = self
            .command(&format!("UID COPY {uid} {}", quote(folder)))
            .map_err(|e| e.to_string())?;
        if r.status != Status::Ok {
            return Err(format!("COPY to {folder}: {}", r.text));
        }
        self.store_flags(uid, "\\Deleted")?;
        let r = self
            .command(&format!("UID EXPUNGE {uid}"))
            .map_err(|e| e.to_string())?;
        if r.status != Status::Ok {
            // A bare EXPUNGE would purge every \Deleted message in the mailbox.
            warn!(
                uid,
                "UID EXPUNGE refused ({}), original left marked \\Deleted",
                r.text.trim()
            );
        }
        Ok(())
    }

    fn append(&mut self, folder: &str, flags: &str, message: &[u8]) -> Result<(), String> {
        let tag = self.tag();
        let head = format!("{tag} APPEND {} {flags} {{{}}}\r\n", quote(folder), message.len());
        self.send(head.as_bytes()).map_err(|e| e.to_string())?;

        let cont = self.read_line().map_err(|e| e.to_string())?;
        if !cont.starts_with('+') {
            return Err(format!("APPEND refused: {}", cont.trim()));
        }
        self.send(message).map_err(|e| e.to_string())?;
        self.send(b"\r\n").map_err(|e| e.to_string())?;

        let r = self.read_response(&tag).map_err(|e| e.to_string())?;
        if r.status == Status::Ok {
            Ok(())
        } else {
            Err(format!("APPEND to {folder}: {}", r.text))
        }
    }

    fn logout(&mut self) {
        let _ = self.command("LOGOUT");
    }
}

/// Quote an IMAP string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// `Some(n)` when the line announces an `{n}` literal.
fn literal_len(line: &str) -> Option<usize> {
    let line = line.trim_end_matches(['\r', '\n']);
    let inner = line.strip_suffix('}')?;
    let start = inner.rfind('{')?;
    inner[start + 1..].trim_end_matches('+').parse().ok()
}

fn parse_status(rest: &str) -> (Status, String) {
    let rest = rest.trim_end();
    let (word, text) = rest.split_once(' ').unwrap_or((rest, ""));
    let status = match word.to_ascii_uppercase().as_str() {
        "OK" => Status::Ok,
        "NO" => Status::No,
        _ => Status::Bad,
    };
    (status, text.to_string())
}

fn parse_search(lines: &[String]) -> Vec<u32> {
    lines
        .iter()
        .filter_map(|l| l.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|t| t.parse().ok()))
        .collect()
}
