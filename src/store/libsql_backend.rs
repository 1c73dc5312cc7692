//! libSQL backend: async `PreferenceStore` implementation.
//!
//! Supports local file and in-memory databases. Every write is a single
//! autocommitted statement, so it is durable once `execute` returns.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::optout::{OptOutRecord, OptOutStats};
use crate::pipeline::types::{Decision, DecisionSource, Disposition, Message};
use crate::store::migrations;
use crate::store::traits::{PatternKind, Preference, PreferenceStore, StoredDecision};

/// Confidence of a newly learned preference.
const LEARNED_BASE_CONFIDENCE: f64 = 0.6;

/// Confidence added each time a preference is reinforced.
const LEARNED_STEP: f64 = 0.1;

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_disposition(s: &str) -> Result<Disposition, DatabaseError> {
    Disposition::parse(s)
        .ok_or_else(|| DatabaseError::Serialization(format!("unknown disposition '{s}'")))
}

fn row_to_opt_out(row: &libsql::Row) -> Result<OptOutRecord, libsql::Error> {
    let sender: String = row.get(0)?;
    let first: String = row.get(1)?;
    let last: String = row.get(2)?;
    let count: i64 = row.get(3)?;
    let escalated: i64 = row.get(4)?;
    Ok(OptOutRecord {
        sender,
        first_request: parse_datetime(&first),
        last_request: parse_datetime(&last),
        request_count: u32::try_from(count).unwrap_or(u32::MAX),
        escalated: escalated != 0,
    })
}

const PREFERENCE_COLUMNS: &str =
    "id, pattern_type, pattern_value, disposition, confidence, usage_count, updated_at";

fn row_to_preference(row: &libsql::Row) -> Result<Preference, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("preference row parse: {e}"));
    let id: i64 = row.get(0).map_err(read)?;
    let kind: String = row.get(1).map_err(read)?;
    let value: String = row.get(2).map_err(read)?;
    let disposition: String = row.get(3).map_err(read)?;
    let confidence: f64 = row.get(4).map_err(read)?;
    let usage: i64 = row.get(5).map_err(read)?;
    let updated: String = row.get(6).map_err(read)?;

    Ok(Preference {
        id,
        kind: PatternKind::parse(&kind)
            .ok_or_else(|| DatabaseError::Serialization(format!("unknown pattern type '{kind}'")))?,
        value,
        disposition: parse_disposition(&disposition)?,
        confidence: confidence as f32,
        usage_count: u32::try_from(usage).unwrap_or(u32::MAX),
        updated_at: parse_datetime(&updated),
    })
}

async fn collect_preferences(mut rows: libsql::Rows) -> Result<Vec<Preference>, DatabaseError> {
    let mut out = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("preferences: {e}")))?
    {
        out.push(row_to_preference(&row)?);
    }
    Ok(out)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl PreferenceStore for LibSqlBackend {
    // ── Decisions ───────────────────────────────────────────────────

    async fn record_decision(
        &self,
        decision: &Decision,
        message: &Message,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO decisions (message_id, disposition, source, sender, subject, decided_at, applied, applied_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, NULL)",
                params![
                    decision.message_id.clone(),
                    decision.disposition.as_str(),
                    decision.source.as_str(),
                    message.sender_key(),
                    message.subject.clone(),
                    decision.decided_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_decision: {e}")))?;

        debug!(
            id = %decision.message_id,
            disposition = %decision.disposition,
            source = decision.source.as_str(),
            "Decision recorded"
        );
        Ok(())
    }

    async fn mark_applied(&self, message_id: &str) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE decisions SET applied = 1, applied_at = ?1 WHERE message_id = ?2",
                params![Utc::now().to_rfc3339(), message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_applied: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "decision".into(),
                id: message_id.to_string(),
            });
        }
        Ok(())
    }

    async fn applied_message_ids(
        &self,
        message_ids: &[String],
    ) -> Result<HashSet<String>, DatabaseError> {
        let mut applied = HashSet::new();
        for id in message_ids {
            let mut rows = self
                .conn()
                .query(
                    "SELECT 1 FROM decisions WHERE message_id = ?1 AND applied = 1",
                    params![id.clone()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("applied_message_ids: {e}")))?;
            if rows
                .next()
                .await
                .map_err(|e| DatabaseError::Query(format!("applied_message_ids: {e}")))?
                .is_some()
            {
                applied.insert(id.clone());
            }
        }
        Ok(applied)
    }

    async fn get_decision(
        &self,
        message_id: &str,
    ) -> Result<Option<StoredDecision>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT message_id, disposition, source, sender, subject, decided_at, applied FROM decisions WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_decision: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_decision: {e}")))?
        else {
            return Ok(None);
        };

        let read = |e: libsql::Error| DatabaseError::Query(format!("get_decision row parse: {e}"));
        let id: String = row.get(0).map_err(read)?;
        let disposition: String = row.get(1).map_err(read)?;
        let source: String = row.get(2).map_err(read)?;
        let sender: String = row.get(3).map_err(read)?;
        let subject: String = row.get(4).map_err(read)?;
        let decided_at: String = row.get(5).map_err(read)?;
        let applied: i64 = row.get(6).map_err(read)?;

        Ok(Some(StoredDecision {
            decision: Decision {
                message_id: id,
                disposition: parse_disposition(&disposition)?,
                source: DecisionSource::parse(&source).ok_or_else(|| {
                    DatabaseError::Serialization(format!("unknown decision source '{source}'"))
                })?,
                decided_at: parse_datetime(&decided_at),
            },
            sender,
            subject,
            applied: applied != 0,
        }))
    }

    async fn decision_counts(&self) -> Result<Vec<(Disposition, u64)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT disposition, COUNT(*) FROM decisions GROUP BY disposition ORDER BY COUNT(*) DESC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("decision_counts: {e}")))?;

        let mut counts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("decision_counts: {e}")))?
        {
            let disposition: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("decision_counts: {e}")))?;
            let count: i64 = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("decision_counts: {e}")))?;
            counts.push((parse_disposition(&disposition)?, count.max(0) as u64));
        }
        Ok(counts)
    }

    // ── Opt-outs ────────────────────────────────────────────────────

    async fn get_opt_out(&self, sender: &str) -> Result<Option<OptOutRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT sender, first_request, last_request, request_count, escalated FROM opt_out_records WHERE sender = ?1",
                params![sender],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_opt_out: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let record = row_to_opt_out(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_opt_out row parse: {e}")))?;
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_opt_out: {e}"))),
        }
    }

    async fn put_opt_out(&self, record: &OptOutRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO opt_out_records (sender, first_request, last_request, request_count, escalated) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(sender) DO UPDATE SET
                    last_request = excluded.last_request,
                    request_count = MAX(request_count, excluded.request_count),
                    escalated = MAX(escalated, excluded.escalated)",
                params![
                    record.sender.clone(),
                    record.first_request.to_rfc3339(),
                    record.last_request.to_rfc3339(),
                    i64::from(record.request_count),
                    i64::from(record.escalated),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("put_opt_out: {e}")))?;
        Ok(())
    }

    async fn opt_out_stats(&self) -> Result<OptOutStats, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*), COALESCE(SUM(escalated), 0), COALESCE(SUM(request_count), 0) FROM opt_out_records",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("opt_out_stats: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("opt_out_stats: {e}")))?
        else {
            return Ok(OptOutStats::default());
        };
        let read = |e: libsql::Error| DatabaseError::Query(format!("opt_out_stats: {e}"));
        let senders: i64 = row.get(0).map_err(read)?;
        let escalated: i64 = row.get(1).map_err(read)?;
        let total: i64 = row.get(2).map_err(read)?;
        Ok(OptOutStats {
            senders: senders.max(0) as u64,
            escalated: escalated.max(0) as u64,
            total_requests: total.max(0) as u64,
        })
    }

    // ── Preferences ─────────────────────────────────────────────────

    async fn reinforce_preference(
        &self,
        kind: PatternKind,
        value: &str,
        disposition: Disposition,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO preferences (pattern_type, pattern_value, disposition, confidence, usage_count, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)
                 ON CONFLICT(pattern_type, pattern_value, disposition) DO UPDATE SET
                    confidence = MIN(1.0, confidence + ?6),
                    usage_count = usage_count + 1,
                    updated_at = excluded.updated_at",
                params![
                    kind.as_str(),
                    value.to_lowercase(),
                    disposition.as_str(),
                    LEARNED_BASE_CONFIDENCE,
                    now,
                    LEARNED_STEP,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reinforce_preference: {e}")))?;
        Ok(())
    }

    async fn find_preferences(
        &self,
        kind: PatternKind,
        value: &str,
    ) -> Result<Vec<Preference>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {PREFERENCE_COLUMNS} FROM preferences WHERE pattern_type = ?1 AND pattern_value = ?2 ORDER BY confidence DESC, usage_count DESC"
                ),
                params![kind.as_str(), value.to_lowercase()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_preferences: {e}")))?;
        collect_preferences(rows).await
    }

    async fn list_preferences(&self, limit: usize) -> Result<Vec<Preference>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {PREFERENCE_COLUMNS} FROM preferences ORDER BY confidence DESC, usage_count DESC, id ASC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_preferences: {e}")))?;
        collect_preferences(rows).await
    }

    async fn add_preference(
        &self,
        kind: PatternKind,
        value: &str,
        disposition: Disposition,
        confidence: f32,
    ) -> Result<i64, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO preferences (pattern_type, pattern_value, disposition, confidence, usage_count, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)
                 ON CONFLICT(pattern_type, pattern_value, disposition) DO UPDATE SET
                    confidence = excluded.confidence,
                    updated_at = excluded.updated_at
                 RETURNING id",
                params![
                    kind.as_str(),
                    value.to_lowercase(),
                    disposition.as_str(),
                    f64::from(confidence.clamp(0.0, 1.0)),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_preference: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("add_preference: {e}")))?
            .ok_or_else(|| DatabaseError::Query("add_preference: no id returned".into()))?;
        row.get::<i64>(0)
            .map_err(|e| DatabaseError::Query(format!("add_preference: {e}")))
    }

    async fn delete_preference(&self, id: i64) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute("DELETE FROM preferences WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_preference: {e}")))?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn message(id: &str, sender: &str, subject: &str) -> Message {
        Message {
            id: id.into(),
            sender: sender.into(),
            sender_name: None,
            subject: subject.into(),
            snippet: String::new(),
            thread_id: id.into(),
            received_at: Utc::now(),
            has_unsubscribe: false,
            disposition: None,
        }
    }

    fn decision(id: &str, disposition: Disposition, source: DecisionSource) -> Decision {
        Decision {
            message_id: id.into(),
            disposition,
            source,
            decided_at: Utc::now(),
        }
    }

    // ── Decisions ───────────────────────────────────────────────────

    #[tokio::test]
    async fn record_and_get_decision() {
        let db = test_db().await;
        let msg = message("101", "Deals <DEALS@shop.com>", "Big sale");
        db.record_decision(&decision("101", Disposition::Trash, DecisionSource::Bulk), &msg)
            .await
            .unwrap();

        let stored = db.get_decision("101").await.unwrap().unwrap();
        assert_eq!(stored.decision.disposition, Disposition::Trash);
        assert_eq!(stored.decision.source, DecisionSource::Bulk);
        assert_eq!(stored.sender, "deals@shop.com");
        assert_eq!(stored.subject, "Big sale");
        assert!(!stored.applied);

        assert!(db.get_decision("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn applied_ids_only_include_applied_decisions() {
        let db = test_db().await;
        for id in ["1", "2", "3"] {
            db.record_decision(
                &decision(id, Disposition::Revisit, DecisionSource::Manual),
                &message(id, "a@b.com", "s"),
            )
            .await
            .unwrap();
        }
        db.mark_applied("2").await.unwrap();

        let ids: Vec<String> = ["1", "2", "3", "4"].iter().map(|s| s.to_string()).collect();
        let applied = db.applied_message_ids(&ids).await.unwrap();
        assert_eq!(applied.len(), 1);
        assert!(applied.contains("2"));
        assert!(db.get_decision("2").await.unwrap().unwrap().applied);
    }

    #[tokio::test]
    async fn mark_applied_unknown_is_not_found() {
        let db = test_db().await;
        let err = db.mark_applied("ghost").await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn decision_counts_group_by_disposition() {
        let db = test_db().await;
        let entries = [
            ("1", Disposition::Trash),
            ("2", Disposition::Trash),
            ("3", Disposition::Action),
        ];
        for (id, d) in entries {
            db.record_decision(&decision(id, d, DecisionSource::Auto), &message(id, "a@b.com", "s"))
                .await
                .unwrap();
        }
        let counts = db.decision_counts().await.unwrap();
        assert_eq!(counts[0], (Disposition::Trash, 2));
        assert!(counts.contains(&(Disposition::Action, 1)));
    }

    // ── Opt-outs ────────────────────────────────────────────────────

    #[tokio::test]
    async fn opt_out_round_trip_and_stats() {
        let db = test_db().await;
        let now = Utc::now();
        let record = OptOutRecord {
            sender: "promo@x.com".into(),
            first_request: now,
            last_request: now,
            request_count: 1,
            escalated: false,
        };
        db.put_opt_out(&record).await.unwrap();

        let updated = OptOutRecord {
            last_request: now + Duration::days(9),
            request_count: 2,
            escalated: true,
            ..record.clone()
        };
        db.put_opt_out(&updated).await.unwrap();

        let stored = db.get_opt_out("promo@x.com").await.unwrap().unwrap();
        assert_eq!(stored.request_count, 2);
        assert!(stored.escalated);
        assert_eq!(stored.first_request.timestamp(), now.timestamp());

        let stats = db.opt_out_stats().await.unwrap();
        assert_eq!(stats.senders, 1);
        assert_eq!(stats.escalated, 1);
        assert_eq!(stats.total_requests, 2);
    }

    #[tokio::test]
    async fn opt_out_never_regresses_in_store() {
        let db = test_db().await;
        let now = Utc::now();
        let escalated = OptOutRecord {
            sender: "a@b.com".into(),
            first_request: now,
            last_request: now,
            request_count: 5,
            escalated: true,
        };
        db.put_opt_out(&escalated).await.unwrap();
        db.put_opt_out(&OptOutRecord {
            request_count: 1,
            escalated: false,
            ..escalated.clone()
        })
        .await
        .unwrap();

        let stored = db.get_opt_out("a@b.com").await.unwrap().unwrap();
        assert_eq!(stored.request_count, 5);
        assert!(stored.escalated);
    }

    #[tokio::test]
    async fn empty_opt_out_stats() {
        let db = test_db().await;
        assert_eq!(db.opt_out_stats().await.unwrap(), OptOutStats::default());
    }

    // ── Preferences ─────────────────────────────────────────────────

    #[tokio::test]
    async fn reinforce_grows_confidence_and_usage() {
        let db = test_db().await;
        for _ in 0..3 {
            db.reinforce_preference(PatternKind::Sender, "Deals@Shop.com", Disposition::Trash)
                .await
                .unwrap();
        }
        let prefs = db
            .find_preferences(PatternKind::Sender, "deals@shop.com")
            .await
            .unwrap();
        assert_eq!(prefs.len(), 1);
        assert_eq!(prefs[0].usage_count, 3);
        assert!((prefs[0].confidence - 0.8).abs() < 1e-4);
        assert_eq!(prefs[0].disposition, Disposition::Trash);
    }

    #[tokio::test]
    async fn reinforce_caps_at_one() {
        let db = test_db().await;
        for _ in 0..10 {
            db.reinforce_preference(PatternKind::Domain, "shop.com", Disposition::Trash)
                .await
                .unwrap();
        }
        let prefs = db.find_preferences(PatternKind::Domain, "shop.com").await.unwrap();
        assert!(prefs[0].confidence <= 1.0);
        assert!(prefs[0].confidence > 0.99);
    }

    #[tokio::test]
    async fn add_list_delete_preferences() {
        let db = test_db().await;
        let id = db
            .add_preference(PatternKind::SubjectKeyword, "invoice", Disposition::Action, 0.9)
            .await
            .unwrap();
        db.reinforce_preference(PatternKind::Sender, "a@b.com", Disposition::Revisit)
            .await
            .unwrap();

        let all = db.list_preferences(10).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, id);
        assert_eq!(all[0].kind, PatternKind::SubjectKeyword);

        assert!(db.delete_preference(id).await.unwrap());
        assert!(!db.delete_preference(id).await.unwrap());
        assert_eq!(db.list_preferences(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn local_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("triage.db");

        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.reinforce_preference(PatternKind::Domain, "news.io", Disposition::Trash)
                .await
                .unwrap();
        }

        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let prefs = db.find_preferences(PatternKind::Domain, "news.io").await.unwrap();
        assert_eq!(prefs.len(), 1);
    }
}
