//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! reused for all operations; `libsql::Connection` is `Send + Sync` and
//! safe for concurrent async use.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::crm::{
    BudgetTier, DecisionOutcome, DecisionPoint, FollowupPreset, Lead, LeadMemory, LeadStage,
    LeadTag, MessageRole, PolicyDecision, ReasonCode, StrategyStatus, StrategyVersion,
    ThreadMessage, Workspace,
};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::Database;

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

        set_foreign_keys_off(&conn).await?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
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

        set_foreign_keys_off(&conn).await?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

/// Match SQLite's documented default of foreign-key enforcement being off.
///
/// The backend detects missing parent rows explicitly (e.g. via UPDATE
/// row-counts returning `NotFound`) rather than relying on FK errors, so
/// enforcement is left off to preserve that behaviour regardless of the
/// libSQL build's compile-time default.
async fn set_foreign_keys_off(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute("PRAGMA foreign_keys = OFF", ())
        .await
        .map_err(|e| DatabaseError::Pool(format!("Failed to disable foreign keys: {e}")))?;
    Ok(())
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
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<DateTime<Utc>>` to libsql Value.
fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(dt.to_rfc3339()),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

const LEAD_COLUMNS: &str = "id, workspace_id, display_name, stage, tags, opted_out, timezone, last_followup_at, next_followup_at, last_inbound_at, created_at, updated_at";

const WORKSPACE_COLUMNS: &str =
    "id, name, budget_tier, followup_preset, sunday_hold, agent_id, created_at, updated_at";

const STRATEGY_COLUMNS: &str = "id, workspace_id, version, status, tone, objectives, objection_handling, call_to_action, created_at, updated_at";

/// Map a libsql Row to a Lead. Column order matches LEAD_COLUMNS.
fn row_to_lead(row: &libsql::Row) -> Result<Lead, libsql::Error> {
    let id_str: String = row.get(0)?;
    let workspace_str: String = row.get(1)?;
    let stage_str: String = row.get(3)?;
    let tags_str: String = row.get(4)?;
    let opted_out: i64 = row.get(5)?;
    let last_followup: Option<String> = row.get(7).ok();
    let next_followup: Option<String> = row.get(8).ok();
    let last_inbound: Option<String> = row.get(9).ok();
    let created_str: String = row.get(10)?;
    let updated_str: String = row.get(11)?;

    let tags: Vec<LeadTag> = serde_json::from_str(&tags_str).unwrap_or_default();

    Ok(Lead {
        id: parse_uuid(&id_str),
        workspace_id: parse_uuid(&workspace_str),
        display_name: row.get(2)?,
        stage: LeadStage::parse(&stage_str),
        tags,
        opted_out: opted_out != 0,
        timezone: row.get(6)?,
        last_followup_at: parse_optional_datetime(&last_followup),
        next_followup_at: parse_optional_datetime(&next_followup),
        last_inbound_at: parse_optional_datetime(&last_inbound),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to a Workspace. Column order matches WORKSPACE_COLUMNS.
fn row_to_workspace(row: &libsql::Row) -> Result<Workspace, libsql::Error> {
    let id_str: String = row.get(0)?;
    let tier_str: String = row.get(2)?;
    let preset_str: String = row.get(3)?;
    let sunday_hold: i64 = row.get(4)?;
    let created_str: String = row.get(6)?;
    let updated_str: String = row.get(7)?;

    Ok(Workspace {
        id: parse_uuid(&id_str),
        name: row.get(1)?,
        budget_tier: BudgetTier::parse(&tier_str),
        followup_preset: FollowupPreset::parse(&preset_str),
        sunday_hold: sunday_hold != 0,
        agent_id: row.get(5)?,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to a StrategyVersion. Column order matches STRATEGY_COLUMNS.
fn row_to_strategy(row: &libsql::Row) -> Result<StrategyVersion, libsql::Error> {
    let id_str: String = row.get(0)?;
    let workspace_str: String = row.get(1)?;
    let status_str: String = row.get(3)?;
    let created_str: String = row.get(8)?;
    let updated_str: String = row.get(9)?;

    Ok(StrategyVersion {
        id: parse_uuid(&id_str),
        workspace_id: parse_uuid(&workspace_str),
        version: row.get(2)?,
        status: StrategyStatus::parse(&status_str),
        tone: row.get(4)?,
        objectives: row.get(5)?,
        objection_handling: row.get(6)?,
        call_to_action: row.get(7)?,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to a ThreadMessage (id, lead_id, role, content, created_at).
fn row_to_thread_message(row: &libsql::Row) -> Result<ThreadMessage, libsql::Error> {
    let id_str: String = row.get(0)?;
    let lead_str: String = row.get(1)?;
    let role_str: String = row.get(2)?;
    let created_str: String = row.get(4)?;

    Ok(ThreadMessage {
        id: parse_uuid(&id_str),
        lead_id: parse_uuid(&lead_str),
        role: MessageRole::parse(&role_str),
        content: row.get(3)?,
        created_at: parse_datetime(&created_str),
    })
}

/// Map a libsql Row to a PolicyDecision
/// (id, lead_id, workspace_id, point, outcome, reason, draft, created_at).
fn row_to_decision(row: &libsql::Row) -> Result<PolicyDecision, libsql::Error> {
    let id_str: String = row.get(0)?;
    let lead_str: String = row.get(1)?;
    let workspace_str: String = row.get(2)?;
    let point_str: String = row.get(3)?;
    let outcome_str: String = row.get(4)?;
    let reason_str: String = row.get(5)?;
    let draft: Option<String> = row.get(6).ok();
    let created_str: String = row.get(7)?;

    Ok(PolicyDecision {
        id: parse_uuid(&id_str),
        lead_id: parse_uuid(&lead_str),
        workspace_id: parse_uuid(&workspace_str),
        point: DecisionPoint::parse(&point_str),
        outcome: DecisionOutcome::parse(&outcome_str),
        reason: ReasonCode::parse(&reason_str).unwrap_or(ReasonCode::AllChecksPassed),
        draft,
        created_at: parse_datetime(&created_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Workspaces ──────────────────────────────────────────────────

    async fn upsert_workspace(&self, workspace: &Workspace) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO workspaces (id, name, budget_tier, followup_preset, sunday_hold, agent_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                budget_tier = excluded.budget_tier,
                followup_preset = excluded.followup_preset,
                sunday_hold = excluded.sunday_hold,
                agent_id = excluded.agent_id,
                updated_at = excluded.updated_at",
            params![
                workspace.id.to_string(),
                workspace.name.clone(),
                workspace.budget_tier.as_str(),
                workspace.followup_preset.as_str(),
                workspace.sunday_hold as i64,
                workspace.agent_id.clone(),
                workspace.created_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("upsert_workspace: {e}")))?;

        Ok(())
    }

    async fn get_workspace(&self, id: Uuid) -> Result<Option<Workspace>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_workspace: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let ws = row_to_workspace(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_workspace row parse: {e}")))?;
                Ok(Some(ws))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_workspace: {e}"))),
        }
    }

    // ── Strategies ──────────────────────────────────────────────────

    async fn upsert_strategy(&self, strategy: &StrategyVersion) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO strategy_versions (id, workspace_id, version, status, tone, objectives, objection_handling, call_to_action, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (id) DO UPDATE SET
                status = excluded.status,
                tone = excluded.tone,
                objectives = excluded.objectives,
                objection_handling = excluded.objection_handling,
                call_to_action = excluded.call_to_action,
                updated_at = excluded.updated_at",
            params![
                strategy.id.to_string(),
                strategy.workspace_id.to_string(),
                strategy.version,
                strategy.status.as_str(),
                strategy.tone.clone(),
                strategy.objectives.clone(),
                strategy.objection_handling.clone(),
                strategy.call_to_action.clone(),
                strategy.created_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("upsert_strategy: {e}")))?;

        Ok(())
    }

    async fn get_active_strategy(
        &self,
        workspace_id: Uuid,
    ) -> Result<Option<StrategyVersion>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {STRATEGY_COLUMNS} FROM strategy_versions
                     WHERE workspace_id = ?1 AND status = 'active'
                     ORDER BY version DESC LIMIT 1"
                ),
                params![workspace_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_active_strategy: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let strategy = row_to_strategy(&row).map_err(|e| {
                    DatabaseError::Query(format!("get_active_strategy row parse: {e}"))
                })?;
                Ok(Some(strategy))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_active_strategy: {e}"))),
        }
    }

    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead(&self, lead: &Lead) -> Result<(), DatabaseError> {
        let tags = serde_json::to_string(&lead.tags)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO leads (id, workspace_id, display_name, stage, tags, opted_out, timezone, last_followup_at, next_followup_at, last_inbound_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                lead.id.to_string(),
                lead.workspace_id.to_string(),
                lead.display_name.clone(),
                lead.stage.as_str(),
                tags,
                lead.opted_out as i64,
                lead.timezone.clone(),
                opt_datetime(lead.last_followup_at),
                opt_datetime(lead.next_followup_at),
                opt_datetime(lead.last_inbound_at),
                lead.created_at.to_rfc3339(),
                lead.updated_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_lead: {e}")))?;

        debug!(lead_id = %lead.id, "Lead inserted into DB");
        Ok(())
    }

    async fn get_lead(
        &self,
        workspace_id: Uuid,
        lead_id: Uuid,
    ) -> Result<Option<Lead>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1 AND workspace_id = ?2"),
                params![lead_id.to_string(), workspace_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_lead: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let lead = row_to_lead(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_lead row parse: {e}")))?;
                Ok(Some(lead))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_lead: {e}"))),
        }
    }

    async fn add_lead_tag(
        &self,
        workspace_id: Uuid,
        lead_id: Uuid,
        tag: LeadTag,
    ) -> Result<(), DatabaseError> {
        let lead = self
            .get_lead(workspace_id, lead_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "lead".into(),
                id: lead_id.to_string(),
            })?;

        if lead.has_tag(tag) {
            return Ok(());
        }

        let mut tags = lead.tags;
        tags.push(tag);
        let tags_json = serde_json::to_string(&tags)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let conn = self.conn();
        conn.execute(
            "UPDATE leads SET tags = ?1, updated_at = ?2 WHERE id = ?3 AND workspace_id = ?4",
            params![
                tags_json,
                Utc::now().to_rfc3339(),
                lead_id.to_string(),
                workspace_id.to_string(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("add_lead_tag: {e}")))?;

        debug!(lead_id = %lead_id, tag = ?tag, "Lead tagged");
        Ok(())
    }

    async fn set_next_followup(
        &self,
        workspace_id: Uuid,
        lead_id: Uuid,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE leads SET next_followup_at = ?1, updated_at = ?2 WHERE id = ?3 AND workspace_id = ?4",
            params![
                opt_datetime(at),
                Utc::now().to_rfc3339(),
                lead_id.to_string(),
                workspace_id.to_string(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("set_next_followup: {e}")))?;

        Ok(())
    }

    async fn list_review_candidates(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Lead>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {LEAD_COLUMNS} FROM leads
                     WHERE stage NOT IN ('suppressed', 'take_over', 'closed_won', 'closed_lost')
                       AND (next_followup_at IS NULL OR next_followup_at < ?1)
                     ORDER BY created_at ASC"
                ),
                params![stale_before.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_review_candidates: {e}")))?;

        let mut leads = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_lead(&row) {
                Ok(lead) => leads.push(lead),
                Err(e) => tracing::warn!("Skipping lead row: {e}"),
            }
        }
        Ok(leads)
    }

    async fn list_due_leads(&self, now: DateTime<Utc>) -> Result<Vec<Lead>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {LEAD_COLUMNS} FROM leads
                     WHERE stage NOT IN ('suppressed', 'take_over', 'closed_won', 'closed_lost')
                       AND next_followup_at IS NOT NULL
                       AND next_followup_at <= ?1
                     ORDER BY next_followup_at ASC"
                ),
                params![now.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_due_leads: {e}")))?;

        let mut leads = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_lead(&row) {
                Ok(lead) => leads.push(lead),
                Err(e) => tracing::warn!("Skipping due lead row: {e}"),
            }
        }
        Ok(leads)
    }

    // ── Conversation threads ────────────────────────────────────────

    async fn record_inbound(
        &self,
        workspace_id: Uuid,
        lead_id: Uuid,
        content: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("record_inbound begin: {e}")))?;

        let result: Result<(), DatabaseError> = async {
            tx.execute(
                "INSERT INTO thread_messages (id, lead_id, role, content, created_at)
                 VALUES (?1, ?2, 'user', ?3, ?4)",
                params![Uuid::new_v4().to_string(), lead_id.to_string(), content, now.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_inbound insert: {e}")))?;

            let updated = tx
                .execute(
                    "UPDATE leads SET last_inbound_at = ?1, updated_at = ?1 WHERE id = ?2 AND workspace_id = ?3",
                    params![now.clone(), lead_id.to_string(), workspace_id.to_string()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("record_inbound update: {e}")))?;

            if updated == 0 {
                return Err(DatabaseError::NotFound {
                    entity: "lead".into(),
                    id: lead_id.to_string(),
                });
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => tx
                .commit()
                .await
                .map_err(|e| DatabaseError::Query(format!("record_inbound commit: {e}"))),
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn list_recent_messages(
        &self,
        lead_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ThreadMessage>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT id, lead_id, role, content, created_at FROM thread_messages
                 WHERE lead_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                params![lead_id.to_string(), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_recent_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_thread_message(&row) {
                Ok(msg) => messages.push(msg),
                Err(e) => tracing::warn!("Skipping thread message row: {e}"),
            }
        }
        messages.reverse(); // oldest first
        Ok(messages)
    }

    async fn persist_outbound_turn(
        &self,
        workspace_id: Uuid,
        lead_id: Uuid,
        content: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let sent = sent_at.to_rfc3339();
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("persist_outbound_turn begin: {e}")))?;

        let result: Result<(), DatabaseError> = async {
            tx.execute(
                "INSERT INTO thread_messages (id, lead_id, role, content, created_at)
                 VALUES (?1, ?2, 'model', ?3, ?4)",
                params![Uuid::new_v4().to_string(), lead_id.to_string(), content, sent.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("persist_outbound_turn insert: {e}")))?;

            // The stage only ever advances along the single new → contacted
            // edge here; every other stage change is external.
            let updated = tx
                .execute(
                    "UPDATE leads SET
                        last_followup_at = ?1,
                        stage = CASE WHEN stage = 'new' THEN 'contacted' ELSE stage END,
                        updated_at = ?1
                     WHERE id = ?2 AND workspace_id = ?3",
                    params![sent.clone(), lead_id.to_string(), workspace_id.to_string()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("persist_outbound_turn update: {e}")))?;

            if updated == 0 {
                return Err(DatabaseError::NotFound {
                    entity: "lead".into(),
                    id: lead_id.to_string(),
                });
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("persist_outbound_turn commit: {e}")))?;
                debug!(lead_id = %lead_id, "Outbound turn persisted");
                Ok(())
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    // ── Lead memory ─────────────────────────────────────────────────

    async fn get_lead_memory(&self, lead_id: Uuid) -> Result<Option<LeadMemory>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT lead_id, summary, facts, last_updated_at FROM lead_memories WHERE lead_id = ?1",
                params![lead_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_lead_memory: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let id_str: String = row.get(0).unwrap_or_default();
                let summary: String = row.get(1).unwrap_or_default();
                let facts_str: String = row.get(2).unwrap_or_else(|_| "[]".into());
                let updated_str: String = row.get(3).unwrap_or_default();
                Ok(Some(LeadMemory {
                    lead_id: parse_uuid(&id_str),
                    summary,
                    facts: serde_json::from_str(&facts_str).unwrap_or_default(),
                    last_updated_at: parse_datetime(&updated_str),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_lead_memory: {e}"))),
        }
    }

    async fn put_lead_memory(&self, memory: &LeadMemory) -> Result<(), DatabaseError> {
        let facts = serde_json::to_string(&memory.facts)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO lead_memories (lead_id, summary, facts, last_updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (lead_id) DO UPDATE SET
                summary = excluded.summary,
                facts = excluded.facts,
                last_updated_at = excluded.last_updated_at",
            params![
                memory.lead_id.to_string(),
                memory.summary.clone(),
                facts,
                memory.last_updated_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("put_lead_memory: {e}")))?;

        debug!(lead_id = %memory.lead_id, "Lead memory refreshed");
        Ok(())
    }

    // ── Policy audit trail ──────────────────────────────────────────

    async fn append_policy_decision(
        &self,
        decision: &PolicyDecision,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO policy_decisions (id, lead_id, workspace_id, point, outcome, reason, draft, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                decision.id.to_string(),
                decision.lead_id.to_string(),
                decision.workspace_id.to_string(),
                decision.point.as_str(),
                decision.outcome.as_str(),
                decision.reason.as_str(),
                opt_text(decision.draft.as_deref()),
                decision.created_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("append_policy_decision: {e}")))?;

        Ok(())
    }

    async fn list_policy_decisions(
        &self,
        lead_id: Uuid,
    ) -> Result<Vec<PolicyDecision>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT id, lead_id, workspace_id, point, outcome, reason, draft, created_at
                 FROM policy_decisions WHERE lead_id = ?1
                 ORDER BY created_at ASC, rowid ASC",
                params![lead_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_policy_decisions: {e}")))?;

        let mut decisions = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_decision(&row) {
                Ok(d) => decisions.push(d),
                Err(e) => tracing::warn!("Skipping policy decision row: {e}"),
            }
        }
        Ok(decisions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn backend_with_workspace() -> (LibSqlBackend, Workspace) {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        let workspace = Workspace::new("Acme", "agent-1");
        backend.upsert_workspace(&workspace).await.unwrap();
        (backend, workspace)
    }

    #[tokio::test]
    async fn file_backed_database_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leadpilot.db");

        let workspace = Workspace::new("Acme", "agent-1");
        {
            let backend = LibSqlBackend::new_local(&path).await.unwrap();
            backend.upsert_workspace(&workspace).await.unwrap();
        }

        let reopened = LibSqlBackend::new_local(&path).await.unwrap();
        let loaded = reopened.get_workspace(workspace.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "Acme");
    }

    #[tokio::test]
    async fn lead_roundtrip() {
        let (backend, workspace) = backend_with_workspace().await;

        let mut lead = Lead::new(workspace.id, "Ada", "America/Chicago");
        lead.tags.push(LeadTag::Disconnect);
        backend.insert_lead(&lead).await.unwrap();

        let loaded = backend
            .get_lead(workspace.id, lead.id)
            .await
            .unwrap()
            .expect("lead should exist");
        assert_eq!(loaded.display_name, "Ada");
        assert_eq!(loaded.stage, LeadStage::New);
        assert_eq!(loaded.timezone, "America/Chicago");
        assert!(loaded.has_tag(LeadTag::Disconnect));
        assert!(loaded.last_followup_at.is_none());
    }

    #[tokio::test]
    async fn get_lead_is_tenant_scoped() {
        let (backend, workspace) = backend_with_workspace().await;
        let lead = Lead::new(workspace.id, "Ada", "UTC");
        backend.insert_lead(&lead).await.unwrap();

        let other_workspace = Uuid::new_v4();
        assert!(backend
            .get_lead(other_workspace, lead.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn persist_outbound_turn_is_atomic_and_advances_stage() {
        let (backend, workspace) = backend_with_workspace().await;
        let lead = Lead::new(workspace.id, "Ada", "UTC");
        backend.insert_lead(&lead).await.unwrap();

        let now = Utc::now();
        backend
            .persist_outbound_turn(workspace.id, lead.id, "Hello from us", now)
            .await
            .unwrap();

        let loaded = backend.get_lead(workspace.id, lead.id).await.unwrap().unwrap();
        assert_eq!(loaded.stage, LeadStage::Contacted);
        assert!(loaded.last_followup_at.is_some());

        let messages = backend.list_recent_messages(lead.id, 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::Model);
        assert_eq!(messages[0].content, "Hello from us");

        // A second persisted turn must not regress the stage.
        backend
            .persist_outbound_turn(workspace.id, lead.id, "Again", Utc::now())
            .await
            .unwrap();
        let loaded = backend.get_lead(workspace.id, lead.id).await.unwrap().unwrap();
        assert_eq!(loaded.stage, LeadStage::Contacted);
    }

    #[tokio::test]
    async fn persist_outbound_turn_missing_lead_rolls_back() {
        let (backend, workspace) = backend_with_workspace().await;
        let ghost = Uuid::new_v4();

        let err = backend
            .persist_outbound_turn(workspace.id, ghost, "Hello", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));

        // The message insert must have been rolled back with the update.
        let messages = backend.list_recent_messages(ghost, 10).await.unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn record_inbound_stamps_last_inbound() {
        let (backend, workspace) = backend_with_workspace().await;
        let lead = Lead::new(workspace.id, "Ada", "UTC");
        backend.insert_lead(&lead).await.unwrap();

        backend
            .record_inbound(workspace.id, lead.id, "Tell me more")
            .await
            .unwrap();

        let loaded = backend.get_lead(workspace.id, lead.id).await.unwrap().unwrap();
        assert!(loaded.last_inbound_at.is_some());

        let messages = backend.list_recent_messages(lead.id, 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::User);
    }

    #[tokio::test]
    async fn recent_messages_are_a_tail_oldest_first() {
        let (backend, workspace) = backend_with_workspace().await;
        let lead = Lead::new(workspace.id, "Ada", "UTC");
        backend.insert_lead(&lead).await.unwrap();

        for i in 0..5 {
            backend
                .record_inbound(workspace.id, lead.id, &format!("msg {i}"))
                .await
                .unwrap();
        }

        let tail = backend.list_recent_messages(lead.id, 3).await.unwrap();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].content, "msg 2");
        assert_eq!(tail[2].content, "msg 4");
    }

    #[tokio::test]
    async fn active_strategy_lookup() {
        let (backend, workspace) = backend_with_workspace().await;

        assert!(backend
            .get_active_strategy(workspace.id)
            .await
            .unwrap()
            .is_none());

        let now = Utc::now();
        let strategy = StrategyVersion {
            id: Uuid::new_v4(),
            workspace_id: workspace.id,
            version: 3,
            status: StrategyStatus::Active,
            tone: "warm, direct".into(),
            objectives: "qualify budget and timeline".into(),
            objection_handling: "acknowledge, then reframe".into(),
            call_to_action: "offer a 15-minute call".into(),
            created_at: now,
            updated_at: now,
        };
        backend.upsert_strategy(&strategy).await.unwrap();

        let mut draft = strategy.clone();
        draft.id = Uuid::new_v4();
        draft.version = 4;
        draft.status = StrategyStatus::Draft;
        backend.upsert_strategy(&draft).await.unwrap();

        let active = backend
            .get_active_strategy(workspace.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.version, 3);
        assert_eq!(active.status, StrategyStatus::Active);
    }

    #[tokio::test]
    async fn lead_memory_overwrites() {
        let (backend, workspace) = backend_with_workspace().await;
        let lead = Lead::new(workspace.id, "Ada", "UTC");
        backend.insert_lead(&lead).await.unwrap();

        assert!(backend.get_lead_memory(lead.id).await.unwrap().is_none());

        let memory = LeadMemory {
            lead_id: lead.id,
            summary: "Interested in the pro plan.".into(),
            facts: vec!["works at Acme".into()],
            last_updated_at: Utc::now(),
        };
        backend.put_lead_memory(&memory).await.unwrap();

        let updated = LeadMemory {
            lead_id: lead.id,
            summary: "Now evaluating competitors.".into(),
            facts: vec!["budget approved".into(), "decision in Q4".into()],
            last_updated_at: Utc::now(),
        };
        backend.put_lead_memory(&updated).await.unwrap();

        let loaded = backend.get_lead_memory(lead.id).await.unwrap().unwrap();
        assert_eq!(loaded.summary, "Now evaluating competitors.");
        assert_eq!(loaded.facts.len(), 2);
    }

    #[tokio::test]
    async fn review_and_due_queries_skip_terminal_stages() {
        let (backend, workspace) = backend_with_workspace().await;
        let now = Utc::now();

        let mut fresh = Lead::new(workspace.id, "Fresh", "UTC");
        fresh.next_followup_at = None;
        backend.insert_lead(&fresh).await.unwrap();

        let mut due = Lead::new(workspace.id, "Due", "UTC");
        due.next_followup_at = Some(now - Duration::minutes(5));
        backend.insert_lead(&due).await.unwrap();

        let mut suppressed = Lead::new(workspace.id, "Gone", "UTC");
        suppressed.stage = LeadStage::Suppressed;
        suppressed.next_followup_at = Some(now - Duration::minutes(5));
        backend.insert_lead(&suppressed).await.unwrap();

        let candidates = backend
            .list_review_candidates(now - Duration::hours(24))
            .await
            .unwrap();
        let names: Vec<_> = candidates.iter().map(|l| l.display_name.as_str()).collect();
        assert!(names.contains(&"Fresh"));
        assert!(!names.contains(&"Gone"));

        let due_leads = backend.list_due_leads(now).await.unwrap();
        let names: Vec<_> = due_leads.iter().map(|l| l.display_name.as_str()).collect();
        assert_eq!(names, vec!["Due"]);
    }

    #[tokio::test]
    async fn policy_decisions_append_only_roundtrip() {
        let (backend, workspace) = backend_with_workspace().await;
        let lead = Lead::new(workspace.id, "Ada", "UTC");
        backend.insert_lead(&lead).await.unwrap();

        let pass = PolicyDecision::pre_send(
            lead.id,
            workspace.id,
            DecisionOutcome::Pass,
            ReasonCode::AllChecksPassed,
        );
        backend.append_policy_decision(&pass).await.unwrap();

        let block = PolicyDecision::post_gen(
            lead.id,
            workspace.id,
            DecisionOutcome::Block,
            ReasonCode::RiskyContentBlock,
            Some("draft with spam".into()),
        );
        backend.append_policy_decision(&block).await.unwrap();

        let decisions = backend.list_policy_decisions(lead.id).await.unwrap();
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].reason, ReasonCode::AllChecksPassed);
        assert_eq!(decisions[1].reason, ReasonCode::RiskyContentBlock);
        assert_eq!(decisions[1].draft.as_deref(), Some("draft with spam"));
    }
}
