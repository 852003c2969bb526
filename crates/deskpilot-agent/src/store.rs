use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use deskpilot_contracts::{Category, ClosureReason, Ticket, TicketState, TicketUpdate};
use deskpilot_kernel::{merge_audit, parse_rfc3339};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ticket {0} not found")]
    NotFound(i64),
    #[error("ticket {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: &'static str,
        to: &'static str,
    },
    #[error("ticket {0} is resolved and can no longer change")]
    Immutable(i64),
    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone)]
pub struct NewTicket {
    pub category_code: i64,
    pub requester: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Backing store for tickets and the category reference table. Shared by
/// every in-flight ticket task.
#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn get(&self, id: i64) -> Result<Option<Ticket>, StoreError>;

    async fn insert(&self, ticket: NewTicket) -> Result<Ticket, StoreError>;

    /// Merge-style update guarded by the ticket state machine.
    async fn update(&self, id: i64, update: TicketUpdate) -> Result<Ticket, StoreError>;

    /// Moves a pending ticket to in-progress and merges `audit`, atomically.
    /// Returns the row as it stood before the claim, or `None` when the
    /// ticket is no longer pending.
    async fn claim(&self, id: i64, audit: Map<String, Value>) -> Result<Option<Ticket>, StoreError>;

    async fn category_exists(&self, code: i64) -> Result<bool, StoreError>;

    /// Creation times of `requester`'s tickets in `categories` created strictly
    /// after `since`, oldest first. `exclude` drops one ticket from the result.
    async fn created_since(
        &self,
        requester: &str,
        categories: &[i64],
        since: DateTime<Utc>,
        exclude: Option<i64>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError>;
}

fn apply_update(ticket: &mut Ticket, update: TicketUpdate) -> Result<(), StoreError> {
    if ticket.state == TicketState::Resolved {
        return Err(StoreError::Immutable(ticket.id));
    }
    if let Some(next) = update.state {
        if !ticket.state.can_advance_to(next) {
            return Err(StoreError::InvalidTransition {
                id: ticket.id,
                from: ticket.state.as_str(),
                to: next.as_str(),
            });
        }
        ticket.state = next;
    }
    if let Some(v) = update.category_code {
        ticket.category_code = v;
    }
    if let Some(v) = update.resolution {
        ticket.resolution = Some(v);
    }
    if let Some(v) = update.resolver {
        ticket.resolver = Some(v);
    }
    if let Some(v) = update.resolved_at {
        ticket.resolved_at = Some(v);
    }
    if let Some(v) = update.closed_at {
        ticket.closed_at = Some(v);
    }
    if let Some(v) = update.closure_reason {
        ticket.closure_reason = Some(v);
    }
    if let Some(audit) = update.audit {
        merge_audit(&mut ticket.audit, audit);
    }
    Ok(())
}

#[derive(Default)]
struct MemoryTables {
    tickets: BTreeMap<i64, Ticket>,
    next_id: i64,
}

pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
    categories: HashSet<i64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_categories(Category::ALL.iter().map(|c| c.code()))
    }
}

impl MemoryStore {
    pub fn with_categories(codes: impl IntoIterator<Item = i64>) -> Self {
        Self {
            tables: Mutex::new(MemoryTables::default()),
            categories: codes.into_iter().collect(),
        }
    }
}

#[async_trait]
impl TicketStore for MemoryStore {
    async fn get(&self, id: i64) -> Result<Option<Ticket>, StoreError> {
        Ok(self.tables.lock().await.tickets.get(&id).cloned())
    }

    async fn insert(&self, new: NewTicket) -> Result<Ticket, StoreError> {
        let mut tables = self.tables.lock().await;
        tables.next_id += 1;
        let ticket = Ticket {
            id: tables.next_id,
            category_code: new.category_code,
            state: TicketState::Pending,
            requester: new.requester,
            description: new.description,
            created_at: new.created_at,
            resolution: None,
            resolver: None,
            resolved_at: None,
            closed_at: None,
            closure_reason: None,
            audit: Map::new(),
        };
        tables.tickets.insert(ticket.id, ticket.clone());
        Ok(ticket)
    }

    async fn update(&self, id: i64, update: TicketUpdate) -> Result<Ticket, StoreError> {
        let mut tables = self.tables.lock().await;
        let ticket = tables.tickets.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let mut next = ticket.clone();
        apply_update(&mut next, update)?;
        *ticket = next.clone();
        Ok(next)
    }

    async fn claim(&self, id: i64, audit: Map<String, Value>) -> Result<Option<Ticket>, StoreError> {
        let mut tables = self.tables.lock().await;
        let ticket = tables.tickets.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if ticket.state != TicketState::Pending {
            return Ok(None);
        }
        let before = ticket.clone();
        ticket.state = TicketState::InProgress;
        merge_audit(&mut ticket.audit, audit);
        Ok(Some(before))
    }

    async fn category_exists(&self, code: i64) -> Result<bool, StoreError> {
        Ok(self.categories.contains(&code))
    }

    async fn created_since(
        &self,
        requester: &str,
        categories: &[i64],
        since: DateTime<Utc>,
        exclude: Option<i64>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        let tables = self.tables.lock().await;
        let mut times: Vec<DateTime<Utc>> = tables
            .tickets
            .values()
            .filter(|t| t.requester == requester)
            .filter(|t| categories.contains(&t.category_code))
            .filter(|t| t.created_at > since)
            .filter(|t| Some(t.id) != exclude)
            .map(|t| t.created_at)
            .collect();
        times.sort();
        Ok(times)
    }
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn closure_from_str(raw: &str) -> Option<ClosureReason> {
    match raw {
        "resolved" => Some(ClosureReason::Resolved),
        "rejected" => Some(ClosureReason::Rejected),
        "ignored" => Some(ClosureReason::Ignored),
        "error" => Some(ClosureReason::Error),
        _ => None,
    }
}

const TICKET_COLUMNS: &str = "id, category_code, state, requester, description, created_at, \
     resolution, resolver, resolved_at, closed_at, closure_reason, audit_json";

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(backend)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tickets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                category_code INTEGER NOT NULL,
                state TEXT NOT NULL,
                requester TEXT NOT NULL,
                description TEXT NOT NULL,
                created_at TEXT NOT NULL,
                resolution TEXT,
                resolver TEXT,
                resolved_at TEXT,
                closed_at TEXT,
                closure_reason TEXT,
                audit_json TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS tickets_requester_created
                ON tickets (requester, created_at);
            CREATE TABLE IF NOT EXISTS categories (
                code INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            );
            ",
        )
        .map_err(backend)?;
        for category in Category::ALL {
            conn.execute(
                "INSERT OR IGNORE INTO categories(code, name) VALUES (?1, ?2)",
                params![category.code(), category.name()],
            )
            .map_err(backend)?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn load(conn: &Connection, id: i64) -> Result<Option<Ticket>, StoreError> {
        let row = conn
            .query_row(
                &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = ?1"),
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, Option<String>>(10)?,
                        row.get::<_, String>(11)?,
                    ))
                },
            )
            .optional()
            .map_err(backend)?;
        let Some((
            id,
            category_code,
            state,
            requester,
            description,
            created_at,
            resolution,
            resolver,
            resolved_at,
            closed_at,
            closure_reason,
            audit_json,
        )) = row
        else {
            return Ok(None);
        };
        let state = TicketState::parse(&state)
            .ok_or_else(|| StoreError::Backend(format!("ticket {id} has unknown state {state}")))?;
        let created_at = parse_rfc3339(&created_at)
            .ok_or_else(|| StoreError::Backend(format!("ticket {id} has invalid created_at")))?;
        let audit: Map<String, Value> = serde_json::from_str(&audit_json).map_err(backend)?;
        Ok(Some(Ticket {
            id,
            category_code,
            state,
            requester,
            description,
            created_at,
            resolution,
            resolver,
            resolved_at: resolved_at.as_deref().and_then(parse_rfc3339),
            closed_at: closed_at.as_deref().and_then(parse_rfc3339),
            closure_reason: closure_reason.as_deref().and_then(closure_from_str),
            audit,
        }))
    }
}

#[async_trait]
impl TicketStore for SqliteStore {
    async fn get(&self, id: i64) -> Result<Option<Ticket>, StoreError> {
        let conn = self.conn.lock().await;
        Self::load(&conn, id)
    }

    async fn insert(&self, new: NewTicket) -> Result<Ticket, StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tickets(category_code, state, requester, description, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                new.category_code,
                TicketState::Pending.as_str(),
                new.requester,
                new.description,
                ts(new.created_at)
            ],
        )
        .map_err(backend)?;
        let id = conn.last_insert_rowid();
        Self::load(&conn, id)?.ok_or(StoreError::NotFound(id))
    }

    async fn update(&self, id: i64, update: TicketUpdate) -> Result<Ticket, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(backend)?;
        let mut ticket = Self::load(&tx, id)?.ok_or(StoreError::NotFound(id))?;
        apply_update(&mut ticket, update)?;
        let audit_json = serde_json::to_string(&ticket.audit).map_err(backend)?;
        tx.execute(
            "UPDATE tickets SET category_code = ?2, state = ?3, resolution = ?4, resolver = ?5,
                resolved_at = ?6, closed_at = ?7, closure_reason = ?8, audit_json = ?9
             WHERE id = ?1",
            params![
                id,
                ticket.category_code,
                ticket.state.as_str(),
                ticket.resolution,
                ticket.resolver,
                ticket.resolved_at.map(ts),
                ticket.closed_at.map(ts),
                ticket.closure_reason.map(|c| c.as_str()),
                audit_json
            ],
        )
        .map_err(backend)?;
        tx.commit().map_err(backend)?;
        Ok(ticket)
    }

    async fn claim(&self, id: i64, audit: Map<String, Value>) -> Result<Option<Ticket>, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(backend)?;
        let before = Self::load(&tx, id)?.ok_or(StoreError::NotFound(id))?;
        let mut merged = before.audit.clone();
        merge_audit(&mut merged, audit);
        let audit_json = serde_json::to_string(&merged).map_err(backend)?;
        let changed = tx
            .execute(
                "UPDATE tickets SET state = ?2, audit_json = ?3 WHERE id = ?1 AND state = ?4",
                params![
                    id,
                    TicketState::InProgress.as_str(),
                    audit_json,
                    TicketState::Pending.as_str()
                ],
            )
            .map_err(backend)?;
        if changed == 0 {
            return Ok(None);
        }
        tx.commit().map_err(backend)?;
        Ok(Some(before))
    }

    async fn category_exists(&self, code: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let found: Option<i64> = conn
            .query_row(
                "SELECT code FROM categories WHERE code = ?1",
                params![code],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;
        Ok(found.is_some())
    }

    async fn created_since(
        &self,
        requester: &str,
        categories: &[i64],
        since: DateTime<Utc>,
        exclude: Option<i64>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, category_code, created_at FROM tickets
                 WHERE requester = ?1 AND created_at > ?2
                 ORDER BY created_at ASC",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![requester, ts(since)], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(backend)?;
        let mut out = Vec::new();
        for row in rows {
            let (id, category_code, created_at) = row.map_err(backend)?;
            if Some(id) == exclude || !categories.contains(&category_code) {
                continue;
            }
            if let Some(t) = parse_rfc3339(&created_at) {
                out.push(t);
            }
        }
        Ok(out)
    }
}
