//! Order store: SQLite-backed, transactional keeper of orders and the users they belong to.
//!
//! Mutations go through [`OrderStore::transaction`], which serializes writers on one
//! connection (bounded wait) and opens `BEGIN IMMEDIATE`. Reads go through
//! [`OrderStore::read`], which uses a separate read-only connection for file databases so
//! they never wait on the writer.
//!
//! The schema enforces the shape of the queue as a second line of defence: a queued order
//! always has a position, no two queued orders share one, and an owner has at most one
//! queued-or-processing order. The engine keeps these true; the indexes turn a violation
//! into a retryable conflict instead of a corrupted queue.

use crate::error::QueueError;
use crate::types::{NewOrder, Order, OrderId, OrderKind, OrderStatus, OrderSummary, Role, User, UserId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    display_name TEXT    NOT NULL,
    email        TEXT    NOT NULL UNIQUE,
    role         TEXT    NOT NULL CHECK (role IN ('USER', 'ADMIN'))
);

CREATE TABLE IF NOT EXISTS orders (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id   INTEGER NOT NULL REFERENCES users(id),
    admin_id   INTEGER REFERENCES users(id),
    type       TEXT    NOT NULL,
    created_at TEXT    NOT NULL,
    status     TEXT    NOT NULL CHECK (status IN ('QUEUED', 'PROCESSING', 'DONE', 'CANCELLED')),
    position   INTEGER CHECK (position IS NULL OR position >= 1),
    CHECK ((status = 'QUEUED') = (position IS NOT NULL))
);

CREATE INDEX IF NOT EXISTS idx_orders_status_position
    ON orders(status, position);

CREATE UNIQUE INDEX IF NOT EXISTS idx_orders_active_owner
    ON orders(owner_id) WHERE status IN ('QUEUED', 'PROCESSING');

CREATE UNIQUE INDEX IF NOT EXISTS idx_orders_queued_position
    ON orders(position) WHERE status = 'QUEUED';
"#;

const ORDER_COLUMNS: &str = "id, owner_id, admin_id, type, created_at, status, position";

/// Cooperative cancellation flag checked right before commit.
///
/// Clones share the flag. The HTTP layer arms an [`AbortOnDrop`] guard for the lifetime of
/// the request, so a dropped request rolls back a transaction that has not committed yet.
#[derive(Clone, Debug, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns a guard that aborts this signal when dropped, unless disarmed first.
    pub fn abort_on_drop(&self) -> AbortOnDrop {
        AbortOnDrop(Some(self.clone()))
    }
}

pub struct AbortOnDrop(Option<AbortSignal>);

impl AbortOnDrop {
    pub fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(signal) = self.0.take() {
            signal.abort();
        }
    }
}

pub struct OrderStore {
    writer: Mutex<Connection>,
    /// `None` for in-memory databases, where a second connection would see a different database.
    reader: Option<Mutex<Connection>>,
}

impl OrderStore {
    /// Opens (or creates) a file database in WAL mode. `":memory:"` opens an in-memory one.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref();
        if path == Path::new(":memory:") {
            return Self::open_in_memory();
        }
        let writer = Connection::open(path).map_err(open_failed)?;
        writer.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::prepare(&writer)?;
        let reader = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(open_failed)?;
        log::info!("order store opened path={}", path.display());
        Ok(Self {
            writer: Mutex::new(writer),
            reader: Some(Mutex::new(reader)),
        })
    }

    pub fn open_in_memory() -> Result<Self, QueueError> {
        let writer = Connection::open_in_memory().map_err(open_failed)?;
        Self::prepare(&writer)?;
        Ok(Self {
            writer: Mutex::new(writer),
            reader: None,
        })
    }

    fn prepare(conn: &Connection) -> Result<(), QueueError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Runs `f` inside one `BEGIN IMMEDIATE` transaction on the writer connection.
    ///
    /// Commits only if `f` succeeds, `abort` has not fired and `deadline` has not passed;
    /// otherwise the transaction is dropped, which rolls it back.
    pub fn transaction<R, F>(&self, deadline: Instant, abort: &AbortSignal, f: F) -> Result<R, QueueError>
    where
        F: FnOnce(&OrderTable<'_>) -> Result<R, QueueError>,
    {
        self.transaction_waiting(deadline, deadline, abort, f)
    }

    /// Like [`transaction`](Self::transaction), but stops waiting for the writer at
    /// `wait_until` (capped at `deadline`) with a retryable conflict.
    pub fn transaction_waiting<R, F>(
        &self,
        wait_until: Instant,
        deadline: Instant,
        abort: &AbortSignal,
        f: F,
    ) -> Result<R, QueueError>
    where
        F: FnOnce(&OrderTable<'_>) -> Result<R, QueueError>,
    {
        remaining(deadline)?;
        let wait_until = wait_until.min(deadline);
        let mut conn = self
            .writer
            .try_lock_for(wait_until.saturating_duration_since(Instant::now()))
            .ok_or_else(|| QueueError::Conflict("writer connection busy".into()))?;
        conn.busy_timeout(wait_until.saturating_duration_since(Instant::now()))?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&OrderTable { conn: &tx })?;
        if abort.is_aborted() {
            return Err(QueueError::Unavailable("request abandoned before commit".into()));
        }
        if Instant::now() >= deadline {
            return Err(QueueError::Unavailable("transaction deadline exceeded".into()));
        }
        tx.commit()?;
        Ok(out)
    }

    /// Runs read-only queries. Each query sees one committed state.
    pub fn read<R, F>(&self, f: F) -> Result<R, QueueError>
    where
        F: FnOnce(&OrderTable<'_>) -> Result<R, QueueError>,
    {
        match &self.reader {
            Some(reader) => {
                let conn = reader.lock();
                f(&OrderTable { conn: &conn })
            }
            None => {
                let conn = self.writer.lock();
                f(&OrderTable { conn: &conn })
            }
        }
    }

    /// Registers a user. Provisioning itself (OAuth, sign-up) lives outside the queue.
    pub fn insert_user(&self, display_name: &str, email: &str, role: Role) -> Result<User, QueueError> {
        let conn = self.writer.lock();
        conn.execute(
            "INSERT INTO users (display_name, email, role) VALUES (?1, ?2, ?3)",
            params![display_name, email, role.as_str()],
        )
        .map_err(|e| match QueueError::from(e) {
            QueueError::Conflict(_) => QueueError::InvalidRequest(format!("email {email} is already registered")),
            other => other,
        })?;
        Ok(User {
            id: UserId(conn.last_insert_rowid()),
            display_name: display_name.to_string(),
            email: email.to_string(),
            role,
        })
    }
}

fn remaining(deadline: Instant) -> Result<Duration, QueueError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        Err(QueueError::Unavailable("transaction deadline exceeded".into()))
    } else {
        Ok(left)
    }
}

fn open_failed(e: rusqlite::Error) -> QueueError {
    log::error!("order store open failed: {}", e);
    QueueError::Unavailable(e.to_string())
}

/// Query surface over one connection or transaction.
pub struct OrderTable<'c> {
    conn: &'c Connection,
}

impl OrderTable<'_> {
    pub fn insert(&self, order: &NewOrder) -> Result<OrderId, QueueError> {
        self.conn.execute(
            "INSERT INTO orders (owner_id, admin_id, type, created_at, status, position)
             VALUES (?1, NULL, ?2, ?3, 'QUEUED', ?4)",
            params![order.owner_id.0, order.kind.as_str(), order.created_at, order.position],
        )?;
        Ok(OrderId(self.conn.last_insert_rowid()))
    }

    pub fn get_by_id(&self, id: OrderId) -> Result<Option<Order>, QueueError> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1");
        Ok(self.conn.query_row(&sql, params![id.0], order_from_row).optional()?)
    }

    /// Replaces every mutable column of the record with `order.id`.
    pub fn update(&self, order: &Order) -> Result<(), QueueError> {
        let changed = self.conn.execute(
            "UPDATE orders
             SET owner_id = ?2, admin_id = ?3, type = ?4, created_at = ?5, status = ?6, position = ?7
             WHERE id = ?1",
            params![
                order.id.0,
                order.owner_id.0,
                order.admin_id.map(|a| a.0),
                order.kind.as_str(),
                order.created_at,
                order.status.as_str(),
                order.position,
            ],
        )?;
        if changed == 0 {
            return Err(QueueError::OrderNotFound(order.id));
        }
        Ok(())
    }

    /// Returns whether a row was removed.
    pub fn delete(&self, id: OrderId) -> Result<bool, QueueError> {
        Ok(self.conn.execute("DELETE FROM orders WHERE id = ?1", params![id.0])? > 0)
    }

    /// Queued orders ascend by position; every other status ascends by admission time, then id.
    pub fn list_by_status(&self, status: OrderStatus) -> Result<Vec<Order>, QueueError> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE status = ?1 ORDER BY {}",
            order_clause(status, "")
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![status.as_str()], order_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn list_by_owner(&self, owner: UserId) -> Result<Vec<Order>, QueueError> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE owner_id = ?1 ORDER BY created_at, id");
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![owner.0], order_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// 0 when the queue is empty.
    pub fn max_queued_position(&self) -> Result<u32, QueueError> {
        Ok(self.conn.query_row(
            "SELECT COALESCE(MAX(position), 0) FROM orders WHERE status = 'QUEUED'",
            [],
            |row| row.get::<_, u32>(0),
        )?)
    }

    pub fn max_queued_created_at(&self) -> Result<Option<DateTime<Utc>>, QueueError> {
        Ok(self.conn.query_row(
            "SELECT MAX(created_at) FROM orders WHERE status = 'QUEUED'",
            [],
            |row| row.get::<_, Option<DateTime<Utc>>>(0),
        )?)
    }

    /// The owner's queued or processing order, if any.
    pub fn find_active_by_owner(&self, owner: UserId) -> Result<Option<Order>, QueueError> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders
             WHERE owner_id = ?1 AND status IN ('QUEUED', 'PROCESSING')"
        );
        Ok(self.conn.query_row(&sql, params![owner.0], order_from_row).optional()?)
    }

    pub fn summaries_by_status(&self, status: OrderStatus) -> Result<Vec<OrderSummary>, QueueError> {
        let sql = format!(
            "SELECT o.id, u.display_name, o.created_at, o.position, o.status
             FROM orders o JOIN users u ON u.id = o.owner_id
             WHERE o.status = ?1
             ORDER BY {}",
            order_clause(status, "o.")
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![status.as_str()], summary_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn summaries_by_owner(&self, owner: UserId) -> Result<Vec<OrderSummary>, QueueError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT o.id, u.display_name, o.created_at, o.position, o.status
             FROM orders o JOIN users u ON u.id = o.owner_id
             WHERE o.owner_id = ?1
             ORDER BY o.created_at, o.id",
        )?;
        let rows = stmt.query_map(params![owner.0], summary_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_user(&self, id: UserId) -> Result<Option<User>, QueueError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, display_name, email, role FROM users WHERE id = ?1",
                params![id.0],
                |row| {
                    let role: String = row.get(3)?;
                    Ok(User {
                        id: UserId(row.get(0)?),
                        display_name: row.get(1)?,
                        email: row.get(2)?,
                        role: Role::from_str(&role).ok_or_else(|| unknown_tag(3, "role", &role))?,
                    })
                },
            )
            .optional()?)
    }
}

fn order_clause(status: OrderStatus, prefix: &str) -> String {
    match status {
        OrderStatus::Queued => format!("{prefix}position ASC"),
        _ => format!("{prefix}created_at ASC, {prefix}id ASC"),
    }
}

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<Order> {
    let kind: String = row.get(3)?;
    let status: String = row.get(5)?;
    Ok(Order {
        id: OrderId(row.get(0)?),
        owner_id: UserId(row.get(1)?),
        admin_id: row.get::<_, Option<i64>>(2)?.map(UserId),
        kind: OrderKind::from_str(&kind).ok_or_else(|| unknown_tag(3, "type", &kind))?,
        created_at: row.get(4)?,
        status: OrderStatus::from_str(&status).ok_or_else(|| unknown_tag(5, "status", &status))?,
        position: row.get(6)?,
    })
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<OrderSummary> {
    let status: String = row.get(4)?;
    Ok(OrderSummary {
        id: OrderId(row.get(0)?),
        usuario: row.get(1)?,
        tempo_que_pediu: row.get(2)?,
        posicao_fila: row.get(3)?,
        status: OrderStatus::from_str(&status).ok_or_else(|| unknown_tag(4, "status", &status))?,
    })
}

fn unknown_tag(column: usize, name: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        format!("unknown {name} tag {value:?}").into(),
    )
}
