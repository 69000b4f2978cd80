//! Queue engine: the state machine over orders.
//!
//! The only component that changes `status`, `position` or the queued set. Every mutator
//! runs as one store transaction (retried on conflict, bounded by a deadline); after each
//! commit the queued positions are exactly `1..=N` and no user has two active orders.

use crate::audit::{self, AuditEvent, AuditSink, NullAuditSink};
use crate::error::{ErrorKind, QueueError};
use crate::notifier::{self, Confirmation, Notifier};
use crate::store::{AbortSignal, OrderStore, OrderTable};
use crate::types::{FinalizedOrder, NewOrder, Order, OrderId, OrderKind, OrderStatus, OrderSummary, UserId};
use chrono::Utc;
use log::{debug, info, warn};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug)]
pub struct EngineSettings {
    /// Deadline for one mutation, covering lock wait, retries and commit.
    pub tx_timeout: Duration,
    /// Retries after the first attempt when the store reports a conflict.
    pub max_retries: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tx_timeout: crate::config::DEFAULT_TX_TIMEOUT,
            max_retries: crate::config::DEFAULT_TX_MAX_RETRIES,
        }
    }
}

/// Per-user FIFO queue over an [`OrderStore`].
///
/// Mutators: [`admit`](Self::admit), [`promote_next`](Self::promote_next),
/// [`finalize`](Self::finalize), [`complete`](Self::complete), [`cancel`](Self::cancel).
/// Each has a `_with` variant taking an [`AbortSignal`] so a caller that goes away before
/// commit rolls the mutation back. Queries read one committed snapshot and never block on
/// mutators for file-backed stores.
pub struct QueueEngine {
    store: Arc<OrderStore>,
    notifier: Option<Arc<dyn Notifier>>,
    audit: Arc<dyn AuditSink>,
    settings: EngineSettings,
}

impl QueueEngine {
    pub fn new(store: Arc<OrderStore>) -> Self {
        Self {
            store,
            notifier: None,
            audit: Arc::new(NullAuditSink),
            settings: EngineSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn store(&self) -> &Arc<OrderStore> {
        &self.store
    }

    /// Appends a new order for `owner` at the tail of the queue.
    ///
    /// Fails with `AlreadyActive` if the owner has a queued or processing order.
    pub fn admit(&self, owner: UserId, kind: OrderKind) -> Result<Order, QueueError> {
        self.admit_with(owner, kind, &AbortSignal::new())
    }

    pub fn admit_with(&self, owner: UserId, kind: OrderKind, abort: &AbortSignal) -> Result<Order, QueueError> {
        let result = self.transact("admit", abort, |t| {
            if let Some(active) = t.find_active_by_owner(owner)? {
                debug!("admit refused owner={} active_order={} status={}", owner, active.id, active.status);
                return Err(QueueError::AlreadyActive(owner));
            }
            let user = t
                .get_user(owner)?
                .ok_or_else(|| QueueError::NotFound(format!("user {owner} not found")))?;
            let position = t.max_queued_position()? + 1;
            // Sampled inside the transaction; never earlier than the current tail.
            let now = Utc::now();
            let created_at = match t.max_queued_created_at()? {
                Some(tail) if tail > now => tail,
                _ => now,
            };
            let id = t.insert(&NewOrder {
                owner_id: owner,
                kind,
                created_at,
                position,
            })?;
            let order = Order {
                id,
                owner_id: owner,
                admin_id: None,
                kind,
                created_at,
                status: OrderStatus::Queued,
                position: Some(position),
            };
            Ok((order, user))
        });

        let resource = match &result {
            Ok((order, _)) => json!({ "order_id": order.id, "position": order.position, "type": kind }),
            Err(_) => json!({ "owner_id": owner, "type": kind }),
        };
        self.record(owner, audit::ORDER_ADMIT, resource, &result);

        let (order, user) = result?;
        info!(
            "order admitted order_id={} owner={} type={} position={}",
            order.id,
            owner,
            kind.as_str(),
            order.position.unwrap_or_default()
        );
        if let Some(notifier) = &self.notifier {
            notifier::dispatch(
                notifier.clone(),
                Confirmation {
                    order_id: order.id,
                    kind,
                    position: order.position.unwrap_or_default(),
                    owner: user,
                },
            );
        }
        Ok(order)
    }

    /// Moves the head of the queue to processing and shifts everyone else up by one.
    /// Returns `None` when the queue is empty.
    pub fn promote_next(&self, admin: UserId) -> Result<Option<Order>, QueueError> {
        self.promote_next_with(admin, &AbortSignal::new())
    }

    pub fn promote_next_with(&self, admin: UserId, abort: &AbortSignal) -> Result<Option<Order>, QueueError> {
        let result = self.transact("promote", abort, |t| {
            let queued = t.list_by_status(OrderStatus::Queued)?;
            let Some((head, rest)) = queued.split_first() else {
                return Ok(None);
            };
            let mut head = head.clone();
            head.status = OrderStatus::Processing;
            head.position = None;
            head.admin_id = Some(admin);
            t.update(&head)?;
            for order in rest {
                let mut order = order.clone();
                order.position = order.position.map(|p| p - 1);
                t.update(&order)?;
            }
            Ok(Some(head))
        });

        let resource = match &result {
            Ok(Some(head)) => json!({ "order_id": head.id, "owner_id": head.owner_id }),
            _ => json!({}),
        };
        self.record(admin, audit::ORDER_PROMOTE, resource, &result);

        let promoted = result?;
        match &promoted {
            Some(head) => info!("order promoted order_id={} owner={} admin={}", head.id, head.owner_id, admin),
            None => debug!("promote on empty queue admin={}", admin),
        }
        Ok(promoted)
    }

    /// Removes a queued order and closes the gap it leaves.
    ///
    /// The row is deleted; the returned view reports it as `DONE`. Fails with `NotFound` for an
    /// unknown id and `IllegalState` when the order is not queued.
    pub fn finalize(&self, id: OrderId, admin: UserId) -> Result<FinalizedOrder, QueueError> {
        self.finalize_with(id, admin, &AbortSignal::new())
    }

    pub fn finalize_with(&self, id: OrderId, admin: UserId, abort: &AbortSignal) -> Result<FinalizedOrder, QueueError> {
        let result = self.transact("finalize", abort, |t| {
            let order = t.get_by_id(id)?.ok_or(QueueError::OrderNotFound(id))?;
            let removed = queued_position(&order)?;
            t.delete(id)?;
            let shifted = close_gap(t, removed)?;
            Ok((removed, shifted))
        });

        let resource = match &result {
            Ok((removed, shifted)) => json!({ "order_id": id, "position": removed, "shifted": shifted }),
            Err(_) => json!({ "order_id": id }),
        };
        self.record(admin, audit::ORDER_FINALIZE, resource, &result);

        let (removed, shifted) = result?;
        info!(
            "order finalized order_id={} admin={} position={} shifted={}",
            id, admin, removed, shifted
        );
        Ok(FinalizedOrder {
            id,
            status: OrderStatus::Done,
        })
    }

    /// Marks a processing order as done. The row is kept.
    pub fn complete(&self, id: OrderId, admin: UserId) -> Result<Order, QueueError> {
        self.complete_with(id, admin, &AbortSignal::new())
    }

    pub fn complete_with(&self, id: OrderId, admin: UserId, abort: &AbortSignal) -> Result<Order, QueueError> {
        let result = self.transact("complete", abort, |t| {
            let mut order = t.get_by_id(id)?.ok_or(QueueError::OrderNotFound(id))?;
            if order.status != OrderStatus::Processing {
                return Err(QueueError::IllegalState {
                    id,
                    actual: order.status,
                    expected: OrderStatus::Processing,
                });
            }
            order.status = OrderStatus::Done;
            order.admin_id = Some(admin);
            t.update(&order)?;
            Ok(order)
        });

        self.record(admin, audit::ORDER_COMPLETE, json!({ "order_id": id }), &result);
        let order = result?;
        info!("order completed order_id={} owner={} admin={}", id, order.owner_id, admin);
        Ok(order)
    }

    /// Withdraws the owner's queued order. Orders already processing cannot be cancelled.
    pub fn cancel(&self, owner: UserId) -> Result<Order, QueueError> {
        self.cancel_with(owner, &AbortSignal::new())
    }

    pub fn cancel_with(&self, owner: UserId, abort: &AbortSignal) -> Result<Order, QueueError> {
        let result = self.transact("cancel", abort, |t| {
            let mut order = t
                .find_active_by_owner(owner)?
                .ok_or_else(|| QueueError::NotFound(format!("user {owner} has no queued order")))?;
            let removed = queued_position(&order)?;
            order.status = OrderStatus::Cancelled;
            order.position = None;
            t.update(&order)?;
            close_gap(t, removed)?;
            Ok(order)
        });

        let resource = match &result {
            Ok(order) => json!({ "order_id": order.id }),
            Err(_) => json!({ "owner_id": owner }),
        };
        self.record(owner, audit::ORDER_CANCEL, resource, &result);
        let order = result?;
        info!("order cancelled order_id={} owner={}", order.id, owner);
        Ok(order)
    }

    /// 1-based position of the owner's queued order, or `None` if they have none.
    pub fn my_position(&self, owner: UserId) -> Result<Option<u32>, QueueError> {
        self.store.read(|t| {
            let queued = t.list_by_status(OrderStatus::Queued)?;
            Ok(queued
                .iter()
                .position(|o| o.owner_id == owner)
                .map(|i| i as u32 + 1))
        })
    }

    pub fn get(&self, id: OrderId) -> Result<Order, QueueError> {
        self.store
            .read(|t| t.get_by_id(id))?
            .ok_or(QueueError::OrderNotFound(id))
    }

    /// Queued orders ascending by position.
    pub fn list_queued(&self) -> Result<Vec<Order>, QueueError> {
        self.list_by_status(OrderStatus::Queued)
    }

    pub fn list_by_status(&self, status: OrderStatus) -> Result<Vec<Order>, QueueError> {
        self.store.read(|t| t.list_by_status(status))
    }

    pub fn list_by_owner(&self, owner: UserId) -> Result<Vec<Order>, QueueError> {
        self.store.read(|t| t.list_by_owner(owner))
    }

    pub fn summaries_by_status(&self, status: OrderStatus) -> Result<Vec<OrderSummary>, QueueError> {
        self.store.read(|t| t.summaries_by_status(status))
    }

    pub fn summaries_by_owner(&self, owner: UserId) -> Result<Vec<OrderSummary>, QueueError> {
        self.store.read(|t| t.summaries_by_owner(owner))
    }

    fn transact<R, F>(&self, op: &'static str, abort: &AbortSignal, mut f: F) -> Result<R, QueueError>
    where
        F: FnMut(&OrderTable<'_>) -> Result<R, QueueError>,
    {
        let deadline = Instant::now() + self.settings.tx_timeout;
        let attempts = self.settings.max_retries.saturating_add(1);
        let mut attempt = 1;
        loop {
            // Each attempt may wait for the writer for an equal share of what is left.
            let share = deadline.saturating_duration_since(Instant::now()) / (attempts - attempt + 1);
            match self.store.transaction_waiting(Instant::now() + share, deadline, abort, &mut f) {
                Err(e) if e.is_retryable() => {
                    if attempt >= attempts || abort.is_aborted() {
                        warn!("{} gave up attempts={} error={}", op, attempt, e);
                        return Err(QueueError::Unavailable(format!("{op} gave up after {attempt} attempts: {e}")));
                    }
                    debug!("{} conflict attempt={} error={}; retrying", op, attempt, e);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn record<T>(&self, actor: UserId, action: &'static str, resource: serde_json::Value, result: &Result<T, QueueError>) {
        let outcome = match result {
            Ok(_) => "success",
            Err(e) if matches!(e.kind(), ErrorKind::Unavailable | ErrorKind::Internal) => "error",
            Err(_) => "rejected",
        };
        self.audit
            .emit(&AuditEvent::now(format!("user:{actor}"), action, Some(resource), outcome));
    }
}

/// Position of a queued order, or `IllegalState` for any other status.
fn queued_position(order: &Order) -> Result<u32, QueueError> {
    match (order.status, order.position) {
        (OrderStatus::Queued, Some(p)) => Ok(p),
        (OrderStatus::Queued, None) => Err(QueueError::Internal(format!("queued order {} has no position", order.id))),
        (actual, _) => Err(QueueError::IllegalState {
            id: order.id,
            actual,
            expected: OrderStatus::Queued,
        }),
    }
}

/// Decrements every queued position above `removed`, lowest first so the unique
/// position index never sees a duplicate. Returns how many orders moved.
fn close_gap(t: &OrderTable<'_>, removed: u32) -> Result<usize, QueueError> {
    let mut shifted = 0;
    for mut order in t.list_by_status(OrderStatus::Queued)? {
        match order.position {
            Some(p) if p > removed => {
                order.position = Some(p - 1);
                t.update(&order)?;
                shifted += 1;
            }
            _ => {}
        }
    }
    Ok(shifted)
}
