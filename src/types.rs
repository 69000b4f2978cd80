//! Core types and IDs for the order queue.
//!
//! All identifiers are newtype wrappers. [`Order`] is the persisted queue record;
//! [`OrderSummary`] and [`FinalizedOrder`] are the response projections used by the API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Surrogate order identifier, assigned by the store on insert.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId(pub i64);

/// User identifier (JWT `sub`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller role carried in the bearer token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Admin => "ADMIN",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("user") {
            Some(Role::User)
        } else if s.eq_ignore_ascii_case("admin") {
            Some(Role::Admin)
        } else {
            None
        }
    }
}

/// Kind of service request. Opaque to the engine; validated at the API boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderKind {
    Product,
    Service,
    Support,
}

impl OrderKind {
    pub const ALL: [OrderKind; 3] = [OrderKind::Product, OrderKind::Service, OrderKind::Support];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Product => "PRODUCT",
            OrderKind::Service => "SERVICE",
            OrderKind::Support => "SUPPORT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

/// Order lifecycle status. `Done` and `Cancelled` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Queued,
    Processing,
    Done,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Queued => "QUEUED",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Done => "DONE",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(OrderStatus::Queued),
            "PROCESSING" => Some(OrderStatus::Processing),
            "DONE" => Some(OrderStatus::Done),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    /// Queued or processing: counts against the one-active-order-per-user rule.
    pub fn is_active(&self) -> bool {
        matches!(self, OrderStatus::Queued | OrderStatus::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted order record.
///
/// `position` is `Some(p)` with `p >= 1` exactly when `status == Queued`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub owner_id: UserId,
    pub admin_id: Option<UserId>,
    #[serde(rename = "type")]
    pub kind: OrderKind,
    pub created_at: DateTime<Utc>,
    pub status: OrderStatus,
    pub position: Option<u32>,
}

/// Order fields known before the store assigns an id.
#[derive(Clone, Debug)]
pub struct NewOrder {
    pub owner_id: UserId,
    pub kind: OrderKind,
    pub created_at: DateTime<Utc>,
    pub position: u32,
}

/// User record consumed by the queue (display name for summaries, email for notices).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    pub email: String,
    pub role: Role,
}

/// Listing row for `/meus` and `/atendimento`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSummary {
    pub id: OrderId,
    pub usuario: String,
    #[serde(rename = "tempoQuePediu")]
    pub tempo_que_pediu: DateTime<Utc>,
    #[serde(rename = "posicaoFila")]
    pub posicao_fila: Option<u32>,
    pub status: OrderStatus,
}

/// Detached terminal view returned by finalize; the row itself no longer exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedOrder {
    pub id: OrderId,
    pub status: OrderStatus,
}
