//! # Peditos order queue
//!
//! A single shared FIFO queue of service orders. Users admit one order at a time and watch
//! their position; admins pull the head into service, then finalize or complete it. Queue
//! positions stay dense (`1..N`, no gaps) across every mutation.
//!
//! ## Entry point
//!
//! [`QueueEngine`] owns the rules. Build it over an [`OrderStore`], optionally attach a
//! [`notifier::Notifier`] and an [`audit::AuditSink`], then call [`QueueEngine::admit`],
//! [`QueueEngine::promote_next`], [`QueueEngine::finalize`] and friends.
//!
//! ## Example
//!
//! ```rust
//! use peditos_queue::{OrderKind, OrderStore, QueueEngine, Role};
//! use std::sync::Arc;
//!
//! let store = Arc::new(OrderStore::open_in_memory().unwrap());
//! let ana = store.insert_user("Ana", "ana@example.com", Role::User).unwrap();
//! let engine = QueueEngine::new(store);
//! let order = engine.admit(ana.id, OrderKind::Product).unwrap();
//! assert_eq!(order.position, Some(1));
//! assert_eq!(engine.my_position(ana.id).unwrap(), Some(1));
//! ```
//!
//! ## HTTP
//!
//! [`api::create_router`] exposes the engine under `/api/peditos`, behind bearer tokens
//! issued by [`auth::JwtService`].

pub mod api;
pub mod audit;
pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod notifier;
pub mod request_counter;
pub mod store;
pub mod types;

pub use api::{create_router, AppState};
pub use auth::{AuthContext, JwtService};
pub use config::Config;
pub use engine::{EngineSettings, QueueEngine};
pub use error::{ErrorKind, QueueError};
pub use store::{AbortSignal, OrderStore};
pub use types::{FinalizedOrder, Order, OrderId, OrderKind, OrderStatus, OrderSummary, Role, User, UserId};
