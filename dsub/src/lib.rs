#![deny(unsafe_code)] // Enforce memory safety across the entire crate

//! # Overall Example
//! ```rust,no_run
//!
//! use dsub::context::EngineContext;
//! use dsub::session::{ChannelCallback, Session};
//! use dsub::subscription::{SubscriptionContext, SubscriptionController};
//! use dsub::types::QoS;
//! use dsub::{Message, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let scx = EngineContext::default();
//!
//!     let (callback, mut deliveries) = ChannelCallback::channel();
//!     let session = Session::new("client-1".into(), callback);
//!     let controller = SubscriptionController::new(scx.clone(), session, false);
//!     controller
//!         .add_subscription(SubscriptionContext::builder("/sensors/#").qos(QoS::AtLeastOnce).build()?)
//!         .await?;
//!
//!     let destination = scx.destinations.find_or_create("/sensors/1").await;
//!     destination.store_message(Message::new("21.5")).wait(scx.task_timeout()).await?;
//!
//!     if let Some(d) = deliveries.recv().await {
//!         d.completion.run();
//!         d.handle.ack_received(d.message.id);
//!     }
//!     controller.close().await;
//!     Ok(())
//! }
//! ```

/// Engine
pub mod context; // Shared engine context, owns the destination catalog
pub mod destination; // Destination state and message storage
pub mod executor; // Per-destination task serializer
pub mod manager; // Destination catalog and lifecycle listeners
pub mod session; // Delivery callback seam

/// Subscriptions
pub mod subscription; // Subscription state, credit and convergence

/// Messages
pub mod message; // Message model and store
pub mod selector; // Content selector expressions
pub mod topic; // Filter parsing and matching

/// Support
pub mod error; // Error taxonomy
pub mod logger; // log/slog bridge
pub mod stats; // Engine counters
pub mod types; // Common data types

pub use dsub_conf as conf;
pub use dsub_utils as utils;

pub use context::EngineContext;
pub use destination::Destination;
pub use error::{Error, Result};
pub use message::Message;
pub use session::Session;
