//! Upstream side of the mining proxy.
//!
//! This module owns the connection from the agent to a mining pool. One
//! upstream session is shared by many downstream mining devices, so the pool
//! sees a single connection carrying all of their work.
//!
//! # Wire formats
//!
//! The pool stream mixes two formats, told apart by the first byte of each
//! unit:
//!
//! - **JSON-RPC lines**: Stratum requests, notifications and responses, one
//!   compact JSON object per `\n`-terminated line
//! - **Ex-Messages**: binary frames starting with `0x7F` (see [`frame`])
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ─► Connecting ─► Connected ─► Subscribed ─► Authorized
//!       ▲              │             │             │             │
//!       └──────────────┴─────────────┴─────────────┴─────────────┘
//!                            any fatal error / close
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use stratum_agent::upstream::{Status, UpstreamSession};
//!
//! let session = UpstreamSession::new(config, "account.worker", 0, shutdown)?;
//! let handle = session.handle();
//! tokio::spawn(session.start());
//!
//! if handle.handshake_finished().await == Status::Authorized {
//!     handle.attach_downstream_session(device).await?;
//! }
//! ```

mod capabilities;
mod connection;
mod downstream;
mod error;
pub mod frame;
pub mod messages;
mod session;

pub use capabilities::{NegotiatedParams, ServerCapabilities};
pub use connection::{Connection, Transport};
pub use downstream::DownstreamSession;
pub use error::{UpstreamError, UpstreamResult};
pub use session::{MIN_EXTRANONCE2_SIZE, Status, UpstreamEvent, UpstreamHandle, UpstreamSession};
