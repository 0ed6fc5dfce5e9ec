//! nfqio - NFQUEUE packet interception
//!
//! Binds a Linux netfilter queue, diverts traffic into it with nftables or
//! legacy iptables rules, and hands each queued packet to a callback for a
//! verdict.
//!
//! # Architecture
//!
//! - [`core`] - Queue session, kernel transport, rule generation and backends
//! - [`config`] - Session configuration loading
//!
//! # Example
//!
//! ```no_run
//! use nfqio::config::QueueConfig;
//! use nfqio::core::session::{Flow, QueueEvent, QueueSession, Verdict};
//!
//! # async fn example() -> nfqio::Result<()> {
//! let mut session = QueueSession::open(&QueueConfig::default())?;
//! let handle = session.verdict_handle();
//! let (stop, stop_rx) = tokio::sync::watch::channel(false);
//!
//! session
//!     .register(stop_rx, move |event| {
//!         if let QueueEvent::Packet(packet) = event {
//!             let _ = handle.set_verdict(packet, Verdict::AcceptStream, None);
//!         }
//!         Flow::Continue
//!     })
//!     .await?;
//!
//! // ... later
//! let _ = stop.send(true);
//! session.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Stream verdicts
//!
//! `AcceptStream` and `DropStream` write a connection mark; the installed
//! rules accept or drop marked connections before the queue rule, so later
//! packets of that connection never reach user space.

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod core;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::session::{Flow, Packet, QueueEvent, QueueSession, Verdict, VerdictHandle};
