//! Muster — declarative agent-team execution engine
//!
//! Turns stored team configuration (agents, tasks, tools, datasources,
//! models, credentials) into a live streaming conversation session: resolves
//! the entity graph with composite ownership keys, binds platform clients
//! and tools, then drives a per-session state machine that alternates model
//! calls, tool calls, and human-input round trips while enforcing message,
//! recursion, and cancellation limits.
//!
//! # Quick Start
//!
//! ```no_run
//! use muster::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(store: Arc<dyn muster::records::ConfigStore>) -> muster::error::Result<()> {
//! let input = muster::records::fetch_team_input(store.as_ref(), "team-1").await?;
//! let graph = EntityGraphResolver::resolve(&input)?;
//! # Ok(())
//! # }
//! ```

pub mod binding;
pub mod cancel;
pub mod config;
pub mod error;
pub mod events;
pub mod graph;
pub mod platform;
pub mod pool;
pub mod prelude;
pub mod records;
pub mod session;
pub mod team;
pub mod transport;
