//! Optimistic, realtime-reconciled entity caching for a loan and service
//! application kanban.
//!
//! [`sync`] holds the primitives (entity and collection hooks, realtime
//! subscriber, registry, draft autosave, attachment uploads); [`store`]
//! defines the remote store they talk to along with a SQLite reference
//! implementation; [`domain`] holds the kanban rows and helpers built on
//! top; [`server`] exposes the reference store over HTTP.

pub mod config;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod server;
pub mod store;
pub mod sync;
