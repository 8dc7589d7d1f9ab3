//! # Agent Coordination Fabric
//!
//! A Postgres-backed message bus, task queue, session store, result cache,
//! and subscription/notification layer for a fleet of long-running agent
//! processes. The fabric owns ordering, retry, deduplication, and
//! at-most-once-effect guarantees; it does not own LLM inference,
//! authentication, or transport — callers supply an agent identity string
//! and are trusted.
//!
//! The typical entry point is [`hub::CoordinationHub`], which constructs
//! every component from a single [`config::FabricConfig`] and owns their
//! shared lifecycle. Components are also usable standalone for callers
//! that want finer-grained control over what gets started.

pub mod cache;
pub mod config;
pub mod errors;
pub mod hub;
pub mod messaging;
pub mod polling;
pub mod session;
pub mod store;
pub mod subscription;
pub mod tasks;

pub use config::FabricConfig;
pub use errors::{FabricError, FabricResult};
pub use hub::CoordinationHub;
