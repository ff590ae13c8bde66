//! A layered, event-sourced entity and resource store.
//!
//! Entity values are projected from a mutation event log into an
//! in-memory cache whose write path returns a future resolved once the
//! write round-trips through the log. Raw resources are served directly
//! from a prioritized list of sources: filesystem trees, local archives,
//! and archives fetched over HTTP.

pub mod blob;
pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod ident;
pub mod migration;
pub mod store;
