//! xdsync Protocol - Discovery protocol engine
//!
//! This crate keeps named resources in sync with a discovery service:
//!
//! - `decoder`: turning raw response payloads into typed resources
//! - `filter`: resolve filters run on every decoded batch
//! - `engine`: request/response correlation, acknowledgement, one-shot and durable fetches
//! - `scheduler`: periodic resync of durable subscriptions

pub mod decoder;
pub mod engine;
pub mod filter;
pub mod scheduler;

pub use decoder::{decode_response, Decoded, JsonDecoder, ResourceDecoder};
pub use engine::{Consumer, EngineStats, XdsEngine, XdsEngineBuilder};
pub use filter::{FilterChain, ResolveFilter};
pub use scheduler::{ResyncScheduler, ResyncState};
