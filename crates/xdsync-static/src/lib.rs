//! xdsync Static - In-process discovery server backed by a snapshot file

pub mod server;
pub mod snapshot;

pub use server::*;
pub use snapshot::*;
