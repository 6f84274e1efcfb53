//! Transport seams
//!
//! The engine never talks to a network directly. A [`SessionFactory`] opens a
//! duplex stream per subscription; requests go out through the returned
//! [`DiscoveryStream`] and responses come back through the
//! [`ResponseObserver`] handed to the factory.

use crate::error::{Result, XdsError};
use crate::types::{DiscoveryRequest, DiscoveryResponse, Node};
use std::sync::Arc;

/// Receives events from one open stream.
///
/// Implementations are called from the transport's own context and must not block.
pub trait ResponseObserver: Send + Sync {
    fn on_next(&self, response: DiscoveryResponse);

    fn on_error(&self, error: XdsError);

    fn on_completed(&self) {}
}

/// Request half of an open discovery stream
pub trait DiscoveryStream: Send + Sync {
    fn send(&self, request: DiscoveryRequest) -> Result<()>;

    /// Half-close the stream. Responses already in flight may still arrive.
    fn close(&self) {}
}

/// Opens discovery streams
pub trait SessionFactory: Send + Sync {
    fn open_session(
        &self,
        node: &Node,
        type_url: &str,
        observer: Arc<dyn ResponseObserver>,
    ) -> Result<Arc<dyn DiscoveryStream>>;
}
