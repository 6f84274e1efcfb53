//! Core types for xdsync

use crate::config::NodeConfig;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Listener discovery
pub const LDS_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";

/// Route configuration discovery
pub const RDS_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";

/// Cluster discovery
pub const CDS_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";

/// Endpoint discovery
pub const EDS_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";

/// Subscription identifier, unique for the lifetime of one engine
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl SubscriptionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the local client, sent with every discovery request.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub cluster: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Node {
    /// Build the sidecar-style node identity from configuration.
    ///
    /// The id follows the `sidecar~{ip}~{pod}.{namespace}~{namespace}.svc.cluster.local`
    /// layout that istiod uses to attribute a proxy to its workload.
    pub fn from_config(config: &NodeConfig) -> Arc<Self> {
        let namespace = &config.namespace;
        let id = format!(
            "sidecar~{}~{}.{}~{}.svc.cluster.local",
            config.pod_ip, config.pod_name, namespace, namespace
        );

        let mut metadata = config.metadata.clone();
        metadata.insert("NAMESPACE".to_string(), namespace.clone());
        metadata.insert("CLUSTER_ID".to_string(), config.cluster_id.clone());

        Arc::new(Self {
            id,
            cluster: config.cluster_id.clone(),
            metadata,
        })
    }
}

/// Opaque resource payload as carried on the wire
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RawResource {
    pub type_url: String,
    pub value: Bytes,
}

impl RawResource {
    pub fn new(type_url: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            type_url: type_url.into(),
            value: value.into(),
        }
    }
}

/// Rejection details attached to a NACK
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: i32,
    pub message: String,
}

impl ErrorDetail {
    /// gRPC `INVALID_ARGUMENT`
    pub const INVALID_ARGUMENT: i32 = 3;

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self {
            code: Self::INVALID_ARGUMENT,
            message: message.into(),
        }
    }
}

/// Request sent from the client to the discovery service
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub node: Arc<Node>,
    pub type_url: String,
    pub resource_names: BTreeSet<String>,

    /// Present only on ACK/NACK requests
    pub version_info: Option<String>,

    /// Present only on ACK/NACK requests
    pub response_nonce: Option<String>,

    /// Present only on NACK requests
    pub error_detail: Option<ErrorDetail>,
}

impl DiscoveryRequest {
    /// Initial subscription request
    pub fn subscribe(
        node: Arc<Node>,
        type_url: impl Into<String>,
        resource_names: BTreeSet<String>,
    ) -> Self {
        Self {
            node,
            type_url: type_url.into(),
            resource_names,
            version_info: None,
            response_nonce: None,
            error_detail: None,
        }
    }

    /// Acknowledge `response`, echoing its version and nonce
    pub fn ack(
        node: Arc<Node>,
        response: &DiscoveryResponse,
        resource_names: BTreeSet<String>,
    ) -> Self {
        Self {
            node,
            type_url: response.type_url.clone(),
            resource_names,
            version_info: Some(response.version_info.clone()),
            response_nonce: Some(response.nonce.clone()),
            error_detail: None,
        }
    }

    /// Reject `response`, keeping the last accepted version
    pub fn nack(
        node: Arc<Node>,
        response: &DiscoveryResponse,
        resource_names: BTreeSet<String>,
        accepted_version: String,
        detail: ErrorDetail,
    ) -> Self {
        Self {
            node,
            type_url: response.type_url.clone(),
            resource_names,
            version_info: Some(accepted_version),
            response_nonce: Some(response.nonce.clone()),
            error_detail: Some(detail),
        }
    }

    pub fn is_ack(&self) -> bool {
        self.response_nonce.is_some() && self.error_detail.is_none()
    }

    pub fn is_nack(&self) -> bool {
        self.error_detail.is_some()
    }
}

/// Response pushed by the discovery service
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub type_url: String,
    pub version_info: String,
    pub nonce: String,
    pub resources: Vec<RawResource>,
}
