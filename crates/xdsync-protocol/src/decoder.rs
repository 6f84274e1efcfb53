//! Resource decoding

use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::marker::PhantomData;
use xdsync_core::{DiscoveryResponse, RawResource, Result, XdsError};

/// Decodes the raw resources of one resource type
pub trait ResourceDecoder: Send + Sync + 'static {
    type Resource: Clone + Send + Sync + 'static;

    /// Type URL this decoder understands
    fn type_url(&self) -> &str;

    fn decode_resource(&self, raw: &RawResource) -> Result<Self::Resource>;

    /// Names of resources referenced by `resources` that a dependent
    /// subscription should watch (listener -> route configuration, for example).
    fn resolve_resource_names(&self, _resources: &[Self::Resource]) -> BTreeSet<String> {
        BTreeSet::new()
    }
}

/// Outcome of decoding one response.
///
/// Undecodable entries are skipped, so `resources` may be partial.
#[derive(Debug)]
pub struct Decoded<R> {
    pub resources: Vec<R>,
    pub failures: Vec<XdsError>,
}

impl<R> Decoded<R> {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failure messages joined for a NACK
    pub fn failure_summary(&self) -> String {
        self.failures
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Decode every resource in `response`
pub fn decode_response<D: ResourceDecoder>(
    decoder: &D,
    response: &DiscoveryResponse,
) -> Decoded<D::Resource> {
    if response.type_url != decoder.type_url() {
        return Decoded {
            resources: Vec::new(),
            failures: vec![XdsError::TypeUrlMismatch {
                expected: decoder.type_url().to_string(),
                actual: response.type_url.clone(),
            }],
        };
    }

    let mut resources = Vec::with_capacity(response.resources.len());
    let mut failures = Vec::new();
    for raw in &response.resources {
        if raw.type_url != decoder.type_url() {
            failures.push(XdsError::TypeUrlMismatch {
                expected: decoder.type_url().to_string(),
                actual: raw.type_url.clone(),
            });
            continue;
        }
        match decoder.decode_resource(raw) {
            Ok(resource) => resources.push(resource),
            Err(e) => failures.push(e),
        }
    }

    Decoded {
        resources,
        failures,
    }
}

/// Decoder for resources carried as JSON documents
pub struct JsonDecoder<T> {
    type_url: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDecoder<T> {
    pub fn new(type_url: impl Into<String>) -> Self {
        Self {
            type_url: type_url.into(),
            _marker: PhantomData,
        }
    }
}

impl<T> ResourceDecoder for JsonDecoder<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    type Resource = T;

    fn type_url(&self) -> &str {
        &self.type_url
    }

    fn decode_resource(&self, raw: &RawResource) -> Result<T> {
        serde_json::from_slice(&raw.value).map_err(|e| XdsError::Decode {
            type_url: raw.type_url.clone(),
            reason: e.to_string(),
        })
    }
}
