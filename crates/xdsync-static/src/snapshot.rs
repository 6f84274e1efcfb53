//! Resource snapshots served by the static discovery server

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use xdsync_core::{RawResource, Result};

/// A versioned set of resources, grouped by type URL.
///
/// Each resource is a JSON object; its `name` field is what subscriptions
/// select on.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: String,

    #[serde(default)]
    pub resources: BTreeMap<String, Vec<Value>>,
}

impl Snapshot {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            resources: BTreeMap::new(),
        }
    }

    /// Load a snapshot from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Add a resource under `type_url`
    pub fn with_resource(mut self, type_url: impl Into<String>, resource: Value) -> Self {
        self.resources.entry(type_url.into()).or_default().push(resource);
        self
    }

    /// Encode the resources of `type_url` selected by `names`.
    /// An empty name set selects everything.
    pub fn select(&self, type_url: &str, names: &BTreeSet<String>) -> Vec<RawResource> {
        let Some(resources) = self.resources.get(type_url) else {
            return Vec::new();
        };

        resources
            .iter()
            .filter(|resource| {
                names.is_empty()
                    || resource_name(resource).is_some_and(|name| names.contains(name))
            })
            .filter_map(|resource| match serde_json::to_vec(resource) {
                Ok(bytes) => Some(RawResource::new(type_url, bytes)),
                Err(e) => {
                    tracing::warn!(type_url, error = %e, "Skipping unencodable resource");
                    None
                }
            })
            .collect()
    }
}

fn resource_name(resource: &Value) -> Option<&str> {
    resource.get("name").and_then(Value::as_str)
}
