//! Resolve filters

use std::sync::Arc;
use xdsync_core::Result;

/// Hook run on every decoded batch of resources.
///
/// Returning `Ok(false)` stops the rest of the chain for this batch.
pub trait ResolveFilter<R>: Send + Sync {
    fn name(&self) -> &str;

    fn resolve(&self, resources: &[R]) -> Result<bool>;
}

/// Ordered list of resolve filters
pub struct FilterChain<R> {
    filters: Vec<Arc<dyn ResolveFilter<R>>>,
}

impl<R> FilterChain<R> {
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
        }
    }

    pub fn push(&mut self, filter: Arc<dyn ResolveFilter<R>>) {
        self.filters.push(filter);
    }

    /// Run the chain. A failing filter is logged and skipped.
    /// Returns the number of filters that ran.
    pub fn run(&self, resources: &[R]) -> usize {
        let mut ran = 0;
        for filter in &self.filters {
            ran += 1;
            match filter.resolve(resources) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(filter = filter.name(), "Resolve filter stopped the chain");
                    break;
                }
                Err(e) => {
                    tracing::error!(filter = filter.name(), error = %e, "Resolve filter failed");
                }
            }
        }
        ran
    }
}

impl<R> Default for FilterChain<R> {
    fn default() -> Self {
        Self::new()
    }
}
