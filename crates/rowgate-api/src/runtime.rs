//! The runtime interface: capabilities the embedder supplies to the
//! server. All hooks may be called from many tasks at once and should
//! return quickly.

use rowgate_script::InitHook;

/// Metric reporting hook: name, labels, value.
pub type MetricHook = Box<dyn Fn(&str, &[String], f64) + Send + Sync>;

/// Cache lookup hook over 64-bit keys.
pub type CacheGetHook = Box<dyn Fn(u64) -> Option<Vec<u8>> + Send + Sync>;

/// Cache store hook; a `None` value deletes the entry.
pub type CacheSetHook = Box<dyn Fn(u64, Option<Vec<u8>>) + Send + Sync>;

/// Support functions injected by the embedder. Logging flows through the
/// globally installed `tracing` subscriber; everything else is optional
/// and the corresponding feature is disabled when absent.
#[derive(Default)]
pub struct RuntimeInterface {
    /// Called with measured values, like the time taken to serve an
    /// endpoint.
    pub report_metric: Option<MetricHook>,

    /// Retrieve a cache entry.
    pub cache_get: Option<CacheGetHook>,

    /// Store or delete a cache entry.
    pub cache_set: Option<CacheSetHook>,

    /// Additional initialisation of each fresh script sandbox.
    pub init_script_context: Option<InitHook>,
}

impl RuntimeInterface {
    /// Response caching requires both directions of the cache.
    #[must_use]
    pub fn cache_enabled(&self) -> bool {
        self.cache_get.is_some() && self.cache_set.is_some()
    }

    pub(crate) fn emit_metric(&self, name: &str, labels: &[String], value: f64) {
        if let Some(report) = &self.report_metric {
            report(name, labels, value);
        }
    }

    pub(crate) fn cache_fetch(&self, key: u64) -> Option<Vec<u8>> {
        self.cache_get.as_ref().and_then(|get| get(key))
    }

    pub(crate) fn cache_store(&self, key: u64, value: Option<Vec<u8>>) {
        if let Some(set) = &self.cache_set {
            set(key, value);
        }
    }
}
