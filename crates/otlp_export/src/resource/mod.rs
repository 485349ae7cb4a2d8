//! Resource model: the attribute set describing the reporting entity.
//!
//! Attribute values are either resolved or pending. A pending value wraps a
//! shared future, so a `Resource` stays `Clone` and `merge` can borrow both
//! sides. Once every pending value settles (see
//! [`Resource::wait_for_async_attributes`]) the attribute list is memoized and
//! shared read-only.

mod detector;

pub use detector::{
    detect_resources, EnvResourceDetector, ProcessResourceDetector, ResourceDetector,
    SdkResourceDetector,
};

use crate::diag::Diagnostics;
use crate::error::ResourceError;
use crate::record::AttributeValue;
use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};

/// Deferred attribute value.
pub type PendingAttribute = Shared<BoxFuture<'static, Result<AttributeValue, ResourceError>>>;

/// Ordered attribute list of a resolved resource.
pub type ResourceAttributes = Vec<(String, AttributeValue)>;

#[derive(Clone)]
enum Entry {
    Resolved(AttributeValue),
    Pending(PendingAttribute),
}

/// Attribute set describing the process or service that produces telemetry.
#[derive(Clone)]
pub struct Resource {
    entries: Vec<(String, Entry)>,
    schema_url: Option<String>,
    memo: OnceLock<Arc<ResourceAttributes>>,
    diag: Diagnostics,
}

impl Resource {
    /// A resource with no attributes and no schema URL.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            schema_url: None,
            memo: OnceLock::new(),
            diag: Diagnostics::default(),
        }
    }

    /// A resource with the given resolved attributes, in iteration order.
    pub fn new<K, V>(attributes: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<AttributeValue>,
    {
        let mut resource = Self::empty();
        for (key, value) in attributes {
            resource.upsert(key.into(), Entry::Resolved(value.into()));
        }
        resource
    }

    pub fn with_schema_url(mut self, schema_url: impl Into<String>) -> Self {
        let url = schema_url.into();
        self.schema_url = (!url.is_empty()).then_some(url);
        self
    }

    pub fn with_diagnostics(mut self, diag: Diagnostics) -> Self {
        self.diag = diag;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.upsert(key.into(), Entry::Resolved(value.into()));
        self
    }

    /// Adds an attribute whose value is produced later by `value`.
    pub fn with_pending<F>(mut self, key: impl Into<String>, value: F) -> Self
    where
        F: Future<Output = Result<AttributeValue, ResourceError>> + Send + 'static,
    {
        self.upsert(key.into(), Entry::Pending(value.boxed().shared()));
        self
    }

    pub fn schema_url(&self) -> Option<&str> {
        self.schema_url.as_deref()
    }

    /// Returns `true` while any attribute value is unresolved.
    pub fn async_attributes_pending(&self) -> bool {
        self.entries
            .iter()
            .any(|(_, entry)| matches!(entry, Entry::Pending(_)))
    }

    /// Number of attribute keys, pending ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves every pending attribute in place.
    ///
    /// Pending values are awaited concurrently. A value that fails is dropped
    /// from the resource and logged; it never fails the whole resolution.
    pub async fn wait_for_async_attributes(&mut self) {
        let pending: Vec<(usize, PendingAttribute)> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(idx, (_, entry))| match entry {
                Entry::Pending(fut) => Some((idx, fut.clone())),
                Entry::Resolved(_) => None,
            })
            .collect();

        if pending.is_empty() {
            return;
        }

        let (indices, futures): (Vec<usize>, Vec<PendingAttribute>) = pending.into_iter().unzip();
        let outcomes = join_all(futures).await;

        let mut dropped = Vec::new();
        for (idx, outcome) in indices.into_iter().zip(outcomes) {
            match outcome {
                Ok(value) => self.entries[idx].1 = Entry::Resolved(value),
                Err(err) => {
                    self.diag.warn("resource", format_args!("attribute dropped: {err}"));
                    dropped.push(idx);
                }
            }
        }

        // Remove back to front so earlier indices stay valid.
        for idx in dropped.into_iter().rev() {
            self.entries.remove(idx);
        }
        self.memo = OnceLock::new();
    }

    /// Attribute list of this resource.
    ///
    /// On a fully resolved resource the list is computed once and shared.
    /// While attributes are still pending this logs an error and returns a
    /// best-effort snapshot (resolved values plus pending values that have
    /// already completed) which is not memoized.
    pub fn attributes(&self) -> Arc<ResourceAttributes> {
        if self.async_attributes_pending() {
            self.diag.error(
                "resource",
                "accessing resource attributes before async attributes settled",
            );
            return Arc::new(self.snapshot());
        }
        Arc::clone(self.memo.get_or_init(|| Arc::new(self.snapshot())))
    }

    /// Looks up one attribute without logging. Pending values read as `None`
    /// until they complete.
    pub fn get(&self, key: &str) -> Option<AttributeValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, entry)| settled_value(entry))
    }

    /// Merges `other` into a new resource.
    ///
    /// `self` is the base and `other` overrides on key collision; keys keep
    /// the position they first appeared at. Schema URLs: if only one side has
    /// one it is kept; equal URLs are kept; conflicting URLs leave the result
    /// without a schema URL and emit a warning.
    pub fn merge(&self, other: &Resource) -> Resource {
        let mut merged = Resource {
            entries: self.entries.clone(),
            schema_url: None,
            memo: OnceLock::new(),
            diag: self.diag.clone(),
        };
        for (key, entry) in &other.entries {
            merged.upsert(key.clone(), entry.clone());
        }

        merged.schema_url = match (self.schema_url.as_deref(), other.schema_url.as_deref()) {
            (None, None) => None,
            (Some(url), None) | (None, Some(url)) => Some(url.to_string()),
            (Some(a), Some(b)) if a == b => Some(a.to_string()),
            (Some(a), Some(b)) => {
                self.diag.warn(
                    "resource",
                    format_args!("schema url conflict while merging resources: `{a}` vs `{b}`"),
                );
                None
            }
        };
        merged
    }

    fn upsert(&mut self, key: String, entry: Entry) {
        self.memo = OnceLock::new();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = entry,
            None => self.entries.push((key, entry)),
        }
    }

    fn snapshot(&self) -> ResourceAttributes {
        self.entries
            .iter()
            .filter_map(|(key, entry)| settled_value(entry).map(|v| (key.clone(), v)))
            .collect()
    }
}

fn settled_value(entry: &Entry) -> Option<AttributeValue> {
    match entry {
        Entry::Resolved(value) => Some(value.clone()),
        Entry::Pending(fut) => fut.peek().and_then(|r| r.as_ref().ok()).cloned(),
    }
}

impl Default for Resource {
    /// SDK defaults: `service.name`, `telemetry.sdk.*`.
    fn default() -> Self {
        SdkResourceDetector.detect()
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<(&str, bool)> = self
            .entries
            .iter()
            .map(|(k, e)| (k.as_str(), matches!(e, Entry::Pending(_))))
            .collect();
        f.debug_struct("Resource")
            .field("keys_pending", &keys)
            .field("schema_url", &self.schema_url)
            .finish()
    }
}
