//! Master (wire) formats.
//!
//! A master format supplies the two pre-parsing steps the interpreter
//! needs: [`MasterFormat::split_blob`] cuts a multi-record blob into
//! per-record fragments, and [`MasterFormat::prepare`] turns one record
//! into an [`IntermediateTree`] of tag-keyed elements that creator-rule
//! selectors match against. Formats register by name in a
//! [`FormatRegistry`].
//!
//! The reference implementation is MARCXML ([`marcxml::MarcxmlFormat`]).

pub mod marcxml;

use crate::error::FatalInputError;
use crate::rules::Selector;
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;

/// One wire format the engine can ingest.
pub trait MasterFormat: Send + Sync {
    /// Registered format name, as used in creator rules.
    fn name(&self) -> &str;

    /// Split a blob into per-record fragments.
    ///
    /// # Errors
    ///
    /// [`FatalInputError::SplitFailed`] when the blob is unparsable.
    fn split_blob(&self, text: &str) -> Result<Vec<String>, FatalInputError>;

    /// Pre-parse one record fragment into its intermediate tree.
    ///
    /// # Errors
    ///
    /// [`FatalInputError::PrepareFailed`] when the fragment is unparsable.
    fn prepare(&self, blob: &str) -> Result<IntermediateTree, FatalInputError>;
}

/// Ordered tag-keyed elements of one pre-parsed record.
///
/// Tag keys carry the full element address of the wire format (for MARCXML
/// the tag plus both indicators, blanks written as `_`, e.g. `245_0`;
/// control fields keep their bare tag). Repeated tags appear as repeated
/// entries, in wire order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntermediateTree {
    entries: Vec<(String, Value)>,
}

impl IntermediateTree {
    /// An empty tree.
    #[must_use]
    pub fn new() -> Self {
        IntermediateTree::default()
    }

    /// Append one element.
    pub fn push(&mut self, tag: impl Into<String>, value: Value) {
        self.entries.push((tag.into(), value));
    }

    /// All elements in wire order.
    #[must_use]
    pub fn entries(&self) -> &[(String, Value)] {
        &self.entries
    }

    /// Elements whose tag key matches the selector, with their tags.
    #[must_use]
    pub fn select(&self, selector: &Selector) -> Vec<(&str, &Value)> {
        self.entries
            .iter()
            .filter(|(tag, _)| selector.matches(tag))
            .map(|(tag, value)| (tag.as_str(), value))
            .collect()
    }

    /// The whole record as one JSON object, repeated tags collected into
    /// arrays. This is what aggregate selectors evaluate against.
    #[must_use]
    pub fn whole_record(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (tag, value) in &self.entries {
            match map.get_mut(tag) {
                None => {
                    map.insert(tag.clone(), value.clone());
                },
                Some(Value::Array(items)) => items.push(value.clone()),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value.clone()]);
                },
            }
        }
        Value::Object(map)
    }

    /// True when the record produced no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Master formats known to one engine instance, keyed by name.
#[derive(Clone, Default)]
pub struct FormatRegistry {
    formats: IndexMap<String, Arc<dyn MasterFormat>>,
}

impl FormatRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        FormatRegistry::default()
    }

    /// A registry with the MARCXML reference format registered.
    #[must_use]
    pub fn with_marcxml() -> Self {
        let mut registry = FormatRegistry::new();
        registry.register(marcxml::MarcxmlFormat);
        registry
    }

    /// Register (or replace) a format under its own name.
    pub fn register<F: MasterFormat + 'static>(&mut self, format: F) {
        self.formats
            .insert(format.name().to_string(), Arc::new(format));
    }

    /// Look up a format by name.
    ///
    /// # Errors
    ///
    /// [`FatalInputError::UnknownFormat`] when unregistered.
    pub fn get(&self, name: &str) -> Result<Arc<dyn MasterFormat>, FatalInputError> {
        self.formats
            .get(name)
            .cloned()
            .ok_or_else(|| FatalInputError::UnknownFormat(name.to_string()))
    }
}

impl std::fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatRegistry")
            .field("formats", &self.formats.keys().collect::<Vec<_>>())
            .finish()
    }
}
