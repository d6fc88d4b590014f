//! The canonical document produced by a translation.
//!
//! A [`Document`] keeps two parallel trees: `stored` (the persistence-safe
//! form) and `live` (the materialized form), bridged per field by the
//! `loads`/`dumps` hooks named in the field's `json:` section. Calculated
//! fields materialize lazily on first read; a `memoize` TTL is tracked as
//! an explicit per-field `computed_at` timestamp, so a document is fully
//! self-contained. It also carries its `Arc<RuleRegistry>` and function
//! registry, so lazy reads need no ambient state.
//!
//! Continuable errors accumulate on the document without aborting anything;
//! a document with a non-empty error list was "ingested with warnings".
//! Fatal errors hit while re-reading into an existing document abort that
//! call but are kept on a parallel list for inspection.

use crate::error::{ContinuableError, FatalInputError};
use crate::expr::{self, Bindings};
use crate::functions::FunctionRegistry;
use crate::registry::RuleRegistry;
use crate::rules::{HookPair, RuleKind, KIND_CALCULATED};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Reserved key of the metadata namespace in the persisted form.
pub const META_KEY: &str = "__meta__";

/// Per-field bookkeeping attached when a field is resolved or set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldMetadata {
    /// Canonical id of the field.
    pub json_id: String,
    /// Rule family that produced the value; `None` when set directly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<RuleKind>,
    /// Master format the value came from, for creator fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_format: Option<String>,
    /// Wire tags that actually populated the field (producer provenance).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_tags: Vec<String>,
    /// Cache TTL in seconds for calculated fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memoize: Option<u64>,
    /// Epoch seconds of the last materialization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed_at: Option<u64>,
    /// Persistent-identifier level from the field definition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_identifier: Option<u32>,
    /// Hidden fields are skipped by filtered dumps.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hidden: bool,
    /// Load/dump hook names, resolved through the function registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<HookPair>,
}

impl FieldMetadata {
    /// Metadata seeded from a field definition, for direct `set` writes.
    #[must_use]
    pub fn from_definition(field: &crate::rules::FieldRule) -> Self {
        FieldMetadata {
            json_id: field.json_id.clone(),
            persistent_identifier: field.persistent_identifier,
            hidden: field.hidden,
            hooks: field.hooks().cloned(),
            ..FieldMetadata::default()
        }
    }
}

/// Options for [`Document::dumps`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DumpOptions {
    /// Leave the `__meta__` namespace out.
    pub without_metadata: bool,
    /// Materialize every calculated field before dumping.
    pub with_calculated: bool,
    /// Skip fields marked `@hidden`.
    pub filter_hidden: bool,
}

/// One canonical record, stored and live forms side by side.
#[derive(Debug, Clone)]
pub struct Document {
    registry: Arc<RuleRegistry>,
    functions: Arc<FunctionRegistry>,
    master_format: Option<String>,
    pub(crate) live: IndexMap<String, Value>,
    pub(crate) stored: IndexMap<String, Value>,
    pub(crate) metadata: IndexMap<String, FieldMetadata>,
    errors: Vec<ContinuableError>,
    fatal_errors: Vec<FatalInputError>,
}

impl Document {
    /// An empty document bound to a registry and function set.
    #[must_use]
    pub fn new(registry: Arc<RuleRegistry>, functions: Arc<FunctionRegistry>) -> Self {
        Document {
            registry,
            functions,
            master_format: None,
            live: IndexMap::new(),
            stored: IndexMap::new(),
            metadata: IndexMap::new(),
            errors: Vec::new(),
            fatal_errors: Vec::new(),
        }
    }

    /// Record which master format the document was translated from.
    #[must_use]
    pub fn with_master_format(mut self, format: impl Into<String>) -> Self {
        self.master_format = Some(format.into());
        self
    }

    /// The registry this document was built against.
    #[must_use]
    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    /// The function registry used for hooks and lazy evaluation.
    #[must_use]
    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        &self.functions
    }

    /// Master format the document came from, if translated.
    #[must_use]
    pub fn master_format(&self) -> Option<&str> {
        self.master_format.as_deref()
    }

    /// Canonical ids of every field the document knows about.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.metadata.keys().map(String::as_str)
    }

    /// True when the field (or alias) has a live or stored value.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        let canonical = self.registry.resolve_name(key);
        self.live.contains_key(canonical) || self.stored.contains_key(canonical)
    }

    /// Read one field, alias-aware.
    ///
    /// Calculated fields materialize here: with no `memoize` they are
    /// re-evaluated on every read, with `memoize=0` they stay cached
    /// forever, and with a positive TTL the `computed_at` timestamp decides
    /// whether the cache is still good. Other fields load from `stored`
    /// through the field's `loads` hook on first access.
    pub fn get(&mut self, key: &str) -> Option<Value> {
        let canonical = self.registry.resolve_name(key).to_string();
        if self.needs_materialization(&canonical) {
            if let Some(value) = self.materialize_calculated(&canonical) {
                return Some(value);
            }
        }
        if let Some(value) = self.live.get(&canonical) {
            return Some(value.clone());
        }
        if let Some(stored) = self.stored.get(&canonical).cloned() {
            let value = self.run_hook(&canonical, stored, HookDirection::Load);
            self.live.insert(canonical, value.clone());
            return Some(value);
        }
        None
    }

    /// Write one field, alias-aware, bypassing rule evaluation.
    ///
    /// A field unknown to the document gets metadata attached first, from
    /// its definition when one exists; writing a field with no definition
    /// records a continuable error but still takes effect.
    pub fn set(&mut self, key: &str, value: Value) {
        let canonical = self.registry.resolve_name(key).to_string();
        if !self.metadata.contains_key(&canonical) {
            let meta = match self.registry.field(&canonical) {
                Some(field) => FieldMetadata::from_definition(field),
                None => {
                    self.errors
                        .push(ContinuableError::UndefinedSet(canonical.clone()));
                    FieldMetadata {
                        json_id: canonical.clone(),
                        ..FieldMetadata::default()
                    }
                },
            };
            self.metadata.insert(canonical.clone(), meta);
        }
        let stored = self.run_hook(&canonical, value.clone(), HookDirection::Dump);
        self.live.insert(canonical.clone(), value);
        self.stored.insert(canonical, stored);
    }

    /// Attach (or replace) a field's metadata.
    pub fn attach_metadata(&mut self, meta: FieldMetadata) {
        self.metadata.insert(meta.json_id.clone(), meta);
    }

    /// A field's metadata, canonical id or alias.
    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<&FieldMetadata> {
        self.metadata.get(self.registry.resolve_name(key))
    }

    /// Mutable metadata access (timestamp adjustments, provenance).
    pub fn metadata_mut(&mut self, key: &str) -> Option<&mut FieldMetadata> {
        let canonical = self.registry.resolve_name(key).to_string();
        self.metadata.get_mut(&canonical)
    }

    /// Record a continuable error.
    pub fn record_error(&mut self, error: ContinuableError) {
        self.errors.push(error);
    }

    /// Record a fatal error hit while re-reading into this document. The
    /// failing call still aborts; the document keeps the trace.
    pub fn record_fatal(&mut self, error: FatalInputError) {
        self.fatal_errors.push(error);
    }

    /// Continuable errors accumulated so far.
    #[must_use]
    pub fn errors(&self) -> &[ContinuableError] {
        &self.errors
    }

    /// Fatal errors recorded against this document.
    #[must_use]
    pub fn fatal_errors(&self) -> &[FatalInputError] {
        &self.fatal_errors
    }

    /// True when the document was ingested with warnings.
    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.errors.is_empty() || !self.fatal_errors.is_empty()
    }

    /// Snapshot of the live tree as one JSON object (the `self` binding of
    /// rule expressions).
    #[must_use]
    pub fn snapshot(&self) -> Value {
        Value::Object(
            self.live
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Serialize the document to its persisted form.
    ///
    /// Every live value is pushed through its `dumps` hook; the metadata
    /// table lands under [`META_KEY`] unless disabled.
    pub fn dumps(&mut self, options: &DumpOptions) -> Value {
        if options.with_calculated {
            let calculated: Vec<String> = self
                .metadata
                .iter()
                .filter(|(_, meta)| meta.kind == Some(RuleKind::Calculated))
                .map(|(id, _)| id.clone())
                .collect();
            for json_id in calculated {
                let _ = self.get(&json_id);
            }
        }
        let dumped: Vec<(String, Value)> = self
            .live
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (json_id, value) in dumped {
            let stored = self.run_hook(&json_id, value, HookDirection::Dump);
            self.stored.insert(json_id, stored);
        }

        let mut map = serde_json::Map::new();
        for (json_id, value) in &self.stored {
            if options.filter_hidden
                && self.metadata.get(json_id).is_some_and(|meta| meta.hidden)
            {
                continue;
            }
            map.insert(json_id.clone(), value.clone());
        }
        if !options.without_metadata {
            let meta = serde_json::to_value(&self.metadata).unwrap_or(Value::Null);
            map.insert(META_KEY.to_string(), meta);
        }
        Value::Object(map)
    }

    /// Rebuild a document from its persisted form.
    ///
    /// Values stay in `stored`; live materialization happens lazily on
    /// [`Document::get`] through each field's `loads` hook.
    #[must_use]
    pub fn loads(
        registry: Arc<RuleRegistry>,
        functions: Arc<FunctionRegistry>,
        data: &Value,
    ) -> Document {
        let mut doc = Document::new(registry, functions);
        if let Value::Object(map) = data {
            for (key, value) in map {
                if key == META_KEY {
                    if let Ok(meta) =
                        serde_json::from_value::<IndexMap<String, FieldMetadata>>(value.clone())
                    {
                        doc.metadata = meta;
                    }
                    continue;
                }
                doc.stored.insert(key.clone(), value.clone());
            }
        }
        doc
    }

    // -----------------------------------------------------------------------
    // Lazy calculated fields
    // -----------------------------------------------------------------------

    fn needs_materialization(&self, canonical: &str) -> bool {
        let Some(meta) = self.metadata.get(canonical) else {
            return false;
        };
        if meta.kind != Some(RuleKind::Calculated) {
            return false;
        }
        match meta.memoize {
            None => true,
            Some(0) => !self.live.contains_key(canonical),
            Some(ttl) => match meta.computed_at {
                Some(at) if self.live.contains_key(canonical) => {
                    now_epoch().saturating_sub(at) > ttl
                },
                _ => true,
            },
        }
    }

    fn materialize_calculated(&mut self, json_id: &str) -> Option<Value> {
        let bodies = self.registry.field(json_id)?.bodies(KIND_CALCULATED).to_vec();
        let snapshot = self.snapshot();
        for body in &bodies {
            let bindings = Bindings::new().with_document(snapshot.clone());
            if let Some(guard) = &body.decorators.only_if {
                match expr::eval_guard(guard, &bindings, &self.functions) {
                    Ok(true) => {},
                    Ok(false) => continue,
                    Err(e) => {
                        self.errors.push(ContinuableError::RuleEvaluation {
                            field: json_id.to_string(),
                            msg: e.to_string(),
                        });
                        continue;
                    },
                }
            }
            match expr::eval(&body.value, &bindings, &self.functions) {
                Ok(Value::Null) => continue,
                Ok(value) => {
                    self.live.insert(json_id.to_string(), value.clone());
                    if let Some(meta) = self.metadata.get_mut(json_id) {
                        meta.computed_at = Some(now_epoch());
                    }
                    let stored = self.run_hook(json_id, value.clone(), HookDirection::Dump);
                    self.stored.insert(json_id.to_string(), stored);
                    return Some(value);
                },
                Err(e) => {
                    self.errors.push(ContinuableError::RuleEvaluation {
                        field: json_id.to_string(),
                        msg: e.to_string(),
                    });
                },
            }
        }
        self.live.get(json_id).cloned()
    }

    fn run_hook(&mut self, json_id: &str, value: Value, direction: HookDirection) -> Value {
        let Some(name) = self.metadata.get(json_id).and_then(|meta| {
            meta.hooks.as_ref().map(|hooks| match direction {
                HookDirection::Load => hooks.loads.clone(),
                HookDirection::Dump => hooks.dumps.clone(),
            })
        }) else {
            return value;
        };
        match self.functions.call(&name, &[value.clone()]) {
            Ok(converted) => converted,
            Err(e) => {
                self.errors.push(ContinuableError::RuleEvaluation {
                    field: json_id.to_string(),
                    msg: e.to_string(),
                });
                value
            },
        }
    }
}

#[derive(Clone, Copy)]
enum HookDirection {
    Load,
    Dump,
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryBuilder;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn empty_registry() -> Arc<RuleRegistry> {
        Arc::new(RegistryBuilder::new("test").build(1).unwrap())
    }

    fn registry_from(source: &str) -> Arc<RuleRegistry> {
        let mut builder = RegistryBuilder::new("test");
        builder.add_field_source("test.cfg", source).unwrap();
        Arc::new(builder.build(1).unwrap())
    }

    #[test]
    fn test_set_get_without_hooks() {
        let mut doc = Document::new(
            registry_from("title:\n    derived:\n        self['x']\n"),
            Arc::new(FunctionRegistry::with_builtins()),
        );
        doc.set("title", json!({"title": "X"}));
        assert_eq!(doc.get("title"), Some(json!({"title": "X"})));
        assert!(!doc.has_warnings());
    }

    #[test]
    fn test_set_undefined_field_warns_but_sticks() {
        let mut doc = Document::new(
            empty_registry(),
            Arc::new(FunctionRegistry::with_builtins()),
        );
        doc.set("ghost", json!(1));
        assert_eq!(doc.get("ghost"), Some(json!(1)));
        assert!(matches!(
            doc.errors()[0],
            ContinuableError::UndefinedSet(_)
        ));
    }

    #[test]
    fn test_alias_rewriting() {
        let mut doc = Document::new(
            registry_from("title, main_title:\n    derived:\n        self['x']\n"),
            Arc::new(FunctionRegistry::with_builtins()),
        );
        doc.set("main_title", json!("X"));
        assert_eq!(doc.get("title"), Some(json!("X")));
    }

    #[test]
    fn test_hooks_bridge_stored_and_live() {
        let mut functions = FunctionRegistry::with_builtins();
        functions.register("wrap", |args| Ok(json!({ "v": args[0] })));
        functions.register("unwrap", |args| {
            Ok(args[0].get("v").cloned().unwrap_or(Value::Null))
        });
        let registry = registry_from(
            "stamp:\n    derived:\n        self['x']\n    json:\n        loads: unwrap\n        dumps: wrap\n",
        );
        let mut doc = Document::new(registry.clone(), Arc::new(functions.clone()));
        doc.set("stamp", json!("2024"));
        assert_eq!(doc.stored["stamp"], json!({"v": "2024"}));

        let dumped = doc.dumps(&DumpOptions::default());
        let mut restored = Document::loads(registry, Arc::new(functions), &dumped);
        assert_eq!(restored.get("stamp"), Some(json!("2024")));
    }

    #[test]
    fn test_dumps_loads_round_trip_without_hooks() {
        let registry = registry_from("title:\n    derived:\n        self['x']\n");
        let functions = Arc::new(FunctionRegistry::with_builtins());
        let mut doc = Document::new(registry.clone(), functions.clone());
        doc.set("title", json!({"title": "X", "subtitle": "Y"}));
        let dumped = doc.dumps(&DumpOptions::default());
        assert!(dumped.get(META_KEY).is_some());

        let mut restored = Document::loads(registry, functions, &dumped);
        assert_eq!(restored.get("title"), doc.get("title"));
    }

    #[test]
    fn test_dumps_without_metadata_and_hidden_filter() {
        let registry = registry_from(
            "@hidden\nsecret:\n    derived:\n        self['x']\ntitle:\n    derived:\n        self['y']\n",
        );
        let mut doc = Document::new(registry, Arc::new(FunctionRegistry::with_builtins()));
        doc.set("secret", json!("s"));
        doc.set("title", json!("t"));
        let dumped = doc.dumps(&DumpOptions {
            without_metadata: true,
            filter_hidden: true,
            ..DumpOptions::default()
        });
        assert!(dumped.get(META_KEY).is_none());
        assert!(dumped.get("secret").is_none());
        assert_eq!(dumped["title"], json!("t"));
    }

    #[test]
    fn test_memoize_ttl_caching() {
        let registry = registry_from(
            "counter:\n    calculated:\n        @memoize(300)\n        tick()\n",
        );
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let mut functions = FunctionRegistry::with_builtins();
        functions.register("tick", |_args| {
            Ok(json!(CALLS.fetch_add(1, Ordering::SeqCst) + 1))
        });
        let mut doc = Document::new(registry, Arc::new(functions));
        doc.attach_metadata(FieldMetadata {
            json_id: "counter".to_string(),
            kind: Some(RuleKind::Calculated),
            memoize: Some(300),
            ..FieldMetadata::default()
        });

        assert_eq!(doc.get("counter"), Some(json!(1)));
        // Within the TTL the cache answers.
        assert_eq!(doc.get("counter"), Some(json!(1)));

        // Backdate the timestamp past the TTL.
        doc.metadata_mut("counter").unwrap().computed_at = Some(now_epoch() - 301);
        assert_eq!(doc.get("counter"), Some(json!(2)));
    }

    #[test]
    fn test_unmemoized_calculated_recomputes_every_read() {
        let registry = registry_from("roll:\n    calculated:\n        roll_once()\n");
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let mut functions = FunctionRegistry::with_builtins();
        functions.register("roll_once", |_args| {
            Ok(json!(CALLS.fetch_add(1, Ordering::SeqCst) + 1))
        });
        let mut doc = Document::new(registry, Arc::new(functions));
        doc.attach_metadata(FieldMetadata {
            json_id: "roll".to_string(),
            kind: Some(RuleKind::Calculated),
            ..FieldMetadata::default()
        });
        assert_eq!(doc.get("roll"), Some(json!(1)));
        assert_eq!(doc.get("roll"), Some(json!(2)));
    }
}
