//! The interpreter: turns one wire record into a [`Document`] by
//! evaluating the registry's rules.
//!
//! [`Reader::translate`] processes exactly one record and always produces a
//! document unless the blob itself is unusable ([`FatalInputError`]). Field
//! failures are continuable: they are recorded on the document and the
//! remaining fields keep resolving.
//!
//! Within one call, resolution is memoized per (`json_id`, field-name)
//! pair, which also terminates `parse_first`/`depends_on` dependency
//! chains.
//!
//! # Examples
//!
//! ```ignore
//! use bibrules::{FunctionRegistry, Reader, RegistryBuilder};
//! use std::sync::Arc;
//!
//! let mut builder = RegistryBuilder::new("demo");
//! builder.add_field_source(
//!     "title.cfg",
//!     "title:\n    creator:\n        marcxml, \"245..\", value['a']\n",
//! )?;
//! let registry = Arc::new(builder.build(1)?);
//! let reader = Reader::new(registry, Arc::new(FunctionRegistry::with_builtins()));
//! let doc = reader.translate(marcxml_blob, "marcxml", &[])?;
//! ```

use crate::document::{Document, FieldMetadata};
use crate::error::{ContinuableError, FatalInputError};
use crate::expr::{self, Bindings};
use crate::functions::FunctionRegistry;
use crate::masterfmt::{FormatRegistry, IntermediateTree};
use crate::registry::RuleRegistry;
use crate::rules::{FieldRule, Multiplicity, RuleBody, RuleKind, KIND_CALCULATED, KIND_DERIVED};
use log::debug;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Evaluates rules against pre-parsed records.
///
/// Cheap to clone and safe to share: all state lives in the per-call
/// session, so one reader may serve many threads.
#[derive(Debug, Clone)]
pub struct Reader {
    registry: Arc<RuleRegistry>,
    functions: Arc<FunctionRegistry>,
    formats: FormatRegistry,
}

/// Per-call evaluation state.
struct Session {
    tree: IntermediateTree,
    format: String,
    parsed: HashSet<(String, String)>,
}

impl Reader {
    /// A reader over the given registry and functions, with the MARCXML
    /// reference format registered.
    #[must_use]
    pub fn new(registry: Arc<RuleRegistry>, functions: Arc<FunctionRegistry>) -> Self {
        Reader {
            registry,
            functions,
            formats: FormatRegistry::with_marcxml(),
        }
    }

    /// Replace the master-format registry.
    #[must_use]
    pub fn with_formats(mut self, formats: FormatRegistry) -> Self {
        self.formats = formats;
        self
    }

    /// The rule registry this reader evaluates.
    #[must_use]
    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    /// The master formats this reader can ingest.
    #[must_use]
    pub fn formats(&self) -> &FormatRegistry {
        &self.formats
    }

    /// Translate one record blob into a document.
    ///
    /// `models` restricts and renames the resolved field set; empty means
    /// the default model (every field).
    ///
    /// # Errors
    ///
    /// [`FatalInputError`] when the format is unknown, the blob cannot be
    /// pre-parsed, or a model name does not exist. Field-level failures are
    /// recorded on the document instead.
    pub fn translate(
        &self,
        blob: &str,
        master_format: &str,
        models: &[&str],
    ) -> Result<Document, FatalInputError> {
        let format = self.formats.get(master_format)?;
        let tree = format.prepare(blob)?;
        let model_fields = self
            .registry
            .resolve_models(models)
            .map_err(|e| FatalInputError::UnknownModel(e.to_string()))?;
        debug!(
            "translate: {} elements, {} fields to resolve",
            tree.entries().len(),
            model_fields.len()
        );

        let mut doc = Document::new(Arc::clone(&self.registry), Arc::clone(&self.functions))
            .with_master_format(master_format);
        let mut session = Session {
            tree,
            format: master_format.to_string(),
            parsed: HashSet::new(),
        };
        for (field_name, json_id) in &model_fields {
            self.resolve_field(&mut session, &mut doc, field_name, json_id);
        }
        Ok(doc)
    }

    /// Resolve additional fields from a blob into an existing document.
    ///
    /// Fields already present are left alone. `fields: None` means every
    /// field of the registry.
    ///
    /// # Errors
    ///
    /// [`FatalInputError`] when the blob cannot be pre-parsed or the
    /// document has no master format. The error is also recorded on the
    /// document.
    pub fn add(
        &self,
        doc: &mut Document,
        blob: &str,
        fields: Option<&[&str]>,
    ) -> Result<(), FatalInputError> {
        let mut session = self.open_session(doc, blob)?;
        for json_id in self.target_fields(doc, fields) {
            if doc.contains(&json_id) {
                continue;
            }
            self.resolve_field(&mut session, doc, &json_id, &json_id);
        }
        Ok(())
    }

    /// Re-resolve fields from a blob, overwriting present values.
    ///
    /// `fields: None` re-resolves the fields the document already carries
    /// plus every field of the registry.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Reader::add`].
    pub fn update(
        &self,
        doc: &mut Document,
        blob: &str,
        fields: Option<&[&str]>,
    ) -> Result<(), FatalInputError> {
        let mut session = self.open_session(doc, blob)?;
        for json_id in self.target_fields(doc, fields) {
            self.resolve_field(&mut session, doc, &json_id, &json_id);
        }
        Ok(())
    }

    /// Attach metadata for one field, optionally writing a value directly.
    ///
    /// With a value this is a plain [`Document::set`]; without one it only
    /// attaches metadata, marking an externally computed field.
    pub fn set(&self, doc: &mut Document, field: &str, value: Option<Value>) {
        if let Some(value) = value {
            doc.set(field, value);
            return;
        }
        let canonical = self.registry.resolve_name(field).to_string();
        match self.registry.field(&canonical) {
            Some(definition) => {
                doc.attach_metadata(FieldMetadata::from_definition(definition));
            },
            None => {
                doc.record_error(ContinuableError::UndefinedSet(canonical.clone()));
                doc.attach_metadata(FieldMetadata {
                    json_id: canonical,
                    ..FieldMetadata::default()
                });
            },
        }
    }

    fn open_session(&self, doc: &mut Document, blob: &str) -> Result<Session, FatalInputError> {
        match self.prepare_session(doc, blob) {
            Ok(session) => Ok(session),
            Err(e) => {
                doc.record_fatal(e.clone());
                Err(e)
            },
        }
    }

    fn prepare_session(&self, doc: &Document, blob: &str) -> Result<Session, FatalInputError> {
        let format_name = doc
            .master_format()
            .ok_or_else(|| FatalInputError::UnknownFormat(String::new()))?
            .to_string();
        let format = self.formats.get(&format_name)?;
        let tree = format.prepare(blob)?;
        Ok(Session {
            tree,
            format: format_name,
            parsed: HashSet::new(),
        })
    }

    fn target_fields(&self, doc: &Document, fields: Option<&[&str]>) -> Vec<String> {
        match fields {
            Some(names) => names
                .iter()
                .map(|name| self.registry.resolve_name(name).to_string())
                .collect(),
            None => {
                let mut all: Vec<String> =
                    doc.keys().map(str::to_string).collect();
                for json_id in self.registry.fields().keys() {
                    if !all.contains(json_id) {
                        all.push(json_id.clone());
                    }
                }
                all
            },
        }
    }

    // -----------------------------------------------------------------------
    // Field resolution
    // -----------------------------------------------------------------------

    /// Resolve one field, memoized per (`json_id`, field-name). Returns
    /// whether the field ended up resolved (value present or metadata
    /// attached for a deferred calculated field).
    fn resolve_field(
        &self,
        session: &mut Session,
        doc: &mut Document,
        field_name: &str,
        json_id: &str,
    ) -> bool {
        let json_id = self.registry.resolve_name(json_id).to_string();
        let key = (json_id.clone(), field_name.to_string());
        if session.parsed.contains(&key) {
            return doc.contains(&json_id) || doc.metadata(&json_id).is_some();
        }
        session.parsed.insert(key);

        let Some(field) = self.registry.field(&json_id).cloned() else {
            doc.record_error(ContinuableError::MissingDefinition(json_id));
            return false;
        };

        if !field.bodies(&session.format).is_empty() {
            return self.apply_creator_rules(session, doc, &field);
        }
        if !field.bodies(KIND_DERIVED).is_empty() {
            return self.apply_virtual_rules(session, doc, &field, RuleKind::Derived);
        }
        if !field.bodies(KIND_CALCULATED).is_empty() {
            return self.apply_virtual_rules(session, doc, &field, RuleKind::Calculated);
        }
        // A definition with no applicable rules still resolves to its
        // schema default, if one exists.
        self.apply_default(doc, &field)
    }

    fn apply_creator_rules(
        &self,
        session: &mut Session,
        doc: &mut Document,
        field: &FieldRule,
    ) -> bool {
        let bodies = field.bodies(&session.format).to_vec();
        let mut values: Vec<Value> = Vec::new();
        let mut tags: Vec<String> = Vec::new();

        for body in &bodies {
            if !self.rule_preconditions_hold(session, doc, field, body) {
                continue;
            }
            let Some(selector) = &body.selector else {
                continue;
            };
            if selector.is_aggregate() {
                let whole = session.tree.whole_record();
                if let Some(value) = self.eval_element(doc, field, body, &whole) {
                    values.push(value);
                    tags.push("entire_record".to_string());
                }
            } else {
                let elements: Vec<(String, Value)> = session
                    .tree
                    .select(selector)
                    .into_iter()
                    .map(|(tag, value)| (tag.to_string(), value.clone()))
                    .collect();
                for (tag, element) in elements {
                    if let Some(value) = self.eval_element(doc, field, body, &element) {
                        values.push(value);
                        tags.push(tag);
                        // A [0] body contributes its first element only.
                        if body.multiplicity == Multiplicity::First {
                            break;
                        }
                    }
                }
            }
        }

        let value = match values.len() {
            0 => return self.apply_default(doc, field),
            1 if field.multiplicity == Multiplicity::Single => {
                values.into_iter().next().unwrap_or(Value::Null)
            },
            _ => Value::Array(values),
        };
        doc.attach_metadata(FieldMetadata {
            json_id: field.json_id.clone(),
            kind: Some(RuleKind::Creator),
            source_format: Some(session.format.clone()),
            source_tags: tags,
            persistent_identifier: field.persistent_identifier,
            hidden: field.hidden,
            hooks: field.hooks().cloned(),
            ..FieldMetadata::default()
        });
        doc.set(&field.json_id, value);
        true
    }

    /// Evaluate one element against one creator body: the per-element
    /// guard, then the value expression. Guard or expression failure skips
    /// this element only.
    fn eval_element(
        &self,
        doc: &mut Document,
        field: &FieldRule,
        body: &RuleBody,
        element: &Value,
    ) -> Option<Value> {
        let bindings = Bindings::new()
            .with_value(element.clone())
            .with_document(doc.snapshot());
        if let Some(guard) = &body.decorators.only_if_master_value {
            match expr::eval_guard(guard, &bindings, &self.functions) {
                Ok(true) => {},
                Ok(false) => return None,
                Err(e) => {
                    doc.record_error(ContinuableError::RuleEvaluation {
                        field: field.json_id.clone(),
                        msg: e.to_string(),
                    });
                    return None;
                },
            }
        }
        match expr::eval(&body.value, &bindings, &self.functions) {
            Ok(Value::Null) => None,
            Ok(value) => Some(value),
            Err(e) => {
                doc.record_error(ContinuableError::RuleEvaluation {
                    field: field.json_id.clone(),
                    msg: e.to_string(),
                });
                None
            },
        }
    }

    fn apply_virtual_rules(
        &self,
        session: &mut Session,
        doc: &mut Document,
        field: &FieldRule,
        kind: RuleKind,
    ) -> bool {
        let source_kind = kind.as_str();
        let bodies = field.bodies(source_kind).to_vec();
        for body in &bodies {
            if !self.rule_preconditions_hold(session, doc, field, body) {
                continue;
            }
            // Calculated fields defer to first read unless memoize=0.
            if kind == RuleKind::Calculated && body.decorators.memoize != Some(0) {
                doc.attach_metadata(FieldMetadata {
                    json_id: field.json_id.clone(),
                    kind: Some(RuleKind::Calculated),
                    memoize: body.decorators.memoize,
                    persistent_identifier: field.persistent_identifier,
                    hidden: field.hidden,
                    hooks: field.hooks().cloned(),
                    ..FieldMetadata::default()
                });
                return true;
            }
            let bindings = Bindings::new().with_document(doc.snapshot());
            match expr::eval(&body.value, &bindings, &self.functions) {
                Ok(Value::Null) => {},
                Ok(value) => {
                    doc.attach_metadata(FieldMetadata {
                        json_id: field.json_id.clone(),
                        kind: Some(kind),
                        memoize: body.decorators.memoize,
                        computed_at: (kind == RuleKind::Calculated).then(now_epoch),
                        persistent_identifier: field.persistent_identifier,
                        hidden: field.hidden,
                        hooks: field.hooks().cloned(),
                        ..FieldMetadata::default()
                    });
                    doc.set(&field.json_id, value);
                    return true;
                },
                Err(e) => {
                    doc.record_error(ContinuableError::RuleEvaluation {
                        field: field.json_id.clone(),
                        msg: e.to_string(),
                    });
                },
            }
        }
        if kind == RuleKind::Derived && !field.bodies(KIND_CALCULATED).is_empty() {
            // Calculated applies only when derived produced nothing.
            return self.apply_virtual_rules(session, doc, field, RuleKind::Calculated);
        }
        self.apply_default(doc, field)
    }

    /// Rule-level decorators, evaluated in order and short-circuiting:
    /// `parse_first` (side effect only), `depends_on` (skip on failure),
    /// `only_if` (boolean guard over the document).
    fn rule_preconditions_hold(
        &self,
        session: &mut Session,
        doc: &mut Document,
        field: &FieldRule,
        body: &RuleBody,
    ) -> bool {
        for dep in &body.decorators.parse_first {
            let base = dep.split('.').next().unwrap_or(dep);
            self.resolve_field(session, doc, base, base);
        }
        for dep in &body.decorators.depends_on {
            let base = dep.split('.').next().unwrap_or(dep);
            if !self.resolve_field(session, doc, base, base) {
                doc.record_error(ContinuableError::UnresolvedDependency {
                    field: field.json_id.clone(),
                    dependency: dep.clone(),
                });
                return false;
            }
        }
        if let Some(guard) = &body.decorators.only_if {
            let bindings = Bindings::new().with_document(doc.snapshot());
            match expr::eval_guard(guard, &bindings, &self.functions) {
                Ok(true) => {},
                Ok(false) => return false,
                Err(e) => {
                    doc.record_error(ContinuableError::RuleEvaluation {
                        field: field.json_id.clone(),
                        msg: e.to_string(),
                    });
                    return false;
                },
            }
        }
        true
    }

    /// No rule produced a value: fall back to the schema default.
    fn apply_default(&self, doc: &mut Document, field: &FieldRule) -> bool {
        let Some(default) = field.schema().and_then(|schema| schema.default.as_ref()) else {
            return false;
        };
        match expr::eval(default, &Bindings::new(), &self.functions) {
            Ok(value) => {
                doc.attach_metadata(FieldMetadata {
                    json_id: field.json_id.clone(),
                    persistent_identifier: field.persistent_identifier,
                    hidden: field.hidden,
                    hooks: field.hooks().cloned(),
                    ..FieldMetadata::default()
                });
                doc.set(&field.json_id, value);
                true
            },
            Err(e) => {
                doc.record_error(ContinuableError::DefaultValue {
                    field: field.json_id.clone(),
                    msg: e.to_string(),
                });
                false
            },
        }
    }
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

    const RECORD: &str = r#"<record xmlns="http://www.loc.gov/MARC21/slim">
        <controlfield tag="001">12345</controlfield>
        <datafield tag="245" ind1=" " ind2=" ">
            <subfield code="a">Main title</subfield>
            <subfield code="b">A subtitle</subfield>
        </datafield>
        <datafield tag="700" ind1=" " ind2=" ">
            <subfield code="a">First, Author</subfield>
        </datafield>
        <datafield tag="700" ind1=" " ind2=" ">
            <subfield code="a">Second, Author</subfield>
        </datafield>
    </record>"#;

    fn reader(source: &str) -> Reader {
        let mut builder = RegistryBuilder::new("test");
        builder.add_field_source("test.cfg", source).unwrap();
        Reader::new(
            Arc::new(builder.build(1).unwrap()),
            Arc::new(FunctionRegistry::with_builtins()),
        )
    }

    #[test]
    fn test_translate_creator_field() {
        let reader = reader(
            "recid:\n    creator:\n        marcxml, \"001\", int(value)\ntitle:\n    creator:\n        marcxml, \"245..\", { 'title': value['a'], 'subtitle': value['b'] }\n",
        );
        let mut doc = reader.translate(RECORD, "marcxml", &[]).unwrap();
        assert_eq!(doc.get("recid"), Some(json!(12345)));
        assert_eq!(
            doc.get("title"),
            Some(json!({"title": "Main title", "subtitle": "A subtitle"}))
        );
        let meta = doc.metadata("title").unwrap();
        assert_eq!(meta.kind, Some(RuleKind::Creator));
        assert_eq!(meta.source_tags, vec!["245__".to_string()]);
        assert!(!doc.has_warnings());
    }

    #[test]
    fn test_repeated_elements_give_list_semantics() {
        let reader = reader(
            "authors[n]:\n    creator:\n        marcxml, \"700..\", value['a']\n",
        );
        let mut doc = reader.translate(RECORD, "marcxml", &[]).unwrap();
        assert_eq!(
            doc.get("authors"),
            Some(json!(["First, Author", "Second, Author"]))
        );
    }

    #[test]
    fn test_variant_rules_combine_first_entry_ahead() {
        let record = r#"<record xmlns="http://www.loc.gov/MARC21/slim">
            <datafield tag="100" ind1=" " ind2=" ">
                <subfield code="a">Main, Author</subfield>
            </datafield>
            <datafield tag="700" ind1=" " ind2=" ">
                <subfield code="a">First, Contributor</subfield>
            </datafield>
            <datafield tag="700" ind1=" " ind2=" ">
                <subfield code="a">Second, Contributor</subfield>
            </datafield>
        </record>"#;
        let reader = reader(
            "authors[0]:\n    creator:\n        marcxml, \"100..\", value['a']\nauthors[n]:\n    creator:\n        marcxml, \"700..\", value['a']\n",
        );
        let mut doc = reader.translate(record, "marcxml", &[]).unwrap();
        assert_eq!(
            doc.get("authors"),
            Some(json!([
                "Main, Author",
                "First, Contributor",
                "Second, Contributor"
            ]))
        );
        assert_eq!(
            doc.metadata("authors").unwrap().source_tags,
            vec!["100__".to_string(), "700__".to_string(), "700__".to_string()]
        );
    }

    #[test]
    fn test_first_entry_variant_keeps_one_element() {
        let reader = reader(
            "lead_author[0]:\n    creator:\n        marcxml, \"700..\", value['a']\n",
        );
        let mut doc = reader.translate(RECORD, "marcxml", &[]).unwrap();
        // Two 700 fields in the record, only the first one contributes.
        assert_eq!(doc.get("lead_author"), Some(json!(["First, Author"])));
    }

    #[test]
    fn test_guard_failure_skips_element_only() {
        let reader = reader(
            "authors[n]:\n    creator:\n        @only_if_master_value(neq(value['a'], 'Second, Author'))\n        marcxml, \"700..\", value['a']\n",
        );
        let mut doc = reader.translate(RECORD, "marcxml", &[]).unwrap();
        // One element guarded out, the other still contributes; a single
        // survivor on a repeatable field stays a list.
        assert_eq!(doc.get("authors"), Some(json!(["First, Author"])));
    }

    #[test]
    fn test_error_isolation_between_fields() {
        let reader = reader(
            "foo:\n    creator:\n        marcxml, \"245..\", value['zz']\nbar:\n    creator:\n        marcxml, \"245..\", value['a']\n",
        );
        let mut doc = reader.translate(RECORD, "marcxml", &[]).unwrap();
        assert_eq!(doc.get("bar"), Some(json!("Main title")));
        assert!(doc.get("foo").is_none());
        assert!(doc.has_warnings());
    }

    #[test]
    fn test_schema_default_fallback() {
        let reader = reader(
            "language:\n    creator:\n        marcxml, \"041..\", value['a']\n    schema:\n        default: 'eng'\n",
        );
        let mut doc = reader.translate(RECORD, "marcxml", &[]).unwrap();
        assert_eq!(doc.get("language"), Some(json!("eng")));
    }

    #[test]
    fn test_derived_with_depends_on() {
        let reader = reader(
            "title:\n    creator:\n        marcxml, \"245..\", value['a']\nlabel:\n    derived:\n        @depends_on('title')\n        concat('rec: ', self['title'])\n",
        );
        let mut doc = reader.translate(RECORD, "marcxml", &[]).unwrap();
        assert_eq!(doc.get("label"), Some(json!("rec: Main title")));
    }

    #[test]
    fn test_depends_on_failure_skips_rule() {
        let reader = reader(
            "label:\n    derived:\n        @depends_on('missing_field')\n        self['missing_field']\n",
        );
        let mut doc = reader.translate(RECORD, "marcxml", &[]).unwrap();
        assert!(doc.get("label").is_none());
        assert!(doc
            .errors()
            .iter()
            .any(|e| matches!(e, ContinuableError::UnresolvedDependency { .. })));
    }

    #[test]
    fn test_calculated_defers_without_eager_memoize() {
        let reader = reader(
            "title:\n    creator:\n        marcxml, \"245..\", value['a']\nshout:\n    calculated:\n        upper(self['title'])\n",
        );
        let mut doc = reader.translate(RECORD, "marcxml", &[]).unwrap();
        let meta = doc.metadata("shout").unwrap();
        assert_eq!(meta.kind, Some(RuleKind::Calculated));
        assert!(meta.computed_at.is_none());
        // Materializes on first read.
        assert_eq!(doc.get("shout"), Some(json!("MAIN TITLE")));
    }

    #[test]
    fn test_calculated_eager_with_memoize_zero() {
        let reader = reader(
            "title:\n    creator:\n        marcxml, \"245..\", value['a']\nshout:\n    calculated:\n        @memoize(0)\n        @parse_first('title')\n        upper(self['title'])\n",
        );
        let mut doc = reader.translate(RECORD, "marcxml", &[]).unwrap();
        let meta = doc.metadata("shout").unwrap();
        assert!(meta.computed_at.is_some());
        assert_eq!(doc.get("shout"), Some(json!("MAIN TITLE")));
    }

    #[test]
    fn test_aggregate_selector_contributes_once() {
        let reader = reader(
            "tag_count:\n    creator:\n        marcxml, \"entire_record\", len(value)\n",
        );
        let mut doc = reader.translate(RECORD, "marcxml", &[]).unwrap();
        // 001, 245__ and the collapsed 700__ group.
        assert_eq!(doc.get("tag_count"), Some(json!(3)));
        assert_eq!(
            doc.metadata("tag_count").unwrap().source_tags,
            vec!["entire_record".to_string()]
        );
    }

    #[test]
    fn test_model_restricts_fields() {
        let mut builder = RegistryBuilder::new("test");
        builder
            .add_field_source(
                "f.cfg",
                "title:\n    creator:\n        marcxml, \"245..\", value['a']\nrecid:\n    creator:\n        marcxml, \"001\", value\n",
            )
            .unwrap();
        builder
            .add_model_source("tiny", "fields:\n    title\n")
            .unwrap();
        let reader = Reader::new(
            Arc::new(builder.build(1).unwrap()),
            Arc::new(FunctionRegistry::with_builtins()),
        );
        let mut doc = reader.translate(RECORD, "marcxml", &["tiny"]).unwrap();
        assert_eq!(doc.get("title"), Some(json!("Main title")));
        assert!(doc.get("recid").is_none());
    }

    #[test]
    fn test_unknown_model_is_fatal() {
        let reader = reader("title:\n    creator:\n        marcxml, \"245..\", value['a']\n");
        assert!(matches!(
            reader.translate(RECORD, "marcxml", &["nope"]),
            Err(FatalInputError::UnknownModel(_))
        ));
    }

    #[test]
    fn test_add_and_update() {
        let reader = reader(
            "title:\n    creator:\n        marcxml, \"245..\", value['a']\nrecid:\n    creator:\n        marcxml, \"001\", value\n",
        );
        let mut doc = reader.translate(RECORD, "marcxml", &[]).unwrap();
        doc.set("title", json!("Edited"));

        // add leaves present fields alone
        reader.add(&mut doc, RECORD, Some(&["title"])).unwrap();
        assert_eq!(doc.get("title"), Some(json!("Edited")));

        // update re-resolves them
        reader.update(&mut doc, RECORD, Some(&["title"])).unwrap();
        assert_eq!(doc.get("title"), Some(json!("Main title")));
    }

    #[test]
    fn test_update_failure_recorded_on_document() {
        let reader = reader("title:\n    creator:\n        marcxml, \"245..\", value['a']\n");
        let mut doc = reader.translate(RECORD, "marcxml", &[]).unwrap();
        let err = reader.update(&mut doc, "<record", Some(&["title"]));
        assert!(matches!(err, Err(FatalInputError::PrepareFailed(_))));
        assert_eq!(doc.fatal_errors().len(), 1);
        assert!(doc.has_warnings());
        // The document itself is untouched.
        assert_eq!(doc.get("title"), Some(json!("Main title")));
    }

    #[test]
    fn test_reader_set_metadata_only() {
        let reader = reader("title:\n    creator:\n        marcxml, \"245..\", value['a']\n");
        let mut doc = reader.translate(RECORD, "marcxml", &[]).unwrap();
        reader.set(&mut doc, "title", None);
        assert!(doc.metadata("title").is_some());
        reader.set(&mut doc, "external_score", Some(json!(0.8)));
        assert_eq!(doc.get("external_score"), Some(json!(0.8)));
        assert!(doc.has_warnings()); // no definition for external_score
    }
}
