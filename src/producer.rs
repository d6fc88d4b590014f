//! Producers: the inverse codec.
//!
//! [`produce`] walks a populated document and regenerates wire-format
//! fragments from the `producer:` rules of each field. A fragment is an
//! ordered key → value map whose keys address wire elements the way the
//! formatter expects them (`245__a`, `001`, `leader`); composing fragments
//! into actual wire syntax is a separate formatting step
//! ([`crate::masterfmt::marcxml::fragments_to_marcxml`]).
//!
//! When a field has several producer entries, the entry's precondition
//! tags are matched against how the field was actually populated (the
//! `source_tags` provenance in its metadata); an empty precondition set
//! matches any provenance.

use crate::document::Document;
use crate::error::ContinuableError;
use crate::expr::{self, is_truthy, Bindings, Expr};
use crate::rules::{ProducerRule, Selector};
use serde_json::Value;
use smallvec::SmallVec;

/// One regenerated wire fragment: ordered output-key → value entries.
///
/// Conflicting writes to the same key within one fragment are
/// last-write-wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    entries: SmallVec<[(String, Value); 4]>,
}

impl Fragment {
    /// An empty fragment.
    #[must_use]
    pub fn new() -> Self {
        Fragment::default()
    }

    /// Insert an entry, replacing any previous value under the same key.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Value under `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// All entries in insertion order.
    #[must_use]
    pub fn entries(&self) -> &[(String, Value)] {
        &self.entries
    }

    /// True when the fragment has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Regenerate fragments for one producer name.
///
/// `fields: None` covers every field the document carries. Only non-empty
/// field values produce output; one fragment is built per element of a
/// repeatable value. Failures while evaluating an output expression are
/// recorded on the document and that output key is skipped.
pub fn produce(doc: &mut Document, producer_name: &str, fields: Option<&[&str]>) -> Vec<Fragment> {
    let targets: Vec<String> = match fields {
        Some(names) => names.iter().map(|n| (*n).to_string()).collect(),
        None => doc.keys().map(str::to_string).collect(),
    };

    let mut fragments = Vec::new();
    for name in targets {
        let Some(value) = doc.get(&name) else {
            continue;
        };
        if !is_truthy(&value) {
            continue;
        }
        let json_id = doc.registry().resolve_name(&name).to_string();
        let rules: Vec<ProducerRule> = doc
            .registry()
            .producer_rules(&json_id, producer_name)
            .to_vec();
        if rules.is_empty() {
            continue;
        }
        let source_tags: Vec<String> = doc
            .metadata(&json_id)
            .map(|meta| meta.source_tags.clone())
            .unwrap_or_default();

        let elements: Vec<Value> = match value {
            Value::Array(items) => items,
            other => vec![other],
        };
        for element in &elements {
            let mut fragment = Fragment::new();
            for rule in &rules {
                if !preconditions_match(doc, &json_id, &rule.preconditions, &source_tags) {
                    continue;
                }
                apply_rule(doc, &json_id, rule, element, &mut fragment);
            }
            if !fragment.is_empty() {
                fragments.push(fragment);
            }
        }
    }
    fragments
}

/// An entry applies when it has no preconditions, or when any of its tag
/// patterns matches any tag that populated the field.
fn preconditions_match(
    doc: &mut Document,
    json_id: &str,
    preconditions: &[String],
    source_tags: &[String],
) -> bool {
    if preconditions.is_empty() {
        return true;
    }
    match Selector::compile(preconditions) {
        Ok(selector) => source_tags.iter().any(|tag| selector.matches(tag)),
        Err(msg) => {
            doc.record_error(ContinuableError::RuleEvaluation {
                field: json_id.to_string(),
                msg,
            });
            false
        },
    }
}

fn apply_rule(
    doc: &mut Document,
    json_id: &str,
    rule: &ProducerRule,
    element: &Value,
    fragment: &mut Fragment,
) {
    let functions = std::sync::Arc::clone(doc.functions());
    for (out_key, output) in &rule.outputs {
        match output {
            // A string output is a dotted path into the element.
            Expr::Str(path) => {
                if let Some(found) = resolve_path(json_id, path, element) {
                    fragment.insert(out_key.clone(), found);
                }
            },
            other => {
                let bindings = Bindings::new()
                    .with_value(element.clone())
                    .with_document(doc.snapshot());
                match expr::eval(other, &bindings, &functions) {
                    Ok(Value::Null) => {},
                    Ok(value) => fragment.insert(out_key.clone(), value),
                    Err(e) => {
                        doc.record_error(ContinuableError::RuleEvaluation {
                            field: json_id.to_string(),
                            msg: e.to_string(),
                        });
                    },
                }
            },
        }
    }
}

/// Walk a dotted path into one element. An empty path is the element
/// itself, and a leading segment equal to the field's own id also refers
/// to the element, so `title.title` on field `title` reads the element's
/// `title` key.
fn resolve_path(json_id: &str, path: &str, element: &Value) -> Option<Value> {
    if path.is_empty() {
        return Some(element.clone());
    }
    let mut segments: Vec<&str> = path.split('.').collect();
    if segments.first() == Some(&json_id) {
        segments.remove(0);
    }
    let mut current = element;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            },
            _ => return None,
        };
    }
    Some(current.clone())
}
