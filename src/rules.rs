//! Compiled rule structures shared by the registry, interpreter and
//! producers.
//!
//! A field configuration stanza compiles down to a [`FieldRule`]: the
//! canonical id, its aliases and markers, and a map from *source kind* (a
//! master-format name, or the synthetic kinds `derived`/`calculated`) to an
//! ordered list of [`RuleBody`] values. Extension sections (producer,
//! schema, hooks, documentation) land in a fixed set of
//! [`ExtensionPayload`] variants keyed by extension name.

use crate::expr::Expr;
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Synthetic source kind for derived rules.
pub const KIND_DERIVED: &str = "derived";
/// Synthetic source kind for calculated rules.
pub const KIND_CALCULATED: &str = "calculated";

/// The three rule families of the language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    /// Extracts a field from one specific wire format's elements.
    Creator,
    /// Computes a field from other fields, evaluated eagerly.
    Derived,
    /// Computes a field from other fields, materialized lazily (unless
    /// memoized eagerly).
    Calculated,
}

impl RuleKind {
    /// Stable name used in metadata and source-kind keys.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RuleKind::Creator => "creator",
            RuleKind::Derived => KIND_DERIVED,
            RuleKind::Calculated => KIND_CALCULATED,
        }
    }
}

/// Multiplicity marker parsed from `[0]`/`[n]` suffixes on a `json_id`.
///
/// Tracked as an explicit marker; the suffix itself is stripped from the
/// canonical id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Multiplicity {
    /// Plain field, defined exactly once.
    #[default]
    Single,
    /// `[0]` — the first-entry variant of a repeatable field.
    First,
    /// `[n]` — the repeatable variant.
    Many,
}

impl Multiplicity {
    /// Split a raw identifier into its bare name and multiplicity marker.
    #[must_use]
    pub fn split(raw: &str) -> (&str, Multiplicity) {
        if let Some(base) = raw.strip_suffix("[0]") {
            (base, Multiplicity::First)
        } else if let Some(base) = raw.strip_suffix("[n]") {
            (base, Multiplicity::Many)
        } else {
            (raw, Multiplicity::Single)
        }
    }
}

/// Compiled source-tag selector of a creator rule.
///
/// Patterns are anchored regular expressions over intermediate-tree tag
/// keys (e.g. `245__`, `909C[0-9]`). The aggregate selector
/// (`entire_record` or `*`) matches the whole record once instead of
/// per element; the choice is per rule, not per field.
#[derive(Debug, Clone)]
pub struct Selector {
    patterns: Vec<String>,
    regexes: Vec<Regex>,
    aggregate: bool,
}

impl Selector {
    /// Compile a list of tag patterns.
    ///
    /// # Errors
    ///
    /// Returns the regex error text when a pattern does not compile.
    pub fn compile(patterns: &[String]) -> Result<Selector, String> {
        let aggregate = patterns
            .iter()
            .any(|p| p == "entire_record" || p == "*");
        let mut regexes = Vec::new();
        if !aggregate {
            for pattern in patterns {
                let anchored = format!("^(?:{pattern})$");
                regexes.push(
                    Regex::new(&anchored)
                        .map_err(|e| format!("bad tag pattern '{pattern}': {e}"))?,
                );
            }
        }
        Ok(Selector {
            patterns: patterns.to_vec(),
            regexes,
            aggregate,
        })
    }

    /// True when this selector matches the entire record at once.
    #[must_use]
    pub fn is_aggregate(&self) -> bool {
        self.aggregate
    }

    /// True when the given tag key matches any pattern.
    #[must_use]
    pub fn matches(&self, tag: &str) -> bool {
        self.regexes.iter().any(|re| re.is_match(tag))
    }

    /// The original pattern strings, as written in configuration.
    #[must_use]
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

/// One `@legacy(...)` correspondence from a rule decorator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyRule {
    /// Explicit format name; only present on virtual rules, creator rules
    /// take the rule's own source format.
    pub format: Option<String>,
    /// Wire tags this correspondence covers.
    pub tags: Vec<String>,
    /// Optional subfield path appended to the canonical id with a dot.
    pub subpath: Option<String>,
}

/// Decorator set attached to one rule body.
///
/// Evaluated in declaration order by the interpreter: `parse_first`,
/// `depends_on`, `only_if` before touching elements; `only_if_master_value`
/// per element; `memoize` only affects calculated fields; `legacy` is
/// compile-time bookkeeping only.
#[derive(Debug, Clone, Default)]
pub struct Decorators {
    /// Fields force-resolved before this rule (side effect only).
    pub parse_first: Vec<String>,
    /// Fields that must resolve successfully or the rule is skipped.
    pub depends_on: Vec<String>,
    /// Boolean guard over `self`.
    pub only_if: Option<Expr>,
    /// Boolean guard over the master `value`, per element.
    pub only_if_master_value: Option<Expr>,
    /// Calculated-field cache TTL in seconds; `Some(0)` caches forever.
    pub memoize: Option<u64>,
    /// Legacy tag correspondences, consumed at compile time.
    pub legacy: Vec<LegacyRule>,
}

/// One compiled rule body.
#[derive(Debug, Clone)]
pub struct RuleBody {
    /// Which family the rule belongs to.
    pub kind: RuleKind,
    /// Multiplicity marker of the stanza variant this body came from. On a
    /// repeatable field the `[0]` bodies contribute one element, the `[n]`
    /// bodies all of them.
    pub multiplicity: Multiplicity,
    /// Master-format name for creator rules, `None` for virtual rules.
    pub source_format: Option<String>,
    /// Source-tag selector; `None` for virtual rules.
    pub selector: Option<Selector>,
    /// The compiled value expression.
    pub value: Expr,
    /// Decorators guarding and modifying evaluation.
    pub decorators: Decorators,
}

// ---------------------------------------------------------------------------
// Extension payloads
// ---------------------------------------------------------------------------

/// Schema extension content: type, required flag and default expression.
#[derive(Debug, Clone, Default)]
pub struct SchemaInfo {
    /// Declared type name, if any (informational).
    pub type_name: Option<String>,
    /// Whether the field is required.
    pub required: bool,
    /// Default-value expression, evaluated with empty bindings when a
    /// creator rule produces nothing.
    pub default: Option<Expr>,
}

/// Load/dump hook pair bridging the stored and live document forms.
///
/// Both are names in the namespace's function registry; each takes the
/// field value and returns the converted value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookPair {
    /// Function converting stored → live.
    pub loads: String,
    /// Function converting live → stored.
    pub dumps: String,
}

/// One producer rule entry for a canonical field.
#[derive(Debug, Clone)]
pub struct ProducerRule {
    /// Source-tag precondition patterns; the entry applies only when the
    /// field was populated from a matching tag. Empty set matches any
    /// provenance.
    pub preconditions: Vec<String>,
    /// Output subfield → literal value path or expression.
    pub outputs: IndexMap<String, Expr>,
}

/// Producer rules grouped by producer name.
pub type ProducerRuleSet = IndexMap<String, Vec<ProducerRule>>;

/// Documentation extension content.
#[derive(Debug, Clone, Default)]
pub struct DocInfo {
    /// Main doc string.
    pub doc: String,
    /// Per-subfield doc strings.
    pub subfields: IndexMap<String, String>,
}

/// Compiled content of one extension section, as a closed set of variants.
///
/// Host-registered extensions that do not fit a built-in variant store
/// their compiled content as an opaque JSON value.
#[derive(Debug, Clone)]
pub enum ExtensionPayload {
    /// `producer:` section.
    Producer(ProducerRuleSet),
    /// `schema:` section.
    Schema(SchemaInfo),
    /// `json:` section (load/dump hooks).
    JsonHooks(HookPair),
    /// `documentation:` section.
    Documentation(DocInfo),
    /// Any host-defined section.
    Custom(Value),
}

// ---------------------------------------------------------------------------
// Field rules and models
// ---------------------------------------------------------------------------

/// Fully resolved definition of one canonical field.
#[derive(Debug, Clone, Default)]
pub struct FieldRule {
    /// Canonical id, multiplicity suffix stripped.
    pub json_id: String,
    /// Alternative names rewritten to the canonical id on access.
    pub aliases: Vec<String>,
    /// Multiplicity marker from `[0]`/`[n]` suffixes.
    pub multiplicity: Multiplicity,
    /// Persistent-identifier level, if declared.
    pub persistent_identifier: Option<u32>,
    /// Hidden fields are skipped by filtered dumps.
    pub hidden: bool,
    /// Parents named by `@inherit_from`, in declaration order.
    pub inherit_from: Vec<String>,
    /// Source kind → ordered rule bodies. Own bodies come before inherited
    /// ones, because the interpreter evaluates a field's own rules first.
    pub rules: IndexMap<String, Vec<RuleBody>>,
    /// Extension payloads keyed by extension name.
    pub extensions: IndexMap<String, ExtensionPayload>,
}

impl Default for RuleKind {
    fn default() -> Self {
        RuleKind::Creator
    }
}

impl FieldRule {
    /// Rule bodies for one source kind, empty when absent.
    #[must_use]
    pub fn bodies(&self, source_kind: &str) -> &[RuleBody] {
        self.rules.get(source_kind).map_or(&[], Vec::as_slice)
    }

    /// Schema extension content, if the stanza carried a `schema:` section.
    #[must_use]
    pub fn schema(&self) -> Option<&SchemaInfo> {
        match self.extensions.get("schema") {
            Some(ExtensionPayload::Schema(info)) => Some(info),
            _ => None,
        }
    }

    /// Load/dump hooks, if the stanza carried a `json:` section.
    #[must_use]
    pub fn hooks(&self) -> Option<&HookPair> {
        match self.extensions.get("json") {
            Some(ExtensionPayload::JsonHooks(pair)) => Some(pair),
            _ => None,
        }
    }

    /// Producer rules for one producer name, empty when absent.
    #[must_use]
    pub fn producer_rules(&self, producer: &str) -> &[ProducerRule] {
        match self.extensions.get("producer") {
            Some(ExtensionPayload::Producer(set)) => {
                set.get(producer).map_or(&[], Vec::as_slice)
            },
            _ => &[],
        }
    }
}

/// One model: an external-field-name → `json_id` map plus base models.
///
/// Bases are merged depth-first with child entries shadowing parents.
#[derive(Debug, Clone, Default)]
pub struct ModelDefinition {
    /// Model name (file stem or registration name).
    pub name: String,
    /// Field name → canonical id.
    pub fields: IndexMap<String, String>,
    /// Parent model names, in declaration order.
    pub bases: Vec<String>,
}

/// Per-format legacy mapping: wire tag → canonical paths.
pub type LegacyMapping = IndexMap<String, IndexMap<String, Vec<String>>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiplicity_split() {
        assert_eq!(Multiplicity::split("title"), ("title", Multiplicity::Single));
        assert_eq!(
            Multiplicity::split("authors[0]"),
            ("authors", Multiplicity::First)
        );
        assert_eq!(
            Multiplicity::split("authors[n]"),
            ("authors", Multiplicity::Many)
        );
    }

    #[test]
    fn test_selector_matching() {
        let selector =
            Selector::compile(&["245__".to_string(), "909C[0-9]".to_string()]).unwrap();
        assert!(selector.matches("245__"));
        assert!(selector.matches("909C1"));
        assert!(!selector.matches("909CO"));
        assert!(!selector.matches("100__"));
        assert!(!selector.is_aggregate());
    }

    #[test]
    fn test_selector_aggregate() {
        let selector = Selector::compile(&["entire_record".to_string()]).unwrap();
        assert!(selector.is_aggregate());
        let selector = Selector::compile(&["*".to_string()]).unwrap();
        assert!(selector.is_aggregate());
    }

    #[test]
    fn test_selector_bad_pattern() {
        assert!(Selector::compile(&["909C[".to_string()]).is_err());
    }
}
