//! Extension sections and their builders.
//!
//! The core grammar knows only the three rule sections. Every other named
//! section in a stanza must be registered in an [`ExtensionSet`]: the
//! grammar captures its lines verbatim and the registry invokes the matching
//! builder once per field, turning the raw section into an
//! [`ExtensionPayload`]. Hosts can register their own sections next to the
//! built-in ones.
//!
//! Built-in sections:
//!
//! ```ignore
//! producer:
//!     json_for_marc("245__"), { 'a': 'title.title', 'b': 'title.subtitle' }
//! schema:
//!     type: "string"
//!     required: true
//!     default: { 'title': '' }
//! json:
//!     loads: parse_date
//!     dumps: format_date
//! documentation:
//!     "Main title of the record"
//!     @subfield a: "Title proper"
//! ```

use crate::error::{CompileError, CompileResult};
use crate::expr::{self, Expr};
use crate::grammar::{parse_decorator, split_top_level, unquote, RawSection};
use crate::rules::{
    DocInfo, ExtensionPayload, HookPair, ProducerRule, ProducerRuleSet, SchemaInfo,
};
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

/// A builder compiling one raw section into its payload.
pub type ExtensionBuilder =
    Arc<dyn Fn(&RawSection) -> Result<ExtensionPayload, String> + Send + Sync>;

/// The registered extension sections of one namespace.
#[derive(Clone, Default)]
pub struct ExtensionSet {
    builders: IndexMap<String, ExtensionBuilder>,
}

impl fmt::Debug for ExtensionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionSet")
            .field("sections", &self.builders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ExtensionSet {
    /// An empty set accepting no extension sections.
    #[must_use]
    pub fn new() -> Self {
        ExtensionSet::default()
    }

    /// The built-in sections: `producer`, `schema`, `json`,
    /// `documentation`.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut set = ExtensionSet::new();
        set.register("producer", build_producer);
        set.register("schema", build_schema);
        set.register("json", build_json_hooks);
        set.register("documentation", build_documentation);
        set
    }

    /// Register (or replace) a section builder.
    pub fn register<F>(&mut self, name: impl Into<String>, builder: F)
    where
        F: Fn(&RawSection) -> Result<ExtensionPayload, String> + Send + Sync + 'static,
    {
        self.builders.insert(name.into(), Arc::new(builder));
    }

    /// True when `name` has a registered builder.
    #[must_use]
    pub fn is_registered(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    /// Compile one raw section for the named field.
    ///
    /// # Errors
    ///
    /// [`CompileError::UnknownSection`] for unregistered names and
    /// [`CompileError::Extension`] when the builder rejects the content.
    pub fn build(&self, json_id: &str, section: &RawSection) -> CompileResult<ExtensionPayload> {
        let builder = self.builders.get(&section.name).ok_or_else(|| {
            CompileError::UnknownSection {
                source_name: json_id.to_string(),
                line: section.line,
                section: section.name.clone(),
            }
        })?;
        builder(section).map_err(|msg| CompileError::Extension {
            name: section.name.clone(),
            json_id: json_id.to_string(),
            msg,
        })
    }
}

// ---------------------------------------------------------------------------
// Built-in builders
// ---------------------------------------------------------------------------

/// `producer_name("tag", ...), { 'out': 'path-or-expr' }` per line. Empty
/// parentheses match any provenance.
fn build_producer(section: &RawSection) -> Result<ExtensionPayload, String> {
    let mut set = ProducerRuleSet::new();
    for line in &section.lines {
        let parts = split_top_level(&line.text, ',');
        if parts.len() < 2 {
            return Err(format!(
                "line {}: expected 'name(tags...), {{outputs}}'",
                line.no
            ));
        }
        let (name, preconditions) = parse_producer_head(&parts[0])
            .ok_or_else(|| format!("line {}: malformed producer head '{}'", line.no, parts[0]))?;
        let outputs_text = parts[1..].join(", ");
        let outputs = match expr::compile_strict(&outputs_text) {
            Ok(Expr::Dict(pairs)) => pairs.into_iter().collect::<IndexMap<String, Expr>>(),
            Ok(_) => {
                return Err(format!("line {}: producer outputs must be a dict", line.no));
            },
            Err(msg) => return Err(format!("line {}: {msg}", line.no)),
        };
        set.entry(name).or_default().push(ProducerRule {
            preconditions,
            outputs,
        });
    }
    Ok(ExtensionPayload::Producer(set))
}

fn parse_producer_head(text: &str) -> Option<(String, Vec<String>)> {
    let open = text.find('(')?;
    let name = text[..open].trim();
    if name.is_empty() {
        return None;
    }
    let inner = text[open + 1..].strip_suffix(')')?;
    let mut preconditions = Vec::new();
    for part in split_top_level(inner, ',') {
        if part.is_empty() {
            continue;
        }
        preconditions.push(unquote(&part)?);
    }
    Some((name.to_string(), preconditions))
}

/// `type:`, `required:` and `default:` entries, each at most once.
fn build_schema(section: &RawSection) -> Result<ExtensionPayload, String> {
    let mut info = SchemaInfo::default();
    for line in &section.lines {
        let (key, rest) = line
            .text
            .split_once(':')
            .ok_or_else(|| format!("line {}: expected 'key: value'", line.no))?;
        let rest = rest.trim();
        match key.trim() {
            "type" => {
                info.type_name = Some(
                    unquote(rest)
                        .ok_or_else(|| format!("line {}: type must be quoted", line.no))?,
                );
            },
            "required" => {
                info.required = match rest {
                    "true" | "True" => true,
                    "false" | "False" => false,
                    other => {
                        return Err(format!("line {}: bad required flag '{other}'", line.no));
                    },
                };
            },
            "default" => {
                info.default = Some(
                    expr::compile_strict(rest)
                        .map_err(|msg| format!("line {}: {msg}", line.no))?,
                );
            },
            other => return Err(format!("line {}: unknown schema key '{other}'", line.no)),
        }
    }
    Ok(ExtensionPayload::Schema(info))
}

/// `loads:` and `dumps:` function names, both required.
fn build_json_hooks(section: &RawSection) -> Result<ExtensionPayload, String> {
    let mut loads = None;
    let mut dumps = None;
    for line in &section.lines {
        let (key, rest) = line
            .text
            .split_once(':')
            .ok_or_else(|| format!("line {}: expected 'loads:' or 'dumps:'", line.no))?;
        let name = rest.trim().to_string();
        if name.is_empty() {
            return Err(format!("line {}: missing function name", line.no));
        }
        match key.trim() {
            "loads" => loads = Some(name),
            "dumps" => dumps = Some(name),
            other => return Err(format!("line {}: unknown hook '{other}'", line.no)),
        }
    }
    match (loads, dumps) {
        (Some(loads), Some(dumps)) => {
            Ok(ExtensionPayload::JsonHooks(HookPair { loads, dumps }))
        },
        _ => Err("json section needs both 'loads:' and 'dumps:'".to_string()),
    }
}

/// A quoted doc string, then optional `@subfield x: "..."` lines.
fn build_documentation(section: &RawSection) -> Result<ExtensionPayload, String> {
    let mut info = DocInfo::default();
    for line in &section.lines {
        if let Some((name, args)) = parse_decorator(&line.text) {
            if name != "subfield" {
                return Err(format!(
                    "line {}: unknown documentation decorator '@{name}'",
                    line.no
                ));
            }
            let (subfield, doc) = args
                .split_once(':')
                .ok_or_else(|| format!("line {}: expected '@subfield x: \"doc\"'", line.no))?;
            let doc = unquote(doc.trim())
                .ok_or_else(|| format!("line {}: subfield doc must be quoted", line.no))?;
            info.subfields.insert(subfield.trim().to_string(), doc);
        } else {
            let doc = unquote(&line.text)
                .ok_or_else(|| format!("line {}: doc string must be quoted", line.no))?;
            if !info.doc.is_empty() {
                info.doc.push('\n');
            }
            info.doc.push_str(&doc);
        }
    }
    Ok(ExtensionPayload::Documentation(info))
}
