//! Compiler for the indentation-structured rule configuration language.
//!
//! A field source file holds `include` directives and field stanzas:
//!
//! ```ignore
//! include "common/base.cfg"
//!
//! @persistent_identifier(2)
//! title, main_title:
//!     creator:
//!         @only_if_master_value(value['a'])
//!         marcxml, "245__", { 'title': value['a'], 'subtitle': get(value, 'b') }
//!     producer:
//!         json_for_marc(), { 'a': 'title.title' }
//!     schema:
//!         type: "string"
//! ```
//!
//! [`compile_field_source`] turns one file into raw rule nodes: stanza
//! headers and creator/derived/calculated bodies are compiled here, while
//! extension sections (`producer:`, `schema:`, ...) are captured verbatim as
//! [`RawSection`] values for the registered extension builders. Model files
//! go through [`compile_model_source`]. All failures are
//! [`CompileError::Syntax`] carrying the source name, line and column.

use crate::error::{CompileError, CompileResult};
use crate::expr::{self, Expr};
use crate::extensions::ExtensionSet;
use crate::rules::{
    Decorators, LegacyRule, Multiplicity, RuleBody, RuleKind, Selector, KIND_CALCULATED,
    KIND_DERIVED,
};
use indexmap::IndexMap;

/// One logical line of configuration after comment stripping and
/// continuation joining.
#[derive(Debug, Clone)]
pub struct RawLine {
    /// 1-based line number of the first physical line.
    pub no: usize,
    /// Indentation width in spaces.
    pub indent: usize,
    /// Trimmed text.
    pub text: String,
}

/// An extension section captured for a registered builder.
#[derive(Debug, Clone)]
pub struct RawSection {
    /// Section name as written (without the colon).
    pub name: String,
    /// Line of the section header.
    pub line: usize,
    /// Body lines, deeper-indented than the header.
    pub lines: Vec<RawLine>,
}

/// One parsed field stanza, rules compiled, extension sections raw.
#[derive(Debug, Clone, Default)]
pub struct RawRuleNode {
    /// Canonical id with the multiplicity suffix stripped.
    pub json_id: String,
    /// Multiplicity marker from the header.
    pub multiplicity: Multiplicity,
    /// Aliases listed after the canonical id.
    pub aliases: Vec<String>,
    /// `@persistent_identifier(N)` level.
    pub persistent_identifier: Option<u32>,
    /// `@hidden` marker.
    pub hidden: bool,
    /// `@override` marker.
    pub override_flag: bool,
    /// `@extend` marker.
    pub extend_flag: bool,
    /// `@inherit_from(...)` parents, in order.
    pub inherit_from: Vec<String>,
    /// Source kind → compiled rule bodies.
    pub rules: IndexMap<String, Vec<RuleBody>>,
    /// Extension sections awaiting their builders.
    pub sections: IndexMap<String, RawSection>,
    /// Line of the stanza header.
    pub line: usize,
}

/// An `include "path"` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeDirective {
    /// Path as written, relative to the including file.
    pub path: String,
    /// Line of the directive.
    pub line: usize,
}

/// Result of compiling one field source file.
#[derive(Debug, Clone, Default)]
pub struct CompiledFieldSource {
    /// Field stanzas in file order.
    pub nodes: Vec<RawRuleNode>,
    /// Include directives in file order.
    pub includes: Vec<IncludeDirective>,
}

/// One parsed model file.
#[derive(Debug, Clone, Default)]
pub struct RawModelNode {
    /// Base model names from `@inherit_from`.
    pub bases: Vec<String>,
    /// Field name → canonical id (name maps to itself when no `=` given).
    pub fields: IndexMap<String, String>,
}

const CORE_SECTIONS: [&str; 3] = ["creator", KIND_DERIVED, KIND_CALCULATED];

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Compile one field configuration source.
///
/// `extensions` decides which non-core section names are legal; an
/// unregistered section is a compile error.
///
/// # Errors
///
/// [`CompileError::Syntax`], [`CompileError::UnknownSection`] or
/// [`CompileError::DuplicateSection`] describing the first problem found.
pub fn compile_field_source(
    source_name: &str,
    text: &str,
    extensions: &ExtensionSet,
) -> CompileResult<CompiledFieldSource> {
    let lines = logical_lines(source_name, text)?;
    let mut out = CompiledFieldSource::default();
    let mut pending: Vec<RawLine> = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = &lines[i];
        if line.indent != 0 {
            return Err(syntax(
                source_name,
                line.no,
                line.indent + 1,
                "unexpected indentation at top level",
            ));
        }
        if let Some(rest) = line.text.strip_prefix("include") {
            let rest = rest.trim();
            if !pending.is_empty() {
                return Err(syntax(
                    source_name,
                    line.no,
                    1,
                    "decorators cannot precede an include directive",
                ));
            }
            let path = unquote(rest).ok_or_else(|| {
                syntax(source_name, line.no, 1, "include expects a quoted path")
            })?;
            out.includes.push(IncludeDirective { path, line: line.no });
            i += 1;
        } else if line.text.starts_with('@') {
            pending.push(line.clone());
            i += 1;
        } else if line.text.ends_with(':') {
            let body_start = i + 1;
            let mut body_end = body_start;
            while body_end < lines.len() && lines[body_end].indent > 0 {
                body_end += 1;
            }
            let node = parse_stanza(
                source_name,
                line,
                &pending,
                &lines[body_start..body_end],
                extensions,
            )?;
            pending.clear();
            out.nodes.push(node);
            i = body_end;
        } else {
            return Err(syntax(
                source_name,
                line.no,
                1,
                format!("expected stanza header or include, found '{}'", line.text),
            ));
        }
    }

    if let Some(stray) = pending.first() {
        return Err(syntax(
            source_name,
            stray.no,
            1,
            "decorators with no stanza header",
        ));
    }
    Ok(out)
}

/// Compile one model configuration source.
///
/// # Errors
///
/// [`CompileError::Syntax`] for anything other than a single `fields:` block
/// of `name` / `name = json_id` entries with an optional `@inherit_from`.
pub fn compile_model_source(source_name: &str, text: &str) -> CompileResult<RawModelNode> {
    let lines = logical_lines(source_name, text)?;
    let mut node = RawModelNode::default();
    let mut seen_fields = false;

    let mut i = 0;
    while i < lines.len() {
        let line = &lines[i];
        if line.indent != 0 || line.text != "fields:" {
            return Err(syntax(
                source_name,
                line.no,
                line.indent + 1,
                "model files contain a single 'fields:' block",
            ));
        }
        if seen_fields {
            return Err(syntax(source_name, line.no, 1, "duplicate 'fields:' block"));
        }
        seen_fields = true;
        i += 1;
        while i < lines.len() && lines[i].indent > 0 {
            let entry = &lines[i];
            if let Some((name, args)) = parse_decorator(&entry.text) {
                if name != "inherit_from" {
                    return Err(syntax(
                        source_name,
                        entry.no,
                        1,
                        format!("unknown model decorator '@{name}'"),
                    ));
                }
                node.bases
                    .extend(parse_string_args(source_name, entry.no, &args)?);
            } else if let Some((name, json_id)) = entry.text.split_once('=') {
                let name = check_ident(source_name, entry.no, name.trim())?;
                let json_id = check_ident(source_name, entry.no, json_id.trim())?;
                node.fields.insert(name, json_id);
            } else {
                let name = check_ident(source_name, entry.no, &entry.text)?;
                node.fields.insert(name.clone(), name);
            }
            i += 1;
        }
    }

    if !seen_fields {
        return Err(syntax(source_name, 1, 1, "model file has no 'fields:' block"));
    }
    Ok(node)
}

// ---------------------------------------------------------------------------
// Stanza parsing
// ---------------------------------------------------------------------------

fn parse_stanza(
    source_name: &str,
    header: &RawLine,
    decorators: &[RawLine],
    body: &[RawLine],
    extensions: &ExtensionSet,
) -> CompileResult<RawRuleNode> {
    let mut node = RawRuleNode {
        line: header.no,
        ..RawRuleNode::default()
    };

    // Header: `json_id(, alias)*:`
    let names = header.text.trim_end_matches(':');
    let mut parts = split_top_level(names, ',');
    if parts.is_empty() || parts[0].is_empty() {
        return Err(syntax(source_name, header.no, 1, "stanza header names no field"));
    }
    let raw_id = parts.remove(0);
    let (base, multiplicity) = Multiplicity::split(&raw_id);
    node.json_id = check_ident(source_name, header.no, base)?;
    node.multiplicity = multiplicity;
    for alias in parts {
        node.aliases
            .push(check_ident(source_name, header.no, alias.trim())?);
    }

    for deco in decorators {
        let (name, args) = parse_decorator(&deco.text).ok_or_else(|| {
            syntax(source_name, deco.no, 1, "malformed decorator")
        })?;
        match name.as_str() {
            "persistent_identifier" => {
                let level = args.trim().parse::<u32>().map_err(|_| {
                    syntax(
                        source_name,
                        deco.no,
                        1,
                        "@persistent_identifier expects an integer level",
                    )
                })?;
                node.persistent_identifier = Some(level);
            },
            "inherit_from" => {
                node.inherit_from
                    .extend(parse_string_args(source_name, deco.no, &args)?);
            },
            "override" => node.override_flag = true,
            "extend" => node.extend_flag = true,
            "hidden" => node.hidden = true,
            other => {
                return Err(syntax(
                    source_name,
                    deco.no,
                    1,
                    format!("unknown field decorator '@{other}'"),
                ));
            },
        }
    }
    if node.override_flag && node.extend_flag {
        return Err(syntax(
            source_name,
            header.no,
            1,
            "@override and @extend are mutually exclusive",
        ));
    }

    // Sections sit at the body's minimum indent.
    let section_indent = body.iter().map(|l| l.indent).min().unwrap_or(0);
    let mut core_seen: Option<String> = None;
    let mut i = 0;
    while i < body.len() {
        let line = &body[i];
        if line.indent != section_indent {
            return Err(syntax(
                source_name,
                line.no,
                line.indent + 1,
                "expected a section header",
            ));
        }
        let name = line.text.trim_end_matches(':');
        if !line.text.ends_with(':') || !is_ident(name) {
            return Err(syntax(
                source_name,
                line.no,
                line.indent + 1,
                format!("expected a section header, found '{}'", line.text),
            ));
        }
        let start = i + 1;
        let mut end = start;
        while end < body.len() && body[end].indent > section_indent {
            end += 1;
        }
        let section_lines = &body[start..end];

        if CORE_SECTIONS.contains(&name) {
            if let Some(previous) = &core_seen {
                return Err(syntax(
                    source_name,
                    line.no,
                    1,
                    format!("stanza mixes '{previous}' and '{name}' rule sections"),
                ));
            }
            core_seen = Some(name.to_string());
            let bodies = if name == "creator" {
                parse_creator_section(source_name, section_lines)?
            } else {
                parse_virtual_section(source_name, name, section_lines)?
            };
            for mut rule in bodies {
                rule.multiplicity = node.multiplicity;
                let kind = rule
                    .source_format
                    .clone()
                    .unwrap_or_else(|| name.to_string());
                node.rules.entry(kind).or_default().push(rule);
            }
        } else {
            if !extensions.is_registered(name) {
                return Err(CompileError::UnknownSection {
                    source_name: source_name.to_string(),
                    line: line.no,
                    section: name.to_string(),
                });
            }
            if node.sections.contains_key(name) {
                return Err(CompileError::DuplicateSection {
                    source_name: source_name.to_string(),
                    line: line.no,
                    section: name.to_string(),
                });
            }
            node.sections.insert(
                name.to_string(),
                RawSection {
                    name: name.to_string(),
                    line: line.no,
                    lines: section_lines.to_vec(),
                },
            );
        }
        i = end;
    }

    // Only @override/@extend stanzas may omit the rule section; they patch
    // a definition that already carries one.
    if core_seen.is_none() && !node.override_flag && !node.extend_flag {
        return Err(syntax(
            source_name,
            header.no,
            1,
            format!(
                "field '{}' needs a creator, derived or calculated section",
                node.json_id
            ),
        ));
    }

    Ok(node)
}

fn parse_creator_section(
    source_name: &str,
    lines: &[RawLine],
) -> CompileResult<Vec<RuleBody>> {
    let mut bodies = Vec::new();
    let mut decorators = Decorators::default();
    for line in lines {
        if line.text.starts_with('@') {
            apply_rule_decorator(source_name, line, &mut decorators)?;
            continue;
        }
        let parts = split_top_level(&line.text, ',');
        if parts.len() < 3 {
            return Err(syntax(
                source_name,
                line.no,
                line.indent + 1,
                "creator entry needs a format, one or more quoted tags and a value",
            ));
        }
        let format = check_ident(source_name, line.no, &parts[0])?;
        let mut patterns = Vec::new();
        let mut idx = 1;
        while idx < parts.len() - 1 {
            match unquote(&parts[idx]) {
                Some(tag) => patterns.push(tag),
                None => break,
            }
            idx += 1;
        }
        if patterns.is_empty() {
            return Err(syntax(
                source_name,
                line.no,
                line.indent + 1,
                "creator entry has no quoted source tags",
            ));
        }
        let value_text = parts[idx..].join(", ");
        let selector = Selector::compile(&patterns)
            .map_err(|msg| syntax(source_name, line.no, line.indent + 1, msg))?;
        bodies.push(RuleBody {
            kind: RuleKind::Creator,
            multiplicity: Multiplicity::Single,
            source_format: Some(format),
            selector: Some(selector),
            value: expr::compile(&value_text),
            decorators: std::mem::take(&mut decorators),
        });
    }
    if has_decorators(&decorators) {
        if let Some(last) = lines.last() {
            return Err(syntax(
                source_name,
                last.no,
                1,
                "trailing decorators with no rule entry",
            ));
        }
    }
    Ok(bodies)
}

fn parse_virtual_section(
    source_name: &str,
    kind_name: &str,
    lines: &[RawLine],
) -> CompileResult<Vec<RuleBody>> {
    let kind = if kind_name == KIND_DERIVED {
        RuleKind::Derived
    } else {
        RuleKind::Calculated
    };
    let mut bodies = Vec::new();
    let mut decorators = Decorators::default();
    for line in lines {
        if line.text.starts_with('@') {
            apply_rule_decorator(source_name, line, &mut decorators)?;
            continue;
        }
        bodies.push(RuleBody {
            kind,
            multiplicity: Multiplicity::Single,
            source_format: None,
            selector: None,
            value: expr::compile(&line.text),
            decorators: std::mem::take(&mut decorators),
        });
    }
    if has_decorators(&decorators) {
        if let Some(last) = lines.last() {
            return Err(syntax(
                source_name,
                last.no,
                1,
                "trailing decorators with no rule entry",
            ));
        }
    }
    Ok(bodies)
}

fn has_decorators(d: &Decorators) -> bool {
    !d.parse_first.is_empty()
        || !d.depends_on.is_empty()
        || d.only_if.is_some()
        || d.only_if_master_value.is_some()
        || d.memoize.is_some()
        || !d.legacy.is_empty()
}

fn apply_rule_decorator(
    source_name: &str,
    line: &RawLine,
    decorators: &mut Decorators,
) -> CompileResult<()> {
    let (name, args) = parse_decorator(&line.text)
        .ok_or_else(|| syntax(source_name, line.no, 1, "malformed decorator"))?;
    match name.as_str() {
        "parse_first" => {
            decorators
                .parse_first
                .extend(parse_string_args(source_name, line.no, &args)?);
        },
        "depends_on" => {
            decorators
                .depends_on
                .extend(parse_string_args(source_name, line.no, &args)?);
        },
        "only_if" => {
            decorators.only_if = Some(compile_guard(&args));
        },
        "only_if_master_value" => {
            decorators.only_if_master_value = Some(compile_guard(&args));
        },
        "memoize" => {
            let ttl = if args.trim().is_empty() {
                0
            } else {
                args.trim().parse::<u64>().map_err(|_| {
                    syntax(source_name, line.no, 1, "@memoize expects seconds")
                })?
            };
            decorators.memoize = Some(ttl);
        },
        "legacy" => {
            decorators
                .legacy
                .extend(parse_legacy_args(source_name, line.no, &args)?);
        },
        other => {
            return Err(syntax(
                source_name,
                line.no,
                1,
                format!("unknown rule decorator '@{other}'"),
            ));
        },
    }
    Ok(())
}

// Multiple guard arguments are AND-reduced at evaluation time, so they
// compile to a list expression.
fn compile_guard(args: &str) -> Expr {
    let parts = split_top_level(args, ',');
    if parts.len() == 1 {
        expr::compile(&parts[0])
    } else {
        Expr::List(parts.iter().map(|p| expr::compile(p)).collect())
    }
}

fn parse_legacy_args(
    source_name: &str,
    line: usize,
    args: &str,
) -> CompileResult<Vec<LegacyRule>> {
    let mut format = None;
    let mut out = Vec::new();
    for (index, part) in split_top_level(args, ',').iter().enumerate() {
        if let Some(inner) = part.strip_prefix('(').and_then(|p| p.strip_suffix(')')) {
            let elements = split_top_level(inner, ',');
            let mut tags = Vec::new();
            let mut subpath = None;
            for (pos, element) in elements.iter().enumerate() {
                if element.is_empty() {
                    continue; // trailing comma in a one-element tuple
                }
                let value = unquote(element).ok_or_else(|| {
                    syntax(source_name, line, 1, "@legacy tuple entries must be quoted")
                })?;
                if pos == elements.len() - 1 && pos > 0 {
                    subpath = if value.is_empty() { None } else { Some(value) };
                } else {
                    tags.push(value);
                }
            }
            if tags.is_empty() {
                return Err(syntax(source_name, line, 1, "@legacy tuple names no tag"));
            }
            out.push(LegacyRule {
                format: format.clone(),
                tags,
                subpath,
            });
        } else if let Some(tag) = unquote(part) {
            out.push(LegacyRule {
                format: format.clone(),
                tags: vec![tag],
                subpath: None,
            });
        } else if index == 0 && is_ident(part) {
            format = Some(part.clone());
        } else {
            return Err(syntax(
                source_name,
                line,
                1,
                format!("malformed @legacy argument '{part}'"),
            ));
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Lexing helpers
// ---------------------------------------------------------------------------

/// Strip comments and blanks, reject tab indentation, join lines while
/// brackets stay open.
fn logical_lines(source_name: &str, text: &str) -> CompileResult<Vec<RawLine>> {
    let mut out: Vec<RawLine> = Vec::new();
    let mut open: i64 = 0;
    for (index, raw) in text.lines().enumerate() {
        let no = index + 1;
        let without_comment = strip_comment(raw);
        let trimmed = without_comment.trim_end();
        if trimmed.trim().is_empty() {
            continue;
        }
        let indent_str: String = trimmed.chars().take_while(|c| c.is_whitespace()).collect();
        if indent_str.contains('\t') {
            return Err(syntax(source_name, no, 1, "tabs are not allowed in indentation"));
        }
        let content = trimmed.trim_start();
        if open > 0 {
            let last = out.last_mut().unwrap_or_else(|| unreachable!());
            last.text.push(' ');
            last.text.push_str(content);
        } else {
            out.push(RawLine {
                no,
                indent: indent_str.len(),
                text: content.to_string(),
            });
        }
        open += bracket_delta(content);
        if open < 0 {
            return Err(syntax(source_name, no, 1, "unbalanced closing bracket"));
        }
    }
    if open > 0 {
        let no = out.last().map_or(1, |l| l.no);
        return Err(syntax(source_name, no, 1, "unclosed bracket at end of file"));
    }
    Ok(out)
}

fn strip_comment(line: &str) -> &str {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (pos, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, c) {
            (Some(_), '\\') => escaped = true,
            (Some(q), c) if c == q => quote = None,
            (None, '\'' | '"') => quote = Some(c),
            (None, '#') => return &line[..pos],
            _ => {},
        }
    }
    line
}

fn bracket_delta(text: &str) -> i64 {
    let mut delta = 0;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in text.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, c) {
            (Some(_), '\\') => escaped = true,
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {},
            (None, '\'' | '"') => quote = Some(c),
            (None, '(' | '[' | '{') => delta += 1,
            (None, ')' | ']' | '}') => delta -= 1,
            _ => {},
        }
    }
    delta
}

/// Split on a separator at bracket depth zero, outside quotes. Parts are
/// trimmed; empty input yields no parts.
pub(crate) fn split_top_level(text: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0i64;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in text.chars() {
        if escaped {
            escaped = false;
            current.push(c);
            continue;
        }
        match (quote, c) {
            (Some(_), '\\') => {
                escaped = true;
                current.push(c);
            },
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            },
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                current.push(c);
            },
            (None, '(' | '[' | '{') => {
                depth += 1;
                current.push(c);
            },
            (None, ')' | ']' | '}') => {
                depth -= 1;
                current.push(c);
            },
            (None, c) if c == sep && depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            },
            (None, c) => current.push(c),
        }
    }
    let last = current.trim();
    if !last.is_empty() || !parts.is_empty() {
        parts.push(last.to_string());
    }
    parts
}

/// Parse `@name` or `@name(args)`; returns the name and the raw argument
/// text (empty when absent).
pub(crate) fn parse_decorator(text: &str) -> Option<(String, String)> {
    let rest = text.strip_prefix('@')?;
    let name_end = rest
        .find(|c: char| !c.is_alphanumeric() && c != '_')
        .unwrap_or(rest.len());
    let name = &rest[..name_end];
    if name.is_empty() {
        return None;
    }
    let tail = rest[name_end..].trim();
    if tail.is_empty() {
        return Some((name.to_string(), String::new()));
    }
    let inner = tail.strip_prefix('(')?.strip_suffix(')')?;
    Some((name.to_string(), inner.trim().to_string()))
}

fn parse_string_args(source_name: &str, line: usize, args: &str) -> CompileResult<Vec<String>> {
    let mut out = Vec::new();
    for part in split_top_level(args, ',') {
        if part.is_empty() {
            continue;
        }
        let value = unquote(&part).ok_or_else(|| {
            syntax(source_name, line, 1, format!("expected a quoted string, found '{part}'"))
        })?;
        out.push(value);
    }
    Ok(out)
}

/// Strip matching quotes and process escapes; `None` when not a single
/// quoted string.
pub(crate) fn unquote(text: &str) -> Option<String> {
    let mut chars = text.chars();
    let quote = match chars.next() {
        Some(c @ ('\'' | '"')) => c,
        _ => return None,
    };
    let mut out = String::new();
    let mut escaped = false;
    let mut closed = false;
    for c in chars {
        if closed {
            return None; // trailing garbage after the closing quote
        }
        if escaped {
            out.push(match c {
                'n' => '\n',
                't' => '\t',
                other => other,
            });
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == quote {
            closed = true;
        } else {
            out.push(c);
        }
    }
    if closed {
        Some(out)
    } else {
        None
    }
}

fn is_ident(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {},
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn check_ident(source_name: &str, line: usize, text: &str) -> CompileResult<String> {
    if is_ident(text) {
        Ok(text.to_string())
    } else {
        Err(syntax(
            source_name,
            line,
            1,
            format!("invalid identifier '{text}'"),
        ))
    }
}

fn syntax(source_name: &str, line: usize, col: usize, msg: impl Into<String>) -> CompileError {
    CompileError::Syntax {
        source_name: source_name.to_string(),
        line,
        col,
        msg: msg.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleKind;

    fn extensions() -> ExtensionSet {
        ExtensionSet::with_builtins()
    }

    #[test]
    fn test_full_stanza() {
        let source = r#"
@persistent_identifier(2)
@inherit_from('base_title')
title[n], main_title:
    creator:
        @only_if_master_value(value['a'])
        marcxml, "245__", "246__", { 'title': value['a'] }
    producer:
        json_for_marc(), { 'a': 'title.title' }
"#;
        let compiled = compile_field_source("title.cfg", source, &extensions()).unwrap();
        assert_eq!(compiled.nodes.len(), 1);
        let node = &compiled.nodes[0];
        assert_eq!(node.json_id, "title");
        assert_eq!(node.multiplicity, Multiplicity::Many);
        assert_eq!(node.aliases, vec!["main_title".to_string()]);
        assert_eq!(node.persistent_identifier, Some(2));
        assert_eq!(node.inherit_from, vec!["base_title".to_string()]);
        let bodies = &node.rules["marcxml"];
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].kind, RuleKind::Creator);
        assert_eq!(bodies[0].multiplicity, Multiplicity::Many);
        assert!(bodies[0].decorators.only_if_master_value.is_some());
        let selector = bodies[0].selector.as_ref().unwrap();
        assert!(selector.matches("245__"));
        assert!(selector.matches("246__"));
        assert!(node.sections.contains_key("producer"));
    }

    #[test]
    fn test_virtual_rules_and_memoize() {
        let source = r#"
number_of_authors:
    calculated:
        @memoize(30)
        len(self['authors'])
"#;
        let compiled = compile_field_source("x.cfg", source, &extensions()).unwrap();
        let node = &compiled.nodes[0];
        let bodies = &node.rules["calculated"];
        assert_eq!(bodies[0].kind, RuleKind::Calculated);
        assert_eq!(bodies[0].decorators.memoize, Some(30));
        assert!(bodies[0].selector.is_none());
    }

    #[test]
    fn test_unknown_section_rejected() {
        let source = "title:\n    bogus:\n        x\n";
        let err = compile_field_source("x.cfg", source, &extensions()).unwrap_err();
        assert!(matches!(err, CompileError::UnknownSection { .. }));
    }

    #[test]
    fn test_duplicate_section_rejected() {
        let source = "title:\n    schema:\n        type: \"string\"\n    schema:\n        type: \"string\"\n";
        let err = compile_field_source("x.cfg", source, &extensions()).unwrap_err();
        assert!(matches!(err, CompileError::DuplicateSection { .. }));
    }

    #[test]
    fn test_stanza_without_rule_section_rejected() {
        let source = "title:\n    producer:\n        json_for_marc(), { 'a': 'title' }\n";
        let err = compile_field_source("x.cfg", source, &extensions()).unwrap_err();
        assert!(matches!(err, CompileError::Syntax { .. }));
    }

    #[test]
    fn test_patch_stanza_may_omit_rule_section() {
        let source = "@extend\ntitle:\n    producer:\n        json_for_marc(), { 'a': 'title' }\n";
        let compiled = compile_field_source("x.cfg", source, &extensions()).unwrap();
        assert!(compiled.nodes[0].extend_flag);
        assert!(compiled.nodes[0].rules.is_empty());
    }

    #[test]
    fn test_mixed_core_sections_rejected() {
        let source = "title:\n    creator:\n        marcxml, \"245__\", value['a']\n    derived:\n        self['x']\n";
        let err = compile_field_source("x.cfg", source, &extensions()).unwrap_err();
        assert!(matches!(err, CompileError::Syntax { .. }));
    }

    #[test]
    fn test_include_directive() {
        let source = "include \"common/base.cfg\"\n";
        let compiled = compile_field_source("x.cfg", source, &extensions()).unwrap();
        assert_eq!(
            compiled.includes,
            vec![IncludeDirective {
                path: "common/base.cfg".to_string(),
                line: 1
            }]
        );
    }

    #[test]
    fn test_multiline_value_joined() {
        let source = "title:\n    creator:\n        marcxml, \"245__\", {\n            'title': value['a'],\n            'subtitle': value['b'] }\n";
        let compiled = compile_field_source("x.cfg", source, &extensions()).unwrap();
        let bodies = &compiled.nodes[0].rules["marcxml"];
        assert_eq!(bodies.len(), 1);
    }

    #[test]
    fn test_legacy_decorator() {
        let source = "title:\n    creator:\n        @legacy((\"245__\", \"title\"), (\"245__a\", \"title.title\"))\n        marcxml, \"245__\", value['a']\n";
        let compiled = compile_field_source("x.cfg", source, &extensions()).unwrap();
        let legacy = &compiled.nodes[0].rules["marcxml"][0].decorators.legacy;
        assert_eq!(legacy.len(), 2);
        assert_eq!(legacy[0].tags, vec!["245__".to_string()]);
        assert_eq!(legacy[0].subpath, Some("title".to_string()));
        assert_eq!(legacy[1].subpath, Some("title.title".to_string()));
    }

    #[test]
    fn test_model_source() {
        let source = "fields:\n    @inherit_from('base')\n    title\n    authors = author_list\n";
        let node = compile_model_source("m.cfg", source).unwrap();
        assert_eq!(node.bases, vec!["base".to_string()]);
        assert_eq!(node.fields.get("title"), Some(&"title".to_string()));
        assert_eq!(node.fields.get("authors"), Some(&"author_list".to_string()));
    }

    #[test]
    fn test_duplicate_field_definition_allowed_here() {
        // Duplicate json_ids are a registry concern, not a grammar one.
        let source = "title:\n    derived:\n        self['a']\ntitle:\n    derived:\n        self['b']\n";
        let compiled = compile_field_source("x.cfg", source, &extensions()).unwrap();
        assert_eq!(compiled.nodes.len(), 2);
    }
}
