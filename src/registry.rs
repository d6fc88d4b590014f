//! The per-namespace rule registry and its builder.
//!
//! A [`RegistryBuilder`] collects field and model sources (text or files,
//! `include` directives resolved against the including file), then
//! [`RegistryBuilder::build`] runs the compilation passes:
//!
//! 1. register plain stanzas, holding `@override`/`@extend` stanzas aside;
//!    the `[0]`/`[n]` variants of a repeatable field register side by side
//!    under their main id
//! 2. resolve `@inherit_from` depth-first, appending parent rule lists
//!    after the child's own per source kind
//! 3. apply `@override` (replaces only the sections present), then
//!    `@extend` (additive)
//! 4. invoke every registered extension builder once per field
//! 5. collect `@legacy` decorators into the wire-tag lookup table
//! 6. resolve models, child entries shadowing parents
//!
//! Any failure aborts the build; no partial registry is ever published. The
//! result is an immutable [`RuleRegistry`] shared behind an `Arc` by every
//! reader, document and producer of the namespace.

use crate::error::{CompileError, CompileResult};
use crate::extensions::ExtensionSet;
use crate::grammar::{self, RawModelNode, RawRuleNode, RawSection};
use crate::rules::{
    ExtensionPayload, FieldRule, LegacyMapping, ModelDefinition, Multiplicity, ProducerRule,
};
use indexmap::IndexMap;
use log::{debug, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Immutable compiled view of one namespace.
#[derive(Debug, Clone)]
pub struct RuleRegistry {
    namespace: String,
    version: u64,
    fields: IndexMap<String, FieldRule>,
    aliases: IndexMap<String, String>,
    models: IndexMap<String, ModelDefinition>,
    legacy: LegacyMapping,
}

impl RuleRegistry {
    /// Namespace this registry was built for.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Monotonic build version, bumped on every republish.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Resolve a field name or alias to its canonical id.
    #[must_use]
    pub fn resolve_name<'a>(&'a self, name: &'a str) -> &'a str {
        if self.fields.contains_key(name) {
            name
        } else {
            self.aliases.get(name).map_or(name, String::as_str)
        }
    }

    /// Look up a field definition by canonical id or alias.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldRule> {
        self.fields.get(self.resolve_name(name))
    }

    /// All field definitions, in registration order.
    #[must_use]
    pub fn fields(&self) -> &IndexMap<String, FieldRule> {
        &self.fields
    }

    /// The alias table (alias → canonical id).
    #[must_use]
    pub fn aliases(&self) -> &IndexMap<String, String> {
        &self.aliases
    }

    /// Legacy wire-tag → canonical-path table for one format.
    #[must_use]
    pub fn legacy_matchings(&self, format: &str) -> Option<&IndexMap<String, Vec<String>>> {
        self.legacy.get(format)
    }

    /// Producer rules of one field for one producer name.
    #[must_use]
    pub fn producer_rules(&self, name: &str, producer: &str) -> &[ProducerRule] {
        self.field(name)
            .map_or(&[], |field| field.producer_rules(producer))
    }

    /// Merge the named models into one field-name → canonical-id map.
    ///
    /// Later models shadow earlier ones. An empty list yields the default
    /// model: every field mapped to itself.
    ///
    /// # Errors
    ///
    /// [`CompileError::BadModel`] when a name is unknown.
    pub fn resolve_models(&self, names: &[&str]) -> CompileResult<IndexMap<String, String>> {
        if names.is_empty() {
            return Ok(self
                .fields
                .keys()
                .map(|id| (id.clone(), id.clone()))
                .collect());
        }
        let mut merged = IndexMap::new();
        for name in names {
            let model = self.models.get(*name).ok_or_else(|| {
                CompileError::BadModel(format!("unknown model '{name}'"))
            })?;
            for (field_name, json_id) in &model.fields {
                merged.insert(field_name.clone(), json_id.clone());
            }
        }
        Ok(merged)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// One stanza being assembled: its rule plus unbuilt extension sections.
#[derive(Debug, Clone, Default)]
struct PendingVariant {
    multiplicity: Multiplicity,
    rule: FieldRule,
    sections: IndexMap<String, RawSection>,
    source_name: String,
}

/// Every stanza registered under one main id. A plain field holds a single
/// variant; a repeatable field may define its `[0]` and `[n]` variants
/// side by side.
#[derive(Debug, Clone, Default)]
struct PendingField {
    variants: Vec<PendingVariant>,
}

/// Collects configuration sources and compiles them into a
/// [`RuleRegistry`].
#[derive(Debug)]
pub struct RegistryBuilder {
    namespace: String,
    extensions: ExtensionSet,
    nodes: Vec<(String, RawRuleNode)>,
    models: Vec<(String, RawModelNode)>,
}

impl RegistryBuilder {
    /// Start a builder with the built-in extension sections.
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        RegistryBuilder {
            namespace: namespace.into(),
            extensions: ExtensionSet::with_builtins(),
            nodes: Vec::new(),
            models: Vec::new(),
        }
    }

    /// Replace the extension set (adds host sections).
    #[must_use]
    pub fn with_extensions(mut self, extensions: ExtensionSet) -> Self {
        self.extensions = extensions;
        self
    }

    /// Compile and queue one field source given as text.
    ///
    /// # Errors
    ///
    /// Grammar errors, or [`CompileError::BadInclude`] since text sources
    /// have no base path to resolve includes against.
    pub fn add_field_source(&mut self, source_name: &str, text: &str) -> CompileResult<()> {
        let compiled = grammar::compile_field_source(source_name, text, &self.extensions)?;
        if let Some(include) = compiled.includes.first() {
            return Err(CompileError::BadInclude {
                path: include.path.clone(),
                msg: "includes require file-based loading".to_string(),
            });
        }
        for node in compiled.nodes {
            self.nodes.push((source_name.to_string(), node));
        }
        Ok(())
    }

    /// Compile and queue one field file, resolving `include` directives
    /// relative to it. Each file is included at most once; include cycles
    /// are rejected.
    ///
    /// # Errors
    ///
    /// Grammar, include or I/O errors.
    pub fn add_field_file(&mut self, path: impl AsRef<Path>) -> CompileResult<()> {
        let mut visited = Vec::new();
        self.add_field_file_inner(path.as_ref(), &mut visited)
    }

    fn add_field_file_inner(
        &mut self,
        path: &Path,
        visited: &mut Vec<PathBuf>,
    ) -> CompileResult<()> {
        let canonical = path.canonicalize().map_err(|e| CompileError::BadInclude {
            path: path.display().to_string(),
            msg: e.to_string(),
        })?;
        if visited.contains(&canonical) {
            // Repeated includes are harmless; each file contributes once.
            return Ok(());
        }
        visited.push(canonical.clone());
        let text = std::fs::read_to_string(&canonical)?;
        let source_name = path.display().to_string();
        let compiled = grammar::compile_field_source(&source_name, &text, &self.extensions)?;
        let base = canonical.parent().map(Path::to_path_buf).unwrap_or_default();
        for include in &compiled.includes {
            self.add_field_file_inner(&base.join(&include.path), visited)?;
        }
        for node in compiled.nodes {
            self.nodes.push((source_name.clone(), node));
        }
        Ok(())
    }

    /// Compile and queue one model source given as text.
    ///
    /// # Errors
    ///
    /// Grammar errors, or [`CompileError::BadModel`] for duplicate names.
    pub fn add_model_source(&mut self, model_name: &str, text: &str) -> CompileResult<()> {
        if self.models.iter().any(|(name, _)| name == model_name) {
            return Err(CompileError::BadModel(format!(
                "model '{model_name}' is defined twice"
            )));
        }
        let node = grammar::compile_model_source(model_name, text)?;
        self.models.push((model_name.to_string(), node));
        Ok(())
    }

    /// Load a namespace directory: every `*.cfg` under `fields/` as a field
    /// file and every `*.cfg` under `models/` as a model named by its file
    /// stem.
    ///
    /// # Errors
    ///
    /// I/O and compile errors.
    pub fn load_directory(&mut self, dir: impl AsRef<Path>) -> CompileResult<()> {
        let dir = dir.as_ref();
        for path in sorted_cfg_files(&dir.join("fields"))? {
            self.add_field_file(&path)?;
        }
        for path in sorted_cfg_files(&dir.join("models"))? {
            let model_name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let text = std::fs::read_to_string(&path)?;
            self.add_model_source(&model_name, &text)?;
        }
        Ok(())
    }

    /// Run the compilation passes and produce the registry.
    ///
    /// # Errors
    ///
    /// The first [`CompileError`] found; nothing is published on failure.
    pub fn build(self, version: u64) -> CompileResult<RuleRegistry> {
        let RegistryBuilder {
            namespace,
            extensions,
            nodes,
            models,
        } = self;
        debug!(
            "building registry '{namespace}' v{version}: {} stanzas, {} models",
            nodes.len(),
            models.len()
        );

        // Pass 1: plain stanzas register, override/extend stand by. The
        // [0]/[n] variants of a repeatable field share one main id; any
        // other repetition of an id is a duplicate.
        let mut pending: IndexMap<String, PendingField> = IndexMap::new();
        let mut stand_by: Vec<(String, RawRuleNode)> = Vec::new();
        for (source_name, node) in nodes {
            if node.override_flag || node.extend_flag {
                stand_by.push((source_name, node));
                continue;
            }
            let entry = pending.entry(node.json_id.clone()).or_default();
            let clash = entry.variants.iter().any(|variant| {
                variant.multiplicity == node.multiplicity
                    || variant.multiplicity == Multiplicity::Single
                    || node.multiplicity == Multiplicity::Single
            });
            if clash {
                return Err(CompileError::DuplicateField {
                    json_id: node.json_id,
                });
            }
            entry.variants.push(new_variant(source_name, node));
        }

        // Pass 2: inheritance, parents before children.
        let order = inheritance_order(&pending)?;
        for json_id in order {
            let inherit_lists: Vec<(usize, Vec<String>)> = pending[&json_id]
                .variants
                .iter()
                .enumerate()
                .map(|(index, variant)| (index, variant.rule.inherit_from.clone()))
                .collect();
            for (index, parent_ids) in inherit_lists {
                for parent_id in parent_ids {
                    let parent = pending[&parent_id].clone();
                    let child = &mut pending[&json_id].variants[index];
                    for parent_variant in &parent.variants {
                        merge_parent(&mut child.rule, &mut child.sections, parent_variant);
                    }
                }
            }
        }

        // Pass 3: override and extend, in file order.
        for (source_name, node) in stand_by {
            let marker = if node.override_flag { "override" } else { "extend" };
            if !node.inherit_from.is_empty() {
                return Err(CompileError::Syntax {
                    source_name,
                    line: node.line,
                    col: 1,
                    msg: format!("@inherit_from is not allowed on an @{marker} stanza"),
                });
            }
            let target = pending.get_mut(&node.json_id).and_then(|entry| {
                entry
                    .variants
                    .iter_mut()
                    .find(|variant| variant.multiplicity == node.multiplicity)
            });
            let Some(target) = target else {
                return Err(CompileError::UnresolvedTarget {
                    json_id: node.json_id,
                    marker,
                });
            };
            if node.override_flag {
                apply_override(target, node);
            } else {
                apply_extend(target, node, &source_name)?;
            }
        }

        // Pass 4: extension builders, variants merged under their main id.
        // The [0] variant contributes before the [n] one, so its bodies
        // evaluate first and land at the head of the resolved list.
        let mut fields: IndexMap<String, FieldRule> = IndexMap::new();
        for (json_id, entry) in pending {
            let mut variants = entry.variants;
            variants.sort_by_key(|v| matches!(v.multiplicity, Multiplicity::Many));
            let mut rule = FieldRule {
                json_id: json_id.clone(),
                multiplicity: if variants.len() > 1 {
                    Multiplicity::Many
                } else {
                    variants[0].multiplicity
                },
                ..FieldRule::default()
            };
            for variant in variants {
                let PendingVariant {
                    multiplicity,
                    rule: stanza,
                    sections,
                    ..
                } = variant;
                for (kind, bodies) in stanza.rules {
                    let merged = rule.rules.entry(kind).or_default();
                    for mut body in bodies {
                        body.multiplicity = multiplicity;
                        merged.push(body);
                    }
                }
                for alias in stanza.aliases {
                    if !rule.aliases.contains(&alias) {
                        rule.aliases.push(alias);
                    }
                }
                if rule.persistent_identifier.is_none() {
                    rule.persistent_identifier = stanza.persistent_identifier;
                }
                rule.hidden = rule.hidden || stanza.hidden;
                for parent in stanza.inherit_from {
                    if !rule.inherit_from.contains(&parent) {
                        rule.inherit_from.push(parent);
                    }
                }
                for section in sections.values() {
                    let payload = extensions.build(&json_id, section)?;
                    merge_extension(&mut rule.extensions, &section.name, payload);
                }
            }
            fields.insert(json_id, rule);
        }

        // Pass 5: legacy mapping from rule decorators.
        let legacy = collect_legacy(&fields);

        // Alias table; a clash keeps the first registration.
        let mut aliases: IndexMap<String, String> = IndexMap::new();
        for (json_id, field) in &fields {
            for alias in &field.aliases {
                if fields.contains_key(alias) || aliases.contains_key(alias) {
                    warn!("namespace '{namespace}': alias '{alias}' of '{json_id}' shadowed");
                    continue;
                }
                aliases.insert(alias.clone(), json_id.clone());
            }
        }

        // Pass 6: models.
        let models = resolve_model_definitions(models, &fields, &aliases)?;

        debug!(
            "registry '{namespace}' v{version} built: {} fields, {} models",
            fields.len(),
            models.len()
        );
        Ok(RuleRegistry {
            namespace,
            version,
            fields,
            aliases,
            models,
            legacy,
        })
    }
}

fn new_variant(source_name: String, node: RawRuleNode) -> PendingVariant {
    PendingVariant {
        multiplicity: node.multiplicity,
        rule: FieldRule {
            json_id: node.json_id,
            aliases: node.aliases,
            multiplicity: node.multiplicity,
            persistent_identifier: node.persistent_identifier,
            hidden: node.hidden,
            inherit_from: node.inherit_from,
            rules: node.rules,
            extensions: IndexMap::new(),
        },
        sections: node.sections,
        source_name,
    }
}

/// Topological order over `@inherit_from`, parents first. Detects missing
/// parents and cycles (self-inheritance included).
fn inheritance_order(pending: &IndexMap<String, PendingField>) -> CompileResult<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        InProgress,
        Done,
    }
    fn visit(
        json_id: &str,
        pending: &IndexMap<String, PendingField>,
        states: &mut HashMap<String, State>,
        order: &mut Vec<String>,
    ) -> CompileResult<()> {
        match states.get(json_id) {
            Some(State::Done) => return Ok(()),
            Some(State::InProgress) => {
                return Err(CompileError::InheritanceCycle {
                    json_id: json_id.to_string(),
                });
            },
            None => {},
        }
        states.insert(json_id.to_string(), State::InProgress);
        let parents = pending[json_id]
            .variants
            .iter()
            .flat_map(|variant| &variant.rule.inherit_from);
        for parent in parents {
            if !pending.contains_key(parent) {
                return Err(CompileError::UnknownParent {
                    json_id: json_id.to_string(),
                    parent: parent.clone(),
                });
            }
            visit(parent, pending, states, order)?;
        }
        states.insert(json_id.to_string(), State::Done);
        order.push(json_id.to_string());
        Ok(())
    }

    let mut states = HashMap::new();
    let mut order = Vec::new();
    for json_id in pending.keys() {
        visit(json_id, pending, &mut states, &mut order)?;
    }
    Ok(order)
}

/// Merge a resolved parent into its child: parent rule lists append after
/// the child's own, parent aliases and sections fill gaps, producer
/// sections concatenate (child entries first).
fn merge_parent(
    child: &mut FieldRule,
    child_sections: &mut IndexMap<String, RawSection>,
    parent: &PendingVariant,
) {
    for (kind, bodies) in &parent.rule.rules {
        child
            .rules
            .entry(kind.clone())
            .or_default()
            .extend(bodies.iter().cloned());
    }
    for alias in &parent.rule.aliases {
        if !child.aliases.contains(alias) {
            child.aliases.push(alias.clone());
        }
    }
    if child.persistent_identifier.is_none() {
        child.persistent_identifier = parent.rule.persistent_identifier;
    }
    child.hidden = child.hidden || parent.rule.hidden;
    for (name, section) in &parent.sections {
        match child_sections.get_mut(name) {
            None => {
                child_sections.insert(name.clone(), section.clone());
            },
            Some(existing) if name == "producer" => {
                existing.lines.extend(section.lines.iter().cloned());
            },
            Some(_) => {}, // child's section wins
        }
    }
}

/// `@override` replaces only what the stanza explicitly carries.
fn apply_override(target: &mut PendingVariant, node: RawRuleNode) {
    for (kind, bodies) in node.rules {
        target.rule.rules.insert(kind, bodies);
    }
    if !node.aliases.is_empty() {
        target.rule.aliases = node.aliases;
    }
    if node.persistent_identifier.is_some() {
        target.rule.persistent_identifier = node.persistent_identifier;
    }
    if node.hidden {
        target.rule.hidden = true;
    }
    for (name, section) in node.sections {
        target.sections.insert(name, section);
    }
}

/// `@extend` is additive only.
fn apply_extend(
    target: &mut PendingVariant,
    node: RawRuleNode,
    source_name: &str,
) -> CompileResult<()> {
    for (kind, bodies) in node.rules {
        target.rule.rules.entry(kind).or_default().extend(bodies);
    }
    for alias in node.aliases {
        if !target.rule.aliases.contains(&alias) {
            target.rule.aliases.push(alias);
        }
    }
    if target.rule.persistent_identifier.is_none() {
        target.rule.persistent_identifier = node.persistent_identifier;
    }
    if node.hidden {
        target.rule.hidden = true;
    }
    for (name, section) in node.sections {
        match target.sections.get_mut(&name) {
            None => {
                target.sections.insert(name, section);
            },
            Some(existing) if name == "producer" => {
                existing.lines.extend(section.lines);
            },
            Some(_) => {
                return Err(CompileError::DuplicateSection {
                    source_name: source_name.to_string(),
                    line: section.line,
                    section: name,
                });
            },
        }
    }
    Ok(())
}

/// Merge one built payload into a field's extension table. Producer rule
/// sets from later variants concatenate; any other payload keeps the first
/// variant's content.
fn merge_extension(
    extensions: &mut IndexMap<String, ExtensionPayload>,
    name: &str,
    payload: ExtensionPayload,
) {
    match (extensions.get_mut(name), payload) {
        (None, payload) => {
            extensions.insert(name.to_string(), payload);
        },
        (Some(ExtensionPayload::Producer(existing)), ExtensionPayload::Producer(incoming)) => {
            for (producer, rules) in incoming {
                existing.entry(producer).or_default().extend(rules);
            }
        },
        (Some(_), _) => {},
    }
}

fn collect_legacy(fields: &IndexMap<String, FieldRule>) -> LegacyMapping {
    let mut legacy = LegacyMapping::new();
    for (json_id, field) in fields {
        for bodies in field.rules.values() {
            for body in bodies {
                for rule in &body.decorators.legacy {
                    let Some(format) = rule
                        .format
                        .clone()
                        .or_else(|| body.source_format.clone())
                    else {
                        continue; // virtual rule without an explicit format
                    };
                    let path = match &rule.subpath {
                        None => json_id.clone(),
                        Some(sub) if sub == json_id || sub.starts_with(&format!("{json_id}.")) => {
                            sub.clone()
                        },
                        Some(sub) => format!("{json_id}.{sub}"),
                    };
                    let by_tag = legacy.entry(format).or_default();
                    for tag in &rule.tags {
                        let paths = by_tag.entry(tag.clone()).or_default();
                        if !paths.contains(&path) {
                            paths.push(path.clone());
                        }
                    }
                }
            }
        }
    }
    legacy
}

fn resolve_model_definitions(
    raw: Vec<(String, RawModelNode)>,
    fields: &IndexMap<String, FieldRule>,
    aliases: &IndexMap<String, String>,
) -> CompileResult<IndexMap<String, ModelDefinition>> {
    let by_name: IndexMap<String, RawModelNode> = raw.into_iter().collect();

    fn resolve(
        name: &str,
        by_name: &IndexMap<String, RawModelNode>,
        fields: &IndexMap<String, FieldRule>,
        aliases: &IndexMap<String, String>,
        done: &mut IndexMap<String, ModelDefinition>,
        in_progress: &mut Vec<String>,
    ) -> CompileResult<()> {
        if done.contains_key(name) {
            return Ok(());
        }
        if in_progress.iter().any(|n| n == name) {
            return Err(CompileError::BadModel(format!(
                "model inheritance cycle at '{name}'"
            )));
        }
        let Some(node) = by_name.get(name) else {
            return Err(CompileError::BadModel(format!("unknown model '{name}'")));
        };
        in_progress.push(name.to_string());
        let mut merged = IndexMap::new();
        for base in &node.bases {
            resolve(base, by_name, fields, aliases, done, in_progress)?;
            for (field_name, json_id) in &done[base].fields {
                merged.insert(field_name.clone(), json_id.clone());
            }
        }
        for (field_name, target) in &node.fields {
            let canonical = if fields.contains_key(target) {
                target.clone()
            } else if let Some(canonical) = aliases.get(target) {
                canonical.clone()
            } else {
                return Err(CompileError::UnknownModelField {
                    model: name.to_string(),
                    json_id: target.clone(),
                });
            };
            merged.insert(field_name.clone(), canonical);
        }
        in_progress.pop();
        done.insert(
            name.to_string(),
            ModelDefinition {
                name: name.to_string(),
                fields: merged,
                bases: node.bases.clone(),
            },
        );
        Ok(())
    }

    let mut done = IndexMap::new();
    let names: Vec<String> = by_name.keys().cloned().collect();
    for name in names {
        let mut in_progress = Vec::new();
        resolve(&name, &by_name, fields, aliases, &mut done, &mut in_progress)?;
    }
    Ok(done)
}

fn sorted_cfg_files(dir: &Path) -> CompileResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "cfg"))
        .collect();
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(sources: &[(&str, &str)]) -> CompileResult<RuleRegistry> {
        let mut builder = RegistryBuilder::new("test");
        for (name, text) in sources {
            builder.add_field_source(name, text)?;
        }
        builder.build(1)
    }

    #[test]
    fn test_inheritance_appends_parent_rules_after_own() {
        let registry = build(&[(
            "f.cfg",
            "base:\n    creator:\n        marcxml, \"100__\", value['a']\n\n@inherit_from('base')\nchild:\n    creator:\n        marcxml, \"700__\", value['a']\n",
        )])
        .unwrap();
        let child = registry.field("child").unwrap();
        let bodies = child.bodies("marcxml");
        assert_eq!(bodies.len(), 2);
        assert!(bodies[0].selector.as_ref().unwrap().matches("700__"));
        assert!(bodies[1].selector.as_ref().unwrap().matches("100__"));
    }

    #[test]
    fn test_inheritance_cycle_rejected() {
        let err = build(&[(
            "f.cfg",
            "@inherit_from('b')\na:\n    derived:\n        self['x']\n\n@inherit_from('a')\nb:\n    derived:\n        self['y']\n",
        )])
        .unwrap_err();
        assert!(matches!(err, CompileError::InheritanceCycle { .. }));
    }

    #[test]
    fn test_self_inheritance_rejected() {
        let err = build(&[(
            "f.cfg",
            "@inherit_from('a')\na:\n    derived:\n        self['x']\n",
        )])
        .unwrap_err();
        assert!(matches!(err, CompileError::InheritanceCycle { .. }));
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let err = build(&[(
            "f.cfg",
            "a:\n    derived:\n        self['x']\na:\n    derived:\n        self['y']\n",
        )])
        .unwrap_err();
        assert!(matches!(err, CompileError::DuplicateField { .. }));
    }

    #[test]
    fn test_multiplicity_variants_register_side_by_side() {
        let registry = build(&[(
            "f.cfg",
            "authors[0]:\n    creator:\n        marcxml, \"100__\", value['a']\nauthors[n]:\n    creator:\n        marcxml, \"700__\", value['a']\n",
        )])
        .unwrap();
        let field = registry.field("authors").unwrap();
        assert_eq!(field.multiplicity, Multiplicity::Many);
        let bodies = field.bodies("marcxml");
        assert_eq!(bodies.len(), 2);
        // The first-entry variant evaluates before the repeatable one.
        assert_eq!(bodies[0].multiplicity, Multiplicity::First);
        assert!(bodies[0].selector.as_ref().unwrap().matches("100__"));
        assert_eq!(bodies[1].multiplicity, Multiplicity::Many);
        assert!(bodies[1].selector.as_ref().unwrap().matches("700__"));
    }

    #[test]
    fn test_repeated_variant_rejected() {
        let err = build(&[(
            "f.cfg",
            "authors[n]:\n    derived:\n        self['x']\nauthors[n]:\n    derived:\n        self['y']\n",
        )])
        .unwrap_err();
        assert!(matches!(err, CompileError::DuplicateField { .. }));
    }

    #[test]
    fn test_plain_and_variant_clash_rejected() {
        let err = build(&[(
            "f.cfg",
            "authors:\n    derived:\n        self['x']\nauthors[n]:\n    derived:\n        self['y']\n",
        )])
        .unwrap_err();
        assert!(matches!(err, CompileError::DuplicateField { .. }));
    }

    #[test]
    fn test_override_targets_its_own_variant() {
        let registry = build(&[(
            "f.cfg",
            "authors[0]:\n    creator:\n        marcxml, \"100__\", value['a']\nauthors[n]:\n    creator:\n        marcxml, \"700__\", value['a']\n\n@override\nauthors[n]:\n    creator:\n        marcxml, \"701__\", value['a']\n",
        )])
        .unwrap();
        let bodies = registry.field("authors").unwrap().bodies("marcxml");
        assert_eq!(bodies.len(), 2);
        assert!(bodies[0].selector.as_ref().unwrap().matches("100__"));
        assert!(bodies[1].selector.as_ref().unwrap().matches("701__"));
    }

    #[test]
    fn test_override_replaces_only_present_sections() {
        let registry = build(&[(
            "f.cfg",
            "@persistent_identifier(1)\ntitle, main_title:\n    creator:\n        marcxml, \"245__\", value['a']\n\n@override\ntitle:\n    creator:\n        marcxml, \"246__\", value['x']\n",
        )])
        .unwrap();
        let field = registry.field("title").unwrap();
        // Aliases and pid carry over; the creator list is replaced.
        assert_eq!(field.aliases, vec!["main_title".to_string()]);
        assert_eq!(field.persistent_identifier, Some(1));
        let bodies = field.bodies("marcxml");
        assert_eq!(bodies.len(), 1);
        assert!(bodies[0].selector.as_ref().unwrap().matches("246__"));
    }

    #[test]
    fn test_extend_is_additive() {
        let registry = build(&[(
            "f.cfg",
            "title:\n    creator:\n        marcxml, \"245__\", value['a']\n\n@extend\ntitle, other_title:\n    creator:\n        marcxml, \"246__\", value['a']\n",
        )])
        .unwrap();
        let field = registry.field("title").unwrap();
        assert_eq!(field.bodies("marcxml").len(), 2);
        assert_eq!(field.aliases, vec!["other_title".to_string()]);
    }

    #[test]
    fn test_unresolved_override_target() {
        let err = build(&[(
            "f.cfg",
            "@override\nghost:\n    derived:\n        self['x']\n",
        )])
        .unwrap_err();
        assert!(matches!(err, CompileError::UnresolvedTarget { .. }));
    }

    #[test]
    fn test_alias_resolution() {
        let registry = build(&[(
            "f.cfg",
            "title, main_title:\n    derived:\n        self['x']\n",
        )])
        .unwrap();
        assert_eq!(registry.resolve_name("main_title"), "title");
        assert!(registry.field("main_title").is_some());
    }

    #[test]
    fn test_legacy_mapping() {
        let registry = build(&[(
            "f.cfg",
            "title:\n    creator:\n        @legacy((\"245__\", \"\"), (\"245__a\", \"title\"))\n        marcxml, \"245__\", value['a']\n",
        )])
        .unwrap();
        let matchings = registry.legacy_matchings("marcxml").unwrap();
        assert_eq!(matchings["245__"], vec!["title".to_string()]);
        assert_eq!(matchings["245__a"], vec!["title".to_string()]);
    }

    #[test]
    fn test_models_shadowing() {
        let mut builder = RegistryBuilder::new("test");
        builder
            .add_field_source(
                "f.cfg",
                "title:\n    derived:\n        self['x']\nsubtitle:\n    derived:\n        self['y']\n",
            )
            .unwrap();
        builder
            .add_model_source("base", "fields:\n    title\n")
            .unwrap();
        builder
            .add_model_source(
                "article",
                "fields:\n    @inherit_from('base')\n    subtitle\n",
            )
            .unwrap();
        let registry = builder.build(1).unwrap();
        let resolved = registry.resolve_models(&["article"]).unwrap();
        assert_eq!(resolved.len(), 2);
        assert!(resolved.contains_key("title"));
        assert!(resolved.contains_key("subtitle"));
    }

    #[test]
    fn test_model_unknown_field_rejected() {
        let mut builder = RegistryBuilder::new("test");
        builder
            .add_field_source("f.cfg", "title:\n    derived:\n        self['x']\n")
            .unwrap();
        builder
            .add_model_source("m", "fields:\n    ghost\n")
            .unwrap();
        let err = builder.build(1).unwrap_err();
        assert!(matches!(err, CompileError::UnknownModelField { .. }));
    }
}
