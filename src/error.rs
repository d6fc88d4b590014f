//! Error types for the rule engine.
//!
//! The engine distinguishes three failure scopes, matching how errors
//! propagate through a translation:
//!
//! - [`CompileError`] — fatal and file-scoped. Raised while compiling field
//!   or model configuration; the namespace is not published until fixed.
//! - [`ContinuableError`] — per-field. Accumulated on the document without
//!   aborting the call; the field falls back to its default or is omitted.
//! - [`FatalInputError`] — per-call. The wire blob could not be split or
//!   pre-parsed; the call aborts and no document is produced.
//!
//! Expression evaluation reports [`EvalError`], which the interpreter
//! converts into continuable errors.

use thiserror::Error;

/// Fatal, file-scoped error raised while compiling configuration sources.
///
/// A `CompileError` blocks the whole namespace: no partial registry is ever
/// published.
#[derive(Error, Debug)]
pub enum CompileError {
    /// Malformed grammar (bad indentation, unmatched decorator, bad token).
    #[error("{source_name}:{line}:{col}: syntax error: {msg}")]
    Syntax {
        /// Name of the configuration source (file name or label).
        source_name: String,
        /// 1-based line of the offending token.
        line: usize,
        /// 1-based column of the offending token.
        col: usize,
        /// Description of what went wrong.
        msg: String,
    },

    /// A field was defined twice without `@override` or `@extend`.
    #[error("field '{json_id}' is already defined (use @override or @extend)")]
    DuplicateField {
        /// The duplicated canonical id.
        json_id: String,
    },

    /// `@override` or `@extend` targeted a field that was never defined.
    #[error("field '{json_id}' is marked '{marker}' but was never defined")]
    UnresolvedTarget {
        /// The canonical id of the orphan stanza.
        json_id: String,
        /// Which marker was used (`override` or `extend`).
        marker: &'static str,
    },

    /// `@inherit_from` named an unknown parent field.
    #[error("field '{json_id}' inherits from unknown field '{parent}'")]
    UnknownParent {
        /// The inheriting field.
        json_id: String,
        /// The missing parent.
        parent: String,
    },

    /// Inheritance resolution found a cycle (including self-inheritance).
    #[error("inheritance cycle detected at field '{json_id}'")]
    InheritanceCycle {
        /// Field where the cycle was detected.
        json_id: String,
    },

    /// An `include` directive formed a cycle or could not be resolved.
    #[error("cannot include '{path}': {msg}")]
    BadInclude {
        /// The include path as written in the configuration.
        path: String,
        /// Reason the include failed.
        msg: String,
    },

    /// A stanza carried a section with no registered handler.
    #[error("{source_name}:{line}: unknown section '{section}'")]
    UnknownSection {
        /// Name of the configuration source.
        source_name: String,
        /// Line of the section header.
        line: usize,
        /// The unregistered section name.
        section: String,
    },

    /// The same section appeared twice in one stanza.
    #[error("{source_name}:{line}: duplicate section '{section}'")]
    DuplicateSection {
        /// Name of the configuration source.
        source_name: String,
        /// Line of the second occurrence.
        line: usize,
        /// The duplicated section name.
        section: String,
    },

    /// A model referenced a `json_id` with no field definition.
    #[error("model '{model}' references unknown field '{json_id}'")]
    UnknownModelField {
        /// The offending model name.
        model: String,
        /// The unknown canonical id.
        json_id: String,
    },

    /// A model was defined twice or inherits from a missing model.
    #[error("model error: {0}")]
    BadModel(String),

    /// An extension builder rejected its section content.
    #[error("extension '{name}' failed for field '{json_id}': {msg}")]
    Extension {
        /// Extension name.
        name: String,
        /// Field being built.
        json_id: String,
        /// Builder's explanation.
        msg: String,
    },

    /// The namespace has no registered sources.
    #[error("unknown namespace '{0}'")]
    UnknownNamespace(String),

    /// IO error while reading a configuration file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-field error recorded on a document without aborting the call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContinuableError {
    /// A requested `json_id` has no field definition; the field is omitted.
    #[error("unable to find '{0}' field definition")]
    MissingDefinition(String),

    /// A value or guard expression failed for one element; that element's
    /// contribution is dropped.
    #[error("unable to apply rule for field '{field}': {msg}")]
    RuleEvaluation {
        /// Field whose rule failed.
        field: String,
        /// Evaluation failure description.
        msg: String,
    },

    /// A `depends_on` target could not be resolved; the rule is skipped.
    #[error("unresolved dependency '{dependency}' for field '{field}'")]
    UnresolvedDependency {
        /// Field whose rule was skipped.
        field: String,
        /// The dependency that failed to resolve.
        dependency: String,
    },

    /// The schema default could not be evaluated.
    #[error("unable to set default value for field '{field}': {msg}")]
    DefaultValue {
        /// Field whose default failed.
        field: String,
        /// Evaluation failure description.
        msg: String,
    },

    /// Metadata was attached for a field with no definition (via `set`).
    #[error("adding new field '{0}' without definition")]
    UndefinedSet(String),
}

/// Per-call fatal error: the input blob cannot be processed at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalInputError {
    /// No master format registered under the requested name.
    #[error("no master format registered for '{0}'")]
    UnknownFormat(String),

    /// A translate call named a model the namespace does not define.
    #[error("unknown model '{0}'")]
    UnknownModel(String),

    /// The blob could not be split into record fragments.
    #[error("cannot split blob: {0}")]
    SplitFailed(String),

    /// The blob could not be pre-parsed into an intermediate tree.
    #[error("cannot prepare blob: {0}")]
    PrepareFailed(String),

    /// Producer fragments could not be composed back into wire syntax.
    #[error("cannot format fragments: {0}")]
    FormatFailed(String),
}

/// Error raised while evaluating a compiled expression.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    /// An identifier was neither a binding nor a registered function.
    #[error("unknown name '{0}'")]
    UnknownName(String),

    /// A call named a function absent from the registry.
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    /// Subscript applied to a value that does not support it.
    #[error("cannot subscript {kind} with {key}")]
    BadSubscript {
        /// Kind of the subscripted value (`object`, `array`, ...).
        kind: &'static str,
        /// Printable form of the key.
        key: String,
    },

    /// Object subscript key not present.
    #[error("key '{0}' not found")]
    KeyNotFound(String),

    /// Array index out of bounds.
    #[error("index {0} out of bounds")]
    IndexOutOfBounds(usize),

    /// A registered function rejected its arguments.
    #[error("function '{function}': {msg}")]
    Function {
        /// Function name.
        function: String,
        /// Failure description.
        msg: String,
    },

    /// A free-form expression was reached but no host evaluator is
    /// registered.
    #[error("no host evaluator registered for free-form expression")]
    NoHostEvaluator,

    /// A guard expression produced a non-boolean result.
    #[error("guard expression produced non-boolean value")]
    NonBooleanGuard,
}

/// Convenience alias for compile-phase results.
pub type CompileResult<T> = std::result::Result<T, CompileError>;

/// Convenience alias for evaluation results.
pub type EvalResult<T> = std::result::Result<T, EvalError>;
