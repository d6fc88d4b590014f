#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

//! # bibrules: schema-driven bibliographic record translation
//!
//! A rule-compilation and evaluation engine that turns master-format
//! records (MARCXML and friends) into structured JSON documents, and back.
//! Field definitions live in a small configuration language: each field
//! names the wire elements it reads, the expression that shapes the value,
//! and optionally how to regenerate wire output from the value again.
//!
//! ## Quick Start
//!
//! ### Compiling a registry and translating a record
//!
//! ```ignore
//! use bibrules::{FunctionRegistry, Reader, RegistryBuilder};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut builder = RegistryBuilder::new("main");
//! builder.add_field_source(
//!     "title.cfg",
//!     "title:\n    creator:\n        marcxml, \"245..\", { 'title': value['a'] }\n",
//! )?;
//! let registry = Arc::new(builder.build(1)?);
//!
//! let reader = Reader::new(registry, Arc::new(FunctionRegistry::with_builtins()));
//! let mut doc = reader.translate(marcxml_blob, "marcxml", &[])?;
//! println!("{:?}", doc.get("title"));
//! # Ok(())
//! # }
//! ```
//!
//! ### Regenerating wire output
//!
//! ```ignore
//! use bibrules::{fragments_to_marcxml, produce};
//!
//! let fragments = produce(&mut doc, "json_for_marc", None);
//! let xml = fragments_to_marcxml(&fragments)?;
//! ```
//!
//! ### Batch translation
//!
//! ```ignore
//! use bibrules::{PipelineConfig, TranslationPipeline};
//!
//! let pipeline =
//!     TranslationPipeline::spawn(reader, blob, "marcxml", &[], &PipelineConfig::default())?;
//! for outcome in pipeline.into_iter() {
//!     match outcome {
//!         Ok(doc) => { /* index, store, ... */ },
//!         Err(e) => eprintln!("record skipped: {e}"),
//!     }
//! }
//! ```
//!
//! ## Modules
//!
//! - [`grammar`] — Parsing field and model definition sources
//! - [`rules`] — Compiled rule structures (`FieldRule`, `RuleBody`, selectors)
//! - [`registry`] — Registry construction (inheritance, overrides, models)
//! - [`extensions`] — Pluggable stanza sections (`producer:`, `schema:`, ...)
//! - [`expr`] — The closed expression language and its evaluator
//! - [`functions`] — The enumerated function registry for expressions
//! - [`masterfmt`] — Master-format adapters (MARCXML reference adapter)
//! - [`reader`] — Record translation against a compiled registry
//! - [`document`] — The translated document, metadata, and lazy fields
//! - [`producer`] — Regenerating wire fragments from documents
//! - [`pipeline`] — Parallel batch translation with backpressure
//! - [`cache`] — Namespace registry cache with atomic reload
//! - [`error`] — Error types (compile-time, continuable, fatal)

pub mod cache;
pub mod document;
pub mod error;
pub mod expr;
pub mod extensions;
pub mod functions;
pub mod grammar;
pub mod masterfmt;
pub mod pipeline;
pub mod producer;
pub mod reader;
pub mod registry;
pub mod rules;

pub use cache::RegistryCache;
pub use document::{Document, DumpOptions, FieldMetadata};
pub use error::{CompileError, ContinuableError, EvalError, FatalInputError};
pub use expr::{Bindings, Expr};
pub use extensions::{ExtensionBuilder, ExtensionSet};
pub use functions::FunctionRegistry;
pub use masterfmt::marcxml::{fragments_to_marcxml, MarcxmlFormat};
pub use masterfmt::{FormatRegistry, IntermediateTree, MasterFormat};
pub use pipeline::{translate_batch, PipelineConfig, TranslationPipeline};
pub use producer::{produce, Fragment};
pub use reader::Reader;
pub use registry::{RegistryBuilder, RuleRegistry};
pub use rules::{FieldRule, Multiplicity, RuleBody, RuleKind, Selector};
