//! Batch translation pipeline with backpressure.
//!
//! Splits a multi-record blob once, then translates record fragments on a
//! rayon worker pool in batches, feeding finished documents through a
//! bounded channel. The channel bound is the backpressure: the producer
//! thread blocks when consumers fall behind.
//!
//! Failure is per record. One fragment's fatal error travels down the
//! channel as an `Err` without disturbing its neighbors, and continuable
//! errors stay recorded on their own document.

use crate::document::Document;
use crate::error::FatalInputError;
use crate::reader::Reader;
use crossbeam_channel::{bounded, Receiver};
use rayon::prelude::*;
use std::thread;

/// Configuration for the batch pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Channel capacity (documents)
    pub channel_capacity: usize,
    /// Fragments per parallel batch
    pub batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1000,
            batch_size: 100,
        }
    }
}

/// Per-record outcome flowing out of the pipeline.
pub type RecordOutcome = Result<Document, FatalInputError>;

/// Translate every fragment of a blob in parallel, preserving input order.
///
/// The convenience form of the pipeline for callers that want the whole
/// batch at once.
///
/// # Errors
///
/// [`FatalInputError`] when the format is unknown or the blob cannot be
/// split; per-record failures come back inside the vector.
pub fn translate_batch(
    reader: &Reader,
    blob: &str,
    master_format: &str,
    models: &[&str],
) -> Result<Vec<RecordOutcome>, FatalInputError> {
    let format = reader.formats().get(master_format)?;
    let fragments = format.split_blob(blob)?;
    Ok(fragments
        .par_iter()
        .map(|fragment| reader.translate(fragment, master_format, models))
        .collect())
}

/// Consumer-facing pipeline handle.
#[derive(Debug)]
pub struct TranslationPipeline {
    receiver: Receiver<RecordOutcome>,
    _producer_handle: Option<thread::JoinHandle<()>>,
}

impl TranslationPipeline {
    /// Split the blob and spawn the producer thread.
    ///
    /// The blob is split up front so a malformed envelope fails fast;
    /// translation itself happens in the background, batch by batch.
    ///
    /// # Errors
    ///
    /// [`FatalInputError`] when the format is unknown or the blob cannot
    /// be split.
    pub fn spawn(
        reader: Reader,
        blob: &str,
        master_format: &str,
        models: &[&str],
        config: &PipelineConfig,
    ) -> Result<Self, FatalInputError> {
        let format = reader.formats().get(master_format)?;
        let fragments = format.split_blob(blob)?;
        let (sender, receiver) = bounded(config.channel_capacity);
        let master_format = master_format.to_string();
        let models: Vec<String> = models.iter().map(|m| (*m).to_string()).collect();
        let batch_size = config.batch_size.max(1);

        let producer_handle = thread::spawn(move || {
            let model_refs: Vec<&str> = models.iter().map(String::as_str).collect();
            for batch in fragments.chunks(batch_size) {
                let outcomes: Vec<RecordOutcome> = batch
                    .par_iter()
                    .map(|fragment| reader.translate(fragment, &master_format, &model_refs))
                    .collect();
                for outcome in outcomes {
                    // Send blocks when the channel is full (backpressure);
                    // a dropped receiver ends the producer.
                    if sender.send(outcome).is_err() {
                        return;
                    }
                }
            }
        });

        Ok(TranslationPipeline {
            receiver,
            _producer_handle: Some(producer_handle),
        })
    }

    /// Next outcome without blocking; `None` when empty or finished.
    #[must_use]
    pub fn try_next(&self) -> Option<RecordOutcome> {
        self.receiver.try_recv().ok()
    }

    /// Next outcome, blocking; `None` when the batch is exhausted.
    #[must_use]
    pub fn next(&self) -> Option<RecordOutcome> {
        self.receiver.recv().ok()
    }

    /// Consume the pipeline and iterate every outcome.
    #[allow(clippy::should_implement_trait)]
    pub fn into_iter(self) -> impl Iterator<Item = RecordOutcome> {
        self.receiver.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::FunctionRegistry;
    use crate::registry::RegistryBuilder;
    use serde_json::json;
    use std::sync::Arc;

    const COLLECTION: &str = r#"<collection xmlns="http://www.loc.gov/MARC21/slim">
        <record><controlfield tag="001">rec1</controlfield></record>
        <record><controlfield tag="001">rec2</controlfield></record>
        <record><controlfield tag="001">rec3</controlfield></record>
    </collection>"#;

    fn reader() -> Reader {
        let mut builder = RegistryBuilder::new("test");
        builder
            .add_field_source(
                "f.cfg",
                "recid:\n    creator:\n        marcxml, \"001\", value\n",
            )
            .unwrap();
        Reader::new(
            Arc::new(builder.build(1).unwrap()),
            Arc::new(FunctionRegistry::with_builtins()),
        )
    }

    #[test]
    fn test_translate_batch_preserves_order() {
        let outcomes = translate_batch(&reader(), COLLECTION, "marcxml", &[]).unwrap();
        assert_eq!(outcomes.len(), 3);
        let ids: Vec<_> = outcomes
            .into_iter()
            .map(|outcome| outcome.unwrap().get("recid").unwrap())
            .collect();
        assert_eq!(ids, vec![json!("rec1"), json!("rec2"), json!("rec3")]);
    }

    #[test]
    fn test_pipeline_drains_all_records() {
        let pipeline = TranslationPipeline::spawn(
            reader(),
            COLLECTION,
            "marcxml",
            &[],
            &PipelineConfig {
                channel_capacity: 2,
                batch_size: 2,
            },
        )
        .unwrap();
        let outcomes: Vec<_> = pipeline.into_iter().collect();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(Result::is_ok));
    }

    #[test]
    fn test_bad_envelope_fails_fast() {
        let result = TranslationPipeline::spawn(
            reader(),
            "<collection><broken",
            "marcxml",
            &[],
            &PipelineConfig::default(),
        );
        assert!(matches!(result, Err(FatalInputError::SplitFailed(_))));
    }

    #[test]
    fn test_config_default() {
        let config = PipelineConfig::default();
        assert_eq!(config.channel_capacity, 1000);
        assert_eq!(config.batch_size, 100);
    }
}
