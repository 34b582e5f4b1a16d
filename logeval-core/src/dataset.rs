//! Evaluation dataset (`test.csv`) and the batch loader feeding the model.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use futures::Stream;
use futures::StreamExt;
use futures::stream;
use serde::Deserialize;

use crate::session::SEQUENCE_SEPARATOR;

/// One labelled session: its log messages and `1` for anomalous, `0` for normal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceExample {
    pub messages: Vec<String>,
    pub label: u8,
}

#[derive(Debug, Deserialize)]
struct SequenceRow {
    #[serde(rename = "Content")]
    content: String,
    #[serde(rename = "Label")]
    label: String,
}

fn parse_label(raw: &str) -> Result<u8> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "anomaly" | "anomalous" => Ok(1),
        "0" | "normal" => Ok(0),
        other => Err(anyhow!("unrecognised label '{other}'")),
    }
}

fn split_content(content: &str) -> Vec<String> {
    if content.is_empty() {
        return Vec::new();
    }
    content
        .split(SEQUENCE_SEPARATOR)
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct EvalDataset {
    examples: Vec<SequenceExample>,
}

impl EvalDataset {
    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("failed to open dataset {}", path.display()))?;

        let mut examples = Vec::new();
        for (index, row) in reader.deserialize::<SequenceRow>().enumerate() {
            let row = row.with_context(|| {
                format!("failed to read row {} of {}", index + 2, path.display())
            })?;
            let label = parse_label(&row.label).with_context(|| {
                format!("invalid label in row {} of {}", index + 2, path.display())
            })?;
            examples.push(SequenceExample {
                messages: split_content(&row.content),
                label,
            });
        }

        tracing::debug!(
            path = %path.display(),
            examples = examples.len(),
            "loaded evaluation dataset"
        );
        Ok(Self { examples })
    }

    pub fn from_examples(examples: Vec<SequenceExample>) -> Self {
        Self { examples }
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn examples(&self) -> &[SequenceExample] {
        &self.examples
    }

    pub fn labels(&self) -> Vec<u8> {
        self.examples.iter().map(|e| e.label).collect()
    }
}

/// Truncation applied while collating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollateSettings {
    /// Log messages kept per sequence.
    pub max_seq_len: usize,
    /// Whitespace tokens kept per message.
    pub max_content_len: usize,
}

/// A collated slice of the dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub index: usize,
    /// Position of the first example in the dataset.
    pub offset: usize,
    pub sequences: Vec<Vec<String>>,
    pub labels: Vec<u8>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }
}

fn truncate_message(message: &str, max_tokens: usize) -> String {
    message
        .split_whitespace()
        .take(max_tokens)
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn collate(
    examples: &[SequenceExample],
    index: usize,
    offset: usize,
    settings: CollateSettings,
) -> Batch {
    let sequences = examples
        .iter()
        .map(|example| {
            example
                .messages
                .iter()
                .take(settings.max_seq_len)
                .map(|message| truncate_message(message, settings.max_content_len))
                .collect()
        })
        .collect();

    Batch {
        index,
        offset,
        sequences,
        labels: examples.iter().map(|e| e.label).collect(),
    }
}

/// Sequential, unshuffled batches collated on blocking workers.
///
/// At most `workers` batches are being collated or waiting at any time and
/// batches are yielded strictly in dataset order.
#[derive(Debug, Clone)]
pub struct BatchLoader {
    dataset: Arc<EvalDataset>,
    batch_size: usize,
    workers: usize,
    collate: CollateSettings,
}

impl BatchLoader {
    pub fn new(
        dataset: Arc<EvalDataset>,
        batch_size: usize,
        workers: usize,
        collate: CollateSettings,
    ) -> Result<Self> {
        if batch_size == 0 {
            bail!("batch size must be greater than zero");
        }
        Ok(Self {
            dataset,
            batch_size,
            workers: workers.max(1),
            collate,
        })
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Batch>> + Send + 'static {
        let Self {
            dataset,
            batch_size,
            workers,
            collate: settings,
        } = self;
        let total = dataset.len();

        stream::iter((0..total).step_by(batch_size).enumerate())
            .map(move |(index, offset)| {
                let dataset = Arc::clone(&dataset);
                async move {
                    let end = (offset + batch_size).min(dataset.len());
                    tokio::task::spawn_blocking(move || {
                        collate(&dataset.examples()[offset..end], index, offset, settings)
                    })
                    .await
                    .with_context(|| format!("collation worker for batch {index} failed"))
                }
            })
            .buffered(workers)
    }
}
