use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;

/// Final label of a block in `anomaly_label.csv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockLabel {
    Normal,
    Anomaly,
}

impl BlockLabel {
    pub fn from_flag(anomalous: bool) -> Self {
        if anomalous { Self::Anomaly } else { Self::Normal }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Anomaly => "Anomaly",
        }
    }

    pub fn is_anomaly(self) -> bool {
        self == Self::Anomaly
    }

    /// Binary encoding used by `train.csv` / `test.csv`.
    pub fn as_binary(self) -> u8 {
        u8::from(self.is_anomaly())
    }
}

impl fmt::Display for BlockLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockLabel {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "anomaly" => Ok(Self::Anomaly),
            other => Err(anyhow!("unknown block label '{other}'")),
        }
    }
}

/// Builds the block id -> label table from rows whose block id field may hold
/// several space separated ids.
///
/// A block that is ever observed with the anomaly flag set ends up as
/// [`BlockLabel::Anomaly`], whatever order the rows arrive in. Ids keep the
/// order of their first appearance.
#[derive(Debug, Clone, Default)]
pub struct LabelReconciler {
    labels: IndexMap<String, BlockLabel>,
}

impl LabelReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one row. Returns how many block ids the field contributed;
    /// empty, whitespace-only and `nan` fields contribute none.
    pub fn observe(&mut self, block_field: &str, anomalous: bool) -> usize {
        let trimmed = block_field.trim();
        if trimmed.is_empty() || trimmed == "nan" {
            return 0;
        }

        let mut touched = 0;
        for block_id in trimmed.split_whitespace() {
            touched += 1;
            match self.labels.get_mut(block_id) {
                Some(label) => {
                    if anomalous {
                        *label = BlockLabel::Anomaly;
                    }
                }
                None => {
                    self.labels
                        .insert(block_id.to_string(), BlockLabel::from_flag(anomalous));
                }
            }
        }
        touched
    }

    pub fn label_of(&self, block_id: &str) -> Option<BlockLabel> {
        self.labels.get(block_id).copied()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn anomaly_count(&self) -> usize {
        self.labels.values().filter(|label| label.is_anomaly()).count()
    }

    pub fn normal_count(&self) -> usize {
        self.len() - self.anomaly_count()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, BlockLabel)> {
        self.labels.iter().map(|(id, label)| (id.as_str(), *label))
    }

    /// Write the table as `BlockId,Label`, replacing any existing file.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }

        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("failed to create label file {}", path.display()))?;
        for (block_id, label) in self.entries() {
            writer
                .serialize(LabelRow {
                    block_id: block_id.to_string(),
                    label: label.as_str().to_string(),
                })
                .with_context(|| format!("failed to write label row for {block_id}"))?;
        }
        writer
            .flush()
            .with_context(|| format!("failed to flush label file {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LabelRow {
    #[serde(rename = "BlockId")]
    block_id: String,
    #[serde(rename = "Label")]
    label: String,
}

/// Read an `anomaly_label.csv` table. Rows with an unknown label are skipped.
pub fn read_label_csv(path: &Path) -> Result<IndexMap<String, BlockLabel>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open label file {}", path.display()))?;

    let mut labels = IndexMap::new();
    for (index, row) in reader.deserialize::<LabelRow>().enumerate() {
        let row = row.with_context(|| {
            format!("failed to read row {} of {}", index + 2, path.display())
        })?;
        match row.label.parse::<BlockLabel>() {
            Ok(label) => {
                labels.insert(row.block_id, label);
            }
            Err(err) => {
                tracing::warn!(block_id = %row.block_id, "skipping label row: {err}");
            }
        }
    }
    Ok(labels)
}
