//! Session-window grouping for HDFS: every log line is assigned to the blocks
//! it mentions, and each block becomes one labelled sequence.

use std::fs;
use std::io;
use std::io::BufRead;
use std::path::Path;
use std::path::PathBuf;
use std::sync::LazyLock;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use indexmap::IndexMap;
use indexmap::IndexSet;
use regex::Regex;

use crate::labels::BlockLabel;
use crate::labels::read_label_csv;
use crate::records::LogRecord;

/// Separator between log messages inside the `Content` column.
pub const SEQUENCE_SEPARATOR: &str = " ;-; ";

static BLOCK_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"blk_-?\d+").expect("block id pattern is valid"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub block_id: String,
    pub messages: Vec<String>,
    pub label: BlockLabel,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSplit {
    pub train: Vec<Session>,
    pub test: Vec<Session>,
    /// Lines that did not match the flat log template.
    pub skipped_lines: usize,
    /// Blocks seen in the log but absent from the label table.
    pub unlabeled_blocks: usize,
}

/// Paths written by [`SessionSplit::write_split`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitFiles {
    pub train: PathBuf,
    pub test: PathBuf,
    pub train_info: PathBuf,
    pub test_info: PathBuf,
}

pub fn block_ids(content: &str) -> IndexSet<&str> {
    BLOCK_ID.find_iter(content).map(|m| m.as_str()).collect()
}

/// Group the lines of a flat log into per-block sessions, ordered by first
/// appearance. Returns the sessions and the number of skipped lines.
pub fn group_sessions(log_path: &Path) -> Result<(IndexMap<String, Vec<String>>, usize)> {
    let file = fs::File::open(log_path)
        .with_context(|| format!("failed to open log file {}", log_path.display()))?;
    let reader = io::BufReader::new(file);

    let mut sessions: IndexMap<String, Vec<String>> = IndexMap::new();
    let mut skipped = 0;

    for (line_num, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!(
                "failed to read line {} of {}",
                line_num + 1,
                log_path.display()
            )
        })?;

        let Some(record) = LogRecord::parse_line(&line) else {
            tracing::debug!(line = line_num + 1, "line does not match the log template");
            skipped += 1;
            continue;
        };

        for block_id in block_ids(&record.content) {
            sessions
                .entry(block_id.to_string())
                .or_default()
                .push(record.content.clone());
        }
    }

    Ok((sessions, skipped))
}

/// Index at which the train split ends.
pub fn split_point(total: usize, train_ratio: f64) -> usize {
    ((total as f64) * train_ratio).floor().min(total as f64) as usize
}

/// Build the train/test split for a flat log and its label table.
pub fn build_sessions(
    log_path: &Path,
    label_path: &Path,
    train_ratio: f64,
) -> Result<SessionSplit> {
    if !(0.0..=1.0).contains(&train_ratio) {
        bail!("train ratio must lie within [0, 1], got {train_ratio}");
    }

    let labels = read_label_csv(label_path)?;
    let (grouped, skipped_lines) = group_sessions(log_path)?;

    let mut unlabeled_blocks = 0;
    let mut sessions = Vec::with_capacity(grouped.len());
    for (block_id, messages) in grouped {
        match labels.get(&block_id) {
            Some(label) => sessions.push(Session {
                block_id,
                messages,
                label: *label,
            }),
            None => unlabeled_blocks += 1,
        }
    }

    let test = sessions.split_off(split_point(sessions.len(), train_ratio));
    Ok(SessionSplit {
        train: sessions,
        test,
        skipped_lines,
        unlabeled_blocks,
    })
}

impl SessionSplit {
    /// Write `train.csv`, `test.csv` and their `*_info.txt` summaries into `dir`.
    pub fn write_split(&self, dir: &Path) -> Result<SplitFiles> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;

        let files = SplitFiles {
            train: dir.join("train.csv"),
            test: dir.join("test.csv"),
            train_info: dir.join("train_info.txt"),
            test_info: dir.join("test_info.txt"),
        };

        write_sequences(&files.train, &self.train)?;
        write_sequences(&files.test, &self.test)?;
        write_info(&files.train_info, &self.train)?;
        write_info(&files.test_info, &self.test)?;

        Ok(files)
    }
}

fn write_sequences(path: &Path, sessions: &[Session]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    // Header is written explicitly so an empty split still has one.
    writer.write_record(["Content", "Label"])?;
    for session in sessions {
        writer.write_record([
            session.messages.join(SEQUENCE_SEPARATOR),
            session.label.as_binary().to_string(),
        ])?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(())
}

fn write_info(path: &Path, sessions: &[Session]) -> Result<()> {
    let anomalous = sessions.iter().filter(|s| s.label.is_anomaly()).count();
    let info = format!(
        "sequences: {}\nanomalous: {}\nnormal: {}\n",
        sessions.len(),
        anomalous,
        sessions.len() - anomalous
    );
    fs::write(path, info).with_context(|| format!("failed to write {}", path.display()))
}

/// Check the inputs exist, build the split and write it next to the log.
pub fn prepare_dataset(
    log_path: &Path,
    label_path: &Path,
    out_dir: &Path,
    train_ratio: f64,
) -> Result<(SessionSplit, SplitFiles)> {
    if !log_path.is_file() {
        bail!("log file not found: {}", log_path.display());
    }
    if !label_path.is_file() {
        bail!("label file not found: {}", label_path.display());
    }

    let split = build_sessions(log_path, label_path, train_ratio)?;
    if split.unlabeled_blocks > 0 {
        tracing::warn!(
            blocks = split.unlabeled_blocks,
            "dropped sessions without a label"
        );
    }
    let files = split.write_split(out_dir)?;
    tracing::info!(
        train = split.train.len(),
        test = split.test.len(),
        dir = %out_dir.display(),
        "wrote session split"
    );
    Ok((split, files))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_fixture(dir: &Path) -> (PathBuf, PathBuf) {
        let log = dir.join("HDFS.log");
        fs::write(
            &log,
            "081109 203518 143 INFO dfs.DataNode$DataXceiver: Receiving block blk_-1608999687919862906 src: /10.250.19.102:54106\n\
             081109 203518 35 INFO dfs.FSNamesystem: BLOCK* NameSystem.allocateBlock: blk_7503483334202473044\n\
             garbage line\n\
             081109 203519 143 INFO dfs.DataNode$DataXceiver: Receiving block blk_-1608999687919862906 again\n\
             081109 203520 145 WARN dfs.DataNode: copy blk_3 to blk_7503483334202473044\n\
             081109 203521 145 INFO dfs.DataNode: heartbeat\n",
        )
        .unwrap();

        let labels = dir.join("anomaly_label.csv");
        fs::write(
            &labels,
            "BlockId,Label\nblk_-1608999687919862906,Normal\nblk_7503483334202473044,Anomaly\n",
        )
        .unwrap();
        (log, labels)
    }

    #[test]
    fn extracts_unique_block_ids() {
        let ids: Vec<_> = block_ids("blk_1 then blk_-2 and blk_1 again").into_iter().collect();
        assert_eq!(ids, vec!["blk_1", "blk_-2"]);
    }

    #[test]
    fn groups_lines_by_block_in_first_seen_order() {
        let tmp = TempDir::new().unwrap();
        let (log, _) = write_fixture(tmp.path());

        let (sessions, skipped) = group_sessions(&log).unwrap();
        assert_eq!(skipped, 1);

        let keys: Vec<_> = sessions.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "blk_-1608999687919862906",
                "blk_7503483334202473044",
                "blk_3"
            ]
        );
        assert_eq!(sessions["blk_-1608999687919862906"].len(), 2);
        assert_eq!(
            sessions["blk_7503483334202473044"][1],
            "copy blk_3 to blk_7503483334202473044"
        );
    }

    #[test]
    fn split_point_floors() {
        assert_eq!(split_point(10, 0.8), 8);
        assert_eq!(split_point(3, 0.5), 1);
        assert_eq!(split_point(3, 1.0), 3);
        assert_eq!(split_point(0, 0.8), 0);
    }

    #[test]
    fn builds_and_writes_split() {
        let tmp = TempDir::new().unwrap();
        let (log, labels) = write_fixture(tmp.path());

        let split = build_sessions(&log, &labels, 0.5).unwrap();
        assert_eq!(split.unlabeled_blocks, 1);
        assert_eq!(split.train.len(), 1);
        assert_eq!(split.test.len(), 1);
        assert_eq!(split.test[0].label, BlockLabel::Anomaly);

        let files = split.write_split(&tmp.path().join("out")).unwrap();
        let test_csv = fs::read_to_string(&files.test).unwrap();
        assert_eq!(
            test_csv,
            "Content,Label\n\
             BLOCK* NameSystem.allocateBlock: blk_7503483334202473044 ;-; copy blk_3 to blk_7503483334202473044,1\n"
        );
        let info = fs::read_to_string(&files.train_info).unwrap();
        assert_eq!(info, "sequences: 1\nanomalous: 0\nnormal: 1\n");
    }

    #[test]
    fn prepare_requires_inputs() {
        let tmp = TempDir::new().unwrap();
        let (log, _) = write_fixture(tmp.path());
        let err = prepare_dataset(&log, &tmp.path().join("missing.csv"), tmp.path(), 0.8)
            .unwrap_err();
        assert!(err.to_string().contains("label file not found"));
    }

    #[test]
    fn rejects_out_of_range_ratio() {
        let tmp = TempDir::new().unwrap();
        let (log, labels) = write_fixture(tmp.path());
        assert!(build_sessions(&log, &labels, 1.5).is_err());
    }
}
