//! Bulk dataset transfer through an object storage command line client.
//!
//! Every copy is independent: a failed file is recorded and the next one
//! still runs. The client's exit status is the only success signal.

use std::fmt;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;

use crate::config::ResolvedDataset;

/// Copies one file between local disk and the bucket.
pub trait CopyCommand {
    fn copy(&self, src: &str, dst: &str) -> Result<()>;
}

/// Runs `<program> cp <src> <dst>` and waits for it.
#[derive(Debug, Clone)]
pub struct StorageCli {
    program: String,
}

impl StorageCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl CopyCommand for StorageCli {
    fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let output = Command::new(&self.program)
            .args(["cp", src, dst])
            .output()
            .with_context(|| format!("failed to run {}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} cp exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => f.write_str("upload"),
            Self::Download => f.write_str("download"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Transferred,
    Failed(String),
    /// Required file absent from the local dataset directory.
    MissingLocal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub dataset: String,
    pub file: String,
    pub required: bool,
    pub outcome: FileOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub direction: Direction,
    pub files: Vec<FileRecord>,
    pub skipped_datasets: Vec<String>,
    /// Entry count of each local dataset directory after a download;
    /// `None` when the directory does not exist.
    pub inventory: Vec<(String, Option<usize>)>,
}

impl TransferReport {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            files: Vec::new(),
            skipped_datasets: Vec::new(),
            inventory: Vec::new(),
        }
    }

    pub fn transferred(&self) -> usize {
        self.count(|outcome| matches!(outcome, FileOutcome::Transferred))
    }

    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, FileOutcome::Failed(_)))
    }

    pub fn missing(&self) -> usize {
        self.count(|outcome| matches!(outcome, FileOutcome::MissingLocal))
    }

    fn count(&self, predicate: impl Fn(&FileOutcome) -> bool) -> usize {
        self.files.iter().filter(|f| predicate(&f.outcome)).count()
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "{rule}\nTransfer ({})\n{rule}\n",
            self.direction,
            rule = "=".repeat(60)
        );
        for dataset in &self.skipped_datasets {
            out.push_str(&format!("SKIP  {dataset}: local directory missing\n"));
        }
        for record in &self.files {
            let line = match &record.outcome {
                FileOutcome::Transferred => format!("OK    {}/{}", record.dataset, record.file),
                FileOutcome::Failed(reason) => {
                    format!("FAIL  {}/{}: {reason}", record.dataset, record.file)
                }
                FileOutcome::MissingLocal => {
                    format!("MISS  {}/{}", record.dataset, record.file)
                }
            };
            out.push_str(&line);
            out.push('\n');
        }
        out.push_str(&format!(
            "{}\nTransferred: {}  Failed: {}  Missing: {}\n",
            "-".repeat(60),
            self.transferred(),
            self.failed(),
            self.missing()
        ));
        if !self.inventory.is_empty() {
            out.push_str("\nLocal files:\n");
            for (dataset, count) in &self.inventory {
                match count {
                    Some(count) => out.push_str(&format!("  {dataset}: {count} files\n")),
                    None => out.push_str(&format!("  {dataset}: missing\n")),
                }
            }
        }
        out
    }
}

/// Files of one dataset directory, named the same locally and remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDataset {
    pub dir_name: String,
    pub required: Vec<String>,
    pub optional: Vec<String>,
}

impl From<&ResolvedDataset> for TransferDataset {
    fn from(dataset: &ResolvedDataset) -> Self {
        Self {
            dir_name: dataset.dir_name.clone(),
            required: dataset.required.clone(),
            optional: dataset.optional.clone(),
        }
    }
}

impl TransferDataset {
    fn files(&self) -> impl Iterator<Item = (&str, bool)> {
        self.required
            .iter()
            .map(|f| (f.as_str(), true))
            .chain(self.optional.iter().map(|f| (f.as_str(), false)))
    }
}

#[derive(Debug, Clone)]
pub struct TransferPlan {
    /// Bucket URL ending in `/`.
    pub bucket: String,
    pub data_dir: PathBuf,
    pub datasets: Vec<TransferDataset>,
}

impl TransferPlan {
    pub fn remote_path(&self, dataset: &str, file: &str) -> String {
        format!("{}data/{}/{}", self.bucket, dataset, file)
    }

    pub fn local_path(&self, dataset: &str, file: &str) -> PathBuf {
        self.data_dir.join(dataset).join(file)
    }

    pub fn upload(&self, copier: &dyn CopyCommand) -> TransferReport {
        let mut report = TransferReport::new(Direction::Upload);

        for dataset in &self.datasets {
            let local_dir = self.data_dir.join(&dataset.dir_name);
            if !local_dir.is_dir() {
                tracing::warn!(dataset = %dataset.dir_name, "skipping dataset: local directory missing");
                report.skipped_datasets.push(dataset.dir_name.clone());
                continue;
            }

            for (file, required) in dataset.files() {
                let local = self.local_path(&dataset.dir_name, file);
                if !local.exists() {
                    if required {
                        tracing::warn!(path = %local.display(), "required file missing");
                        report.files.push(FileRecord {
                            dataset: dataset.dir_name.clone(),
                            file: file.to_string(),
                            required,
                            outcome: FileOutcome::MissingLocal,
                        });
                    }
                    continue;
                }

                let remote = self.remote_path(&dataset.dir_name, file);
                let outcome = run_copy(copier, &local.display().to_string(), &remote);
                report.files.push(FileRecord {
                    dataset: dataset.dir_name.clone(),
                    file: file.to_string(),
                    required,
                    outcome,
                });
            }
        }

        report
    }

    pub fn download(&self, copier: &dyn CopyCommand) -> TransferReport {
        let mut report = TransferReport::new(Direction::Download);

        for dataset in &self.datasets {
            let local_dir = self.data_dir.join(&dataset.dir_name);
            if let Err(err) = fs::create_dir_all(&local_dir) {
                tracing::warn!(path = %local_dir.display(), "cannot create dataset directory: {err}");
                report.skipped_datasets.push(dataset.dir_name.clone());
                continue;
            }

            for (file, required) in dataset.files() {
                let remote = self.remote_path(&dataset.dir_name, file);
                let local = self.local_path(&dataset.dir_name, file);
                let outcome = run_copy(copier, &remote, &local.display().to_string());
                report.files.push(FileRecord {
                    dataset: dataset.dir_name.clone(),
                    file: file.to_string(),
                    required,
                    outcome,
                });
            }
        }

        report.inventory = self.inventory();
        report
    }

    pub fn inventory(&self) -> Vec<(String, Option<usize>)> {
        self.datasets
            .iter()
            .map(|dataset| {
                let dir = self.data_dir.join(&dataset.dir_name);
                (dataset.dir_name.clone(), count_entries(&dir))
            })
            .collect()
    }
}

fn count_entries(dir: &Path) -> Option<usize> {
    fs::read_dir(dir).ok().map(|entries| entries.count())
}

fn run_copy(copier: &dyn CopyCommand, src: &str, dst: &str) -> FileOutcome {
    tracing::debug!(src, dst, "copying");
    match copier.copy(src, dst) {
        Ok(()) => {
            tracing::info!(dst, "copied");
            FileOutcome::Transferred
        }
        Err(err) => {
            tracing::warn!(src, "copy failed: {err:#}");
            FileOutcome::Failed(format!("{err:#}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingCopier {
        calls: Mutex<Vec<(String, String)>>,
        fail_suffix: Option<&'static str>,
    }

    impl CopyCommand for RecordingCopier {
        fn copy(&self, src: &str, dst: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((src.to_string(), dst.to_string()));
            if let Some(suffix) = self.fail_suffix
                && src.ends_with(suffix)
            {
                bail!("NoSuchKey");
            }
            Ok(())
        }
    }

    fn plan(data_dir: &Path) -> TransferPlan {
        TransferPlan {
            bucket: "oss://my_models/".to_string(),
            data_dir: data_dir.to_path_buf(),
            datasets: vec![
                TransferDataset {
                    dir_name: "HDFS_data".to_string(),
                    required: vec!["HDFS.log".to_string(), "test.csv".to_string()],
                    optional: vec!["test_info.txt".to_string(), "extra.txt".to_string()],
                },
                TransferDataset {
                    dir_name: "BGL".to_string(),
                    required: vec!["BGL.log".to_string()],
                    optional: Vec::new(),
                },
            ],
        }
    }

    #[test]
    fn builds_remote_and_local_paths() {
        let plan = plan(Path::new("/hy-tmp/data"));
        assert_eq!(
            plan.remote_path("BGL", "test.csv"),
            "oss://my_models/data/BGL/test.csv"
        );
        assert_eq!(
            plan.local_path("BGL", "test.csv"),
            PathBuf::from("/hy-tmp/data/BGL/test.csv")
        );
    }

    #[test]
    fn upload_skips_missing_and_records_outcomes() {
        let tmp = TempDir::new().unwrap();
        let hdfs = tmp.path().join("HDFS_data");
        fs::create_dir_all(&hdfs).unwrap();
        fs::write(hdfs.join("HDFS.log"), "line\n").unwrap();
        fs::write(hdfs.join("test_info.txt"), "sequences: 0\n").unwrap();

        let copier = RecordingCopier {
            fail_suffix: Some("test_info.txt"),
            ..Default::default()
        };
        let report = plan(tmp.path()).upload(&copier);

        assert_eq!(report.skipped_datasets, vec!["BGL"]);
        assert_eq!(report.transferred(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.missing(), 1);

        let calls = copier.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, "oss://my_models/data/HDFS_data/HDFS.log");
        assert!(calls[0].0.ends_with("HDFS_data/HDFS.log"));

        let missing = report
            .files
            .iter()
            .find(|r| r.outcome == FileOutcome::MissingLocal)
            .unwrap();
        assert_eq!(missing.file, "test.csv");
        assert!(report.render().contains("SKIP  BGL"));
    }

    #[test]
    fn download_creates_dirs_and_continues_after_failures() {
        let tmp = TempDir::new().unwrap();
        let copier = RecordingCopier {
            fail_suffix: Some("extra.txt"),
            ..Default::default()
        };
        let report = plan(tmp.path()).download(&copier);

        assert!(tmp.path().join("HDFS_data").is_dir());
        assert!(tmp.path().join("BGL").is_dir());
        assert_eq!(copier.calls.lock().unwrap().len(), 5);
        assert_eq!(report.transferred(), 4);
        assert_eq!(report.failed(), 1);
        assert_eq!(
            report.inventory,
            vec![("HDFS_data".to_string(), Some(0)), ("BGL".to_string(), Some(0))]
        );
    }

    #[cfg(unix)]
    #[test]
    fn storage_cli_uses_exit_status() {
        assert!(StorageCli::new("true").copy("a", "b").is_ok());

        let err = StorageCli::new("false").copy("a", "b").unwrap_err();
        assert!(err.to_string().contains("false cp exited"));

        assert!(
            StorageCli::new("logeval-no-such-storage-client")
                .copy("a", "b")
                .is_err()
        );
    }
}
