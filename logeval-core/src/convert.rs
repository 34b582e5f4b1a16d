//! Conversion of a row-oriented HDFS export into the flat `HDFS.log` file and
//! the `anomaly_label.csv` block table.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::io::BufRead;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use serde_json::Value;

use crate::labels::LabelReconciler;
use crate::records::LogRecord;
use crate::records::coerce_text;

/// One row of the exported dataset: the log fields plus its block ids and
/// anomaly flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceRow {
    pub record: LogRecord,
    pub block_id: String,
    pub anomalous: bool,
}

impl SourceRow {
    fn from_lookup<'a>(get: impl Fn(&str) -> Option<&'a str>) -> Self {
        Self {
            record: LogRecord {
                date: coerce_text(get("date")),
                time: coerce_text(get("time")),
                pid: coerce_text(get("pid")),
                level: coerce_text(get("level")),
                component: coerce_text(get("component")),
                content: coerce_text(get("content")),
            },
            block_id: coerce_text(get("block_id")),
            anomalous: get("anomaly").is_some_and(is_anomaly_flag),
        }
    }

    fn from_json(object: &serde_json::Map<String, Value>) -> Self {
        let rendered: HashMap<&str, String> = object
            .iter()
            .filter_map(|(key, value)| json_text(value).map(|text| (key.as_str(), text)))
            .collect();
        Self::from_lookup(|key| rendered.get(key).map(String::as_str))
    }
}

fn json_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Bool(flag) => Some(if *flag { "1" } else { "0" }.to_string()),
        other => Some(other.to_string()),
    }
}

/// Anything numerically equal to 1 (or `true`) marks the row anomalous.
fn is_anomaly_flag(raw: &str) -> bool {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("true") {
        return true;
    }
    raw.parse::<f64>().is_ok_and(|value| value == 1.0)
}

pub fn render_line(record: &LogRecord) -> String {
    record.render()
}

/// Write one rendered line per record, in order, replacing `path`.
/// Returns the number of lines written.
pub fn materialize<'a, I>(records: I, path: &Path) -> Result<usize>
where
    I: IntoIterator<Item = &'a LogRecord>,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    let file = fs::File::create(path)
        .with_context(|| format!("failed to create log file {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    let mut written = 0;
    for record in records {
        writeln!(writer, "{}", render_line(record))
            .with_context(|| format!("failed to write log file {}", path.display()))?;
        written += 1;
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush log file {}", path.display()))?;

    Ok(written)
}

/// Load source rows from a path.
///
/// The path can be either:
/// - A `.jsonl` file (one JSON object per line)
/// - A `.csv` file with a header row
/// - A directory; every `.jsonl` / `.csv` file inside is loaded in file name
///   order and the rows are concatenated
pub fn load_source_rows(path: &Path) -> Result<Vec<SourceRow>> {
    if !path.exists() {
        bail!("input path '{}' does not exist", path.display());
    }

    if path.is_dir() {
        let mut files = Vec::new();
        collect_source_files(path, &mut files)?;
        files.sort();

        if files.is_empty() {
            bail!("no .jsonl or .csv files found in {}", path.display());
        }

        let mut rows = Vec::new();
        for file in &files {
            let split = load_source_file(file)?;
            tracing::info!(split = %file.display(), rows = split.len(), "loaded split");
            rows.extend(split);
        }
        return Ok(rows);
    }

    load_source_file(path)
}

/// `.jsonl` / `.csv` files under `dir`, including nested split directories.
fn collect_source_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("unable to read input directory {}", dir.display()))?;
    for entry in entries {
        let candidate = entry?.path();
        if candidate.is_dir() {
            collect_source_files(&candidate, files)?;
        } else if matches!(extension(&candidate), Some("jsonl" | "csv")) {
            files.push(candidate);
        }
    }
    Ok(())
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|ext| ext.to_str())
}

fn load_source_file(path: &Path) -> Result<Vec<SourceRow>> {
    match extension(path) {
        Some("jsonl") => load_jsonl_rows(path),
        Some("csv") => load_csv_rows(path),
        _ => bail!("unsupported input format: {}", path.display()),
    }
}

fn load_jsonl_rows(path: &Path) -> Result<Vec<SourceRow>> {
    let file = fs::File::open(path)
        .with_context(|| format!("failed to open JSONL file '{}'", path.display()))?;
    let reader = io::BufReader::new(file);

    let mut rows = Vec::new();
    for (line_num, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!(
                "failed to read line {} of '{}'",
                line_num + 1,
                path.display()
            )
        })?;

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(object)) => rows.push(SourceRow::from_json(&object)),
            Ok(_) | Err(_) => {
                tracing::debug!(line = line_num + 1, "skipping non-object JSONL line");
            }
        }
    }

    Ok(rows)
}

fn load_csv_rows(path: &Path) -> Result<Vec<SourceRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open CSV file '{}'", path.display()))?;

    let headers = reader
        .headers()
        .with_context(|| format!("failed to read CSV header of '{}'", path.display()))?
        .clone();
    let columns: HashMap<String, usize> = headers
        .iter()
        .enumerate()
        .map(|(index, name)| (name.trim().to_ascii_lowercase(), index))
        .collect();

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                tracing::debug!(row = index + 2, "skipping unreadable CSV row: {err}");
                continue;
            }
        };
        rows.push(SourceRow::from_lookup(|key| {
            columns
                .get(key)
                .and_then(|column| record.get(*column))
                .filter(|value| !value.is_empty())
        }));
    }

    Ok(rows)
}

/// Outcome of [`convert_hdfs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionSummary {
    pub log_path: PathBuf,
    pub label_path: PathBuf,
    pub rows: usize,
    pub unique_blocks: usize,
    pub anomalies: usize,
    pub normals: usize,
    pub log_size_bytes: u64,
}

impl ConversionSummary {
    pub fn log_size_mb(&self) -> f64 {
        self.log_size_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Convert the exported rows under `input` into `<output_dir>/<log_name>` and
/// `<output_dir>/<label_file>`.
pub fn convert_hdfs(
    input: &Path,
    output_dir: &Path,
    log_name: &str,
    label_file: &str,
) -> Result<ConversionSummary> {
    let rows = load_source_rows(input)?;
    tracing::info!(rows = rows.len(), input = %input.display(), "loaded source rows");

    let log_path = output_dir.join(log_name);
    let written = materialize(rows.iter().map(|row| &row.record), &log_path)?;
    tracing::info!(lines = written, path = %log_path.display(), "wrote flat log");

    let mut reconciler = LabelReconciler::new();
    for row in &rows {
        reconciler.observe(&row.block_id, row.anomalous);
    }

    let label_path = output_dir.join(label_file);
    reconciler.write_csv(&label_path)?;
    tracing::info!(
        blocks = reconciler.len(),
        path = %label_path.display(),
        "wrote block labels"
    );

    let log_size_bytes = fs::metadata(&log_path)
        .with_context(|| format!("failed to stat {}", log_path.display()))?
        .len();

    Ok(ConversionSummary {
        log_path,
        label_path,
        rows: written,
        unique_blocks: reconciler.len(),
        anomalies: reconciler.anomaly_count(),
        normals: reconciler.normal_count(),
        log_size_bytes,
    })
}
