use std::fmt;
use std::fs;
use std::future::Future;
use std::path::Path;
use std::pin::pin;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use bon::Builder;
use chrono::Local;
use futures::StreamExt;
use indicatif::ProgressBar;
use indicatif::ProgressStyle;
use serde::Serialize;

use crate::dataset::BatchLoader;
use crate::dataset::CollateSettings;
use crate::dataset::EvalDataset;
use crate::metrics::ConfusionMatrix;
use crate::model::AnomalyModel;
use crate::prediction::PredictionLabel;
use crate::prediction::parse_prediction;

/// Stages of a single evaluation run. The run moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalPhase {
    Init,
    BatchIterate,
    Decode,
    LabelParse,
    Aggregate,
    Report,
}

impl fmt::Display for EvalPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::BatchIterate => "batch-iterate",
            Self::Decode => "decode",
            Self::LabelParse => "label-parse",
            Self::Aggregate => "aggregate",
            Self::Report => "report",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassCounts {
    pub actual_anomalous: usize,
    pub actual_normal: usize,
    pub predicted_anomalous: usize,
    pub predicted_normal: usize,
    /// Outputs with neither keyword; also counted in `predicted_normal`.
    pub unparsed: usize,
}

impl ClassCounts {
    fn tally(truth: &[u8], predictions: &[PredictionLabel]) -> Self {
        let actual_anomalous = truth.iter().filter(|&&label| label == 1).count();
        let predicted_anomalous = predictions.iter().filter(|p| p.is_positive()).count();
        Self {
            actual_anomalous,
            actual_normal: truth.len() - actual_anomalous,
            predicted_anomalous,
            predicted_normal: predictions.len() - predicted_anomalous,
            unparsed: predictions
                .iter()
                .filter(|p| **p == PredictionLabel::Unparsed)
                .count(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationResult {
    pub dataset: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub accuracy: f64,
    pub examples: usize,
    pub counts: ClassCounts,
    pub confusion: ConfusionMatrix,
    pub evaluated_at: String,
}

impl EvaluationResult {
    fn from_predictions(
        dataset: &str,
        truth: &[u8],
        predictions: &[PredictionLabel],
    ) -> Result<Self> {
        let predicted: Vec<u8> = predictions.iter().map(|p| p.as_binary()).collect();
        let confusion = ConfusionMatrix::from_labels(truth, &predicted)?;
        Ok(Self {
            dataset: dataset.to_string(),
            precision: confusion.precision(),
            recall: confusion.recall(),
            f1: confusion.f1(),
            accuracy: confusion.accuracy(),
            examples: truth.len(),
            counts: ClassCounts::tally(truth, predictions),
            confusion,
            evaluated_at: Local::now().to_rfc3339(),
        })
    }
}

/// Console report for one dataset.
pub fn render_report(result: &EvaluationResult) -> String {
    let counts = &result.counts;
    format!(
        "{rule}\n\
         Evaluation: {}\n\
         {rule}\n\
         Examples:            {}\n\
         Actual anomalous:    {}\n\
         Actual normal:       {}\n\
         Predicted anomalous: {}\n\
         Predicted normal:    {}\n\
         Unparsed outputs:    {}\n\
         {dash}\n\
         Precision: {:.4}\n\
         Recall:    {:.4}\n\
         F1:        {:.4}\n\
         Accuracy:  {:.4}\n\
         {rule}",
        result.dataset,
        result.examples,
        counts.actual_anomalous,
        counts.actual_normal,
        counts.predicted_anomalous,
        counts.predicted_normal,
        counts.unparsed,
        result.precision,
        result.recall,
        result.f1,
        result.accuracy,
        rule = "=".repeat(60),
        dash = "-".repeat(60),
    )
}

/// Runs one dataset through the model batch by batch and scores the output.
#[derive(Builder)]
pub struct EvaluationDriver {
    #[builder(into)]
    dataset_name: String,
    model: Arc<dyn AnomalyModel>,
    #[builder(default = 32)]
    batch_size: usize,
    #[builder(default = 1)]
    workers: usize,
    collate: CollateSettings,
    #[builder(default = false)]
    show_progress: bool,
}

impl EvaluationDriver {
    fn enter(&self, phase: &mut EvalPhase, next: EvalPhase) {
        tracing::debug!(dataset = %self.dataset_name, from = %phase, to = %next, "phase");
        *phase = next;
    }

    fn progress_bar(&self, batches: usize) -> Result<ProgressBar> {
        if !self.show_progress {
            return Ok(ProgressBar::hidden());
        }
        let bar = ProgressBar::new(batches as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {pos}/{len} batches")
                .context("invalid progress bar template")?
                .progress_chars("#>-"),
        );
        bar.set_message(self.dataset_name.clone());
        Ok(bar)
    }

    pub async fn run(&self, dataset: EvalDataset) -> Result<EvaluationResult> {
        let mut phase = EvalPhase::Init;
        tracing::info!(
            dataset = %self.dataset_name,
            model = self.model.name(),
            examples = dataset.len(),
            "starting evaluation"
        );
        if dataset.is_empty() {
            tracing::warn!(
                dataset = %self.dataset_name,
                "dataset is empty; all metrics are reported as 0"
            );
        }

        let loader = BatchLoader::new(
            Arc::new(dataset),
            self.batch_size,
            self.workers,
            self.collate,
        )?;
        let progress = self.progress_bar(loader.num_batches())?;

        let mut truth = Vec::new();
        let mut predictions = Vec::new();
        let mut batches = pin!(loader.into_stream());

        while let Some(batch) = batches.next().await {
            self.enter(&mut phase, EvalPhase::BatchIterate);
            let batch = batch?;

            self.enter(&mut phase, EvalPhase::Decode);
            let outputs = self
                .model
                .generate(&batch)
                .await
                .with_context(|| format!("model failed on batch {}", batch.index))?;
            if outputs.len() != batch.len() {
                bail!(
                    "model returned {} outputs for batch {} of {} sequences",
                    outputs.len(),
                    batch.index,
                    batch.len()
                );
            }

            self.enter(&mut phase, EvalPhase::LabelParse);
            predictions.extend(outputs.iter().map(|text| parse_prediction(text)));
            truth.extend_from_slice(&batch.labels);
            progress.inc(1);
        }
        progress.finish_and_clear();

        self.enter(&mut phase, EvalPhase::Aggregate);
        let result = EvaluationResult::from_predictions(&self.dataset_name, &truth, &predictions)?;
        tracing::info!(
            dataset = %result.dataset,
            actual_anomalous = result.counts.actual_anomalous,
            actual_normal = result.counts.actual_normal,
            predicted_anomalous = result.counts.predicted_anomalous,
            predicted_normal = result.counts.predicted_normal,
            unparsed = result.counts.unparsed,
            "class balance"
        );

        self.enter(&mut phase, EvalPhase::Report);
        Ok(result)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetFailure {
    pub dataset: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EvaluationSummary {
    pub results: Vec<EvaluationResult>,
    pub failures: Vec<DatasetFailure>,
}

impl EvaluationSummary {
    /// Mean F1 over the datasets that evaluated successfully.
    pub fn mean_f1(&self) -> Option<f64> {
        if self.results.is_empty() {
            return None;
        }
        let total: f64 = self.results.iter().map(|r| r.f1).sum();
        Some(total / self.results.len() as f64)
    }

    pub fn render_table(&self) -> String {
        let mut out = String::new();
        out.push_str(&"=".repeat(60));
        out.push_str("\nSummary\n");
        out.push_str(&"=".repeat(60));
        out.push('\n');

        if self.results.is_empty() {
            out.push_str("No dataset evaluated successfully\n");
        } else {
            out.push_str(&format!(
                "{:<16} {:>10} {:>10} {:>10} {:>10}\n",
                "dataset", "precision", "recall", "f1", "accuracy"
            ));
            for result in &self.results {
                out.push_str(&format!(
                    "{:<16} {:>10.4} {:>10.4} {:>10.4} {:>10.4}\n",
                    result.dataset, result.precision, result.recall, result.f1, result.accuracy
                ));
            }
            if let Some(mean) = self.mean_f1() {
                out.push_str(&format!("\nMean F1: {mean:.4}\n"));
            }
        }

        for failure in &self.failures {
            out.push_str(&format!("FAILED {}: {}\n", failure.dataset, failure.error));
        }
        out
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let payload = serde_json::json!({
            "timestamp": Local::now().to_rfc3339(),
            "mean_f1": self.mean_f1(),
            "results": self.results,
            "failures": self.failures,
        });
        fs::write(path, serde_json::to_string_pretty(&payload)?)
            .with_context(|| format!("failed to write summary {}", path.display()))
    }
}

/// Evaluate every dataset in order. A failing dataset is logged and recorded;
/// the remaining datasets still run.
pub async fn evaluate_all<F, Fut>(datasets: &[String], mut evaluate: F) -> EvaluationSummary
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<EvaluationResult>>,
{
    let mut summary = EvaluationSummary::default();
    for name in datasets {
        match evaluate(name.clone()).await {
            Ok(result) => summary.results.push(result),
            Err(err) => {
                tracing::error!(dataset = %name, "evaluation failed: {err:?}");
                summary.failures.push(DatasetFailure {
                    dataset: name.clone(),
                    error: format!("{err:#}"),
                });
            }
        }
    }
    summary
}
