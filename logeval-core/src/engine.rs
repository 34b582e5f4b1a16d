use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use anyhow::bail;
use chrono::Local;

use crate::config::AppConfig;
use crate::config::AppPaths;
use crate::config::ConfigBundle;
use crate::config::ModelSettings;
use crate::config::ResolvedDataset;
use crate::config::load_or_initialize_config;
use crate::convert::ConversionSummary;
use crate::convert::convert_hdfs;
use crate::dataset::EvalDataset;
use crate::evaluation;
use crate::evaluation::EvaluationDriver;
use crate::evaluation::EvaluationResult;
use crate::evaluation::EvaluationSummary;
use crate::hub;
use crate::hub::HubClient;
use crate::hub::HubDownload;
use crate::hub::HubReport;
use crate::model::AnomalyModel;
use crate::model::HttpModel;
use crate::model::WeightCheck;
use crate::model::preflight;
use crate::model::smoke_generate;
use crate::session::SessionSplit;
use crate::session::SplitFiles;
use crate::session::prepare_dataset;
use crate::transfer::StorageCli;
use crate::transfer::TransferDataset;
use crate::transfer::TransferPlan;
use crate::transfer::TransferReport;

/// Entry point for every harness operation. Owns the loaded configuration and
/// the runtime paths derived from it.
#[derive(Debug)]
pub struct Harness {
    bundle: ConfigBundle,
}

impl Harness {
    /// Load configuration from disk (creating defaults if needed).
    pub fn load(app_name: impl AsRef<str>) -> Result<Self> {
        Ok(Self {
            bundle: load_or_initialize_config(app_name)?,
        })
    }

    pub fn from_bundle(bundle: ConfigBundle) -> Self {
        Self { bundle }
    }

    pub fn config(&self) -> &AppConfig {
        &self.bundle.config
    }

    pub fn paths(&self) -> &AppPaths {
        &self.bundle.paths
    }

    pub fn resolve_dataset(&self, name: &str) -> Result<ResolvedDataset> {
        self.bundle.config.resolve_dataset(name, &self.bundle.paths)
    }

    pub fn resolve_datasets(&self) -> Result<Vec<ResolvedDataset>> {
        self.bundle
            .config
            .dataset_names()
            .iter()
            .map(|name| self.resolve_dataset(name))
            .collect()
    }

    /// Convert the row-oriented HDFS export. Explicit paths take precedence
    /// over `[conversion]`.
    pub fn convert(
        &self,
        input: Option<&Path>,
        output_dir: Option<&Path>,
    ) -> Result<ConversionSummary> {
        let conversion = self.config().resolve_conversion(self.paths())?;
        convert_hdfs(
            input.unwrap_or(conversion.input.as_path()),
            output_dir.unwrap_or(conversion.output_dir.as_path()),
            &conversion.log_name,
            &conversion.label_file,
        )
    }

    /// Build `train.csv` / `test.csv` for a dataset from its flat log and label
    /// table.
    pub fn prepare(&self, name: &str) -> Result<(SessionSplit, SplitFiles)> {
        let dataset = self.resolve_dataset(name)?;
        prepare_dataset(
            &dataset.log_path,
            &dataset.label_path,
            &dataset.dir,
            self.config().session.train_ratio,
        )
    }

    fn model_token(&self) -> Option<String> {
        model_token(&self.config().models, hub::resolve_token)
    }

    pub fn model_for(&self, dataset: &ResolvedDataset) -> Result<Arc<dyn AnomalyModel>> {
        let models = self.config().resolve_models(self.paths())?;
        let token = self.model_token();
        let model = HttpModel::new(
            &models,
            dataset,
            self.config().evaluation.collate(),
            token.as_deref(),
        )?;
        Ok(Arc::new(model))
    }

    pub async fn evaluate(&self, name: &str) -> Result<EvaluationResult> {
        let dataset = self.resolve_dataset(name)?;
        let model = self.model_for(&dataset)?;
        self.evaluate_with(&dataset, model).await
    }

    pub async fn evaluate_with(
        &self,
        dataset: &ResolvedDataset,
        model: Arc<dyn AnomalyModel>,
    ) -> Result<EvaluationResult> {
        if !dataset.test_path.is_file() {
            bail!(
                "test split not found at {}; run `logeval prepare {}` first",
                dataset.test_path.display(),
                dataset.name
            );
        }
        let examples = EvalDataset::load(&dataset.test_path)?;

        let settings = &self.config().evaluation;
        let driver = EvaluationDriver::builder()
            .dataset_name(dataset.name.clone())
            .model(model)
            .batch_size(settings.batch_size)
            .workers(settings.workers)
            .collate(settings.collate())
            .show_progress(settings.show_progress)
            .build();
        driver.run(examples).await
    }

    /// Evaluate every configured dataset in order and keep a copy of the
    /// summary under the state directory.
    pub async fn evaluate_all(&self) -> EvaluationSummary {
        let names = self.config().dataset_names();
        let summary = evaluation::evaluate_all(&names, |name| async move {
            self.evaluate(&name).await
        })
        .await;

        let path = self.summary_path();
        if let Err(err) = summary.write_json(&path) {
            tracing::warn!(path = %path.display(), "could not persist summary: {err:#}");
        } else {
            tracing::info!(path = %path.display(), "saved evaluation summary");
        }
        summary
    }

    fn summary_path(&self) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        self.paths()
            .state_dir
            .join("evaluations")
            .join(format!("summary_{stamp}.json"))
    }

    pub fn transfer_plan(&self) -> Result<TransferPlan> {
        let datasets = self.resolve_datasets()?;
        Ok(TransferPlan {
            bucket: self.config().transfer.bucket.clone(),
            data_dir: self.paths().data_dir.clone(),
            datasets: datasets.iter().map(TransferDataset::from).collect(),
        })
    }

    pub fn upload(&self) -> Result<TransferReport> {
        let plan = self.transfer_plan()?;
        Ok(plan.upload(&StorageCli::new(&self.config().transfer.program)))
    }

    pub fn download(&self) -> Result<TransferReport> {
        let plan = self.transfer_plan()?;
        Ok(plan.download(&StorageCli::new(&self.config().transfer.program)))
    }

    pub fn check_models(&self) -> Result<Vec<WeightCheck>> {
        let models = self.config().resolve_models(self.paths())?;
        let datasets = self.resolve_datasets()?;
        Ok(preflight(&models, &datasets))
    }

    /// Short generation against the endpoint with the dataset's adapter.
    pub async fn smoke_test(&self, name: &str) -> Result<String> {
        let dataset = self.resolve_dataset(name)?;
        let model = self.model_for(&dataset)?;
        smoke_generate(model.as_ref()).await
    }

    /// Fetch the hub dataset repo into `dest`, defaulting to `[conversion].input`
    /// so `convert` picks it up without arguments.
    pub async fn download_hdfs(&self, dest: Option<&Path>) -> Result<HubDownload> {
        let dest = match dest {
            Some(dest) => dest.to_path_buf(),
            None => self.config().resolve_conversion(self.paths())?.input,
        };
        let token = hub::resolve_token();
        let settings = &self.config().hub;
        let client = HubClient::new(settings, token.as_deref())?;
        client
            .download_dataset(&settings.dataset, &settings.revision, &dest)
            .await
    }

    pub async fn hub_check(&self) -> Result<HubReport> {
        let token = hub::resolve_token();
        let settings = &self.config().hub;
        let client = HubClient::new(settings, token.as_deref())?;
        Ok(client
            .check(&settings.dataset, token.as_ref().map(String::len))
            .await)
    }
}

/// Configured api key, else the hub token when `forward_hub_token` is set.
fn model_token(
    models: &ModelSettings,
    hub_token: impl FnOnce() -> Option<String>,
) -> Option<String> {
    match models.api_key.as_deref().map(str::trim) {
        Some(key) if !key.is_empty() => Some(key.to_string()),
        _ if models.forward_hub_token => hub_token(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatasetConfig;
    use crate::dataset::Batch;
    use async_trait::async_trait;
    use std::fs;
    use tempfile::TempDir;

    /// Flags any sequence mentioning `exception` as anomalous.
    struct KeywordModel;

    #[async_trait]
    impl AnomalyModel for KeywordModel {
        fn name(&self) -> &str {
            "keyword"
        }

        async fn generate(&self, batch: &Batch) -> Result<Vec<String>> {
            Ok(batch
                .sequences
                .iter()
                .map(|messages| {
                    if messages.iter().any(|m| m.contains("exception")) {
                        "The log sequence is anomalous".to_string()
                    } else {
                        "normal".to_string()
                    }
                })
                .collect())
        }
    }

    fn harness(root: &Path) -> Harness {
        let mut config = AppConfig {
            datasets: vec![DatasetConfig {
                name: "HDFS_v1".to_string(),
                dir: Some("HDFS_data".to_string()),
                log_file: Some("HDFS.log".to_string()),
                required: vec!["HDFS.log".to_string()],
                ..Default::default()
            }],
            ..Default::default()
        };
        config.session.train_ratio = 0.5;
        config.evaluation.show_progress = false;
        config.evaluation.batch_size = 2;
        config.normalize().unwrap();

        let paths = AppPaths {
            app_name: "logeval-test".to_string(),
            config_dir: root.join("config"),
            config_file: root.join("config/config.toml"),
            data_dir: root.join("data"),
            state_dir: root.join("state"),
        };
        Harness::from_bundle(ConfigBundle { config, paths })
    }

    fn write_hdfs(root: &Path) {
        let dir = root.join("data/HDFS_data");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("HDFS.log"),
            "081109 203518 143 INFO dfs.DataNode: Receiving block blk_1\n\
             081109 203518 35 INFO dfs.DataNode: Receiving block blk_2\n\
             081109 203519 143 INFO dfs.DataNode: Receiving block blk_3\n\
             081109 203520 145 WARN dfs.DataNode: exception while serving blk_3\n\
             081109 203521 145 INFO dfs.DataNode: Receiving block blk_4\n",
        )
        .unwrap();
        fs::write(
            dir.join("anomaly_label.csv"),
            "BlockId,Label\nblk_1,Normal\nblk_2,Normal\nblk_3,Anomaly\nblk_4,Normal\n",
        )
        .unwrap();
    }

    #[tokio::test]
    async fn prepares_and_evaluates_a_dataset() {
        let tmp = TempDir::new().unwrap();
        write_hdfs(tmp.path());
        let harness = harness(tmp.path());

        let (split, files) = harness.prepare("HDFS_v1").unwrap();
        assert_eq!(split.train.len(), 2);
        assert_eq!(split.test.len(), 2);
        assert!(files.test.is_file());

        let dataset = harness.resolve_dataset("HDFS_v1").unwrap();
        let result = harness
            .evaluate_with(&dataset, Arc::new(KeywordModel))
            .await
            .unwrap();
        assert_eq!(result.examples, 2);
        assert_eq!(result.f1, 1.0);
        assert_eq!(result.accuracy, 1.0);
    }

    #[tokio::test]
    async fn evaluation_requires_a_test_split() {
        let tmp = TempDir::new().unwrap();
        let harness = harness(tmp.path());
        let dataset = harness.resolve_dataset("HDFS_v1").unwrap();

        let err = harness
            .evaluate_with(&dataset, Arc::new(KeywordModel))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("logeval prepare HDFS_v1"));
    }

    #[tokio::test]
    async fn evaluate_all_records_failures_and_persists_summary() {
        let tmp = TempDir::new().unwrap();
        let harness = harness(tmp.path());

        let summary = harness.evaluate_all().await;
        assert!(summary.results.is_empty());
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].dataset, "HDFS_v1");

        let saved = fs::read_dir(tmp.path().join("state/evaluations"))
            .unwrap()
            .count();
        assert_eq!(saved, 1);
    }

    #[tokio::test]
    async fn hdfs_download_defaults_to_conversion_input() {
        let tmp = TempDir::new().unwrap();
        let mut harness = harness(tmp.path());
        harness.bundle.config.hub.endpoint = "http://127.0.0.1:1".to_string();
        harness.bundle.config.conversion.input = tmp.path().join("HDFS_v1").display().to_string();

        let err = harness.download_hdfs(None).await.unwrap_err();
        let hint = hub::download_hint(&err, &harness.config().hub.dataset).unwrap();
        assert!(hint.contains("network connection"));
        assert!(!tmp.path().join("HDFS_v1").exists());
    }

    #[tokio::test]
    async fn smoke_test_reports_unreachable_endpoint() {
        let tmp = TempDir::new().unwrap();
        let mut harness = harness(tmp.path());
        harness.bundle.config.models.base_url = "http://127.0.0.1:1".to_string();

        let err = harness.smoke_test("HDFS_v1").await.unwrap_err();
        assert!(err.to_string().contains("smoke generation for HDFS_v1 failed"));
    }

    #[test]
    fn hub_token_is_forwarded_only_when_enabled() {
        let hub_token = || Some("hf_secret".to_string());
        let mut models = ModelSettings::default();
        assert_eq!(model_token(&models, hub_token), None);

        models.forward_hub_token = true;
        assert_eq!(model_token(&models, hub_token).as_deref(), Some("hf_secret"));

        models.api_key = Some(" sk-endpoint ".to_string());
        assert_eq!(model_token(&models, hub_token).as_deref(), Some("sk-endpoint"));

        models.api_key = Some("  ".to_string());
        models.forward_hub_token = false;
        assert_eq!(model_token(&models, hub_token), None);
    }

    #[test]
    fn transfer_plan_uses_dataset_directories() {
        let tmp = TempDir::new().unwrap();
        let plan = harness(tmp.path()).transfer_plan().unwrap();
        assert_eq!(plan.bucket, "oss://my_models/");
        assert_eq!(plan.datasets[0].dir_name, "HDFS_data");
        assert_eq!(
            plan.remote_path("HDFS_data", "HDFS.log"),
            "oss://my_models/data/HDFS_data/HDFS.log"
        );
    }

    #[test]
    fn model_checks_cover_every_dataset() {
        let tmp = TempDir::new().unwrap();
        let checks = harness(tmp.path()).check_models().unwrap();
        let labels: Vec<_> = checks.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["encoder", "decoder", "adapter (HDFS_v1)"]);
    }
}
