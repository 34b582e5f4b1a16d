use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use config::Config as ConfigLoader;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::dataset::CollateSettings;

/// Embedded template used to bootstrap the on-disk configuration when the user
/// runs the tool for the first time.
pub const DEFAULT_CONFIG_TEMPLATE: &str = include_str!("../../demos/config.toml");

/// Container returned after loading configuration data and resolving runtime
/// paths.
#[derive(Debug, Clone)]
pub struct ConfigBundle {
    pub config: AppConfig,
    pub paths: AppPaths,
}

/// Resolve and load the configuration for the provided application name. If no
/// config file exists yet, a default file is created from
/// [`DEFAULT_CONFIG_TEMPLATE`].
pub fn load_or_initialize_config(app_name: impl AsRef<str>) -> Result<ConfigBundle> {
    let app_name = app_name.as_ref();
    let mut paths = AppPaths::discover(app_name)?;
    paths.ensure_config_dir()?;

    if !paths.config_file.exists() {
        fs::write(&paths.config_file, DEFAULT_CONFIG_TEMPLATE).with_context(|| {
            format!(
                "failed to write default config to {}",
                paths.config_file.display()
            )
        })?;
        tracing::info!(path = %paths.config_file.display(), "wrote default configuration");
    }

    let env_prefix = app_name
        .chars()
        .map(|ch| if ch == '-' { '_' } else { ch })
        .collect::<String>()
        .to_ascii_uppercase();

    let builder = ConfigLoader::builder()
        .add_source(File::from(paths.config_file.clone()))
        .add_source(
            Environment::with_prefix(&env_prefix)
                .separator("__")
                .try_parsing(true),
        );

    let mut config: AppConfig = builder
        .build()
        .with_context(|| {
            format!(
                "failed to parse configuration at {}",
                paths.config_file.display()
            )
        })?
        .try_deserialize()
        .context("failed to deserialize configuration into AppConfig")?;

    paths = paths.apply_storage_overrides(&config.storage)?;
    paths.ensure_runtime_dirs()?;

    config.normalize()?;

    Ok(ConfigBundle { config, paths })
}

/// Persistent runtime paths derived from XDG environment variables or sensible
/// fallbacks. `data_dir` is the dataset root: one sub-directory per dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub app_name: String,
    pub config_dir: PathBuf,
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl AppPaths {
    pub fn discover(app_name: impl Into<String>) -> Result<Self> {
        let app_name = app_name.into();
        let home = home_dir().context("unable to determine home directory for XDG resolution")?;

        let config_base = xdg_dir("XDG_CONFIG_HOME", &home, ".config");
        let data_base = xdg_dir("XDG_DATA_HOME", &home, ".local/share");
        let state_base = xdg_dir("XDG_STATE_HOME", &home, ".local/state");

        let config_dir = config_base.join(&app_name);
        let config_file = config_dir.join("config.toml");

        Ok(Self {
            data_dir: data_base.join(&app_name),
            state_dir: state_base.join(&app_name),
            app_name,
            config_dir,
            config_file,
        })
    }

    pub fn ensure_config_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.config_dir).with_context(|| {
            format!(
                "failed to create config directory {}",
                self.config_dir.display()
            )
        })
    }

    /// The data root is left alone; it usually lives on a mounted volume and
    /// is populated by `download`.
    pub fn ensure_runtime_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.state_dir).with_context(|| {
            format!(
                "failed to create runtime directory {}",
                self.state_dir.display()
            )
        })
    }

    pub fn apply_storage_overrides(&self, storage: &StorageSettings) -> Result<Self> {
        let mut next = self.clone();

        if let Some(data_dir) = storage.data_dir.as_ref() {
            next.data_dir = resolve_path_value(data_dir, &self.config_dir)?;
        }

        if let Some(state_dir) = storage.state_dir.as_ref() {
            next.state_dir = resolve_path_value(state_dir, &self.config_dir)?;
        }

        Ok(next)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageSettings,
    pub models: ModelSettings,
    pub evaluation: EvaluationSettings,
    pub session: SessionSettings,
    pub conversion: ConversionSettings,
    pub transfer: TransferSettings,
    pub hub: HubSettings,
    pub datasets: Vec<DatasetConfig>,
}

impl AppConfig {
    pub fn normalize(&mut self) -> Result<()> {
        if self.evaluation.batch_size == 0 {
            bail!("evaluation.batch_size must be greater than zero");
        }
        if self.evaluation.workers == 0 {
            self.evaluation.workers = 1;
        }
        if !(0.0..=1.0).contains(&self.session.train_ratio) {
            bail!(
                "session.train_ratio must lie within [0, 1], got {}",
                self.session.train_ratio
            );
        }
        if !self.transfer.bucket.is_empty() && !self.transfer.bucket.ends_with('/') {
            self.transfer.bucket.push('/');
        }

        let mut seen = HashSet::new();
        for dataset in &self.datasets {
            if dataset.name.trim().is_empty() {
                bail!("every [[datasets]] entry needs a name");
            }
            if !seen.insert(dataset.name.as_str()) {
                bail!("dataset '{}' is configured more than once", dataset.name);
            }
        }
        Ok(())
    }

    pub fn dataset_names(&self) -> Vec<String> {
        self.datasets.iter().map(|d| d.name.clone()).collect()
    }

    pub fn resolve_dataset(&self, name: &str, paths: &AppPaths) -> Result<ResolvedDataset> {
        let dataset = self
            .datasets
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| anyhow!("dataset '{name}' is not configured"))?;

        let dir_name = dataset.dir.clone().unwrap_or_else(|| dataset.name.clone());
        let dir = paths.data_dir.join(&dir_name);
        let log_file = dataset
            .log_file
            .clone()
            .unwrap_or_else(|| format!("{}.log", dataset.name));

        let adapter_root = resolve_path_value(&self.models.adapter_root, &paths.config_dir)
            .context("failed to resolve models.adapter_root")?;
        let adapter = dataset.adapter.as_deref().unwrap_or(&dataset.name);

        Ok(ResolvedDataset {
            name: dataset.name.clone(),
            train_path: dir.join("train.csv"),
            test_path: dir.join("test.csv"),
            log_path: dir.join(&log_file),
            label_path: dir.join(ANOMALY_LABEL_FILE),
            adapter_path: adapter_root.join(format!("ft_model_{adapter}")),
            dir,
            dir_name,
            required: dataset.required.clone(),
            optional: dataset.optional.clone(),
        })
    }

    pub fn resolve_models(&self, paths: &AppPaths) -> Result<ResolvedModelConfig> {
        let encoder = resolve_path_value(&self.models.encoder_path, &paths.config_dir)
            .context("failed to resolve models.encoder_path")?;
        let decoder = resolve_path_value(&self.models.decoder_path, &paths.config_dir)
            .context("failed to resolve models.decoder_path")?;

        Ok(ResolvedModelConfig {
            base_url: self.models.base_url.trim_end_matches('/').to_string(),
            api_key: self.models.api_key.clone(),
            encoder,
            decoder,
            request_timeout: Duration::from_secs(self.models.request_timeout_secs),
        })
    }

    pub fn resolve_conversion(&self, paths: &AppPaths) -> Result<ResolvedConversion> {
        let input = resolve_path_value(&self.conversion.input, &paths.config_dir)
            .context("failed to resolve conversion.input")?;
        let output_dir = match self.conversion.output_dir.as_ref() {
            Some(dir) => resolve_path_value(dir, &paths.config_dir)
                .context("failed to resolve conversion.output_dir")?,
            None => paths.data_dir.join("HDFS_data"),
        };

        Ok(ResolvedConversion {
            input,
            output_dir,
            log_name: self.conversion.log_name.clone(),
            label_file: self.conversion.label_file.clone(),
        })
    }
}

pub const ANOMALY_LABEL_FILE: &str = "anomaly_label.csv";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub data_dir: Option<String>,
    pub state_dir: Option<String>,
}

/// Location of the inference endpoint and the weights it serves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Send the model hub token as the endpoint's bearer credential when no
    /// `api_key` is set.
    pub forward_hub_token: bool,
    pub encoder_path: String,
    pub decoder_path: String,
    pub adapter_root: String,
    pub request_timeout_secs: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            api_key: None,
            forward_hub_token: false,
            encoder_path: "/hy-tmp/model_weights/AI-ModelScope/bert-base-uncased".to_string(),
            decoder_path: "/hy-tmp/model_weights/LLM-Research/Meta-Llama-3-8B".to_string(),
            adapter_root: ".".to_string(),
            request_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationSettings {
    pub batch_size: usize,
    /// Whitespace tokens kept per log message.
    pub max_content_len: usize,
    /// Log messages kept per sequence.
    pub max_seq_len: usize,
    /// Collation workers, which is also the prefetch depth.
    pub workers: usize,
    pub show_progress: bool,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            batch_size: 32,
            max_content_len: 100,
            max_seq_len: 128,
            workers: 4,
            show_progress: true,
        }
    }
}

impl EvaluationSettings {
    pub fn collate(&self) -> CollateSettings {
        CollateSettings {
            max_seq_len: self.max_seq_len,
            max_content_len: self.max_content_len,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub train_ratio: f64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self { train_ratio: 0.8 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionSettings {
    pub input: String,
    pub output_dir: Option<String>,
    pub log_name: String,
    pub label_file: String,
}

impl Default for ConversionSettings {
    fn default() -> Self {
        Self {
            input: "~/HDFS_v1".to_string(),
            output_dir: None,
            log_name: "HDFS.log".to_string(),
            label_file: ANOMALY_LABEL_FILE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Object storage command line client, invoked as `<program> cp <src> <dst>`.
    pub program: String,
    pub bucket: String,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            program: "oss".to_string(),
            bucket: "oss://my_models/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    pub endpoint: String,
    pub dataset: String,
    /// Branch, tag or commit the dataset files are fetched from.
    pub revision: String,
    pub request_timeout_secs: u64,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://huggingface.co".to_string(),
            dataset: "logfit-project/HDFS_v1".to_string(),
            revision: "main".to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub name: String,
    /// Directory under the data root; defaults to the dataset name.
    pub dir: Option<String>,
    /// Suffix of the fine-tuned adapter directory (`ft_model_<adapter>`).
    pub adapter: Option<String>,
    pub log_file: Option<String>,
    pub required: Vec<String>,
    pub optional: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDataset {
    pub name: String,
    pub dir_name: String,
    pub dir: PathBuf,
    pub log_path: PathBuf,
    pub label_path: PathBuf,
    pub train_path: PathBuf,
    pub test_path: PathBuf,
    pub adapter_path: PathBuf,
    pub required: Vec<String>,
    pub optional: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModelConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub encoder: PathBuf,
    pub decoder: PathBuf,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConversion {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub log_name: String,
    pub label_file: String,
}

fn xdg_dir(var: &str, home: &Path, fallback_suffix: &str) -> PathBuf {
    env::var(var)
        .ok()
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| home.join(fallback_suffix))
}

pub fn resolve_path_value(value: &str, base_dir: &Path) -> Result<PathBuf> {
    let expanded = expand_path(value)?;
    let path = PathBuf::from(&expanded);
    if path.is_absolute() {
        Ok(path.components().collect())
    } else {
        Ok(base_dir.join(path))
    }
}

fn expand_path(value: &str) -> Result<String> {
    let home = home_dir();
    let home_utf8 = match home.as_ref() {
        Some(path) => Some(
            path.to_str()
                .ok_or_else(|| anyhow!("home directory contains invalid UTF-8"))?
                .to_string(),
        ),
        None => None,
    };

    let expanded = shellexpand::full_with_context(
        value,
        || home_utf8.as_deref(),
        |var| Ok(env::var(var).ok()),
    )
    .map_err(|error: shellexpand::LookupError<std::env::VarError>| {
        anyhow!("failed to expand '{value}': {error}")
    })?;
    Ok(expanded.into_owned())
}

fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("USERPROFILE").map(PathBuf::from))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use std::sync::OnceLock;
    use tempfile::TempDir;

    pub(crate) fn set_env_path(var: &str, value: &Path) {
        // `std::env::set_var` is unsafe in edition 2024 because it mutates
        // global process state. Every caller holds `env_lock` first.
        unsafe { env::set_var(var, value) };
    }

    pub(crate) fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    fn point_xdg_at(tmp: &TempDir) -> PathBuf {
        let config_home = tmp.path().join("config");
        set_env_path("XDG_CONFIG_HOME", &config_home);
        set_env_path("XDG_DATA_HOME", &tmp.path().join("data"));
        set_env_path("XDG_STATE_HOME", &tmp.path().join("state"));
        config_home
    }

    #[test]
    fn creates_config_when_missing() {
        let _guard = env_lock().lock().unwrap_or_else(|e| e.into_inner());
        let tmp = TempDir::new().unwrap();
        point_xdg_at(&tmp);

        let bundle = load_or_initialize_config("logeval-test").unwrap();

        assert!(
            bundle.paths.config_file.exists(),
            "config file not created at {}",
            bundle.paths.config_file.display()
        );
        assert!(bundle.paths.state_dir.exists());
        assert_eq!(
            bundle.config.dataset_names(),
            vec!["HDFS_v1", "BGL", "Liberty", "Thunderbird"]
        );
        assert_eq!(bundle.config.evaluation.batch_size, 32);
        assert_eq!(bundle.config.transfer.bucket, "oss://my_models/");
    }

    #[test]
    fn resolves_dataset_layout() {
        let _guard = env_lock().lock().unwrap_or_else(|e| e.into_inner());
        let tmp = TempDir::new().unwrap();
        let config_home = point_xdg_at(&tmp);

        let app_dir = config_home.join("logeval-layout");
        fs::create_dir_all(&app_dir).unwrap();
        let mut file = fs::File::create(app_dir.join("config.toml")).unwrap();
        writeln!(
            file,
            r#"
                [storage]
                data_dir = "{data}"

                [models]
                adapter_root = "{data}/weights"

                [[datasets]]
                name = "HDFS_v1"
                dir = "HDFS_data"
                adapter = "HDFS"
                log_file = "HDFS.log"
                required = ["HDFS.log"]
            "#,
            data = tmp.path().join("datasets").display()
        )
        .unwrap();

        let bundle = load_or_initialize_config("logeval-layout").unwrap();
        let resolved = bundle
            .config
            .resolve_dataset("HDFS_v1", &bundle.paths)
            .unwrap();

        let root = tmp.path().join("datasets");
        assert_eq!(resolved.dir, root.join("HDFS_data"));
        assert_eq!(resolved.test_path, root.join("HDFS_data/test.csv"));
        assert_eq!(resolved.log_path, root.join("HDFS_data/HDFS.log"));
        assert_eq!(resolved.adapter_path, root.join("weights/ft_model_HDFS"));
        assert_eq!(resolved.required, vec!["HDFS.log"]);

        assert!(
            bundle
                .config
                .resolve_dataset("Missing", &bundle.paths)
                .is_err()
        );
    }

    #[test]
    fn rejects_duplicate_dataset_names() {
        let mut config = AppConfig {
            datasets: vec![
                DatasetConfig {
                    name: "BGL".to_string(),
                    ..Default::default()
                },
                DatasetConfig {
                    name: "BGL".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let err = config.normalize().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn normalize_appends_bucket_separator() {
        let mut config = AppConfig::default();
        config.transfer.bucket = "oss://archive".to_string();
        config.normalize().unwrap();
        assert_eq!(config.transfer.bucket, "oss://archive/");
    }
}
