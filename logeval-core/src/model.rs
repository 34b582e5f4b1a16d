//! The model is a black box behind an inference endpoint. The harness only
//! sends collated batches and reads back one generated text per sequence.

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header;
use serde::Deserialize;
use serde::Serialize;

use crate::config::ResolvedDataset;
use crate::config::ResolvedModelConfig;
use crate::dataset::Batch;
use crate::dataset::CollateSettings;

#[async_trait]
pub trait AnomalyModel: Send + Sync {
    fn name(&self) -> &str;

    /// One decoded text per sequence in `batch`, in batch order.
    async fn generate(&self, batch: &Batch) -> Result<Vec<String>>;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    encoder: &'a str,
    decoder: &'a str,
    adapter: &'a str,
    max_seq_len: usize,
    max_content_len: usize,
    sequences: &'a [Vec<String>],
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    outputs: Vec<String>,
}

/// Client for a `POST {base_url}/generate` inference server.
#[derive(Debug, Clone)]
pub struct HttpModel {
    client: Client,
    url: String,
    name: String,
    encoder: String,
    decoder: String,
    adapter: String,
    collate: CollateSettings,
}

impl HttpModel {
    pub fn new(
        models: &ResolvedModelConfig,
        dataset: &ResolvedDataset,
        collate: CollateSettings,
        token: Option<&str>,
    ) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        if let Some(token) = token {
            let value = header::HeaderValue::from_str(&format!("Bearer {token}"))
                .context("model api token is not a valid header value")?;
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(models.request_timeout)
            .build()
            .context("failed to build HTTP client for the model endpoint")?;

        Ok(Self {
            client,
            url: format!("{}/generate", models.base_url),
            name: dataset.name.clone(),
            encoder: models.encoder.display().to_string(),
            decoder: models.decoder.display().to_string(),
            adapter: dataset.adapter_path.display().to_string(),
            collate,
        })
    }

    fn request<'a>(&'a self, batch: &'a Batch) -> GenerateRequest<'a> {
        GenerateRequest {
            model: &self.name,
            encoder: &self.encoder,
            decoder: &self.decoder,
            adapter: &self.adapter,
            max_seq_len: self.collate.max_seq_len,
            max_content_len: self.collate.max_content_len,
            sequences: &batch.sequences,
        }
    }
}

#[async_trait]
impl AnomalyModel for HttpModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, batch: &Batch) -> Result<Vec<String>> {
        let response = self
            .client
            .post(&self.url)
            .json(&self.request(batch))
            .send()
            .await
            .with_context(|| format!("request to {} failed", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("model endpoint returned {status}: {body}");
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .with_context(|| format!("invalid response body from {}", self.url))?;
        Ok(parsed.outputs)
    }
}

pub const SMOKE_PROMPT: &str = "Log analysis is";

/// One short generation to confirm the endpoint loads the weights and answers.
pub async fn smoke_generate(model: &dyn AnomalyModel) -> Result<String> {
    let batch = Batch {
        index: 0,
        offset: 0,
        sequences: vec![vec![SMOKE_PROMPT.to_string()]],
        labels: vec![0],
    };
    let outputs = model
        .generate(&batch)
        .await
        .with_context(|| format!("smoke generation for {} failed", model.name()))?;
    outputs
        .into_iter()
        .next()
        .context("model endpoint returned no output for the smoke prompt")
}

/// Existence check for one set of weights.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightCheck {
    pub label: String,
    pub path: PathBuf,
    pub present: bool,
}

/// Encoder, decoder and every dataset's fine-tuned adapter.
pub fn preflight(models: &ResolvedModelConfig, datasets: &[ResolvedDataset]) -> Vec<WeightCheck> {
    let mut checks = vec![
        WeightCheck {
            label: "encoder".to_string(),
            present: models.encoder.exists(),
            path: models.encoder.clone(),
        },
        WeightCheck {
            label: "decoder".to_string(),
            present: models.decoder.exists(),
            path: models.decoder.clone(),
        },
    ];
    checks.extend(datasets.iter().map(|dataset| WeightCheck {
        label: format!("adapter ({})", dataset.name),
        present: dataset.adapter_path.is_dir(),
        path: dataset.adapter_path.clone(),
    }));
    checks
}

/// Fail when any checked path is missing.
pub fn ensure_weights(checks: &[WeightCheck]) -> Result<()> {
    let missing: Vec<_> = checks
        .iter()
        .filter(|check| !check.present)
        .map(|check| check.label.as_str())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("missing model weights: {}", missing.join(", ")))
    }
}
