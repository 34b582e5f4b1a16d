//! Model hub connectivity and authentication diagnostics.

use std::env;
use std::fmt;
use std::fs;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use reqwest::Client;
use reqwest::Response;
use reqwest::StatusCode;
use reqwest::header;
use serde::Deserialize;

use crate::config::HubSettings;

pub const TOKEN_VARS: [&str; 2] = ["HF_TOKEN", "HUGGINGFACE_HUB_TOKEN"];

/// First non-empty token among [`TOKEN_VARS`].
pub fn resolve_token() -> Option<String> {
    resolve_token_from(|var| env::var(var).ok())
}

pub fn resolve_token_from(lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    TOKEN_VARS
        .iter()
        .find_map(|var| lookup(var).filter(|value| !value.trim().is_empty()))
}

const AUTH_HINT: &str = "A model hub token is required:
  1. Create a read token at https://huggingface.co/settings/tokens
  2. export HF_TOKEN=<token>
  3. Re-run the command";

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetInfo {
    pub id: String,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub siblings: Vec<RepoFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepoFile {
    pub rfilename: String,
}

/// Non-success reply from the hub.
#[derive(Debug)]
pub struct HubStatusError {
    pub url: String,
    pub status: StatusCode,
}

impl fmt::Display for HubStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} returned {}", self.url, self.status)
    }
}

impl std::error::Error for HubStatusError {}

/// What to tell the user after a failed hub request, if anything useful.
pub fn download_hint(err: &anyhow::Error, repo: &str) -> Option<String> {
    let network_hint =
        || format!("Check the network connection and that the dataset name is correct: {repo}");

    if let Some(status) = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<HubStatusError>())
    {
        return match status.status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Some(AUTH_HINT.to_string()),
            StatusCode::NOT_FOUND => Some(network_hint()),
            _ => None,
        };
    }

    err.chain()
        .filter_map(|cause| cause.downcast_ref::<reqwest::Error>())
        .any(|cause| cause.is_connect() || cause.is_timeout())
        .then(network_hint)
}

#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub name: String,
    pub path: PathBuf,
    pub bytes: u64,
}

#[derive(Debug)]
pub struct HubDownload {
    pub repo: String,
    pub dest: PathBuf,
    pub files: Vec<DownloadedFile>,
}

impl HubDownload {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|file| file.bytes).sum()
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "{rule}\nDownloaded {}\n{rule}\n",
            self.repo,
            rule = "=".repeat(60)
        );
        for file in &self.files {
            out.push_str(&format!("  {:<40} {:>12} bytes\n", file.name, file.bytes));
        }
        out.push_str(&format!(
            "{} files, {:.2} MB saved to {}\n",
            self.files.len(),
            self.total_bytes() as f64 / (1024.0 * 1024.0),
            self.dest.display()
        ));
        out
    }
}

/// Local path for a repo file, refusing anything that escapes `dest`.
fn repo_file_path(dest: &Path, name: &str) -> Result<PathBuf> {
    let relative = Path::new(name);
    if name.is_empty()
        || relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
    {
        bail!("refusing to write repo file outside {}: {name}", dest.display());
    }
    Ok(dest.join(relative))
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhoAmI {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug)]
pub struct HubClient {
    client: Client,
    endpoint: String,
    authenticated: bool,
}

impl HubClient {
    pub fn new(settings: &HubSettings, token: Option<&str>) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        if let Some(token) = token {
            let value = header::HeaderValue::from_str(&format!("Bearer {token}"))
                .context("hub token is not a valid header value")?;
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .context("failed to build HTTP client for the model hub")?;

        Ok(Self {
            client,
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            authenticated: token.is_some(),
        })
    }

    async fn get(&self, path: &str) -> Result<(String, Response)> {
        let url = format!("{}{}", self.endpoint, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HubStatusError { url, status }.into());
        }
        Ok((url, response))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let (url, response) = self.get(path).await?;
        response
            .json()
            .await
            .with_context(|| format!("invalid response body from {url}"))
    }

    pub async fn dataset_info(&self, repo: &str) -> Result<DatasetInfo> {
        self.get_json(&format!("/api/datasets/{repo}")).await
    }

    pub async fn whoami(&self) -> Result<WhoAmI> {
        if !self.authenticated {
            bail!("no hub token set; export HF_TOKEN to authenticate");
        }
        self.get_json("/api/whoami-v2").await
    }

    /// Fetch every file of a dataset repo at `revision` into `dest`, keeping
    /// the repo's directory layout. Dotfiles such as `.gitattributes` are skipped.
    pub async fn download_dataset(
        &self,
        repo: &str,
        revision: &str,
        dest: &Path,
    ) -> Result<HubDownload> {
        let info = self.dataset_info(repo).await?;
        let names: Vec<&str> = info
            .siblings
            .iter()
            .map(|file| file.rfilename.as_str())
            .filter(|name| !name.starts_with('.'))
            .collect();
        if names.is_empty() {
            bail!("dataset {repo} lists no files to download");
        }
        tracing::info!(repo, files = names.len(), dest = %dest.display(), "downloading dataset");

        let mut files = Vec::with_capacity(names.len());
        for name in names {
            let path = repo_file_path(dest, name)?;
            let (url, response) = self
                .get(&format!("/datasets/{repo}/resolve/{revision}/{name}"))
                .await?;
            let body = response
                .bytes()
                .await
                .with_context(|| format!("failed to read {url}"))?;

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            fs::write(&path, &body)
                .with_context(|| format!("failed to write {}", path.display()))?;
            tracing::debug!(file = name, bytes = body.len(), "downloaded");

            files.push(DownloadedFile {
                name: name.to_string(),
                path,
                bytes: body.len() as u64,
            });
        }

        Ok(HubDownload {
            repo: repo.to_string(),
            dest: dest.to_path_buf(),
            files,
        })
    }

    /// Run every diagnostic step. A failing step never stops the next one.
    pub async fn check(&self, repo: &str, token_len: Option<usize>) -> HubReport {
        let dataset = self.dataset_info(repo).await;
        if let Err(err) = &dataset {
            tracing::warn!(repo, "dataset lookup failed: {err:#}");
        }
        let identity = self.whoami().await;
        if let Err(err) = &identity {
            tracing::warn!("authentication check failed: {err:#}");
        }

        HubReport {
            repo: repo.to_string(),
            token_len,
            dataset: dataset.map_err(|err| format!("{err:#}")),
            identity: identity.map_err(|err| format!("{err:#}")),
        }
    }
}

#[derive(Debug)]
pub struct HubReport {
    pub repo: String,
    /// Length of the token found in the environment, never the token itself.
    pub token_len: Option<usize>,
    pub dataset: Result<DatasetInfo, String>,
    pub identity: Result<WhoAmI, String>,
}

impl HubReport {
    pub fn render(&self) -> String {
        let mut out = format!("{rule}\nModel hub check\n{rule}\n", rule = "=".repeat(60));

        match self.token_len {
            Some(len) => out.push_str(&format!("[ok]   token found (length {len})\n")),
            None => out.push_str("[warn] no HF_TOKEN / HUGGINGFACE_HUB_TOKEN set\n"),
        }

        match &self.dataset {
            Ok(info) => out.push_str(&format!(
                "[ok]   dataset {} reachable{}\n",
                info.id,
                if info.private { " (private)" } else { "" }
            )),
            Err(err) => out.push_str(&format!("[fail] dataset {}: {err}\n", self.repo)),
        }

        match &self.identity {
            Ok(user) => out.push_str(&format!(
                "[ok]   logged in as {} ({})\n",
                user.name,
                user.email.as_deref().unwrap_or("N/A")
            )),
            Err(err) => out.push_str(&format!("[warn] not authenticated: {err}\n")),
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::Route;
    use crate::model::tests::serve;
    use std::collections::HashMap;
    use tempfile::TempDir;

    const REPO: &str = "logfit-project/HDFS_v1";

    fn settings(endpoint: &str) -> HubSettings {
        HubSettings {
            endpoint: endpoint.to_string(),
            dataset: REPO.to_string(),
            revision: "main".to_string(),
            request_timeout_secs: 5,
        }
    }

    #[test]
    fn prefers_hf_token_then_falls_back() {
        let vars = HashMap::from([
            ("HF_TOKEN", "  "),
            ("HUGGINGFACE_HUB_TOKEN", "hf_fallback"),
        ]);
        let token = resolve_token_from(|var| vars.get(var).map(|v| v.to_string()));
        assert_eq!(token.as_deref(), Some("hf_fallback"));

        let vars = HashMap::from([("HF_TOKEN", "hf_primary"), ("HUGGINGFACE_HUB_TOKEN", "x")]);
        let token = resolve_token_from(|var| vars.get(var).map(|v| v.to_string()));
        assert_eq!(token.as_deref(), Some("hf_primary"));

        assert_eq!(resolve_token_from(|_| None), None);
    }

    #[test]
    fn parses_hub_payloads() {
        let info: DatasetInfo =
            serde_json::from_str(r#"{"id": "logfit-project/HDFS_v1", "private": false}"#).unwrap();
        assert_eq!(info.id, "logfit-project/HDFS_v1");

        let user: WhoAmI = serde_json::from_str(r#"{"name": "alice", "type": "user"}"#).unwrap();
        assert_eq!(user.name, "alice");
        assert_eq!(user.email, None);
    }

    #[tokio::test]
    async fn every_step_reports_even_when_offline() {
        let settings = settings("http://127.0.0.1:1/");
        let client = HubClient::new(&settings, None).unwrap();
        let report = client.check(&settings.dataset, None).await;

        assert!(report.dataset.is_err());
        assert!(report.identity.as_ref().unwrap_err().contains("no hub token"));

        let rendered = report.render();
        assert!(rendered.contains("[warn] no HF_TOKEN"));
        assert!(rendered.contains("[fail] dataset logfit-project/HDFS_v1"));
    }

    #[tokio::test]
    async fn downloads_every_repo_file_keeping_layout() {
        let tmp = TempDir::new().unwrap();
        let listing = r#"{
            "id": "logfit-project/HDFS_v1",
            "siblings": [
                {"rfilename": ".gitattributes"},
                {"rfilename": "README.md"},
                {"rfilename": "data/test.jsonl"}
            ]
        }"#;
        let (endpoint, server) = serve(vec![
            Route::new("/api/datasets/logfit-project/HDFS_v1", 200, listing),
            Route::new(
                "/datasets/logfit-project/HDFS_v1/resolve/main/README.md",
                200,
                "# HDFS_v1\n",
            ),
            Route::new(
                "/datasets/logfit-project/HDFS_v1/resolve/main/data/test.jsonl",
                200,
                "{}\n",
            ),
        ])
        .await;

        let client = HubClient::new(&settings(&endpoint), Some("hf_read")).unwrap();
        let dest = tmp.path().join("HDFS_v1");
        let download = client.download_dataset(REPO, "main", &dest).await.unwrap();

        assert_eq!(download.files.len(), 2);
        assert_eq!(download.total_bytes(), 13);
        assert_eq!(
            fs::read_to_string(dest.join("data/test.jsonl")).unwrap(),
            "{}\n"
        );
        assert!(!dest.join(".gitattributes").exists());

        let requests = server.await.unwrap();
        assert!(
            requests
                .iter()
                .all(|r| r.to_lowercase().contains("authorization: bearer hf_read"))
        );
    }

    #[tokio::test]
    async fn unauthorized_download_suggests_a_token() {
        let tmp = TempDir::new().unwrap();
        let (endpoint, _server) = serve(vec![Route::new(
            "/api/datasets/logfit-project/HDFS_v1",
            401,
            r#"{"error":"Invalid credentials"}"#,
        )])
        .await;

        let client = HubClient::new(&settings(&endpoint), None).unwrap();
        let err = client
            .download_dataset(REPO, "main", tmp.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("401"));
        assert!(download_hint(&err, REPO).unwrap().contains("export HF_TOKEN"));
    }

    #[tokio::test]
    async fn missing_dataset_suggests_checking_the_name() {
        let tmp = TempDir::new().unwrap();
        let (endpoint, _server) = serve(vec![Route::new(
            "/api/datasets/logfit-project/HDFS_v1",
            404,
            "{}",
        )])
        .await;

        let client = HubClient::new(&settings(&endpoint), None).unwrap();
        let err = client
            .download_dataset(REPO, "main", tmp.path())
            .await
            .unwrap_err();
        let hint = download_hint(&err, REPO).unwrap();
        assert!(hint.contains("dataset name is correct: logfit-project/HDFS_v1"));
    }

    #[tokio::test]
    async fn offline_download_fails_with_network_hint() {
        let tmp = TempDir::new().unwrap();
        let client = HubClient::new(&settings("http://127.0.0.1:1"), None).unwrap();
        let err = client
            .download_dataset(REPO, "main", &tmp.path().join("HDFS_v1"))
            .await
            .unwrap_err();

        assert!(download_hint(&err, REPO).unwrap().contains("network connection"));
        assert!(!tmp.path().join("HDFS_v1").exists());
    }

    #[test]
    fn repo_files_stay_inside_destination() {
        let dest = Path::new("/data/HDFS_v1");
        assert_eq!(
            repo_file_path(dest, "data/train.jsonl").unwrap(),
            dest.join("data/train.jsonl")
        );
        assert!(repo_file_path(dest, "../escape.jsonl").is_err());
        assert!(repo_file_path(dest, "/etc/passwd").is_err());
        assert!(repo_file_path(dest, "").is_err());
    }
}
