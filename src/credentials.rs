//! Credential provisioning
//!
//! Fetches connection credentials for a run and materializes them as files
//! in a per-process scope directory (`<workspace>/devdata/process_<key>`).
//! The directory lives exactly as long as its [`CredentialScope`] guard.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, SimError};

/// Credential endpoint path, relative to the reporting base URL
pub const CREDENTIAL_ENDPOINT: &str = "/connection/for-simulation";

/// Scope directory guard; removes the directory on drop
#[derive(Debug)]
pub struct CredentialScope {
    dir: PathBuf,
    armed: bool,
}

impl CredentialScope {
    /// Take ownership of an existing directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Remove the directory now, reporting failures
    pub fn release(mut self) -> Result<()> {
        self.armed = false;
        remove_dir_if_exists(&self.dir)
    }
}

impl Drop for CredentialScope {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match remove_dir_if_exists(&self.dir) {
            Ok(()) => debug!(dir = %self.dir.display(), "Credential scope removed"),
            Err(e) => warn!(dir = %self.dir.display(), error = %e, "Failed to remove credential scope"),
        }
    }
}

fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Source of per-run credential material
#[async_trait]
pub trait CredentialProvisioner: Send + Sync {
    /// Materialize credentials for `connection_keys` into a fresh scope
    async fn provision(&self, process_key: &str, connection_keys: &[String])
        -> Result<CredentialScope>;
}

/// One credential file as returned by the backend
#[derive(Debug, Deserialize)]
struct CredentialFile {
    #[serde(rename = "fileName")]
    file_name: Option<String>,
    data: Option<Value>,
}

/// Fetches credentials from the backend over HTTP
#[derive(Clone)]
pub struct HttpCredentialProvisioner {
    client: reqwest::Client,
    base_url: String,
    service_key: Option<String>,
    devdata_dir: PathBuf,
}

impl HttpCredentialProvisioner {
    pub fn new(
        base_url: &str,
        service_key: Option<String>,
        devdata_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("robot-sim/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SimError::Config {
                reason: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            devdata_dir: devdata_dir.into(),
        })
    }

    /// Scope directory for a process key
    pub fn scope_dir(&self, process_key: &str) -> PathBuf {
        self.devdata_dir.join(format!("process_{}", process_key))
    }

    fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, CREDENTIAL_ENDPOINT)
    }

    fn request(&self, method: reqwest::Method, body: &Value) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, self.endpoint()).json(body);
        if let Some(key) = &self.service_key {
            req = req.header("Service-Key", key);
        }
        req
    }

    /// GET first; the backend accepts POST on deployments that reject GET bodies
    async fn fetch(&self, connection_keys: &[String]) -> Result<Vec<CredentialFile>> {
        let body = json!({ "connectionKeys": connection_keys });
        let fetch_err = |e: reqwest::Error| SimError::CredentialFetch {
            reason: e.to_string(),
        };

        let mut response = self
            .request(reqwest::Method::GET, &body)
            .send()
            .await
            .map_err(fetch_err)?;

        if response.status() != reqwest::StatusCode::OK {
            debug!(status = %response.status(), "GET rejected, retrying with POST");
            response = self
                .request(reqwest::Method::POST, &body)
                .send()
                .await
                .map_err(fetch_err)?;
        }

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let text = response.text().await.unwrap_or_default();
            return Err(SimError::CredentialFetch {
                reason: format!("status {}: {}", status, text),
            });
        }

        response.json().await.map_err(fetch_err)
    }

    async fn write_files(&self, dir: &Path, files: Vec<CredentialFile>) -> Result<usize> {
        let mut written = 0;
        for file in files {
            let (Some(name), Some(data)) = (file.file_name, file.data) else {
                continue;
            };
            let Some(safe_name) = Path::new(&name).file_name() else {
                warn!(file_name = %name, "Skipping credential with unusable file name");
                continue;
            };

            let content = match &data {
                Value::Object(_) | Value::Array(_) => serde_json::to_string_pretty(&data)?,
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let path = dir.join(safe_name);
            tokio::fs::write(&path, content).await?;
            debug!(path = %path.display(), "Saved credential");
            written += 1;
        }
        Ok(written)
    }
}

#[async_trait]
impl CredentialProvisioner for HttpCredentialProvisioner {
    #[instrument(skip(self, connection_keys), fields(keys = connection_keys.len()))]
    async fn provision(
        &self,
        process_key: &str,
        connection_keys: &[String],
    ) -> Result<CredentialScope> {
        let dir = self.scope_dir(process_key);

        // Stale scope from a run that never cleaned up
        if tokio::fs::metadata(&dir).await.is_ok() {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!(dir = %dir.display(), error = %e, "Failed to clear stale credential scope");
            }
        }
        tokio::fs::create_dir_all(&dir).await?;
        let scope = CredentialScope::new(&dir);

        if connection_keys.is_empty() {
            debug!("No connection keys, empty credential scope");
            return Ok(scope);
        }

        // On error the guard drops and takes the directory with it
        let files = self.fetch(connection_keys).await?;
        let count = self.write_files(scope.path(), files).await?;
        info!(count, dir = %dir.display(), "Credentials provisioned");
        Ok(scope)
    }
}
