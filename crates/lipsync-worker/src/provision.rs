//! Model weight provisioning.
//!
//! Weights are fetched once and then trusted: an existing non-empty file is
//! returned without any checksum or size check. Downloads stream into
//! `<file>.part` and are renamed into place only when complete, so an
//! interrupted fetch never leaves a truncated file under the final name.

use lipsync_media::fs_utils::is_non_empty_file;
use lipsync_models::ModelVariant;
use reqwest::Client;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ProvisionerConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::metrics;

/// Ensures model files are present locally.
pub struct ModelProvisioner {
    config: ProvisionerConfig,
    http: Client,
    /// Serialises first-time downloads within this process.
    download_lock: Mutex<()>,
}

impl ModelProvisioner {
    pub fn new(config: ProvisionerConfig) -> PipelineResult<Self> {
        let http = Client::builder()
            .timeout(config.download_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(concat!("lipsync-worker/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PipelineError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config,
            http,
            download_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    /// Local path of a variant's weights, whether or not it exists yet.
    pub fn weights_path(&self, variant: ModelVariant) -> PathBuf {
        self.config.weights_path(variant)
    }

    /// Whether the variant's weights are already on disk.
    pub async fn is_provisioned(&self, variant: ModelVariant) -> bool {
        is_non_empty_file(self.weights_path(variant)).await
    }

    /// Return the local weights for `variant`, downloading them on first use.
    pub async fn ensure(&self, variant: ModelVariant) -> PipelineResult<PathBuf> {
        let path = self.weights_path(variant);
        let url = self.config.url(variant).to_string();
        self.ensure_asset(variant.file_name(), &url, &path).await
    }

    /// Provision every variant.
    pub async fn ensure_all(&self) -> PipelineResult<Vec<PathBuf>> {
        let mut paths = Vec::with_capacity(ModelVariant::ALL.len());
        for variant in ModelVariant::ALL {
            paths.push(self.ensure(*variant).await?);
        }
        Ok(paths)
    }

    /// Provision the face detector model, if one is configured with a URL.
    pub async fn ensure_face_model(&self) -> PipelineResult<Option<PathBuf>> {
        match (&self.config.face_model_path, &self.config.face_model_url) {
            (Some(path), Some(url)) => {
                let path = path.clone();
                let url = url.clone();
                self.ensure_asset("face_model", &url, &path).await.map(Some)
            }
            (Some(path), None) => Ok(Some(path.clone())),
            _ => Ok(None),
        }
    }

    /// Make sure `path` exists and is non-empty, fetching it from `url` if not.
    pub async fn ensure_asset(&self, asset: &str, url: &str, path: &Path) -> PipelineResult<PathBuf> {
        if is_non_empty_file(path).await {
            debug!(asset, path = %path.display(), "Asset already provisioned");
            return Ok(path.to_path_buf());
        }

        let _guard = self.download_lock.lock().await;

        // Another task may have finished the download while we waited.
        if is_non_empty_file(path).await {
            return Ok(path.to_path_buf());
        }

        info!(asset, url, path = %path.display(), "Downloading asset");
        let start = Instant::now();
        match self.download(url, path).await {
            Ok(bytes) => {
                let elapsed = start.elapsed().as_secs_f64();
                metrics::record_download(asset, "success", bytes, elapsed);
                info!(
                    asset,
                    bytes,
                    "Downloaded {} in {:.1}s",
                    path.display(),
                    elapsed
                );
                Ok(path.to_path_buf())
            }
            Err(message) => {
                metrics::record_download(asset, "failure", 0, start.elapsed().as_secs_f64());
                warn!(asset, url, "Download failed: {}", message);
                Err(PipelineError::provisioning(asset, message))
            }
        }
    }

    /// Stream `url` into `dest`. Returns the number of bytes written.
    async fn download(&self, url: &str, dest: &Path) -> Result<u64, String> {
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| format!("cannot create {}: {}", parent.display(), e))?;
            }
        }

        let part = part_path(dest);
        let result = self.fetch_to(url, &part).await;

        let bytes = match result {
            Ok(0) => Err(format!("{} returned an empty body", url)),
            other => other,
        };

        match bytes {
            Ok(bytes) => {
                fs::rename(&part, dest).await.map_err(|e| {
                    format!("cannot move {} into place: {}", part.display(), e)
                })?;
                Ok(bytes)
            }
            Err(e) => {
                let _ = fs::remove_file(&part).await;
                Err(e)
            }
        }
    }

    async fn fetch_to(&self, url: &str, part: &Path) -> Result<u64, String> {
        let mut response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| format!("request to {} failed: {}", url, e))?
            .error_for_status()
            .map_err(|e| format!("{} answered {}", url, e))?;

        let mut file = fs::File::create(part)
            .await
            .map_err(|e| format!("cannot create {}: {}", part.display(), e))?;

        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| format!("reading {} failed after {} bytes: {}", url, written, e))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| format!("writing {} failed: {}", part.display(), e))?;
            written += chunk.len() as u64;
        }

        file.flush()
            .await
            .map_err(|e| format!("flushing {} failed: {}", part.display(), e))?;
        file.sync_all()
            .await
            .map_err(|e| format!("syncing {} failed: {}", part.display(), e))?;

        Ok(written)
    }
}

/// `wav2lip.pth` -> `wav2lip.pth.part`
fn part_path(dest: &Path) -> PathBuf {
    let mut name: OsString = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("download"));
    name.push(".part");
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provisioner(dir: &Path, server: &MockServer) -> ModelProvisioner {
        ModelProvisioner::new(ProvisionerConfig {
            checkpoint_dir: dir.join("checkpoints"),
            standard_url: format!("{}/models/wav2lip.pth", server.uri()),
            gan_url: format!("{}/models/wav2lip_gan.pth", server.uri()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_part_path() {
        assert_eq!(
            part_path(Path::new("checkpoints/wav2lip.pth")),
            PathBuf::from("checkpoints/wav2lip.pth.part")
        );
    }

    #[tokio::test]
    async fn test_ensure_twice_downloads_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models/wav2lip.pth"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 4096]))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let provisioner = provisioner(dir.path(), &server);

        let first = provisioner.ensure(ModelVariant::Standard).await.unwrap();
        let second = provisioner.ensure(ModelVariant::Standard).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first, dir.path().join("checkpoints").join("wav2lip.pth"));
        assert_eq!(fs::read(&first).await.unwrap().len(), 4096);
        assert!(!part_path(&first).exists());
    }

    #[tokio::test]
    async fn test_concurrent_first_use_downloads_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models/wav2lip_gan.pth"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![1u8; 2048])
                    .set_delay(std::time::Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let provisioner = Arc::new(provisioner(dir.path(), &server));

        let (a, b) = tokio::join!(
            provisioner.ensure(ModelVariant::Gan),
            provisioner.ensure(ModelVariant::Gan)
        );
        assert_eq!(a.unwrap(), b.unwrap());
    }

    #[tokio::test]
    async fn test_existing_file_is_trusted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 16]))
            .expect(0)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let provisioner = provisioner(dir.path(), &server);
        let weights = provisioner.weights_path(ModelVariant::Standard);
        fs::create_dir_all(weights.parent().unwrap()).await.unwrap();
        fs::write(&weights, b"not really a checkpoint").await.unwrap();

        assert!(provisioner.is_provisioned(ModelVariant::Standard).await);
        let path = provisioner.ensure(ModelVariant::Standard).await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), b"not really a checkpoint");
    }

    #[tokio::test]
    async fn test_zero_length_file_is_downloaded_again() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models/wav2lip.pth"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![9u8; 100]))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let provisioner = provisioner(dir.path(), &server);
        let weights = provisioner.weights_path(ModelVariant::Standard);
        fs::create_dir_all(weights.parent().unwrap()).await.unwrap();
        fs::write(&weights, b"").await.unwrap();

        provisioner.ensure(ModelVariant::Standard).await.unwrap();
        assert_eq!(fs::read(&weights).await.unwrap().len(), 100);
    }

    #[tokio::test]
    async fn test_http_error_is_provisioning_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let provisioner = provisioner(dir.path(), &server);

        let err = provisioner.ensure(ModelVariant::Gan).await.unwrap_err();
        assert!(matches!(err, PipelineError::Provisioning { .. }), "{:?}", err);

        let weights = provisioner.weights_path(ModelVariant::Gan);
        assert!(!weights.exists());
        assert!(!part_path(&weights).exists());
    }

    #[tokio::test]
    async fn test_empty_body_is_provisioning_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let provisioner = provisioner(dir.path(), &server);

        assert!(provisioner.ensure(ModelVariant::Standard).await.is_err());
        assert!(!provisioner.is_provisioned(ModelVariant::Standard).await);
    }

    #[tokio::test]
    async fn test_ensure_all_fetches_both_variants() {
        let server = MockServer::start().await;
        for name in ["wav2lip.pth", "wav2lip_gan.pth"] {
            Mock::given(method("GET"))
                .and(path(format!("/models/{}", name)))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(name.as_bytes().to_vec()))
                .expect(1)
                .mount(&server)
                .await;
        }

        let dir = TempDir::new().unwrap();
        let provisioner = provisioner(dir.path(), &server);

        let paths = provisioner.ensure_all().await.unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(fs::read(&paths[1]).await.unwrap(), b"wav2lip_gan.pth");
    }

    #[tokio::test]
    async fn test_face_model_without_url_is_passed_through() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let mut provisioner = provisioner(dir.path(), &server);
        assert_eq!(provisioner.ensure_face_model().await.unwrap(), None);

        provisioner.config.face_model_path = Some(dir.path().join("yunet.onnx"));
        assert_eq!(
            provisioner.ensure_face_model().await.unwrap(),
            Some(dir.path().join("yunet.onnx"))
        );
    }
}
