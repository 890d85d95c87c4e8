//! OCI registry client.
//!
//! Resolves tags to manifest digests (selecting the platform-specific
//! manifest out of an image index), probes for base-image presence, and
//! publishes multi-arch image indexes. Transient failures (5xx, 429,
//! connection errors) are retried with exponential backoff and jitter
//! before surfacing as `TplError::Registry`.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use base64::Engine as _;
use oci_distribution::client::{Certificate, CertificateEncoding, Client, ClientConfig};
use oci_distribution::manifest::{
    ImageIndexEntry, OciImageIndex, OciManifest, Platform, IMAGE_MANIFEST_MEDIA_TYPE,
    OCI_IMAGE_INDEX_MEDIA_TYPE, OCI_IMAGE_MEDIA_TYPE,
};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Reference, RegistryOperation};
use rand::Rng;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::arch::split_platform;
use crate::config::SslContextConfig;
use crate::error::{Result, TplError};
use crate::hashing;

/// Registry operations used by the build pipeline. Kept behind a trait so
/// the executor and commands can run against an in-memory registry in
/// tests.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Resolve a tag to the digest of its (platform-specific) manifest.
    async fn resolve_digest(&self, repo: &str, tag: &str, platform: &str) -> Result<String>;

    /// Like [`Registry::resolve_digest`] but yields `None` on 404.
    async fn probe(&self, repo: &str, tag: &str, platform: &str) -> Result<Option<String>>;

    /// Publish an OCI image index referencing per-platform manifests
    /// already present in `repo`. Returns the index digest.
    async fn push_multiarch(
        &self,
        repo: &str,
        tag: &str,
        platform_digests: &BTreeMap<String, String>,
    ) -> Result<String>;
}

/// Retry policy for registry operations.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

/// Docker-style credential store: registry host -> basic auth pair.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    credentials: BTreeMap<String, (String, String)>,
}

impl CredentialStore {
    /// Parse a `~/.docker/config.json`-style auth file.
    pub fn load(path: &Path) -> Result<Self> {
        #[derive(serde::Deserialize)]
        struct AuthFile {
            #[serde(default)]
            auths: BTreeMap<String, AuthEntry>,
        }
        #[derive(serde::Deserialize)]
        struct AuthEntry {
            #[serde(default)]
            auth: Option<String>,
            #[serde(default)]
            username: Option<String>,
            #[serde(default)]
            password: Option<String>,
        }

        let text = std::fs::read_to_string(path).map_err(|e| TplError::io(path, e))?;
        let parsed: AuthFile = serde_json::from_str(&text).map_err(|err| {
            TplError::config(format!("auth file {}: {err}", path.display()))
        })?;

        let mut credentials = BTreeMap::new();
        for (registry, entry) in parsed.auths {
            let pair = if let Some(auth) = entry.auth {
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(auth.trim())
                    .map_err(|err| {
                        TplError::config(format!(
                            "auth file {}: bad auth entry for {registry:?}: {err}",
                            path.display()
                        ))
                    })?;
                let decoded = String::from_utf8_lossy(&decoded).into_owned();
                match decoded.split_once(':') {
                    Some((user, pass)) => (user.to_string(), pass.to_string()),
                    None => continue,
                }
            } else if let (Some(user), Some(pass)) = (entry.username, entry.password) {
                (user, pass)
            } else {
                continue;
            };
            credentials.insert(registry, pair);
        }
        Ok(Self { credentials })
    }

    fn auth_for(&self, registry: &str) -> RegistryAuth {
        match self.credentials.get(registry) {
            Some((user, pass)) => RegistryAuth::Basic(user.clone(), pass.clone()),
            None => RegistryAuth::Anonymous,
        }
    }
}

/// Registry client backed by the OCI distribution protocol.
pub struct RegistryClient {
    client: tokio::sync::Mutex<Client>,
    credentials: CredentialStore,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl RegistryClient {
    pub fn new(
        ssl: &SslContextConfig,
        credentials: CredentialStore,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let mut extra_root_certificates = Vec::new();
        if let Some(cafile) = &ssl.cafile {
            extra_root_certificates.push(load_certificate(Path::new(cafile))?);
        }
        if let Some(capath) = &ssl.capath {
            let capath = Path::new(capath);
            let entries = std::fs::read_dir(capath).map_err(|e| TplError::io(capath, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| TplError::io(capath, e))?;
                let path = entry.path();
                if matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("pem") | Some("crt")
                ) {
                    extra_root_certificates.push(load_certificate(&path)?);
                }
            }
        }

        let config = ClientConfig {
            accept_invalid_certificates: ssl.insecure,
            extra_root_certificates,
            ..Default::default()
        };
        Ok(Self {
            client: tokio::sync::Mutex::new(Client::new(config)),
            credentials,
            retry: RetryConfig::default(),
            cancel,
        })
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn reference(repo: &str, tag: &str) -> Result<Reference> {
        Reference::try_from(format!("{repo}:{tag}").as_str()).map_err(|err| {
            TplError::registry(format!("invalid image reference {repo}:{tag}: {err}"))
        })
    }

    /// Run `op` with the configured retry policy, backing off on errors
    /// classified transient.
    async fn retrying<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(TplError::Cancelled);
            }
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TplError::Cancelled),
                result = op() => result,
            };
            match result {
                Err(TplError::Registry {
                    reason,
                    status,
                    transient: true,
                }) if attempt + 1 < self.retry.attempts => {
                    attempt += 1;
                    let exp = self
                        .retry
                        .base_delay
                        .saturating_mul(1 << attempt.min(16))
                        .min(self.retry.max_delay);
                    let jittered =
                        exp.mul_f64(0.5 + 0.5 * rand::thread_rng().gen::<f64>());
                    warn!(
                        what,
                        attempt,
                        delay_ms = jittered.as_millis() as u64,
                        status,
                        "transient registry failure, retrying: {reason}"
                    );
                    sleep(jittered).await;
                }
                other => return other,
            }
        }
    }

    /// Pull the manifest for `reference`; when it is an index, select the
    /// entry matching `platform` and return its digest, otherwise return
    /// the manifest digest itself.
    async fn resolve_once(&self, reference: &Reference, platform: &str) -> Result<String> {
        let auth = self.credentials.auth_for(reference.resolve_registry());
        let client = self.client.lock().await;
        let (manifest, digest) = client
            .pull_manifest(reference, &auth)
            .await
            .map_err(classify_error)?;
        match manifest {
            OciManifest::Image(_) => Ok(digest),
            OciManifest::ImageIndex(index) => {
                let (os, arch, variant) = split_platform(platform);
                index
                    .manifests
                    .iter()
                    .find(|entry| {
                        entry.platform.as_ref().is_some_and(|p| {
                            p.os == os
                                && p.architecture == arch
                                && (variant.is_empty()
                                    || p.variant.as_deref() == Some(variant.as_str()))
                        })
                    })
                    .map(|entry| entry.digest.clone())
                    .ok_or_else(|| TplError::Registry {
                        reason: format!(
                            "{reference} has no manifest for platform {platform}"
                        ),
                        status: None,
                        transient: false,
                    })
            }
        }
    }
}

fn load_certificate(path: &Path) -> Result<Certificate> {
    let data = std::fs::read(path).map_err(|e| TplError::io(path, e))?;
    Ok(Certificate {
        encoding: CertificateEncoding::Pem,
        data,
    })
}

/// Map an OCI distribution error onto `TplError::Registry`, classifying
/// retryable failures.
fn classify_error(err: oci_distribution::errors::OciDistributionError) -> TplError {
    use oci_distribution::errors::OciDistributionError;
    match err {
        OciDistributionError::ImageManifestNotFoundError(reason) => TplError::Registry {
            reason,
            status: Some(404),
            transient: false,
        },
        OciDistributionError::ServerError { code, url, .. } => TplError::Registry {
            reason: format!("server error {code} from {url}"),
            status: Some(code),
            transient: code == 429 || code >= 500,
        },
        other => {
            let reason = other.to_string();
            // Connection-level failures surface through the HTTP client.
            let transient = matches!(
                other,
                oci_distribution::errors::OciDistributionError::RequestError(_)
            );
            TplError::Registry {
                reason,
                status: None,
                transient,
            }
        }
    }
}

fn is_not_found(err: &TplError) -> bool {
    matches!(
        err,
        TplError::Registry {
            status: Some(404),
            ..
        }
    )
}

#[async_trait]
impl Registry for RegistryClient {
    async fn resolve_digest(&self, repo: &str, tag: &str, platform: &str) -> Result<String> {
        let reference = Self::reference(repo, tag)?;
        debug!(%reference, platform, "resolving digest");
        self.retrying("resolve_digest", || self.resolve_once(&reference, platform))
            .await
    }

    async fn probe(&self, repo: &str, tag: &str, platform: &str) -> Result<Option<String>> {
        let reference = Self::reference(repo, tag)?;
        debug!(%reference, platform, "probing manifest");
        let result = self
            .retrying("probe", || self.resolve_once(&reference, platform))
            .await;
        match result {
            Ok(digest) => Ok(Some(digest)),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn push_multiarch(
        &self,
        repo: &str,
        tag: &str,
        platform_digests: &BTreeMap<String, String>,
    ) -> Result<String> {
        // Fetch each per-platform manifest to learn its media type and
        // size, then assemble and push the index.
        let mut manifests = Vec::new();
        for (platform, digest) in platform_digests {
            let reference =
                Reference::try_from(format!("{repo}@{digest}").as_str()).map_err(|err| {
                    TplError::registry(format!("invalid reference {repo}@{digest}: {err}"))
                })?;
            let auth = self.credentials.auth_for(reference.resolve_registry());
            let raw = self
                .retrying("fetch platform manifest", || async {
                    let client = self.client.lock().await;
                    client
                        .pull_manifest_raw(
                            &reference,
                            &auth,
                            &[IMAGE_MANIFEST_MEDIA_TYPE, OCI_IMAGE_MEDIA_TYPE],
                        )
                        .await
                        .map_err(classify_error)
                })
                .await?;
            let (bytes, _) = raw;

            let media_type = serde_json::from_slice::<serde_json::Value>(&bytes)
                .ok()
                .and_then(|v| v.get("mediaType").and_then(|m| m.as_str().map(String::from)))
                .unwrap_or_else(|| OCI_IMAGE_MEDIA_TYPE.to_string());
            let (os, arch, variant) = split_platform(platform);
            manifests.push(ImageIndexEntry {
                media_type,
                digest: digest.clone(),
                size: bytes.len() as i64,
                platform: Some(Platform {
                    architecture: arch,
                    os,
                    os_version: None,
                    os_features: None,
                    variant: (!variant.is_empty()).then_some(variant),
                    features: None,
                }),
                annotations: None,
            });
        }

        let index = OciImageIndex {
            schema_version: 2,
            media_type: Some(OCI_IMAGE_INDEX_MEDIA_TYPE.to_string()),
            manifests,
            annotations: None,
        };
        let index_digest = format!(
            "sha256:{}",
            hashing::bytes_hash(
                serde_json::to_string(&index)
                    .map_err(|err| TplError::registry(format!(
                        "serializing image index: {err}"
                    )))?
                    .as_bytes()
            )
        );

        let reference = Self::reference(repo, tag)?;
        let auth = self.credentials.auth_for(reference.resolve_registry());
        self.retrying("push image index", || async {
            let client = self.client.lock().await;
            client
                .auth(&reference, &auth, RegistryOperation::Push)
                .await
                .map_err(classify_error)?;
            client
                .push_manifest(&reference, &OciManifest::ImageIndex(index.clone()))
                .await
                .map_err(classify_error)
        })
        .await?;
        debug!(%reference, digest = %index_digest, "pushed image index");
        Ok(index_digest)
    }
}
