//! Toolchain manager.
//!
//! Tracks installed toolchains on disk, refreshes the supported list
//! from the release catalog at most hourly, and installs missing
//! versions exactly once: the fetch mutex is held across the whole
//! download, so concurrent callers for any version serialize behind
//! one fetch, and a failed fetch is remembered for the process
//! lifetime to keep stampedes off the upstream. "Version not in the
//! catalog" is deliberately not cached; it may be a future release.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::{Duration, Instant};

use flate2::read::GzDecoder;
use gobuild_core::Failure;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tar::Archive;

use crate::goproxy::USER_AGENT;

/// Reproducible builds work from go1.13 onwards; earlier versions are
/// refused before any I/O.
pub const MIN_GO_MINOR: u64 = 13;

/// How often the supported-releases list may be refreshed.
const SUPPORTED_REFRESH: Duration = Duration::from_secs(60 * 60);

const CATALOG_TIMEOUT: Duration = Duration::from_secs(30);
const ARCHIVE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Deserialize)]
pub struct GoRelease {
    pub version: String,
    #[serde(default)]
    pub stable: bool,
    #[serde(default)]
    pub files: Vec<ReleaseFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseFile {
    pub filename: String,
    pub os: String,
    pub arch: String,
    pub sha256: String,
    #[serde(default)]
    pub size: u64,
    pub kind: String,
}

pub type CatalogFuture<T> = Pin<Box<dyn Future<Output = Result<T, Failure>> + Send>>;

/// Narrow interface to the toolchain release catalog; the production
/// impl speaks HTTP, tests substitute fixtures.
pub trait ReleaseCatalog: Send + Sync {
    /// Currently supported releases, newest first.
    fn supported(&self) -> CatalogFuture<Vec<GoRelease>>;
    /// All known releases.
    fn all(&self) -> CatalogFuture<Vec<GoRelease>>;
    /// Download one release archive.
    fn archive(&self, file: ReleaseFile) -> CatalogFuture<Vec<u8>>;
}

pub struct HttpCatalog {
    client: reqwest::Client,
    base: String,
}

impl HttpCatalog {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_base(client, "https://go.dev/dl/".to_string())
    }

    pub fn with_base(client: reqwest::Client, base: String) -> Self {
        HttpCatalog { client, base }
    }

    async fn list(client: reqwest::Client, url: String) -> Result<Vec<GoRelease>, Failure> {
        let response = client
            .get(&url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .timeout(CATALOG_TIMEOUT)
            .send()
            .await
            .map_err(|err| Failure::remote(format!("release catalog request: {err}")))?;
        if !response.status().is_success() {
            return Err(Failure::remote(format!(
                "release catalog returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|err| Failure::remote(format!("parsing release catalog: {err}")))
    }
}

impl ReleaseCatalog for HttpCatalog {
    fn supported(&self) -> CatalogFuture<Vec<GoRelease>> {
        let client = self.client.clone();
        let url = format!("{}?mode=json", self.base);
        Box::pin(Self::list(client, url))
    }

    fn all(&self) -> CatalogFuture<Vec<GoRelease>> {
        let client = self.client.clone();
        let url = format!("{}?mode=json&include=all", self.base);
        Box::pin(Self::list(client, url))
    }

    fn archive(&self, file: ReleaseFile) -> CatalogFuture<Vec<u8>> {
        let client = self.client.clone();
        let url = format!("{}{}", self.base, file.filename);
        Box::pin(async move {
            let response = client
                .get(&url)
                .header(reqwest::header::USER_AGENT, USER_AGENT)
                .timeout(ARCHIVE_TIMEOUT)
                .send()
                .await
                .map_err(|err| Failure::remote(format!("fetching toolchain archive: {err}")))?;
            if !response.status().is_success() {
                return Err(Failure::remote(format!(
                    "toolchain archive returned {}",
                    response.status()
                )));
            }
            let bytes = response
                .bytes()
                .await
                .map_err(|err| Failure::remote(format!("reading toolchain archive: {err}")))?;
            Ok(bytes.to_vec())
        })
    }
}

/// Validate a toolchain identifier before any I/O: must begin with
/// "go", and identifiers in the legacy `go1.x` shape must be at least
/// go1.13.
pub fn validate_goversion(goversion: &str) -> Result<(), Failure> {
    if !goversion.starts_with("go") {
        return Err(Failure::user(format!(
            "bad goversion {goversion:?}: must start with \"go\""
        )));
    }
    if !goversion
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')
    {
        return Err(Failure::user(format!(
            "bad goversion {goversion:?}: unexpected characters"
        )));
    }
    if goversion.starts_with("go1") {
        let Some(rest) = goversion.strip_prefix("go1.") else {
            return Err(Failure::user(format!(
                "bad goversion {goversion:?}: old version, must be >=go1.{MIN_GO_MINOR}"
            )));
        };
        let minor = rest.split('.').next().unwrap_or("");
        match minor.parse::<u64>() {
            Ok(num) if num >= MIN_GO_MINOR => {}
            _ => {
                return Err(Failure::user(format!(
                    "bad goversion {goversion:?}: must be >=go1.{MIN_GO_MINOR}"
                )));
            }
        }
    }
    Ok(())
}

fn host_goos() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

fn host_goarch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "386",
        "aarch64" => "arm64",
        "arm" => "arm",
        "riscv64" => "riscv64",
        "s390x" => "s390x",
        other => other,
    }
}

#[derive(Debug, Default)]
struct SdkState {
    installed: HashSet<String>,
    supported: Vec<String>,
    last_supported: Option<Instant>,
    /// Installed versions no longer in the supported list, newest
    /// first; for UI listings.
    installed_list: Vec<String>,
}

impl SdkState {
    fn update_installed_list(&mut self) {
        let mut list: Vec<String> = self
            .installed
            .iter()
            .filter(|v| !self.supported.contains(v))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.cmp(a));
        self.installed_list = list;
    }
}

pub struct SdkManager {
    sdk_dir: PathBuf,
    catalog: Box<dyn ReleaseCatalog>,
    state: parking_lot::Mutex<SdkState>,
    /// Fetch outcomes per version, kept for the process lifetime.
    /// Held across the whole download so fetches serialize.
    fetch: tokio::sync::Mutex<HashMap<String, Result<(), Failure>>>,
}

impl SdkManager {
    /// Discover already-installed toolchains under `sdk_dir`.
    pub fn open(sdk_dir: PathBuf, catalog: Box<dyn ReleaseCatalog>) -> std::io::Result<SdkManager> {
        fs::create_dir_all(&sdk_dir)?;
        let mut installed = HashSet::new();
        for entry in fs::read_dir(&sdk_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("go") {
                installed.insert(name);
            }
        }
        tracing::info!(count = installed.len(), "discovered installed toolchains");
        Ok(SdkManager {
            sdk_dir,
            catalog,
            state: parking_lot::Mutex::new(SdkState {
                installed,
                ..SdkState::default()
            }),
            fetch: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn go_binary(&self, goversion: &str) -> PathBuf {
        let exe = if host_goos() == "windows" { "go.exe" } else { "go" };
        self.sdk_dir.join(goversion).join("bin").join(exe)
    }

    /// Supported and historical installed versions, refreshing the
    /// supported list from the catalog at most hourly. The state lock
    /// is not held across the catalog request; concurrent callers see
    /// the stale list instead of piling onto upstream.
    pub async fn installed(&self) -> (Vec<String>, Vec<String>) {
        let refresh = {
            let mut state = self.state.lock();
            let due = state
                .last_supported
                .is_none_or(|at| at.elapsed() > SUPPORTED_REFRESH);
            if due {
                state.last_supported = Some(Instant::now());
            }
            due
        };
        if refresh {
            match self.catalog.supported().await {
                Ok(releases) => {
                    let mut state = self.state.lock();
                    state.supported = releases.into_iter().map(|r| r.version).collect();
                    state.update_installed_list();
                }
                Err(err) => {
                    tracing::warn!(error = %err, "listing supported releases failed");
                }
            }
        }
        let state = self.state.lock();
        (state.supported.clone(), state.installed_list.clone())
    }

    /// Ensure the newest supported toolchain is present and return
    /// its version.
    pub async fn most_recent(&self) -> Result<String, Failure> {
        let (supported, _) = self.installed().await;
        let Some(newest) = supported.first().cloned() else {
            return Err(Failure::server("no supported go versions"));
        };
        self.ensure(&newest).await?;
        Ok(newest)
    }

    /// Idempotent: returns without error iff a usable toolchain tree
    /// for `goversion` exists on disk afterwards.
    pub async fn ensure(&self, goversion: &str) -> Result<(), Failure> {
        validate_goversion(goversion)?;

        if self.state.lock().installed.contains(goversion) {
            return Ok(());
        }

        // Not installed. Serialize fetches; if another task installed
        // it while we waited, the status map says so, and an earlier
        // failure short-circuits for the process lifetime.
        let mut fetch = self.fetch.lock().await;
        if let Some(outcome) = fetch.get(goversion) {
            return outcome.clone();
        }

        let releases = match self.catalog.all().await {
            Ok(releases) => releases,
            Err(err) => {
                fetch.insert(goversion.to_string(), Err(err.clone()));
                return Err(err);
            }
        };
        let Some(release) = releases.iter().find(|r| r.version == goversion) else {
            // May be a future release; not cached as failed.
            return Err(Failure::user(format!(
                "bad goversion {goversion:?}: no such version"
            )));
        };

        let outcome = self.fetch_and_install(release).await;
        if outcome.is_ok() {
            let mut state = self.state.lock();
            state.installed.insert(goversion.to_string());
            state.update_installed_list();
        }
        fetch.insert(goversion.to_string(), outcome.clone());
        outcome
    }

    async fn fetch_and_install(&self, release: &GoRelease) -> Result<(), Failure> {
        let goversion = release.version.clone();
        let Some(file) = release
            .files
            .iter()
            .find(|f| f.os == host_goos() && f.arch == host_goarch() && f.kind == "archive")
            .cloned()
        else {
            return Err(Failure::server(format!(
                "no {}/{} archive for {goversion}",
                host_goos(),
                host_goarch()
            )));
        };

        tracing::info!(%goversion, filename = %file.filename, "fetching toolchain");
        let expected_sha256 = file.sha256.clone();
        let archive = self.catalog.archive(file).await?;

        let digest = hex::encode(Sha256::digest(&archive));
        if digest != expected_sha256 {
            return Err(Failure::remote(format!(
                "toolchain archive checksum mismatch: got {digest}, want {expected_sha256}"
            )));
        }

        let sdk_dir = self.sdk_dir.clone();
        let version = goversion.clone();
        tokio::task::spawn_blocking(move || install_archive(&sdk_dir, &version, &archive))
            .await
            .map_err(|err| Failure::server(format!("install task: {err}")))??;
        tracing::info!(%goversion, "toolchain installed");
        Ok(())
    }
}

/// Extract a toolchain tar.gz into a temporary directory on the same
/// filesystem as `sdk_dir` and rename its `go/` root into place.
fn install_archive(sdk_dir: &Path, goversion: &str, archive: &[u8]) -> Result<(), Failure> {
    let tmp = tempfile::Builder::new()
        .prefix("tmp-install-")
        .tempdir_in(sdk_dir)
        .map_err(|err| Failure::server(format!("making tempdir for toolchain: {err}")))?;

    let mut tar = Archive::new(GzDecoder::new(archive));
    tar.unpack(tmp.path())
        .map_err(|err| Failure::server(format!("extracting toolchain archive: {err}")))?;

    let extracted = tmp.path().join("go");
    if !extracted.is_dir() {
        return Err(Failure::server(
            "toolchain archive did not contain a go/ tree",
        ));
    }
    fs::rename(&extracted, sdk_dir.join(goversion))
        .map_err(|err| Failure::server(format!("putting toolchain in place: {err}")))?;
    Ok(())
}
