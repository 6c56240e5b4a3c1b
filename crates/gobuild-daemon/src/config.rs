use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Daemon configuration, loaded from a JSON file. Unset string fields
/// mean "feature disabled", not "empty value".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// URL to the Go module proxy, used to resolve "latest" module
    /// versions. Normalized to end in a slash.
    pub goproxy: String,

    /// Directory holding the transparency-log files (`sum/`) and the
    /// built artifacts (`result/`).
    pub data_dir: PathBuf,

    /// Directory where toolchains are installed, one tree per
    /// version.
    pub sdk_dir: PathBuf,

    /// Home directory passed to builds; the toolchain keeps its
    /// caches and downloaded modules here. `home/tmp` stays empty and
    /// is the working directory of every build.
    pub home_dir: PathBuf,

    /// Maximum concurrent builds. 0 means available parallelism + 1.
    pub max_builds: usize,

    /// Additional KEY=VALUE environment entries for toolchain
    /// invocations.
    pub environment: Vec<String>,

    /// Command and parameters to prefix toolchain invocations with,
    /// e.g. ["/usr/bin/nice"].
    pub run: Vec<String>,

    /// When set, exports GOBUILD_GOBIN (instead of GOBIN) pointing at
    /// the staging directory; a wrapper configured through `run` must
    /// write the binary there.
    pub build_gobin: bool,

    /// URLs of peer instances that must reproduce every build with an
    /// identical hash before it is published.
    pub verifier_urls: Vec<String>,

    /// Signer key as generated by the genkey subcommand. Enables the
    /// signed /tlog surface; without it builds are still recorded but
    /// no signed material is produced.
    pub signer_key: String,

    /// Verifier key counterpart, displayed on the landing page.
    pub verifier_key: String,

    /// Directory for the append-only sum.log mirror of transparency
    /// log additions. Empty logs them through tracing only.
    pub log_dir: String,

    /// Allow-list of module path prefixes; empty allows all modules.
    pub module_prefixes: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            goproxy: "https://proxy.golang.org/".to_string(),
            data_dir: PathBuf::from("data"),
            sdk_dir: PathBuf::from("sdk"),
            home_dir: PathBuf::from("home"),
            max_builds: 0,
            environment: Vec::new(),
            run: Vec::new(),
            build_gobin: false,
            verifier_urls: Vec::new(),
            signer_key: String::new(),
            verifier_key: String::new(),
            log_dir: String::new(),
            module_prefixes: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("parsing config file: {0}")]
    Parse(#[from] serde_json::Error),
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let bytes = std::fs::read(path)?;
        let mut config: Config = serde_json::from_slice(&bytes)?;
        config.normalize();
        Ok(config)
    }

    /// Canonical forms the rest of the daemon relies on: goproxy ends
    /// in a slash, peer URLs do not.
    pub fn normalize(&mut self) {
        if !self.goproxy.ends_with('/') {
            self.goproxy.push('/');
        }
        for url in &mut self.verifier_urls {
            while url.ends_with('/') {
                url.pop();
            }
        }
    }

    pub fn effective_max_builds(&self) -> usize {
        if self.max_builds > 0 {
            return self.max_builds;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            + 1
    }

    /// Whether `module` passes the allow-list. An empty list allows
    /// everything; prefixes typically end with a slash.
    pub fn module_allowed(&self, module: &str) -> bool {
        if self.module_prefixes.is_empty() {
            return true;
        }
        let slashed = format!("{module}/");
        self.module_prefixes
            .iter()
            .any(|p| slashed.starts_with(p.as_str()) || module.starts_with(p.as_str()))
    }

    /// The documented default configuration, served on /emptyconfig.
    pub fn default_text() -> String {
        serde_json::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}
