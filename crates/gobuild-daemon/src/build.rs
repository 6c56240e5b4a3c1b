//! Build executor.
//!
//! Invokes a toolchain reproducibly: cleared environment with a fixed
//! `$HOME`, the guaranteed-empty directory as working directory so no
//! enclosing module leaks into resolution, stdout and stderr captured
//! to `log` in the staging directory, and on success the produced
//! file streamed through gzip while its SHA-256 is computed. Timeouts
//! and cancellation are the caller's concern.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use gobuild_core::{BuildSpec, Failure};

use crate::store::gzip_binary;

/// Environment variable handed to wrapper commands when the
/// build-gobin option is enabled: the directory the wrapper must
/// write the produced binary to.
pub const GOBUILD_GOBIN: &str = "GOBUILD_GOBIN";

#[derive(Debug)]
pub enum ExecOutcome {
    /// Toolchain succeeded; `binary.gz` is in the staging directory.
    Built { sum: String, size: u64 },
    /// Toolchain exited non-zero; the captured log is in the staging
    /// directory as `log`.
    Failed,
}

#[derive(Debug, Clone)]
pub struct Executor {
    pub home_dir: PathBuf,
    /// Guaranteed-empty working directory for builds, `home/tmp`.
    pub empty_dir: PathBuf,
    pub goproxy: String,
    /// Operator-provided KEY=VALUE additions.
    pub environment: Vec<String>,
    /// Command prefix, e.g. a nicing or sandboxing wrapper.
    pub run_prefix: Vec<String>,
    pub build_gobin: bool,
}

impl Executor {
    pub async fn execute(
        &self,
        stage: &Path,
        spec: &BuildSpec,
        go: &Path,
    ) -> Result<ExecOutcome, Failure> {
        let stage_abs = stage
            .canonicalize()
            .map_err(|err| Failure::server(format!("resolving staging directory: {err}")))?;

        let log_file = std::fs::File::create(stage.join("log"))
            .map_err(|err| Failure::server(format!("creating build log: {err}")))?;
        let log_stderr = log_file
            .try_clone()
            .map_err(|err| Failure::server(format!("creating build log: {err}")))?;

        let pkg = if spec.dir.is_empty() {
            format!("{}@{}", spec.module, spec.version)
        } else {
            format!("{}/{}@{}", spec.module, spec.dir, spec.version)
        };
        let mut args: Vec<String> = vec!["install".to_string(), "-trimpath".to_string()];
        if spec.stripped {
            args.push("-ldflags".to_string());
            args.push("-w -s".to_string());
        }
        args.push("--".to_string());
        args.push(pkg);

        let go = go.to_path_buf();
        let (program, full_args) = match self.run_prefix.split_first() {
            Some((wrapper, rest)) => {
                let mut full: Vec<String> = rest.to_vec();
                full.push(go.to_string_lossy().into_owned());
                full.extend(args);
                (PathBuf::from(wrapper), full)
            }
            None => (go, args),
        };

        let gobin_var = if self.build_gobin { GOBUILD_GOBIN } else { "GOBIN" };

        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(&full_args)
            .current_dir(&self.empty_dir)
            .env_clear()
            .env("HOME", &self.home_dir)
            .env("PATH", "/usr/bin:/bin")
            .env("GOOS", &spec.goos)
            .env("GOARCH", &spec.goarch)
            .env("CGO_ENABLED", "0")
            .env("GOFLAGS", "-trimpath")
            .env("GOPROXY", &self.goproxy)
            .env("GO111MODULE", "on")
            .env("GOTOOLCHAIN", "local")
            .env(gobin_var, &stage_abs)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_stderr));
        for entry in &self.environment {
            if let Some((key, value)) = entry.split_once('=') {
                cmd.env(key, value);
            }
        }

        tracing::info!(key = %spec.record_key(), program = %program.display(), "starting build");
        let status = cmd
            .status()
            .await
            .map_err(|err| Failure::server(format!("starting toolchain: {err}")))?;
        if !status.success() {
            tracing::info!(key = %spec.record_key(), code = ?status.code(), "build failed");
            return Ok(ExecOutcome::Failed);
        }

        let produced = stage.join(spec.binary_name());
        if !produced.is_file() {
            return Err(Failure::server(format!(
                "toolchain did not produce {}",
                spec.binary_name()
            )));
        }
        let dst = stage.join("binary.gz");
        let (sum, size) =
            tokio::task::spawn_blocking(move || gzip_binary(&produced, &dst))
                .await
                .map_err(|err| Failure::server(format!("compress task: {err}")))?
                .map_err(|err| Failure::server(format!("compressing binary: {err}")))?;
        tracing::info!(key = %spec.record_key(), %sum, size, "build succeeded");
        Ok(ExecOutcome::Built { sum, size })
    }
}
