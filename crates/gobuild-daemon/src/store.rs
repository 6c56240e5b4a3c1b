//! Content-addressed artifact store.
//!
//! Published artifacts live under `result/<c>/<sum>/` where `c` is
//! the first character of the sum; each directory holds `binary.gz`,
//! `log.gz`, and (once logged) `recordnumber`. Builds are staged in a
//! temporary directory on the same filesystem so the final publish is
//! a single atomic rename. Failed-build logs are kept under
//! `result/err/<identity hash>/` and double as a failure cache.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use gobuild_core::BuildSpec;
use gobuild_core::request::render_sum;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

/// A published build result.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub spec: BuildSpec,
    pub sum: String,
    /// Uncompressed binary size in bytes.
    pub size: u64,
    pub recnum: Option<u64>,
}

#[derive(Debug)]
pub struct ArtifactStore {
    result_dir: PathBuf,
}

impl ArtifactStore {
    /// Prepare `data/result` with one directory per leading sum
    /// character plus the failed-build namespace.
    pub fn open(data_dir: &Path) -> io::Result<ArtifactStore> {
        let result_dir = data_dir.join("result");
        fs::create_dir_all(&result_dir)?;
        let chars = ('a'..='z')
            .chain('A'..='Z')
            .chain('0'..='9')
            .chain(['-', '_']);
        for c in chars {
            fs::create_dir_all(result_dir.join(c.to_string()))?;
        }
        fs::create_dir_all(result_dir.join("err"))?;
        Ok(ArtifactStore { result_dir })
    }

    pub fn result_dir(&self) -> &Path {
        &self.result_dir
    }

    pub fn sum_dir(&self, sum: &str) -> PathBuf {
        let c = sum.get(..1).unwrap_or("_");
        self.result_dir.join(c).join(sum)
    }

    pub fn binary_path(&self, sum: &str) -> PathBuf {
        self.sum_dir(sum).join("binary.gz")
    }

    pub fn log_path(&self, sum: &str) -> PathBuf {
        self.sum_dir(sum).join("log.gz")
    }

    pub fn recordnumber_path(&self, sum: &str) -> PathBuf {
        self.sum_dir(sum).join("recordnumber")
    }

    pub fn has(&self, sum: &str) -> bool {
        self.binary_path(sum).exists()
    }

    /// ASCII decimal, no trailing newline; absent until the artifact
    /// is logged.
    pub fn recordnumber(&self, sum: &str) -> io::Result<Option<u64>> {
        let text = match fs::read_to_string(self.recordnumber_path(sum)) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        let value = text
            .parse::<u64>()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad recordnumber"))?;
        Ok(Some(value))
    }

    pub fn set_recordnumber(&self, sum: &str, recnum: u64) -> io::Result<()> {
        fs::write(self.recordnumber_path(sum), recnum.to_string())
    }

    /// Staging directory on the same filesystem as the result tree.
    pub fn stage(&self) -> io::Result<TempDir> {
        tempfile::Builder::new()
            .prefix("stage-")
            .tempdir_in(&self.result_dir)
    }

    /// Finalize a staged build and move it into place: gzip the
    /// captured build log, drop raw files, and rename the directory
    /// to its sum location. An already-existing destination wins; the
    /// stage is discarded.
    pub fn publish(&self, stage: TempDir, spec: &BuildSpec, sum: &str) -> io::Result<PathBuf> {
        let log = stage.path().join("log");
        if log.exists() {
            gzip_file(&log, &stage.path().join("log.gz"))?;
            fs::remove_file(&log)?;
        }
        let raw_binary = stage.path().join(spec.binary_name());
        if raw_binary.exists() {
            fs::remove_file(&raw_binary)?;
        }

        let dest = self.sum_dir(sum);
        if dest.exists() {
            return Ok(dest);
        }
        let staged = stage.keep();
        match fs::rename(&staged, &dest) {
            Ok(()) => Ok(dest),
            Err(err) => {
                let _ = fs::remove_dir_all(&staged);
                if dest.exists() {
                    // Lost the rename race to another publisher.
                    Ok(dest)
                } else {
                    Err(err)
                }
            }
        }
    }

    fn fail_dir(&self, spec: &BuildSpec) -> PathBuf {
        self.result_dir.join("err").join(spec.identity_hash())
    }

    /// Persist the log of a failed build so later requests for the
    /// same identity are answered without re-running the toolchain.
    pub fn persist_failure(&self, spec: &BuildSpec, log_src: &Path) -> io::Result<PathBuf> {
        let dir = self.fail_dir(spec);
        fs::create_dir_all(&dir)?;
        let dest = dir.join("log.gz");
        gzip_file(log_src, &dest)?;
        Ok(dest)
    }

    pub fn lookup_failure(&self, spec: &BuildSpec) -> Option<PathBuf> {
        let path = self.fail_dir(spec).join("log.gz");
        path.exists().then_some(path)
    }

    /// Uncompressed size of a published binary, from the gzip
    /// trailer. Fine for binaries under 4 GiB, which a linker output
    /// always is.
    pub fn binary_size(&self, sum: &str) -> io::Result<u64> {
        let mut file = File::open(self.binary_path(sum))?;
        file.seek(SeekFrom::End(-4))?;
        let mut trailer = [0u8; 4];
        file.read_exact(&mut trailer)?;
        Ok(u64::from(u32::from_le_bytes(trailer)))
    }
}

/// Stream `src` into `dst` as gzip while computing the sum and size
/// of the uncompressed bytes.
pub fn gzip_binary(src: &Path, dst: &Path) -> io::Result<(String, u64)> {
    let mut input = File::open(src)?;
    let mut encoder = GzEncoder::new(File::create(dst)?, Compression::default());
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        encoder.write_all(&buf[..n])?;
        size += n as u64;
    }
    encoder.finish()?.sync_all()?;
    Ok((render_sum(&hasher.finalize().into()), size))
}

pub fn gzip_file(src: &Path, dst: &Path) -> io::Result<()> {
    let mut input = File::open(src)?;
    let mut encoder = GzEncoder::new(File::create(dst)?, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?;
    Ok(())
}

/// Decompress a gzip file and return the sum and size of its
/// contents. Used by startup verification against the last record.
pub fn gunzip_sum(path: &Path) -> io::Result<(String, u64)> {
    let mut decoder = GzDecoder::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = decoder.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((render_sum(&hasher.finalize().into()), size))
}
