//! On-disk transparency log.
//!
//! Two append-only files under `data/sum/`: `records` holds the
//! record lines concatenated verbatim, `hashes` the dense array of
//! 32-byte stored hashes. Appends run under a single writer mutex;
//! the record line, the positional hash write, and the artifact's
//! `recordnumber` file are not one atomic unit, so startup
//! verification rejects any inconsistency instead of repairing it.
//! Operators intervene manually rather than risk silently diverging
//! from published signed tree heads.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use gobuild_core::BuildSpec;
use gobuild_core::note::TreeHead;
use gobuild_core::request::is_sum;
use gobuild_core::tlog::{
    self, HASH_SIZE, Hash32, record_hash, stored_hash_count, stored_hash_index, stored_hashes,
};
use parking_lot::Mutex;
use thiserror::Error;

use crate::store::{ArtifactStore, gunzip_sum};

#[derive(Debug, Error)]
pub enum SumLogError {
    #[error("transparency log: {0}")]
    Io(#[from] io::Error),
    #[error("transparency log corrupt: {0}")]
    Corrupt(String),
    #[error("record not found")]
    NotFound,
    #[error("invalid argument")]
    InvalidArgument,
}

/// One log entry, parsed back from its record line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub recnum: u64,
    pub key: String,
    pub sum: String,
    pub line: String,
}

fn parse_line(line: &str) -> Option<(String, String)> {
    let (key, sum) = line.rsplit_once(' ')?;
    if key.is_empty() || !is_sum(sum) {
        return None;
    }
    Some((key.to_string(), sum.to_string()))
}

#[derive(Debug)]
struct LogInner {
    hashes: File,
    records: File,
    records_len: u64,
    tree_size: u64,
    offsets: Vec<u64>,
    index: HashMap<String, u64>,
    sum_log: Option<File>,
}

impl LogInner {
    fn read_hash_at(hashes: &mut File, index: u64) -> io::Result<Hash32> {
        hashes.seek(SeekFrom::Start(index * HASH_SIZE))?;
        let mut hash = [0u8; 32];
        hashes.read_exact(&mut hash)?;
        Ok(hash)
    }

    fn read_line(&mut self, recnum: u64) -> Result<String, SumLogError> {
        let start = *self
            .offsets
            .get(usize::try_from(recnum).map_err(|_| SumLogError::NotFound)?)
            .ok_or(SumLogError::NotFound)?;
        let end = self
            .offsets
            .get(recnum as usize + 1)
            .copied()
            .unwrap_or(self.records_len);
        self.records.seek(SeekFrom::Start(start))?;
        let mut buf = vec![0u8; (end - start) as usize];
        self.records.read_exact(&mut buf)?;
        String::from_utf8(buf)
            .map_err(|_| SumLogError::Corrupt("record line is not UTF-8".to_string()))
    }

    fn leaf_hashes(&mut self, size: u64) -> Result<Vec<Hash32>, SumLogError> {
        if size > self.tree_size {
            return Err(SumLogError::InvalidArgument);
        }
        let mut leaves = Vec::with_capacity(size as usize);
        for k in 0..size {
            leaves.push(Self::read_hash_at(
                &mut self.hashes,
                stored_hash_index(0, k),
            )?);
        }
        Ok(leaves)
    }
}

#[derive(Debug)]
pub struct SumLog {
    inner: Mutex<LogInner>,
}

impl SumLog {
    /// Open (creating if absent) the log under `sum_dir` and verify
    /// the on-disk sizes are consistent: the records file must end in
    /// a newline and the hashes file must hold exactly
    /// `32 * stored_hash_count(records)` bytes. Any mismatch is fatal
    /// corruption.
    pub fn open(sum_dir: &Path, sum_log: Option<File>) -> Result<SumLog, SumLogError> {
        fs::create_dir_all(sum_dir)?;
        let mut records = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(sum_dir.join("records"))?;
        let hashes = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(sum_dir.join("hashes"))?;

        let mut contents = String::new();
        records
            .read_to_string(&mut contents)
            .map_err(|_| SumLogError::Corrupt("records file is not UTF-8".to_string()))?;
        let records_len = contents.len() as u64;
        if records_len > 0 && !contents.ends_with('\n') {
            return Err(SumLogError::Corrupt(
                "records file ends in a partial line".to_string(),
            ));
        }

        let mut offsets = Vec::new();
        let mut index = HashMap::new();
        let mut pos = 0u64;
        for line in contents.split_inclusive('\n') {
            let recnum = offsets.len() as u64;
            let (key, _sum) = parse_line(line.trim_end_matches('\n')).ok_or_else(|| {
                SumLogError::Corrupt(format!("record {recnum} does not parse"))
            })?;
            if index.insert(key, recnum).is_some() {
                return Err(SumLogError::Corrupt(format!(
                    "duplicate identity at record {recnum}"
                )));
            }
            offsets.push(pos);
            pos += line.len() as u64;
        }
        let tree_size = offsets.len() as u64;

        let hashes_len = hashes.metadata()?.len();
        let want = HASH_SIZE * stored_hash_count(tree_size);
        if hashes_len != want {
            return Err(SumLogError::Corrupt(format!(
                "hashes file is {hashes_len} bytes for {tree_size} records, want {want}"
            )));
        }

        Ok(SumLog {
            inner: Mutex::new(LogInner {
                hashes,
                records,
                records_len,
                tree_size,
                offsets,
                index,
                sum_log,
            }),
        })
    }

    /// The remaining startup checks against the most recent record:
    /// its stored hashes must match the tail of the hashes file, its
    /// artifact must carry the matching `recordnumber`, and the
    /// artifact's binary must hash back to the recorded sum.
    pub fn verify_startup(&self, store: &ArtifactStore) -> Result<(), SumLogError> {
        let mut inner = self.inner.lock();
        let n = inner.tree_size;
        if n == 0 {
            return Ok(());
        }
        let last = n - 1;
        let line = inner.read_line(last)?;
        let (_, sum) = parse_line(line.trim_end_matches('\n'))
            .ok_or_else(|| SumLogError::Corrupt("last record does not parse".to_string()))?;

        let leaf = record_hash(line.as_bytes());
        let LogInner { hashes, .. } = &mut *inner;
        let computed = stored_hashes(last, leaf, |idx| LogInner::read_hash_at(hashes, idx))?;
        let base = stored_hash_index(0, last);
        for (i, expect) in computed.iter().enumerate() {
            let got = LogInner::read_hash_at(hashes, base + i as u64)?;
            if got != *expect {
                return Err(SumLogError::Corrupt(format!(
                    "stored hash {} mismatch for last record {last}",
                    base + i as u64
                )));
            }
        }

        match store.recordnumber(&sum)? {
            Some(num) if num == last => {}
            Some(num) => {
                return Err(SumLogError::Corrupt(format!(
                    "recordnumber {num} for last record, want {last}"
                )));
            }
            None => {
                return Err(SumLogError::Corrupt(format!(
                    "recordnumber file missing for last record {last}"
                )));
            }
        }

        let (binary_sum, _) = gunzip_sum(&store.binary_path(&sum))?;
        if binary_sum != sum {
            return Err(SumLogError::Corrupt(format!(
                "binary sum {binary_sum} does not match record sum {sum}"
            )));
        }
        Ok(())
    }

    /// Append a record for a published artifact and return its record
    /// number. Idempotent per identity. Guarded by the single writer
    /// mutex; the new stored hashes go out in one positional write.
    pub fn append(
        &self,
        spec: &BuildSpec,
        sum: &str,
        store: &ArtifactStore,
    ) -> Result<u64, SumLogError> {
        let mut inner = self.inner.lock();
        let key = spec.record_key();
        if let Some(&existing) = inner.index.get(&key) {
            return Ok(existing);
        }

        let n = inner.tree_size;
        let line = format!("{key} {sum}\n");
        let leaf = record_hash(line.as_bytes());

        let LogInner {
            hashes, records, ..
        } = &mut *inner;
        let new_hashes =
            stored_hashes(n, leaf, |idx| LogInner::read_hash_at(hashes, idx))?;

        records.seek(SeekFrom::End(0))?;
        records.write_all(line.as_bytes())?;

        let mut buf = Vec::with_capacity(new_hashes.len() * HASH_SIZE as usize);
        for h in &new_hashes {
            buf.extend_from_slice(h);
        }
        hashes.seek(SeekFrom::Start(HASH_SIZE * stored_hash_index(0, n)))?;
        hashes.write_all(&buf)?;

        store.set_recordnumber(sum, n)?;

        if let Some(sum_log) = inner.sum_log.as_mut() {
            let _ = sum_log.write_all(line.as_bytes());
        }
        tracing::info!(recnum = n, key = %key, sum = %sum, "transparency log record added");

        let offset = inner.records_len;
        inner.offsets.push(offset);
        inner.records_len += line.len() as u64;
        inner.index.insert(key, n);
        inner.tree_size = n + 1;
        Ok(n)
    }

    pub fn tree_size(&self) -> u64 {
        self.inner.lock().tree_size
    }

    pub fn lookup(&self, key: &str) -> Option<u64> {
        self.inner.lock().index.get(key).copied()
    }

    pub fn read_record(&self, recnum: u64) -> Result<Record, SumLogError> {
        let mut inner = self.inner.lock();
        let line = inner.read_line(recnum)?;
        let (key, sum) = parse_line(line.trim_end_matches('\n'))
            .ok_or_else(|| SumLogError::Corrupt(format!("record {recnum} does not parse")))?;
        Ok(Record {
            recnum,
            key,
            sum,
            line,
        })
    }

    pub fn root_at(&self, size: u64) -> Result<Hash32, SumLogError> {
        let leaves = self.inner.lock().leaf_hashes(size)?;
        Ok(tlog::merkle_root(&leaves))
    }

    pub fn latest_head(&self) -> Result<TreeHead, SumLogError> {
        let mut inner = self.inner.lock();
        let size = inner.tree_size;
        let leaves = inner.leaf_hashes(size)?;
        drop(inner);
        let time_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok(TreeHead {
            size,
            root: tlog::merkle_root(&leaves),
            time_unix,
        })
    }

    /// Inclusion proof for `recnum` in the current tree; returns the
    /// proof and the tree size it is valid for.
    pub fn inclusion_proof(&self, recnum: u64) -> Result<(Vec<Hash32>, u64), SumLogError> {
        let mut inner = self.inner.lock();
        let size = inner.tree_size;
        let leaves = inner.leaf_hashes(size)?;
        drop(inner);
        let proof = tlog::inclusion_proof(&leaves, recnum, size)
            .map_err(|_| SumLogError::NotFound)?;
        Ok((proof, size))
    }

    pub fn consistency_proof(&self, old: u64, new: u64) -> Result<Vec<Hash32>, SumLogError> {
        let mut inner = self.inner.lock();
        if new > inner.tree_size {
            return Err(SumLogError::InvalidArgument);
        }
        let leaves = inner.leaf_hashes(new)?;
        drop(inner);
        tlog::consistency_proof(&leaves, old, new).map_err(|_| SumLogError::InvalidArgument)
    }

    /// Acquire the writer mutex, draining any append in progress, and
    /// terminate. Called on SIGINT/SIGTERM so the on-disk invariants
    /// hold at exit.
    pub fn shutdown(&self) -> ! {
        let _guard = self.inner.lock();
        tracing::info!("shutdown with transparency log drained");
        std::process::exit(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::gzip_binary;
    use gobuild_core::tlog::{merkle_root, verify_inclusion_proof};

    fn spec(i: usize) -> BuildSpec {
        BuildSpec {
            module: format!("example.com/mod{i}"),
            version: "v1.0.0".to_string(),
            goos: "linux".to_string(),
            goarch: "amd64".to_string(),
            goversion: "go1.21.0".to_string(),
            dir: String::new(),
            stripped: false,
        }
    }

    /// Publish a fake artifact for `spec` and return its sum.
    fn publish(store: &ArtifactStore, spec: &BuildSpec, contents: &[u8]) -> String {
        let stage = store.stage().expect("stage");
        let raw = stage.path().join("binary");
        fs::write(&raw, contents).expect("write raw");
        let (sum, _) = gzip_binary(&raw, &stage.path().join("binary.gz")).expect("gzip");
        fs::remove_file(&raw).expect("rm");
        fs::write(stage.path().join("log"), b"ok\n").expect("log");
        store.publish(stage, spec, &sum).expect("publish");
        sum
    }

    fn setup(dir: &Path) -> (ArtifactStore, SumLog) {
        let store = ArtifactStore::open(dir).expect("store");
        let log = SumLog::open(&dir.join("sum"), None).expect("log");
        (store, log)
    }

    #[test]
    fn appends_maintain_size_invariant_and_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, log) = setup(dir.path());

        let mut sums = Vec::new();
        for i in 0..20usize {
            let spec = spec(i);
            let sum = publish(&store, &spec, format!("binary-{i}").as_bytes());
            let recnum = log.append(&spec, &sum, &store).expect("append");
            assert_eq!(recnum, i as u64);
            assert_eq!(store.recordnumber(&sum).expect("recnum"), Some(i as u64));
            sums.push(sum);

            let hashes_len = fs::metadata(dir.path().join("sum/hashes"))
                .expect("stat")
                .len();
            assert_eq!(hashes_len, HASH_SIZE * stored_hash_count(i as u64 + 1));
        }
        log.verify_startup(&store).expect("verify");
        let root_before = log.root_at(20).expect("root");

        drop(log);
        let log = SumLog::open(&dir.path().join("sum"), None).expect("reopen");
        assert_eq!(log.tree_size(), 20);
        log.verify_startup(&store).expect("verify after reopen");
        assert_eq!(log.root_at(20).expect("root"), root_before);

        for i in 0..20usize {
            let record = log.read_record(i as u64).expect("read");
            assert_eq!(record.sum, sums[i]);
            assert_eq!(record.key, spec(i).record_key());
            assert_eq!(log.lookup(&record.key), Some(i as u64));
        }
    }

    #[test]
    fn append_is_idempotent_per_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, log) = setup(dir.path());
        let spec = spec(0);
        let sum = publish(&store, &spec, b"bytes");
        let first = log.append(&spec, &sum, &store).expect("append");
        let second = log.append(&spec, &sum, &store).expect("append again");
        assert_eq!(first, second);
        assert_eq!(log.tree_size(), 1);
    }

    #[test]
    fn proofs_verify_against_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, log) = setup(dir.path());
        let mut leaves = Vec::new();
        for i in 0..9usize {
            let spec = spec(i);
            let sum = publish(&store, &spec, format!("b{i}").as_bytes());
            log.append(&spec, &sum, &store).expect("append");
            leaves.push(record_hash(
                format!("{} {sum}\n", spec.record_key()).as_bytes(),
            ));
        }
        let root = log.root_at(9).expect("root");
        assert_eq!(root, merkle_root(&leaves));

        for i in 0..9u64 {
            let (proof, size) = log.inclusion_proof(i).expect("proof");
            assert_eq!(size, 9);
            assert!(verify_inclusion_proof(&leaves[i as usize], i, 9, &proof, &root));
        }

        let old_root = log.root_at(4).expect("old root");
        let proof = log.consistency_proof(4, 9).expect("consistency");
        assert!(gobuild_verifier::verify_consistency_proof(
            &old_root, &root, 4, 9, &proof
        ));
    }

    #[test]
    fn truncated_hashes_file_refuses_startup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, log) = setup(dir.path());
        for i in 0..3usize {
            let spec = spec(i);
            let sum = publish(&store, &spec, format!("b{i}").as_bytes());
            log.append(&spec, &sum, &store).expect("append");
        }
        drop(log);

        let hashes_path = dir.path().join("sum/hashes");
        let len = fs::metadata(&hashes_path).expect("stat").len();
        let file = OpenOptions::new()
            .write(true)
            .open(&hashes_path)
            .expect("open");
        file.set_len(len - HASH_SIZE).expect("truncate");

        let err = SumLog::open(&dir.path().join("sum"), None).expect_err("must refuse");
        assert!(matches!(err, SumLogError::Corrupt(_)));
    }

    #[test]
    fn partial_trailing_record_refuses_startup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, log) = setup(dir.path());
        let spec = spec(0);
        let sum = publish(&store, &spec, b"bytes");
        log.append(&spec, &sum, &store).expect("append");
        drop(log);

        let mut records = OpenOptions::new()
            .append(true)
            .open(dir.path().join("sum/records"))
            .expect("open");
        records.write_all(b"example.com/partial").expect("write");
        drop(records);

        let err = SumLog::open(&dir.path().join("sum"), None).expect_err("must refuse");
        assert!(matches!(err, SumLogError::Corrupt(_)));
    }

    #[test]
    fn wrong_recordnumber_or_tampered_binary_fails_verification() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, log) = setup(dir.path());
        let spec = spec(0);
        let sum = publish(&store, &spec, b"bytes");
        log.append(&spec, &sum, &store).expect("append");

        store.set_recordnumber(&sum, 5).expect("clobber");
        assert!(matches!(
            log.verify_startup(&store).expect_err("must fail"),
            SumLogError::Corrupt(_)
        ));
        store.set_recordnumber(&sum, 0).expect("restore");
        log.verify_startup(&store).expect("verifies again");

        // Replace the stored binary with different bytes.
        let stage = store.stage().expect("stage");
        let raw = stage.path().join("binary");
        fs::write(&raw, b"other bytes").expect("write");
        gzip_binary(&raw, &store.binary_path(&sum)).expect("overwrite");
        assert!(matches!(
            log.verify_startup(&store).expect_err("must fail"),
            SumLogError::Corrupt(_)
        ));
    }
}
