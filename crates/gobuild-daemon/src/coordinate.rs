//! Build coordinator: bounded parallelism, per-identity
//! single-flight, subscriber fan-out.
//!
//! Each cold identity gets one producer task gated by a global
//! semaphore; its terminal value is delivered through a watch channel
//! to every subscriber. The inflight entry is removed before the
//! value is sent so late requesters fall through to a fresh store
//! lookup. Subscriber disconnection never cancels the build: the
//! artifact has cache value for everyone else.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use gobuild_core::note::NoteSigner;
use gobuild_core::targets::Targets;
use gobuild_core::{BuildSpec, Failure};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, watch};

use crate::build::{ExecOutcome, Executor};
use crate::config::Config;
use crate::recent::RecentBuilds;
use crate::sdk::SdkManager;
use crate::store::{Artifact, ArtifactStore};
use crate::sumlog::SumLog;
use crate::telemetry::Telemetry;
use crate::verify;

pub type BuildOutcome = Result<Arc<Artifact>, Failure>;

/// The pipeline behind an admitted build. A seam so tests can
/// substitute a fake executor for the real toolchain.
pub trait BuildRunner: Send + Sync + 'static {
    fn run(&self, spec: BuildSpec) -> Pin<Box<dyn Future<Output = BuildOutcome> + Send>>;
}

pub struct Coordinator {
    semaphore: Arc<Semaphore>,
    inflight: Arc<Mutex<HashMap<BuildSpec, watch::Receiver<Option<BuildOutcome>>>>>,
    runner: Arc<dyn BuildRunner>,
}

impl Coordinator {
    pub fn new(max_builds: usize, runner: Arc<dyn BuildRunner>) -> Coordinator {
        Coordinator {
            semaphore: Arc::new(Semaphore::new(max_builds)),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            runner,
        }
    }

    /// Subscribe to the build for `spec`, starting it if no run is in
    /// flight. The receiver yields the terminal value once.
    pub fn request(&self, spec: BuildSpec) -> watch::Receiver<Option<BuildOutcome>> {
        let mut inflight = self.inflight.lock();
        if let Some(rx) = inflight.get(&spec) {
            return rx.clone();
        }
        let (tx, rx) = watch::channel(None);
        inflight.insert(spec.clone(), rx.clone());

        let semaphore = self.semaphore.clone();
        let runner = self.runner.clone();
        let map = self.inflight.clone();
        tokio::spawn(async move {
            let outcome = match semaphore.acquire_owned().await {
                Ok(_permit) => runner.run(spec.clone()).await,
                Err(_) => Err(Failure::server("build semaphore closed")),
            };
            map.lock().remove(&spec);
            let _ = tx.send(Some(outcome));
        });
        rx
    }

    pub async fn wait(mut rx: watch::Receiver<Option<BuildOutcome>>) -> BuildOutcome {
        loop {
            let current = rx.borrow().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Err(Failure::server("build task ended without a result"));
            }
        }
    }

    pub async fn build(&self, spec: BuildSpec) -> BuildOutcome {
        Self::wait(self.request(spec)).await
    }
}

/// Startup-initialized context shared by the coordinator pipeline and
/// the HTTP handlers. Each field guards its own state.
pub struct Service {
    pub config: Config,
    pub store: ArtifactStore,
    pub log: SumLog,
    pub signer: Option<NoteSigner>,
    pub sdk: SdkManager,
    pub targets: Targets,
    pub recent: RecentBuilds,
    pub telemetry: Telemetry,
    pub executor: Executor,
    pub client: reqwest::Client,
}

impl Service {
    /// Lookup an already-published artifact by identity, via the log.
    pub fn lookup_artifact(&self, spec: &BuildSpec) -> Result<Option<Artifact>, Failure> {
        let Some(recnum) = self.log.lookup(&spec.record_key()) else {
            return Ok(None);
        };
        let record = self
            .log
            .read_record(recnum)
            .map_err(|err| Failure::server(format!("reading record {recnum}: {err}")))?;
        if !self.store.has(&record.sum) {
            return Err(Failure::server(format!(
                "artifact {} for record {recnum} is missing",
                record.sum
            )));
        }
        let size = self
            .store
            .binary_size(&record.sum)
            .map_err(|err| Failure::server(format!("reading artifact size: {err}")))?;
        Ok(Some(Artifact {
            spec: spec.clone(),
            sum: record.sum,
            size,
            recnum: Some(recnum),
        }))
    }

    /// Replay all records at startup: seed target popularity and the
    /// recent-builds ring from the log.
    pub fn replay_records(&self) -> Result<(), Failure> {
        let n = self.log.tree_size();
        for recnum in 0..n {
            let record = self
                .log
                .read_record(recnum)
                .map_err(|err| Failure::server(format!("replaying record {recnum}: {err}")))?;
            let Some(spec) = BuildSpec::from_record_key(&record.key) else {
                return Err(Failure::server(format!(
                    "record {recnum} key does not parse"
                )));
            };
            self.targets.increase(&spec.target());
            if recnum + 10 >= n {
                self.recent.add(format!("{}{}/", spec.url_path(), record.sum));
            }
        }
        self.telemetry.set_tlog_records(n);
        Ok(())
    }
}

/// The real pipeline: admit → ensure toolchain → execute →
/// cross-verify → publish → append → recent.
pub struct ProductionRunner {
    pub service: Arc<Service>,
}

impl BuildRunner for ProductionRunner {
    fn run(&self, spec: BuildSpec) -> Pin<Box<dyn Future<Output = BuildOutcome> + Send>> {
        let service = self.service.clone();
        Box::pin(async move {
            service.telemetry.record_build_started();
            let outcome = run_build(service.clone(), spec).await;
            match &outcome {
                Ok(_) => service.telemetry.record_build("ok"),
                Err(failure) => service.telemetry.record_build(failure.kind()),
            }
            outcome
        })
    }
}

async fn run_build(service: Arc<Service>, spec: BuildSpec) -> BuildOutcome {
    if spec.version == "latest" || spec.goversion == "latest" {
        return Err(Failure::user("latest must be resolved before building"));
    }
    if !service.targets.valid(&spec.target()) {
        return Err(Failure::user(format!(
            "unsupported target {}",
            spec.target()
        )));
    }

    // Raced a publish, or the artifact predates this process.
    if let Some(artifact) = service.lookup_artifact(&spec)? {
        return Ok(Arc::new(artifact));
    }
    if let Some(log_path) = service.store.lookup_failure(&spec) {
        return Err(Failure::Build { log_path });
    }

    service.sdk.ensure(&spec.goversion).await?;

    let stage = service
        .store
        .stage()
        .map_err(|err| Failure::server(format!("allocating staging directory: {err}")))?;
    let go = service.sdk.go_binary(&spec.goversion);
    match service.executor.execute(stage.path(), &spec, &go).await? {
        ExecOutcome::Failed => {
            let log_path = service
                .store
                .persist_failure(&spec, &stage.path().join("log"))
                .map_err(|err| Failure::server(format!("persisting build log: {err}")))?;
            Err(Failure::Build { log_path })
        }
        ExecOutcome::Built { sum, size } => {
            if let Err(err) = verify::cross_verify(
                &service.client,
                &service.config.verifier_urls,
                &spec,
                &sum,
            )
            .await
            {
                // Stage is dropped, nothing published, nothing logged.
                service.telemetry.record_verify_mismatch();
                return Err(err);
            }

            let publish_service = service.clone();
            let publish_spec = spec.clone();
            let publish_sum = sum.clone();
            tokio::task::spawn_blocking(move || {
                publish_service
                    .store
                    .publish(stage, &publish_spec, &publish_sum)
            })
            .await
            .map_err(|err| Failure::server(format!("publish task: {err}")))?
            .map_err(|err| Failure::server(format!("publishing artifact: {err}")))?;

            let recnum = match service
                .store
                .recordnumber(&sum)
                .map_err(|err| Failure::server(format!("reading recordnumber: {err}")))?
            {
                Some(existing) => existing,
                None => {
                    let recnum = service
                        .log
                        .append(&spec, &sum, &service.store)
                        .map_err(|err| Failure::server(format!("appending record: {err}")))?;
                    service.telemetry.set_tlog_records(service.log.tree_size());
                    recnum
                }
            };

            service
                .recent
                .add(format!("{}{}/", spec.url_path(), sum));
            Ok(Arc::new(Artifact {
                spec,
                sum,
                size,
                recnum: Some(recnum),
            }))
        }
    }
}
