//! End-to-end flows through the coordinator pipeline and the HTTP
//! surface, with a shell script standing in for the toolchain.

#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use gobuild_core::BuildSpec;
use gobuild_core::targets::Targets;
use gobuild_daemon::build::Executor;
use gobuild_daemon::config::Config;
use gobuild_daemon::coordinate::{Coordinator, ProductionRunner, Service};
use gobuild_daemon::recent::RecentBuilds;
use gobuild_daemon::sdk::{CatalogFuture, GoRelease, ReleaseCatalog, ReleaseFile, SdkManager};
use gobuild_daemon::store::{ArtifactStore, gunzip_sum};
use gobuild_daemon::sumlog::SumLog;
use gobuild_daemon::telemetry::Telemetry;
use gobuild_daemon::verify::BuildResult;

const GOVERSION: &str = "go1.21.0";

/// Release catalog that must never be consulted; every call counts.
struct NullCatalog {
    calls: Arc<AtomicUsize>,
}

impl ReleaseCatalog for NullCatalog {
    fn supported(&self) -> CatalogFuture<Vec<GoRelease>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(Vec::new()) })
    }

    fn all(&self) -> CatalogFuture<Vec<GoRelease>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(Vec::new()) })
    }

    fn archive(&self, _file: ReleaseFile) -> CatalogFuture<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(Vec::new()) })
    }
}

struct TestEnv {
    #[allow(dead_code)]
    dir: tempfile::TempDir,
    service: Arc<Service>,
    coordinator: Arc<Coordinator>,
    catalog_calls: Arc<AtomicUsize>,
    runs_path: PathBuf,
}

impl TestEnv {
    fn executor_runs(&self) -> usize {
        fs::read_to_string(&self.runs_path)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }
}

fn install_fake_toolchain(sdk_dir: &Path, runs_path: &Path, script_body: &str) {
    use std::os::unix::fs::PermissionsExt;
    let bin = sdk_dir.join(GOVERSION).join("bin");
    fs::create_dir_all(&bin).expect("mkdir bin");
    let script = format!(
        "#!/bin/sh\necho run >> {}\n{script_body}\n",
        runs_path.display()
    );
    let go = bin.join("go");
    fs::write(&go, script).expect("write script");
    fs::set_permissions(&go, fs::Permissions::from_mode(0o755)).expect("chmod");
}

fn test_env(verifier_urls: Vec<String>, script_body: &str) -> TestEnv {
    test_env_with(verifier_urls, script_body, None)
}

/// Build a full service around a scripted toolchain. `script_body`
/// runs with GOBIN pointing at the staging directory.
fn test_env_with(
    verifier_urls: Vec<String>,
    script_body: &str,
    signer_key: Option<String>,
) -> TestEnv {
    let dir = tempfile::tempdir().expect("tempdir");
    let data_dir = dir.path().join("data");
    let sdk_dir = dir.path().join("sdk");
    let home_dir = dir.path().join("home");
    let empty_dir = home_dir.join("tmp");
    fs::create_dir_all(&empty_dir).expect("mkdir home/tmp");

    let runs_path = dir.path().join("runs");
    install_fake_toolchain(&sdk_dir, &runs_path, script_body);

    let mut config = Config {
        data_dir: data_dir.clone(),
        sdk_dir: sdk_dir.clone(),
        home_dir: home_dir.clone(),
        verifier_urls,
        ..Config::default()
    };
    config.normalize();

    let store = ArtifactStore::open(&data_dir).expect("store");
    let log = SumLog::open(&data_dir.join("sum"), None).expect("log");
    log.verify_startup(&store).expect("verify startup");

    let catalog_calls = Arc::new(AtomicUsize::new(0));
    let sdk = SdkManager::open(
        sdk_dir,
        Box::new(NullCatalog {
            calls: catalog_calls.clone(),
        }),
    )
    .expect("sdk");

    let executor = Executor {
        home_dir,
        empty_dir,
        goproxy: config.goproxy.clone(),
        environment: Vec::new(),
        run_prefix: Vec::new(),
        build_gobin: false,
    };

    let signer = signer_key.map(|key| {
        gobuild_core::note::NoteSigner::from_key(&key).expect("signer key")
    });

    let service = Arc::new(Service {
        config,
        store,
        log,
        signer,
        sdk,
        targets: Targets::new(),
        recent: RecentBuilds::new(),
        telemetry: Telemetry::new(),
        executor,
        client: reqwest::Client::new(),
    });
    let coordinator = Arc::new(Coordinator::new(
        4,
        Arc::new(ProductionRunner {
            service: service.clone(),
        }),
    ));
    TestEnv {
        dir,
        service,
        coordinator,
        catalog_calls,
        runs_path,
    }
}

fn spec() -> BuildSpec {
    BuildSpec {
        module: "example.com/x".to_string(),
        version: "v1.0.0".to_string(),
        goos: "linux".to_string(),
        goarch: "amd64".to_string(),
        goversion: GOVERSION.to_string(),
        dir: String::new(),
        stripped: false,
    }
}

const OK_SCRIPT: &str = r#"printf 'reproducible binary bytes' > "$GOBIN/x""#;

#[tokio::test]
async fn happy_build_publishes_and_appends_one_record() {
    let env = test_env(Vec::new(), OK_SCRIPT);

    let artifact = env.coordinator.build(spec()).await.expect("build");
    assert_eq!(artifact.recnum, Some(0));
    assert_eq!(env.service.log.tree_size(), 1);

    // recordnumber under result/<c>/<sum>/ equals the new recnum.
    assert_eq!(
        env.service.store.recordnumber(&artifact.sum).expect("recnum"),
        Some(0)
    );

    // The record's sum verifies against binary.gz.
    let record = env.service.log.read_record(0).expect("record");
    assert_eq!(record.sum, artifact.sum);
    assert_eq!(record.key, spec().record_key());
    let (sum, size) =
        gunzip_sum(&env.service.store.binary_path(&artifact.sum)).expect("gunzip");
    assert_eq!(sum, artifact.sum);
    assert_eq!(size, artifact.size);

    // Startup verification accepts the resulting state.
    env.service
        .log
        .verify_startup(&env.service.store)
        .expect("state verifies");
    assert_eq!(env.service.recent.links().len(), 1);
}

#[tokio::test]
async fn second_request_is_served_from_cache() {
    let env = test_env(Vec::new(), OK_SCRIPT);

    let first = env.coordinator.build(spec()).await.expect("build");
    assert_eq!(env.executor_runs(), 1);

    let second = env.coordinator.build(spec()).await.expect("cached");
    assert_eq!(second.sum, first.sum);
    assert_eq!(second.recnum, first.recnum);
    assert_eq!(env.executor_runs(), 1);
    assert_eq!(env.service.log.tree_size(), 1);
}

#[tokio::test]
async fn ten_concurrent_cold_requests_run_the_toolchain_once() {
    let env = test_env(Vec::new(), &format!("sleep 0.2\n{OK_SCRIPT}"));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let coordinator = env.coordinator.clone();
        handles.push(tokio::spawn(async move { coordinator.build(spec()).await }));
    }
    let mut sums = Vec::new();
    for handle in handles {
        sums.push(handle.await.expect("join").expect("build").sum.clone());
    }
    assert!(sums.iter().all(|s| s == &sums[0]));
    assert_eq!(env.executor_runs(), 1);
    assert_eq!(env.service.log.tree_size(), 1);
}

async fn spawn_peer(sum: &'static str) -> String {
    let app = axum::Router::new().fallback(move || async move {
        axum::Json(BuildResult {
            sum: sum.to_string(),
            size: 1,
            recnum: Some(0),
        })
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn peer_disagreement_rejects_the_build() {
    let peer = spawn_peer("0differentdifferentdifferent").await;
    let env = test_env(vec![peer], OK_SCRIPT);

    let err = env
        .coordinator
        .build(spec())
        .await
        .expect_err("must be rejected");
    assert_eq!(err.kind(), "remote");

    // Nothing published, nothing logged.
    assert_eq!(env.service.log.tree_size(), 0);
    assert!(env.service.lookup_artifact(&spec()).expect("lookup").is_none());
    assert_eq!(env.executor_runs(), 1);
}

#[tokio::test]
async fn truncated_hashes_refuse_startup() {
    let env = test_env(Vec::new(), OK_SCRIPT);
    env.coordinator.build(spec()).await.expect("build");

    let data_dir = env.service.config.data_dir.clone();
    let hashes = data_dir.join("sum/hashes");
    let len = fs::metadata(&hashes).expect("stat").len();
    let file = fs::OpenOptions::new()
        .write(true)
        .open(&hashes)
        .expect("open");
    file.set_len(len - 32).expect("truncate");

    assert!(SumLog::open(&data_dir.join("sum"), None).is_err());
}

#[tokio::test]
async fn unsupported_toolchain_fails_before_any_io() {
    let env = test_env(Vec::new(), OK_SCRIPT);
    let mut old = spec();
    old.goversion = "go1.10".to_string();

    let err = env.coordinator.build(old).await.expect_err("refused");
    assert_eq!(err.kind(), "user");
    assert_eq!(env.catalog_calls.load(Ordering::SeqCst), 0);
    assert_eq!(env.executor_runs(), 0);
}

#[tokio::test]
async fn failed_build_preserves_log_and_is_not_retried() {
    let env = test_env(
        Vec::new(),
        r#"echo 'cannot find package example.com/x' >&2; exit 1"#,
    );

    let err = env.coordinator.build(spec()).await.expect_err("build fails");
    let gobuild_core::Failure::Build { log_path } = &err else {
        unreachable!("expected build failure, got {err:?}");
    };
    let (_, size) = gunzip_sum(log_path).expect("log readable");
    assert!(size > 0);
    assert_eq!(env.service.log.tree_size(), 0);

    // Served from the failure cache without another toolchain run.
    let again = env.coordinator.build(spec()).await.expect_err("still fails");
    assert_eq!(again.kind(), "build");
    assert_eq!(env.executor_runs(), 1);
}

mod http_surface {
    use super::*;
    use gobuild_daemon::http::{AppState, router};

    async fn spawn_service(env: &TestEnv) -> String {
        let state = AppState {
            service: env.service.clone(),
            coordinator: env.coordinator.clone(),
        };
        let app = router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn build_url_serves_json_and_pages() {
        let env = test_env(Vec::new(), OK_SCRIPT);
        let base = spawn_service(&env).await;
        let client = reqwest::Client::new();

        // Build-or-fetch with JSON (the peer verification surface).
        let result: BuildResult = client
            .get(format!("{base}{}", spec().url_path()))
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .expect("request")
            .json()
            .await
            .expect("json");
        assert_eq!(result.recnum, Some(0));

        // Result page for the known sum.
        let page = client
            .get(format!("{base}{}{}/", spec().url_path(), result.sum))
            .send()
            .await
            .expect("request");
        assert_eq!(page.status(), reqwest::StatusCode::OK);
        let html = page.text().await.expect("body");
        assert!(html.contains(&result.sum));

        // Build log, decompressed for clients without gzip support.
        let log = client
            .get(format!("{base}{}{}/log", spec().url_path(), result.sum))
            .send()
            .await
            .expect("request");
        assert_eq!(log.status(), reqwest::StatusCode::OK);

        // Binary download carries a filename.
        let binary = client
            .get(format!("{base}{}{}/x", spec().url_path(), result.sum))
            .send()
            .await
            .expect("request");
        assert_eq!(binary.status(), reqwest::StatusCode::OK);
        let disposition = binary
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(disposition.contains("filename=\"x\""));
        assert_eq!(
            binary.bytes().await.expect("bytes").as_ref(),
            b"reproducible binary bytes"
        );
    }

    #[tokio::test]
    async fn tlog_surface_serves_verifiable_proofs() {
        use gobuild_core::note::{NoteVerifier, TreeHead};
        use gobuild_core::tlog::record_hash;

        let (signer_key, verifier_key) =
            gobuild_core::note::generate_key("build.test.example").expect("genkey");
        let env = test_env_with(Vec::new(), OK_SCRIPT, Some(signer_key));
        let base = spawn_service(&env).await;
        let client = reqwest::Client::new();

        let artifact = env.coordinator.build(spec()).await.expect("build");

        let note = client
            .get(format!("{base}/tlog/latest"))
            .send()
            .await
            .expect("latest")
            .text()
            .await
            .expect("body");
        let verifier = NoteVerifier::from_key(&verifier_key).expect("verifier");
        let text = verifier.verify_note(&note).expect("note verifies");
        let head = TreeHead::parse(text, "build.test.example").expect("head");
        assert_eq!(head.size, 1);

        let lookup: serde_json::Value = client
            .get(format!("{base}/tlog/lookup/{}", spec().record_key()))
            .send()
            .await
            .expect("lookup")
            .json()
            .await
            .expect("json");
        assert_eq!(lookup["recnum"], 0);
        assert_eq!(lookup["tree_size"], 1);
        let record_line = lookup["record"].as_str().expect("record line");
        assert!(record_line.contains(&artifact.sum));

        // The inclusion proof verifies against the signed root.
        let proof: Vec<gobuild_core::tlog::Hash32> = lookup["proof"]
            .as_array()
            .expect("proof array")
            .iter()
            .map(|h| {
                let bytes = hex::decode(h.as_str().expect("hex")).expect("decode");
                bytes.try_into().expect("32 bytes")
            })
            .collect();
        let note_text = verifier
            .verify_note(lookup["signed_tree_head"].as_str().expect("sth"))
            .expect("sth verifies");
        let sth = TreeHead::parse(note_text, "build.test.example").expect("sth head");
        assert!(gobuild_verifier::verify_inclusion_proof(
            &record_hash(record_line.as_bytes()),
            0,
            sth.size,
            &proof,
            &sth.root
        ));
    }

    #[tokio::test]
    async fn static_paths_and_method_rules() {
        let env = test_env(Vec::new(), OK_SCRIPT);
        let base = spawn_service(&env).await;
        let client = reqwest::Client::new();

        let robots = client
            .get(format!("{base}/robots.txt"))
            .send()
            .await
            .expect("robots");
        assert!(robots.text().await.expect("body").contains("Disallow: /tlog/"));

        let config_text = client
            .get(format!("{base}/emptyconfig"))
            .send()
            .await
            .expect("emptyconfig")
            .text()
            .await
            .expect("body");
        assert!(config_text.contains("goproxy"));

        // Legacy prefixes redirect to the bare path.
        let redirect = client
            .get(format!("{base}/m/example.com/x/@v/v1.0.0/linux-amd64-{GOVERSION}/"))
            .send()
            .await
            .expect("redirect followed");
        assert_eq!(redirect.status(), reqwest::StatusCode::OK);

        // Non-GET is refused.
        let post = client
            .post(format!("{base}/example.com/x/@v/v1.0.0/linux-amd64-{GOVERSION}/"))
            .send()
            .await
            .expect("post");
        assert_eq!(post.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);

        // Soft failure carries a repair hint.
        let hint = client
            .get(format!("{base}/example.com/x/@v/v1.0.0/linux-amd64-{GOVERSION}"))
            .send()
            .await
            .expect("hint");
        assert_eq!(hint.status(), reqwest::StatusCode::NOT_FOUND);
        assert!(hint.text().await.expect("body").contains("trailing slash"));

        // Unsupported targets are user errors.
        let bad = client
            .get(format!("{base}/example.com/x/@v/v1.0.0/android-arm64-{GOVERSION}/"))
            .send()
            .await
            .expect("bad target");
        assert_eq!(bad.status(), reqwest::StatusCode::BAD_REQUEST);
    }
}
