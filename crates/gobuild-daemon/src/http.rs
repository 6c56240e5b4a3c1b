//! HTTP surface.
//!
//! Public router: landing page, build-or-fetch and result URLs with
//! gzip negotiation, the signed /tlog proof service (mounted only
//! when a signer key is configured), robots/favicons/emptyconfig,
//! and 307 redirects from the legacy /m /b /r prefixes. The admin
//! router serves /metrics. Everything non-GET is 405.

use std::collections::HashMap;
use std::io::Read as _;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::{
    ACCEPT, ACCEPT_ENCODING, CONTENT_DISPOSITION, CONTENT_ENCODING, CONTENT_TYPE,
};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use flate2::read::GzDecoder;
use gobuild_core::request::{Page, Request, parse_request};
use gobuild_core::{BuildSpec, Failure, ParseError};
use serde::Serialize;
use tokio::io::AsyncReadExt as _;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;

use crate::coordinate::{Coordinator, Service};
use crate::goproxy;
use crate::sdk::validate_goversion;
use crate::verify::BuildResult;

/// Placeholder artwork served for all favicon variants: a 1x1
/// transparent PNG.
const PIXEL_PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f,
    0x15, 0xc4, 0x89, 0x00, 0x00, 0x00, 0x0a, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0d, 0x0a, 0x2d, 0xb4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<Service>,
    pub coordinator: Arc<Coordinator>,
}

pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/", get(home))
        .route("/robots.txt", get(robots))
        .route("/favicon.ico", get(favicon))
        .route("/favicon-building.png", get(favicon))
        .route("/favicon-error.png", get(favicon))
        .route("/emptyconfig", get(emptyconfig))
        .route("/m/{*rest}", get(legacy_redirect))
        .route("/b/{*rest}", get(legacy_redirect))
        .route("/r/{*rest}", get(legacy_redirect));
    if state.service.signer.is_some() {
        // The closed path set advertised by note::SERVER_PATHS.
        router = router
            .route("/tlog/latest", get(tlog_latest))
            .route("/tlog/lookup/{*key}", get(tlog_lookup))
            .route("/tlog/inclusion/{recnum}", get(tlog_inclusion))
            .route("/tlog/consistency/{old}/{new}", get(tlog_consistency));
    }
    router
        .fallback(serve_request)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn admin_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .with_state(state)
}

fn text(status: StatusCode, body: String) -> Response {
    (status, [(CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

fn not_found(hint: Option<String>) -> Response {
    match hint {
        Some(hint) => text(StatusCode::NOT_FOUND, format!("404 - not found\n\n{hint}\n")),
        None => text(StatusCode::NOT_FOUND, "404 - not found\n".to_string()),
    }
}

/// Whether the client accepts a gzip response body.
pub fn accepts_gzip(headers: &HeaderMap) -> bool {
    let Some(value) = headers.get(ACCEPT_ENCODING).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    value.split(',').any(|entry| {
        let mut parts = entry.trim().split(';');
        let coding = parts.next().unwrap_or("").trim();
        let refused = parts
            .next()
            .map(|q| q.trim() == "q=0")
            .unwrap_or(false);
        coding == "gzip" && !refused
    })
}

fn accepts_json(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json"))
        .unwrap_or(false)
}

/// Stream a file as a response body.
fn stream_file(path: PathBuf) -> Body {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Vec<u8>, std::io::Error>>(16);
    tokio::spawn(async move {
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        };
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(Ok(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    break;
                }
            }
        }
    });
    Body::from_stream(ReceiverStream::new(rx))
}

/// Stream a gzip file decompressed.
fn stream_gunzip(path: PathBuf) -> Body {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Vec<u8>, std::io::Error>>(16);
    tokio::task::spawn_blocking(move || {
        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(err) => {
                let _ = tx.blocking_send(Err(err));
                return;
            }
        };
        let mut decoder = GzDecoder::new(file);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match decoder.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    let _ = tx.blocking_send(Err(err));
                    break;
                }
            }
        }
    });
    Body::from_stream(ReceiverStream::new(rx))
}

/// Serve a stored gzip file, passing it through verbatim when the
/// client accepts gzip and decompressing otherwise.
fn serve_gzip_file(
    headers: &HeaderMap,
    path: PathBuf,
    content_type: &'static str,
    disposition: Option<String>,
) -> Response {
    if !path.is_file() {
        return not_found(None);
    }
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type);
    if let Some(disposition) = disposition {
        builder = builder.header(CONTENT_DISPOSITION, disposition);
    }
    let result = if accepts_gzip(headers) {
        builder
            .header(CONTENT_ENCODING, "gzip")
            .body(stream_file(path))
    } else {
        builder.body(stream_gunzip(path))
    };
    match result {
        Ok(response) => response,
        Err(err) => text(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("500 - internal server error - {err}\n"),
        ),
    }
}

fn failure_response(headers: &HeaderMap, failure: &Failure) -> Response {
    match failure {
        Failure::User(msg) => text(StatusCode::BAD_REQUEST, format!("400 - bad request - {msg}\n")),
        Failure::Remote(msg) => text(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("500 - remote dependency failed - {msg}\n"),
        ),
        Failure::Server(msg) => {
            tracing::error!(error = %msg, "request failed");
            text(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("500 - internal server error - {msg}\n"),
            )
        }
        Failure::Build { log_path } => serve_gzip_file(
            headers,
            log_path.clone(),
            "text/plain; charset=utf-8",
            None,
        ),
    }
}

async fn home(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    state.service.telemetry.record_page("home");
    if let Some(module) = params.get("m") {
        if !module.is_empty() {
            return Redirect::temporary(&format!("/{module}")).into_response();
        }
    }

    let recents = state
        .service
        .recent
        .links()
        .iter()
        .map(|link| format!("<li><a href=\"{link}\">{link}</a></li>\n"))
        .collect::<String>();
    let verifier_key = if state.service.config.verifier_key.is_empty() {
        "(none configured)".to_string()
    } else {
        state.service.config.verifier_key.clone()
    };
    let body = format!(
        "<!doctype html>\n<html><head><title>gobuild</title></head><body>\n\
         <h1>gobuild</h1>\n\
         <p>Reproducible binaries for Go modules, recorded in an append-only transparency log.</p>\n\
         <p>Request a build at /&lt;module&gt;/@v/&lt;version&gt;/&lt;goos&gt;-&lt;goarch&gt;-&lt;goversion&gt;/.</p>\n\
         <h2>Recent builds</h2>\n<ul>\n{recents}</ul>\n\
         <h2>Verifier key</h2>\n<p><code>{verifier_key}</code></p>\n\
         </body></html>\n"
    );
    Html(body).into_response()
}

async fn robots() -> Response {
    text(
        StatusCode::OK,
        "User-agent: *\nDisallow: /*/*\nDisallow: /tlog/\n\nAllow: /\n".to_string(),
    )
}

async fn favicon() -> Response {
    ([(CONTENT_TYPE, "image/png")], PIXEL_PNG).into_response()
}

async fn emptyconfig() -> Response {
    text(StatusCode::OK, crate::config::Config::default_text())
}

async fn legacy_redirect(uri: Uri) -> Response {
    // Strip the two-character legacy prefix.
    let path = uri.path();
    Redirect::temporary(&path[2..]).into_response()
}

async fn metrics(State(state): State<AppState>) -> Response {
    text(StatusCode::OK, state.service.telemetry.render())
}

async fn serve_request(State(state): State<AppState>, request: axum::extract::Request) -> Response {
    if request.method() != Method::GET {
        return text(
            StatusCode::METHOD_NOT_ALLOWED,
            "405 - method not allowed\n".to_string(),
        );
    }
    let path = request.uri().path().to_string();
    let headers = request.headers().clone();
    match parse_request(&path) {
        Ok(parsed) => handle_request(&state, &headers, parsed).await,
        Err(ParseError::Hint(hint)) => not_found(Some(hint)),
        Err(ParseError::NotFound) => not_found(None),
    }
}

async fn handle_request(state: &AppState, headers: &HeaderMap, request: Request) -> Response {
    let service = &state.service;
    let spec = request.spec;

    if !service.config.module_allowed(&spec.module) {
        return failure_response(
            headers,
            &Failure::user(format!("module {} is not allowed here", spec.module)),
        );
    }
    if !service.targets.valid(&spec.target()) {
        return failure_response(
            headers,
            &Failure::user(format!("unsupported target {}", spec.target())),
        );
    }

    // Refuse invalid toolchains before any I/O happens on their
    // behalf; "latest" resolves below.
    if spec.goversion != "latest" {
        if let Err(failure) = validate_goversion(&spec.goversion) {
            return failure_response(headers, &failure);
        }
    }

    // Resolve "latest" forms into a redirect to the canonical URL.
    if spec.version == "latest" {
        service.telemetry.record_page("resolve-latest");
        let resolved = match goproxy::resolve_latest(
            &service.client,
            &service.config.goproxy,
            &spec.module,
        )
        .await
        {
            Ok(info) => {
                service.telemetry.record_goproxy_latest("ok");
                info
            }
            Err(failure) => {
                service.telemetry.record_goproxy_latest(failure.kind());
                return failure_response(headers, &failure);
            }
        };
        let canonical = BuildSpec {
            version: resolved.version,
            ..spec
        };
        return Redirect::temporary(&canonical.url_path()).into_response();
    }
    if spec.goversion == "latest" {
        let resolved = match service.sdk.most_recent().await {
            Ok(version) => version,
            Err(failure) => return failure_response(headers, &failure),
        };
        let canonical = BuildSpec {
            goversion: resolved,
            ..spec
        };
        return Redirect::temporary(&canonical.url_path()).into_response();
    }

    service.targets.increase(&spec.target());

    match request.sum {
        None => {
            service.telemetry.record_page("build");
            match state.coordinator.build(spec.clone()).await {
                Ok(artifact) => {
                    if accepts_json(headers) {
                        return axum::Json(BuildResult {
                            sum: artifact.sum.clone(),
                            size: artifact.size,
                            recnum: artifact.recnum,
                        })
                        .into_response();
                    }
                    result_page(state, &artifact.spec, &artifact.sum)
                }
                Err(failure) => failure_response(headers, &failure),
            }
        }
        Some(sum) => match request.page {
            Page::Index => {
                service.telemetry.record_page("result");
                if !service.store.has(&sum) {
                    return not_found(None);
                }
                result_page(state, &spec, &sum)
            }
            Page::Log => {
                service.telemetry.record_page("log");
                serve_gzip_file(
                    headers,
                    service.store.log_path(&sum),
                    "text/plain; charset=utf-8",
                    None,
                )
            }
            Page::Binary => {
                service.telemetry.record_page("binary");
                serve_gzip_file(
                    headers,
                    service.store.binary_path(&sum),
                    "application/octet-stream",
                    Some(format!(
                        "attachment; filename=\"{}\"",
                        spec.binary_name()
                    )),
                )
            }
        },
    }
}

fn result_page(state: &AppState, spec: &BuildSpec, sum: &str) -> Response {
    let service = &state.service;
    let base = format!("{}{}/", spec.url_path(), sum);
    let recnum = service.store.recordnumber(sum).ok().flatten();
    let record_line = match recnum {
        Some(n) => format!("<p>Transparency log record {n}.</p>\n"),
        None => "<p>Not yet recorded in the transparency log.</p>\n".to_string(),
    };
    let tlog_link = match (recnum, &service.signer) {
        (Some(_), Some(_)) => format!(
            "<p><a href=\"/tlog/lookup/{}\">inclusion proof</a></p>\n",
            spec.record_key()
        ),
        _ => String::new(),
    };
    let body = format!(
        "<!doctype html>\n<html><head><title>{module}@{version}</title></head><body>\n\
         <h1>{module}@{version}</h1>\n\
         <p>{target} {goversion}{stripped}</p>\n\
         <p>sum <code>{sum}</code></p>\n\
         {record_line}{tlog_link}\
         <ul>\n\
         <li><a href=\"{base}{binary}\">{binary}</a></li>\n\
         <li><a href=\"{base}log\">build log</a></li>\n\
         </ul>\n</body></html>\n",
        module = spec.module,
        version = spec.version,
        target = spec.target(),
        goversion = spec.goversion,
        stripped = if spec.stripped { " (stripped)" } else { "" },
        binary = spec.binary_name(),
    );
    Html(body).into_response()
}

#[derive(Debug, Serialize)]
struct LookupResponse {
    recnum: u64,
    record: String,
    tree_size: u64,
    signed_tree_head: String,
    proof: Vec<String>,
}

#[derive(Debug, Serialize)]
struct InclusionResponse {
    leaf_index: u64,
    tree_size: u64,
    proof: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ConsistencyResponse {
    old_size: u64,
    new_size: u64,
    proof: Vec<String>,
}

fn hex_proof(proof: &[gobuild_core::tlog::Hash32]) -> Vec<String> {
    proof.iter().map(hex::encode).collect()
}

async fn tlog_latest(State(state): State<AppState>) -> Response {
    state.service.telemetry.record_page("tlog-latest");
    let Some(signer) = &state.service.signer else {
        return not_found(None);
    };
    match state.service.log.latest_head() {
        Ok(head) => text(StatusCode::OK, signer.signed_tree_head(&head)),
        Err(err) => text(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("500 - internal server error - {err}\n"),
        ),
    }
}

async fn tlog_lookup(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    state.service.telemetry.record_page("tlog-lookup");
    let service = &state.service;
    let Some(signer) = &service.signer else {
        return not_found(None);
    };
    let Some(recnum) = service.log.lookup(&key) else {
        return not_found(None);
    };
    let response = service.log.read_record(recnum).and_then(|record| {
        let (proof, tree_size) = service.log.inclusion_proof(recnum)?;
        let root = service.log.root_at(tree_size)?;
        let time_unix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let head = gobuild_core::note::TreeHead {
            size: tree_size,
            root,
            time_unix,
        };
        Ok(LookupResponse {
            recnum,
            record: record.line,
            tree_size,
            signed_tree_head: signer.signed_tree_head(&head),
            proof: hex_proof(&proof),
        })
    });
    match response {
        Ok(response) => axum::Json(response).into_response(),
        Err(err) => text(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("500 - internal server error - {err}\n"),
        ),
    }
}

async fn tlog_inclusion(State(state): State<AppState>, Path(recnum): Path<u64>) -> Response {
    state.service.telemetry.record_page("tlog-inclusion");
    match state.service.log.inclusion_proof(recnum) {
        Ok((proof, tree_size)) => axum::Json(InclusionResponse {
            leaf_index: recnum,
            tree_size,
            proof: hex_proof(&proof),
        })
        .into_response(),
        Err(_) => not_found(None),
    }
}

async fn tlog_consistency(
    State(state): State<AppState>,
    Path((old, new)): Path<(u64, u64)>,
) -> Response {
    state.service.telemetry.record_page("tlog-consistency");
    match state.service.log.consistency_proof(old, new) {
        Ok(proof) => axum::Json(ConsistencyResponse {
            old_size: old,
            new_size: new,
            proof: hex_proof(&proof),
        })
        .into_response(),
        Err(_) => text(StatusCode::BAD_REQUEST, "400 - bad request\n".to_string()),
    }
}
