//! Cross-verification against peer instances.
//!
//! Before publishing a fresh build, every configured peer is asked to
//! produce the same identity and must report a bit-identical sum.
//! Peers are other instances of this service; their build URL with
//! `Accept: application/json` returns a [`BuildResult`]. Unreachable
//! peers and disagreements both reject the build, so any observable
//! artifact has already been cross-verified.

use std::time::Duration;

use gobuild_core::{BuildSpec, Failure};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use crate::goproxy::USER_AGENT;

/// Peers build from scratch, including toolchain installation.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// JSON body of a successful build URL response; also the
/// peer-verification wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub sum: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub recnum: Option<u64>,
}

async fn query_peer(
    client: reqwest::Client,
    peer: String,
    url: String,
) -> Result<(String, String), Failure> {
    let response = client
        .get(&url)
        .header(reqwest::header::ACCEPT, "application/json")
        .header(reqwest::header::USER_AGENT, USER_AGENT)
        .timeout(PEER_TIMEOUT)
        .send()
        .await
        .map_err(|err| Failure::remote(format!("peer {peer}: {err}")))?;
    if !response.status().is_success() {
        return Err(Failure::remote(format!(
            "peer {peer} returned {}",
            response.status()
        )));
    }
    let result: BuildResult = response
        .json()
        .await
        .map_err(|err| Failure::remote(format!("peer {peer}: parsing response: {err}")))?;
    Ok((peer, result.sum))
}

/// Ask every peer for its sum of `spec` in parallel and require all
/// of them to match `sum`.
pub async fn cross_verify(
    client: &reqwest::Client,
    peers: &[String],
    spec: &BuildSpec,
    sum: &str,
) -> Result<(), Failure> {
    if peers.is_empty() {
        return Ok(());
    }

    let mut set = JoinSet::new();
    for peer in peers {
        let url = format!("{peer}{}", spec.url_path());
        set.spawn(query_peer(client.clone(), peer.clone(), url));
    }
    while let Some(joined) = set.join_next().await {
        let (peer, peer_sum) = joined
            .map_err(|err| Failure::server(format!("peer verification task: {err}")))??;
        if peer_sum != sum {
            return Err(Failure::remote(format!(
                "peer {peer} built {peer_sum} where the local build is {sum}: not reproducible"
            )));
        }
        tracing::info!(%peer, %sum, key = %spec.record_key(), "peer agreed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;

    fn spec() -> BuildSpec {
        BuildSpec {
            module: "example.com/x".to_string(),
            version: "v1.0.0".to_string(),
            goos: "linux".to_string(),
            goarch: "amd64".to_string(),
            goversion: "go1.21.0".to_string(),
            dir: String::new(),
            stripped: false,
        }
    }

    async fn spawn_peer(sum: &'static str) -> String {
        let app = axum::Router::new().fallback(move || async move {
            Json(BuildResult {
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
    async fn agreement_passes() {
        let peer = spawn_peer("0AAAAAAAAAAAAAAAAAAAAAAAAAAA").await;
        let client = reqwest::Client::new();
        cross_verify(
            &client,
            &[peer],
            &spec(),
            "0AAAAAAAAAAAAAAAAAAAAAAAAAAA",
        )
        .await
        .expect("peers agree");
    }

    #[tokio::test]
    async fn disagreement_is_a_remote_failure() {
        let peer = spawn_peer("0ZZZZZZZZZZZZZZZZZZZZZZZZZZZ").await;
        let client = reqwest::Client::new();
        let err = cross_verify(
            &client,
            &[peer],
            &spec(),
            "0YYYYYYYYYYYYYYYYYYYYYYYYYYY",
        )
        .await
        .expect_err("must disagree");
        assert_eq!(err.kind(), "remote");
        assert!(err.to_string().contains("not reproducible"));
    }

    #[tokio::test]
    async fn unreachable_peer_counts_as_failure() {
        // Bind to learn a free port, then close it again.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let client = reqwest::Client::new();
        let err = cross_verify(
            &client,
            &[format!("http://{addr}")],
            &spec(),
            "0AAAAAAAAAAAAAAAAAAAAAAAAAAA",
        )
        .await
        .expect_err("must fail");
        assert_eq!(err.kind(), "remote");
    }

    #[tokio::test]
    async fn no_peers_is_a_noop() {
        let client = reqwest::Client::new();
        cross_verify(&client, &[], &spec(), "0A").await.expect("ok");
    }
}
