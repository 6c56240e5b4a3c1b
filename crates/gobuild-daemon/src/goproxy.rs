//! Module proxy client: resolving "latest" module versions.

use gobuild_core::Failure;
use serde::Deserialize;

pub const USER_AGENT: &str = "gobuild/0.1 (reproducible build service)";

const LATEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
pub struct ModVersion {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Time", default)]
    pub time: String,
}

/// Case-encode a module path for proxy URLs: uppercase letters become
/// `!` followed by the lowercase letter.
pub fn escape_path(module: &str) -> String {
    let mut out = String::with_capacity(module.len());
    for c in module.chars() {
        if c.is_ascii_uppercase() {
            out.push('!');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Ask the module proxy for the latest version of `module`.
pub async fn resolve_latest(
    client: &reqwest::Client,
    goproxy: &str,
    module: &str,
) -> Result<ModVersion, Failure> {
    let url = format!("{goproxy}{}/@latest", escape_path(module));
    let response = client
        .get(&url)
        .header(reqwest::header::USER_AGENT, USER_AGENT)
        .timeout(LATEST_TIMEOUT)
        .send()
        .await
        .map_err(|err| Failure::server(format!("http request to module proxy: {err}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Failure::remote(format!(
            "module proxy returned {status} for {module}:\n{body}"
        )));
    }
    let info: ModVersion = response
        .json()
        .await
        .map_err(|err| Failure::remote(format!("parsing module proxy response: {err}")))?;
    if info.version.is_empty() {
        return Err(Failure::remote("empty version from module proxy"));
    }
    Ok(info)
}
