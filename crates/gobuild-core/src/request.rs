//! Build-request identity and URL grammar.
//!
//! The canonical path form is
//! `/<module>/@v/<version>/<goos>-<goarch>-<goversion>[-stripped]/[<dir>/]`
//! optionally followed by `<sum>/` and a page suffix. Parsing is
//! reversible: `parse_request(spec.url_path())` returns the same
//! spec. The identity determines the storage layout, the log record
//! content, and single-flight equality.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length of a rendered sum: the `"0"` version tag plus 27 base64
/// characters covering 20 digest bytes.
pub const SUM_LEN: usize = 28;

/// The tuple uniquely identifying a requested build.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildSpec {
    pub module: String,
    pub version: String,
    pub goos: String,
    pub goarch: String,
    pub goversion: String,
    /// Package directory within the module; empty for the module root.
    pub dir: String,
    /// Build with symbol tables stripped.
    pub stripped: bool,
}

/// Pages served beneath a result URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    Index,
    Log,
    Binary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub spec: BuildSpec,
    pub sum: Option<String>,
    pub page: Page,
}

#[derive(Debug, Clone, Error)]
pub enum ParseError {
    /// Hard 404: the path is not in the grammar at all.
    #[error("not found")]
    NotFound,
    /// Soft 404 carrying a repair suggestion for the client.
    #[error("not found: {0}")]
    Hint(String),
}

impl BuildSpec {
    pub fn target(&self) -> String {
        format!("{}/{}", self.goos, self.goarch)
    }

    fn target_segment(&self) -> String {
        let mut s = format!("{}-{}-{}", self.goos, self.goarch, self.goversion);
        if self.stripped {
            s.push_str("-stripped");
        }
        s
    }

    /// Canonical URL path, with trailing slash.
    pub fn url_path(&self) -> String {
        let mut s = format!(
            "/{}/@v/{}/{}/",
            self.module,
            self.version,
            self.target_segment()
        );
        if !self.dir.is_empty() {
            s.push_str(&self.dir);
            s.push('/');
        }
        s
    }

    /// Reversible serialized identity used as the log record key and
    /// the identity index key: the canonical path without its leading
    /// and trailing slash.
    pub fn record_key(&self) -> String {
        let path = self.url_path();
        path[1..path.len() - 1].to_string()
    }

    pub fn from_record_key(key: &str) -> Option<BuildSpec> {
        let req = parse_request(&format!("/{key}/")).ok()?;
        if req.sum.is_some() || req.page != Page::Index {
            return None;
        }
        Some(req.spec)
    }

    /// Name of the produced executable: the last element of `dir` if
    /// set, else of `module`, with `.exe` appended on windows.
    pub fn binary_name(&self) -> String {
        let base = if self.dir.is_empty() {
            &self.module
        } else {
            &self.dir
        };
        let name = base.rsplit('/').next().unwrap_or(base);
        if self.goos == "windows" {
            format!("{name}.exe")
        } else {
            name.to_string()
        }
    }

    /// URL-safe digest of the identity, used to key artifacts that
    /// have no sum (failed-build logs).
    pub fn identity_hash(&self) -> String {
        let digest = Sha256::digest(self.record_key().as_bytes());
        URL_SAFE_NO_PAD.encode(&digest[..20])
    }
}

/// Render a binary digest as a sum: the `"0"` version tag (reserved
/// for future hash changes) plus the first 20 digest bytes in
/// URL-safe unpadded base64.
pub fn render_sum(digest: &[u8; 32]) -> String {
    format!("0{}", URL_SAFE_NO_PAD.encode(&digest[..20]))
}

/// A rendered sum: version tag `'0'` plus 27 URL-safe base64 chars.
pub fn is_sum(s: &str) -> bool {
    s.len() == SUM_LEN
        && s.starts_with('0')
        && s.as_bytes()[1..]
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn valid_segment(s: &str) -> bool {
    !s.is_empty() && s != "." && s != ".." && !s.contains('@')
}

fn valid_name(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

fn parse_target_segment(seg: &str) -> Option<(String, String, String, bool)> {
    let parts: Vec<&str> = seg.split('-').collect();
    let stripped = match parts.len() {
        3 => false,
        4 if parts[3] == "stripped" => true,
        _ => return None,
    };
    if !valid_name(parts[0]) || !valid_name(parts[1]) {
        return None;
    }
    let goversion = parts[2];
    if goversion.is_empty() || goversion.contains('/') {
        return None;
    }
    Some((
        parts[0].to_string(),
        parts[1].to_string(),
        goversion.to_string(),
        stripped,
    ))
}

/// Parse a request path. A `ParseError::Hint` should render as a 404
/// with the suggestion in the body; `ParseError::NotFound` as a plain
/// 404.
pub fn parse_request(path: &str) -> Result<Request, ParseError> {
    let rest = path.strip_prefix('/').ok_or(ParseError::NotFound)?;
    let parts: Vec<&str> = rest.split('/').collect();

    let at = parts
        .iter()
        .position(|p| *p == "@v")
        .ok_or(ParseError::NotFound)?;
    if at == 0 || !parts[0].contains('.') {
        return Err(ParseError::NotFound);
    }
    let module_parts = &parts[..at];
    if !module_parts.iter().all(|p| valid_segment(p)) {
        return Err(ParseError::NotFound);
    }
    let module = module_parts.join("/");

    if parts.len() < at + 3 {
        return Err(ParseError::Hint(
            "URL must continue with /@v/<version>/<goos>-<goarch>-<goversion>/".to_string(),
        ));
    }
    let version = parts[at + 1];
    if version.is_empty() || version.contains('@') {
        return Err(ParseError::NotFound);
    }
    let Some((goos, goarch, goversion, stripped)) = parse_target_segment(parts[at + 2]) else {
        return Err(ParseError::Hint(
            "target must look like <goos>-<goarch>-<goversion>, e.g. linux-amd64-go1.21.0"
                .to_string(),
        ));
    };

    let rest = &parts[at + 3..];
    let sum_pos = rest.iter().position(|p| is_sum(p));

    let (dir_parts, sum, tail) = match sum_pos {
        Some(i) => (&rest[..i], Some(rest[i].to_string()), &rest[i + 1..]),
        None => {
            // No sum: everything up to the trailing empty segment is
            // the package dir; a missing trailing slash is repairable.
            match rest.split_last() {
                None => {
                    return Err(ParseError::Hint(
                        "build URLs end with a trailing slash".to_string(),
                    ));
                }
                Some((last, dir)) if last.is_empty() => (dir, None, &[] as &[&str]),
                Some(_) => {
                    return Err(ParseError::Hint(
                        "missing trailing slash on build URL".to_string(),
                    ));
                }
            }
        }
    };

    if !dir_parts.iter().all(|p| valid_segment(p)) {
        return Err(ParseError::NotFound);
    }
    let dir = dir_parts.join("/");

    let spec = BuildSpec {
        module,
        version: version.to_string(),
        goos,
        goarch,
        goversion,
        dir,
        stripped,
    };

    let page = match (sum.as_deref(), tail) {
        (None, _) => Page::Index,
        (Some(_), []) => {
            return Err(ParseError::Hint(
                "missing trailing slash after sum".to_string(),
            ));
        }
        (Some(_), [""]) => Page::Index,
        (Some(_), ["log"]) => Page::Log,
        (Some(_), [name]) if *name == spec.binary_name() => Page::Binary,
        _ => return Err(ParseError::NotFound),
    };

    Ok(Request { spec, sum, page })
}
