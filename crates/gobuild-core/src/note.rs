//! Signed-note keys and tree heads.
//!
//! A signer key is `PRIVATE+KEY+<name>+<hash8hex>+<base64(alg || seed)>`,
//! its verifier counterpart `<name>+<hash8hex>+<base64(alg || pubkey)>`.
//! The 4-byte key hash binds name and key material so a verifier can
//! reject mismatched notes cheaply. A signed tree head is the note
//! text `<origin>\n<size>\n<base64 root>\n<unix time>\n` followed by a
//! blank line and one signature line.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use ed25519_dalek::{Signer, SigningKey};
use gobuild_verifier::{ALG_ED25519, Hash32, NoteError, key_hash, valid_key_name};

pub use gobuild_verifier::NoteVerifier;

pub const SIGNER_KEY_PREFIX: &str = "PRIVATE+KEY+";

/// Closed list of proof-service paths mounted under the tlog URL
/// prefix when a signer is configured.
pub const SERVER_PATHS: &[&str] = &["/latest", "/lookup/", "/inclusion/", "/consistency/"];

/// The (size, root, time) tuple published as a signed note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeHead {
    pub size: u64,
    pub root: Hash32,
    pub time_unix: u64,
}

impl TreeHead {
    pub fn text(&self, origin: &str) -> String {
        format!(
            "{origin}\n{}\n{}\n{}\n",
            self.size,
            B64.encode(self.root),
            self.time_unix
        )
    }

    /// Parse the text part of a tree-head note, as returned by
    /// [`NoteVerifier::verify_note`].
    pub fn parse(text: &str, origin: &str) -> Result<TreeHead, NoteError> {
        let mut lines = text.lines();
        if lines.next() != Some(origin) {
            return Err(NoteError::MalformedNote);
        }
        let size = lines
            .next()
            .and_then(|l| l.parse::<u64>().ok())
            .ok_or(NoteError::MalformedNote)?;
        let root_bytes = lines
            .next()
            .and_then(|l| B64.decode(l).ok())
            .ok_or(NoteError::MalformedNote)?;
        let root: Hash32 = root_bytes
            .try_into()
            .map_err(|_| NoteError::MalformedNote)?;
        let time_unix = lines
            .next()
            .and_then(|l| l.parse::<u64>().ok())
            .ok_or(NoteError::MalformedNote)?;
        if lines.next().is_some() {
            return Err(NoteError::MalformedNote);
        }
        Ok(TreeHead {
            size,
            root,
            time_unix,
        })
    }
}

pub struct NoteSigner {
    name: String,
    key: SigningKey,
    key_hash: [u8; 4],
}

impl NoteSigner {
    /// Parse a signer key as produced by [`generate_key`].
    pub fn from_key(signer_key: &str) -> Result<Self, NoteError> {
        let rest = signer_key
            .strip_prefix(SIGNER_KEY_PREFIX)
            .ok_or(NoteError::MalformedKey)?;
        let mut fields = rest.split('+');
        let name = fields.next().ok_or(NoteError::MalformedKey)?;
        let hash_hex = fields.next().ok_or(NoteError::MalformedKey)?;
        let material_b64 = fields.next().ok_or(NoteError::MalformedKey)?;
        if fields.next().is_some() || !valid_key_name(name) || hash_hex.len() != 8 {
            return Err(NoteError::MalformedKey);
        }

        let material = B64
            .decode(material_b64)
            .map_err(|_| NoteError::MalformedKey)?;
        if material.len() != 33 {
            return Err(NoteError::MalformedKey);
        }
        if material[0] != ALG_ED25519 {
            return Err(NoteError::UnsupportedAlgorithm);
        }
        let seed: [u8; 32] = material[1..]
            .try_into()
            .map_err(|_| NoteError::MalformedKey)?;
        let key = SigningKey::from_bytes(&seed);

        let computed = key_hash(name, key.verifying_key().as_bytes());
        if hex::decode(hash_hex).ok().as_deref() != Some(&computed) {
            return Err(NoteError::KeyHashMismatch);
        }

        Ok(Self {
            name: name.to_string(),
            key,
            key_hash: computed,
        })
    }

    /// The key name, used as the tree-head origin line.
    pub fn origin(&self) -> &str {
        &self.name
    }

    /// Sign note text (which must end in a newline) and return the
    /// full note.
    pub fn sign(&self, text: &str) -> String {
        let signature = self.key.sign(text.as_bytes());
        let mut blob = Vec::with_capacity(4 + 64);
        blob.extend_from_slice(&self.key_hash);
        blob.extend_from_slice(&signature.to_bytes());
        format!("{text}\n\u{2014} {} {}\n", self.name, B64.encode(blob))
    }

    pub fn signed_tree_head(&self, head: &TreeHead) -> String {
        self.sign(&head.text(&self.name))
    }
}

/// Generate a fresh signer/verifier key pair for `name`.
pub fn generate_key(name: &str) -> Result<(String, String), NoteError> {
    if !valid_key_name(name) {
        return Err(NoteError::MalformedKey);
    }
    let mut seed = [0u8; 32];
    getrandom::getrandom(&mut seed).map_err(|_| NoteError::MalformedKey)?;
    let key = SigningKey::from_bytes(&seed);
    let hash = key_hash(name, key.verifying_key().as_bytes());

    let mut private = vec![ALG_ED25519];
    private.extend_from_slice(&seed);
    let mut public = vec![ALG_ED25519];
    public.extend_from_slice(key.verifying_key().as_bytes());

    let signer = format!(
        "{SIGNER_KEY_PREFIX}{name}+{}+{}",
        hex::encode(hash),
        B64.encode(private)
    );
    let verifier = format!("{name}+{}+{}", hex::encode(hash), B64.encode(public));
    Ok((signer, verifier))
}
