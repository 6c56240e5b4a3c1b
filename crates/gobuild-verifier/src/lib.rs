//! gobuild-verifier
//!
//! Verification-side primitives for the gobuild transparency log:
//! Merkle inclusion and consistency proof checks plus signed-note
//! verification. External verifiers depend on this crate alone; the
//! daemon's log machinery delegates its `verify_*` entry points here
//! so both sides agree on one implementation.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

pub type Hash32 = [u8; 32];

/// Algorithm byte prefixed to key material in encoded keys.
pub const ALG_ED25519: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum NoteError {
    #[error("malformed key")]
    MalformedKey,
    #[error("unsupported key algorithm")]
    UnsupportedAlgorithm,
    #[error("key hash does not match key material")]
    KeyHashMismatch,
    #[error("malformed note")]
    MalformedNote,
    #[error("note was signed by a different key")]
    WrongKey,
    #[error("signature verification failed")]
    SignatureVerification,
}

fn sha256(bytes: &[u8]) -> Hash32 {
    let mut h = Sha256::new();
    h.update(bytes);
    h.finalize().into()
}

/// Hash of a record's content, domain-separated from interior nodes.
pub fn record_hash(data: &[u8]) -> Hash32 {
    let mut buf = Vec::with_capacity(1 + data.len());
    buf.push(0u8);
    buf.extend_from_slice(data);
    sha256(&buf)
}

pub fn node_hash(left: &Hash32, right: &Hash32) -> Hash32 {
    let mut buf = [0u8; 65];
    buf[0] = 1;
    buf[1..33].copy_from_slice(left);
    buf[33..65].copy_from_slice(right);
    sha256(&buf)
}

/// Root of the empty tree.
pub fn empty_root() -> Hash32 {
    sha256(b"")
}

/// Check an inclusion proof for `leaf` at `leaf_index` against `root`
/// over a tree of `tree_size` records. The proof must be consumed
/// exactly; trailing elements fail verification.
pub fn verify_inclusion_proof(
    leaf: &Hash32,
    leaf_index: u64,
    tree_size: u64,
    proof: &[Hash32],
    root: &Hash32,
) -> bool {
    if tree_size == 0 || leaf_index >= tree_size {
        return false;
    }

    let mut fn_idx = leaf_index;
    let mut sn_idx = tree_size - 1;
    let mut used = 0usize;
    let mut hash = *leaf;

    while sn_idx > 0 {
        if fn_idx % 2 == 1 {
            let Some(sibling) = proof.get(used) else {
                return false;
            };
            hash = node_hash(sibling, &hash);
            used += 1;
        } else if fn_idx < sn_idx {
            let Some(sibling) = proof.get(used) else {
                return false;
            };
            hash = node_hash(&hash, sibling);
            used += 1;
        }
        fn_idx /= 2;
        sn_idx /= 2;
    }

    used == proof.len() && &hash == root
}

/// Check a consistency proof between the tree of `old_size` records
/// with root `old_root` and the tree of `new_size` records with root
/// `new_root`.
pub fn verify_consistency_proof(
    old_root: &Hash32,
    new_root: &Hash32,
    old_size: u64,
    new_size: u64,
    proof: &[Hash32],
) -> bool {
    if old_size > new_size {
        return false;
    }
    if old_size == 0 {
        return proof.is_empty() && *old_root == empty_root();
    }
    if old_size == new_size {
        return proof.is_empty() && old_root == new_root;
    }

    let mut fn_idx = old_size - 1;
    let mut sn_idx = new_size - 1;
    while fn_idx & 1 == 1 {
        fn_idx >>= 1;
        sn_idx >>= 1;
    }

    let mut it = proof.iter();
    let mut fr;
    let mut sr;
    if fn_idx == 0 {
        fr = *old_root;
        sr = *old_root;
    } else {
        let Some(first) = it.next() else {
            return false;
        };
        fr = *first;
        sr = *first;
    }

    while fn_idx > 0 {
        let Some(p) = it.next() else {
            return false;
        };
        if fn_idx & 1 == 1 {
            fr = node_hash(p, &fr);
            sr = node_hash(p, &sr);
        } else if fn_idx < sn_idx {
            sr = node_hash(&sr, p);
        }
        fn_idx >>= 1;
        sn_idx >>= 1;
    }

    while sn_idx > 0 {
        let Some(p) = it.next() else {
            return false;
        };
        sr = node_hash(&sr, p);
        sn_idx >>= 1;
    }

    it.next().is_none() && &fr == old_root && &sr == new_root
}

/// First four bytes of SHA-256 over the key name and key material,
/// embedded in encoded keys and signature blobs so a verifier can
/// detect a key/note mismatch before checking the signature.
pub fn key_hash(name: &str, public: &[u8; 32]) -> [u8; 4] {
    let mut h = Sha256::new();
    h.update(name.as_bytes());
    h.update(b"\n");
    h.update([ALG_ED25519]);
    h.update(public);
    let digest = h.finalize();
    [digest[0], digest[1], digest[2], digest[3]]
}

/// A key name is a single token: non-empty, printable ASCII, and free
/// of `+` (the key field separator) and whitespace.
pub fn valid_key_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| (0x21..=0x7e).contains(&b) && b != b'+')
}

/// Parsed verifier key: `<name>+<hash8hex>+<base64(alg || pubkey)>`.
#[derive(Debug, Clone)]
pub struct NoteVerifier {
    name: String,
    key: VerifyingKey,
    key_hash: [u8; 4],
}

impl NoteVerifier {
    pub fn from_key(verifier_key: &str) -> Result<Self, NoteError> {
        let mut fields = verifier_key.split('+');
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
        let public: [u8; 32] = material[1..]
            .try_into()
            .map_err(|_| NoteError::MalformedKey)?;
        let key = VerifyingKey::from_bytes(&public).map_err(|_| NoteError::MalformedKey)?;

        let computed = key_hash(name, &public);
        if hex::decode(hash_hex).ok().as_deref() != Some(&computed) {
            return Err(NoteError::KeyHashMismatch);
        }

        Ok(Self {
            name: name.to_string(),
            key,
            key_hash: computed,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Verify a signed note and return its text (the part that was
    /// signed, trailing newline included).
    pub fn verify_note<'a>(&self, note: &'a str) -> Result<&'a str, NoteError> {
        let sep = note.rfind("\n\n").ok_or(NoteError::MalformedNote)?;
        let text = &note[..sep + 1];
        let sig_line = note[sep + 2..]
            .strip_suffix('\n')
            .ok_or(NoteError::MalformedNote)?;
        let rest = sig_line
            .strip_prefix("\u{2014} ")
            .ok_or(NoteError::MalformedNote)?;
        let (sig_name, sig_b64) = rest.split_once(' ').ok_or(NoteError::MalformedNote)?;
        if sig_name != self.name {
            return Err(NoteError::WrongKey);
        }

        let blob = B64.decode(sig_b64).map_err(|_| NoteError::MalformedNote)?;
        if blob.len() != 4 + 64 {
            return Err(NoteError::MalformedNote);
        }
        if blob[..4] != self.key_hash {
            return Err(NoteError::WrongKey);
        }
        let signature =
            Signature::from_slice(&blob[4..]).map_err(|_| NoteError::MalformedNote)?;
        self.key
            .verify(text.as_bytes(), &signature)
            .map_err(|_| NoteError::SignatureVerification)?;
        Ok(text)
    }
}
