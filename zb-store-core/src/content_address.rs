// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Content addresses and content-addressed output path derivation.
//!
//! A [`ContentAddress`] asserts how a store object's bytes relate to its
//! path. The `text`/`fixed` forms follow the published Nix constructions;
//! the `source` form is the recursive SHA-256 address assigned to floating
//! build outputs and imported sources, optionally marked `:self` when the
//! object's bytes embed its own path digest.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use zb_utils_hash::{Algorithm, Hash, Sha256};

use crate::store_path::{StoreDir, StorePath, StorePathDigest, StorePathName};

/// Content-addressed store object information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContentAddress {
    /// Text object: flat hash of the bytes, references allowed but no
    /// self-reference.
    Text(Sha256),
    /// Fixed-output object hashed over the flat file bytes.
    Flat(Hash),
    /// Fixed-output object hashed over the canonical archive serialization.
    Recursive(Hash),
    /// Source object: SHA-256 over the canonical archive serialization,
    /// with self-references masked out when `self_ref` is set.
    Source { hash: Sha256, self_ref: bool },
}

impl ContentAddress {
    pub fn hash(&self) -> Hash {
        match *self {
            ContentAddress::Text(h) => h.into(),
            ContentAddress::Flat(h) => h,
            ContentAddress::Recursive(h) => h,
            ContentAddress::Source { hash, .. } => hash.into(),
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, ContentAddress::Text(_))
    }

    pub fn is_source(&self) -> bool {
        matches!(self, ContentAddress::Source { .. })
    }

    /// Whether the address records a self-reference.
    pub fn has_self_ref(&self) -> bool {
        matches!(self, ContentAddress::Source { self_ref: true, .. })
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentAddress::Text(h) => write!(f, "text:sha256:{}", h.to_base32()),
            ContentAddress::Flat(h) => {
                write!(f, "fixed:{}:{}", h.algorithm(), h.to_base32())
            }
            ContentAddress::Recursive(h) => {
                write!(f, "fixed:r:{}:{}", h.algorithm(), h.to_base32())
            }
            ContentAddress::Source { hash, self_ref } => {
                write!(f, "source:sha256:{}", hash.to_base32())?;
                if *self_ref {
                    write!(f, ":self")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Error, Debug, PartialEq, Clone)]
pub enum ParseContentAddressError {
    #[error("'{0}' is not a content address because it is not in the form '<text | fixed | source>:<rest>'")]
    InvalidForm(String),
    #[error("invalid hash in content address: {0}")]
    InvalidHash(#[from] zb_utils_hash::ParseHashError),
    #[error("content address '{0}' must use sha256")]
    NotSha256(String),
}

impl FromStr for ContentAddress {
    type Err = ParseContentAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(hash_s) = s.strip_prefix("text:") {
            let hash = Hash::parse(hash_s)?;
            let sha256 = hash
                .try_into()
                .map_err(|_| ParseContentAddressError::NotSha256(s.into()))?;
            Ok(ContentAddress::Text(sha256))
        } else if let Some(hash_s) = s.strip_prefix("fixed:r:") {
            Ok(ContentAddress::Recursive(Hash::parse(hash_s)?))
        } else if let Some(hash_s) = s.strip_prefix("fixed:") {
            Ok(ContentAddress::Flat(Hash::parse(hash_s)?))
        } else if let Some(rest) = s.strip_prefix("source:") {
            let (hash_s, self_ref) = match rest.strip_suffix(":self") {
                Some(hash_s) => (hash_s, true),
                None => (rest, false),
            };
            let hash = Hash::parse(hash_s)?;
            let sha256 = hash
                .try_into()
                .map_err(|_| ParseContentAddressError::NotSha256(s.into()))?;
            Ok(ContentAddress::Source {
                hash: sha256,
                self_ref,
            })
        } else {
            Err(ParseContentAddressError::InvalidForm(s.into()))
        }
    }
}

impl Serialize for ContentAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContentAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// References carried into output path derivation.
///
/// `self_ref` marks a reference from the object to its own path; `others`
/// is the set of distinct store paths referenced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PathRefs {
    pub self_ref: bool,
    pub others: BTreeSet<StorePath>,
}

impl PathRefs {
    pub fn none() -> PathRefs {
        PathRefs::default()
    }

    pub fn is_empty(&self) -> bool {
        !self.self_ref && self.others.is_empty()
    }
}

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum MakeStorePathError {
    #[error("text content address cannot have a self-reference")]
    TextSelfRef,
    #[error("references are not supported for fixed {algorithm} outputs")]
    RefsNotSupported { algorithm: Algorithm },
}

/// Failed verification of a declared content address.
#[derive(Error, Debug, Clone)]
#[error("content address verification failed for '{path}': declared {declared}, computed {computed}")]
pub struct CaVerificationFailed {
    pub path: String,
    pub declared: String,
    pub computed: String,
}

/// Fold a hash down to `N` bytes by XORing, matching the store path
/// digest construction.
pub(crate) fn compress_hash<const N: usize>(hash: &[u8]) -> [u8; N] {
    let mut result = [0u8; N];
    for (i, &byte) in hash.iter().enumerate() {
        result[i % N] ^= byte;
    }
    result
}

/// The core store path construction:
/// `digest = base32(compress20(sha256("<type>:sha256:<hex>:<dir>:<name>")))`.
pub fn make_store_path(
    dir: &StoreDir,
    type_str: &str,
    hash: Sha256,
    name: &StorePathName,
) -> StorePath {
    let fingerprint = format!("{}:sha256:{}:{}:{}", type_str, hash.to_base16(), dir, name);
    let fingerprint_hash = Sha256::digest(fingerprint.as_bytes());
    let digest = StorePathDigest::from_bytes(&compress_hash::<20>(fingerprint_hash.digest_bytes()));
    StorePath::new(digest, name.clone())
}

fn make_type(dir: &StoreDir, base: &str, refs: &PathRefs) -> String {
    let mut ty = String::from(base);
    for other in &refs.others {
        ty.push(':');
        ty.push_str(&dir.display_path(other));
    }
    if refs.self_ref {
        ty.push_str(":self");
    }
    ty
}

/// Compute the deterministic output path for a content address.
///
/// Uses the published derivations: `text:<refs>` for text objects,
/// `source:<refs>[:self]` for recursive-SHA-256 and source objects, and
/// the two-level `fixed:out:` / `output:out` construction otherwise.
pub fn fixed_ca_output_path(
    dir: &StoreDir,
    name: &StorePathName,
    ca: &ContentAddress,
    refs: &PathRefs,
) -> Result<StorePath, MakeStorePathError> {
    match ca {
        ContentAddress::Text(hash) => {
            if refs.self_ref {
                return Err(MakeStorePathError::TextSelfRef);
            }
            Ok(make_store_path(dir, &make_type(dir, "text", refs), *hash, name))
        }
        ContentAddress::Source { hash, self_ref } => {
            let mut refs = refs.clone();
            refs.self_ref |= self_ref;
            Ok(make_store_path(
                dir,
                &make_type(dir, "source", &refs),
                *hash,
                name,
            ))
        }
        ContentAddress::Recursive(hash) if hash.algorithm() == Algorithm::SHA256 => {
            let sha256 = Sha256::new(hash.digest_bytes());
            Ok(make_store_path(
                dir,
                &make_type(dir, "source", refs),
                sha256,
                name,
            ))
        }
        ContentAddress::Flat(hash) | ContentAddress::Recursive(hash) => {
            if !refs.is_empty() {
                return Err(MakeStorePathError::RefsNotSupported {
                    algorithm: hash.algorithm(),
                });
            }
            let marker = if matches!(ca, ContentAddress::Recursive(_)) {
                "r:"
            } else {
                ""
            };
            let inner = Sha256::digest(format!(
                "fixed:out:{marker}{}:{}:",
                hash.algorithm(),
                hash.to_base16()
            ));
            Ok(make_store_path(dir, "output:out", inner, name))
        }
    }
}
