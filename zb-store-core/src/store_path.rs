// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Store directory and store path types.
//!
//! A store path is an absolute filename `<storeDir>/<digest>-<name>` where
//! `<digest>` is exactly 32 characters from the store's base32 alphabet.
//! A [`StorePath`] value holds only the `<digest>-<name>` part; joining it
//! with a [`StoreDir`] yields the absolute form. A store path never carries
//! a sub-path below the object; [`StoreDir::parse_store_path`] splits such
//! a component off for the caller.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use zb_utils_base_encoding::base32;

/// Number of base32 characters in a store path digest.
pub const DIGEST_LEN: usize = 32;

/// Maximum length of a store path name.
const NAME_MAX_LEN: usize = 211;

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum InvalidPathError {
    #[error("path '{path}' is not inside store directory '{dir}'")]
    NotInStore { dir: String, path: String },
    #[error("store path digest '{0}' is not {DIGEST_LEN} base32 characters")]
    InvalidDigest(String),
    #[error("store path '{0}' has no dash separating digest and name")]
    MissingDash(String),
    #[error("store path name is empty")]
    EmptyName,
    #[error("store path name '{0}' contains invalid characters or is too long")]
    InvalidName(String),
    #[error("store directory '{0}' is not an absolute path")]
    DirNotAbsolute(String),
}

/// The digest part of a store path: 32 base32 characters, stored as ASCII.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct StorePathDigest([u8; DIGEST_LEN]);

impl StorePathDigest {
    /// The all-zeros digest, used for synthetic paths in structural hashing.
    pub const ZERO: StorePathDigest = StorePathDigest([b'0'; DIGEST_LEN]);

    /// Construct a digest from raw 20-byte material by base32-encoding it.
    pub fn from_bytes(bytes: &[u8; 20]) -> StorePathDigest {
        let mut out = [0u8; DIGEST_LEN];
        base32::encode_mut(bytes, &mut out);
        StorePathDigest(out)
    }

    pub fn as_str(&self) -> &str {
        // Construction guarantees the bytes are ASCII base32 characters.
        std::str::from_utf8(&self.0).unwrap()
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl fmt::Display for StorePathDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for StorePathDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorePathDigest({})", self.as_str())
    }
}

impl FromStr for StorePathDigest {
    type Err = InvalidPathError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != DIGEST_LEN
            || !s
                .bytes()
                .all(|b| base32::ALPHABET_BYTES.contains(&b))
        {
            return Err(InvalidPathError::InvalidDigest(s.to_owned()));
        }
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(s.as_bytes());
        Ok(StorePathDigest(out))
    }
}

/// The name part of a store path.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct StorePathName(String);

impl StorePathName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_valid_char(b: u8) -> bool {
        b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.' | b'_' | b'?' | b'=')
    }
}

impl fmt::Display for StorePathName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for StorePathName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorePathName({})", self.0)
    }
}

impl FromStr for StorePathName {
    type Err = InvalidPathError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(InvalidPathError::EmptyName);
        }
        if s.len() > NAME_MAX_LEN
            || s == "."
            || s == ".."
            || !s.bytes().all(Self::is_valid_char)
        {
            return Err(InvalidPathError::InvalidName(s.to_owned()));
        }
        Ok(StorePathName(s.to_owned()))
    }
}

impl AsRef<str> for StorePathName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A store object name: `<digest>-<name>`, without the store directory.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct StorePath {
    digest: StorePathDigest,
    name: StorePathName,
}

impl StorePath {
    pub fn new(digest: StorePathDigest, name: StorePathName) -> StorePath {
        StorePath { digest, name }
    }

    pub fn digest(&self) -> &StorePathDigest {
        &self.digest
    }

    pub fn name(&self) -> &StorePathName {
        &self.name
    }

    /// Whether this path names a derivation file.
    pub fn is_derivation(&self) -> bool {
        self.name.as_str().ends_with(crate::derivation::DRV_EXTENSION)
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.digest, self.name)
    }
}

impl fmt::Debug for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorePath({self})")
    }
}

impl FromStr for StorePath {
    type Err = InvalidPathError;

    /// Parse the base form `<digest>-<name>` (no store directory).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() < DIGEST_LEN + 1 {
            return Err(InvalidPathError::MissingDash(s.to_owned()));
        }
        let (digest_s, rest) = s.split_at(DIGEST_LEN);
        let digest = digest_s.parse()?;
        let name_s = rest
            .strip_prefix('-')
            .ok_or_else(|| InvalidPathError::MissingDash(s.to_owned()))?;
        Ok(StorePath {
            digest,
            name: name_s.parse()?,
        })
    }
}

impl Serialize for StorePath {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for StorePath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The store directory, fixed per server (e.g. `/zb/store`).
#[derive(PartialEq, Eq, Clone, Hash)]
pub struct StoreDir(String);

impl StoreDir {
    pub fn new(dir: impl Into<String>) -> Result<StoreDir, InvalidPathError> {
        let dir = dir.into();
        if !dir.starts_with('/') || dir.ends_with('/') {
            return Err(InvalidPathError::DirNotAbsolute(dir));
        }
        Ok(StoreDir(dir))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }

    /// The absolute string form of a store path in this directory.
    pub fn display_path(&self, path: &StorePath) -> String {
        format!("{}/{}", self.0, path)
    }

    /// The absolute filesystem form of a store path in this directory.
    pub fn object_path(&self, path: &StorePath) -> PathBuf {
        self.as_path().join(path.to_string())
    }

    /// Parse an absolute path under this store directory.
    ///
    /// Returns the store path and the sub-path below it, if any. Fails if
    /// `s` is not inside this directory, if the digest is malformed, or if
    /// the name is empty.
    pub fn parse_store_path(
        &self,
        s: &str,
    ) -> Result<(StorePath, Option<String>), InvalidPathError> {
        let not_in_store = || InvalidPathError::NotInStore {
            dir: self.0.clone(),
            path: s.to_owned(),
        };
        let rest = s
            .strip_prefix(&self.0)
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(not_in_store)?;
        let (base, sub) = match rest.split_once('/') {
            Some((base, sub)) => (base, Some(sub.to_owned())),
            None => (rest, None),
        };
        Ok((base.parse()?, sub))
    }

    /// Parse an absolute path that must name a store object directly (no
    /// sub-path component).
    pub fn parse_object_path(&self, s: &str) -> Result<StorePath, InvalidPathError> {
        match self.parse_store_path(s)? {
            (path, None) => Ok(path),
            (_, Some(_)) => Err(InvalidPathError::NotInStore {
                dir: self.0.clone(),
                path: s.to_owned(),
            }),
        }
    }
}

impl fmt::Display for StoreDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for StoreDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreDir({})", self.0)
    }
}

impl FromStr for StoreDir {
    type Err = InvalidPathError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StoreDir::new(s)
    }
}


#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    prop_compose! {
        fn arb_store_path()(
            digest in "[0-9abcdfghijklmnpqrsvwxyz]{32}",
            name in "[A-Za-z0-9+_?=.-]{1,40}",
        ) -> String {
            format!("{digest}-{name}")
        }
    }

    proptest! {
        /// Any syntactically valid base form round-trips through
        /// parse/display.
        #[test]
        fn proptest_parse_display_roundtrip(base in arb_store_path()) {
            prop_assume!(!base.ends_with("-.") && !base.ends_with("-.."));
            let parsed: StorePath = base.parse().unwrap();
            prop_assert_eq!(parsed.to_string(), base);
        }
    }
}
