// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Realization hashing and equivalence classes.
//!
//! Two derivations with equal realization hashes are interchangeable for
//! output selection. The pseudo-hash is the structural variant computed
//! before inputs are realized: it substitutes every input with a synthetic
//! zero-digest path, so any two derivations that could end up with the
//! same realization hash agree on it up front.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use zb_utils_base_encoding::base32;
use zb_utils_hash::Sha256;

use crate::aterm;
use crate::content_address::{ContentAddress, MakeStorePathError, PathRefs, fixed_ca_output_path};
use crate::derivation::{Derivation, OutputName};
use crate::placeholder::{output_path_name, unknown_ca_output_placeholder};
use crate::store_path::{StoreDir, StorePath, StorePathDigest};

/// A derivation realization hash (always SHA-256).
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct DrvHash(Sha256);

impl DrvHash {
    pub const ALGORITHM: &'static str = "sha256";

    pub fn new(hash: Sha256) -> DrvHash {
        DrvHash(hash)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<DrvHash> {
        Sha256::from_slice(bytes).ok().map(DrvHash)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.digest_bytes()
    }

    pub fn to_base32(&self) -> String {
        base32::encode_string(self.as_bytes())
    }
}

impl fmt::Display for DrvHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base32())
    }
}

impl fmt::Debug for DrvHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DrvHash({})", self.to_base32())
    }
}

impl Serialize for DrvHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_base32())
    }
}

impl<'de> Deserialize<'de> for DrvHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = base32::decode_string(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid drv hash: {e:?}")))?;
        DrvHash::from_bytes(&bytes)
            .ok_or_else(|| serde::de::Error::custom("drv hash has wrong length"))
    }
}

/// A `(realization hash, output name)` pair.
///
/// The zero class, with neither side set, denotes a source path: one that
/// was added to the store rather than produced by a derivation.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct EquivalenceClass(Option<(DrvHash, OutputName)>);

impl EquivalenceClass {
    pub fn zero() -> EquivalenceClass {
        EquivalenceClass(None)
    }

    pub fn new(drv_hash: DrvHash, output: OutputName) -> EquivalenceClass {
        EquivalenceClass(Some((drv_hash, output)))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_none()
    }

    pub fn drv_hash(&self) -> Option<&DrvHash> {
        self.0.as_ref().map(|(h, _)| h)
    }

    pub fn output_name(&self) -> Option<&OutputName> {
        self.0.as_ref().map(|(_, o)| o)
    }
}

impl fmt::Display for EquivalenceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            None => f.write_str("source"),
            Some((hash, output)) => write!(f, "{hash}!{output}"),
        }
    }
}

impl fmt::Debug for EquivalenceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EquivalenceClass({self})")
    }
}

#[derive(Error, Debug)]
pub enum DrvHashError {
    #[error("no realization for input {drv_path}!{output}")]
    MissingInputRealization {
        drv_path: StorePath,
        output: OutputName,
    },
    #[error(transparent)]
    MakeStorePath(#[from] MakeStorePathError),
}

fn fixed_marker(ca: &ContentAddress) -> &'static str {
    match ca {
        ContentAddress::Text(_) => "text:",
        ContentAddress::Recursive(_) | ContentAddress::Source { .. } => "r:",
        ContentAddress::Flat(_) => "",
    }
}

/// Rewrite `drv` so its derivation inputs become plain sources.
///
/// Every `unknown_ca_output_placeholder` for an input is substituted with
/// the path produced by `resolve`, the resolved paths are added to
/// `input_sources`, and `input_derivations` is cleared.
fn resolve_inputs(
    drv: &Derivation,
    dir: &StoreDir,
    mut resolve: impl FnMut(&StorePath, &OutputName) -> Result<StorePath, DrvHashError>,
) -> Result<Derivation, DrvHashError> {
    let mut resolved = drv.clone();
    let mut substitutions = BTreeMap::new();
    for (drv_path, outputs) in &drv.input_derivations {
        for output in outputs {
            let input_path = resolve(drv_path, output)?;
            substitutions.insert(
                unknown_ca_output_placeholder(drv_path, output),
                dir.display_path(&input_path),
            );
            resolved.input_sources.insert(input_path);
        }
    }
    resolved.input_derivations.clear();
    resolved.substitute(&substitutions);
    Ok(resolved)
}

/// Compute the realization hash of `drv`.
///
/// `lookup` supplies the realized store path for each derivation input;
/// missing inputs are an error. For a fixed-output derivation the hash is
/// independent of its inputs.
pub fn realization_hash(
    dir: &StoreDir,
    drv: &Derivation,
    mut lookup: impl FnMut(&StorePath, &OutputName) -> Option<StorePath>,
) -> Result<DrvHash, DrvHashError> {
    if let Some(ca) = drv.fixed_output() {
        let out = OutputName::out();
        let path = fixed_ca_output_path(
            dir,
            &output_path_name(&drv.name, &out),
            ca,
            &PathRefs::none(),
        )?;
        let s = format!(
            "fixed:out:{}{}:{}",
            fixed_marker(ca),
            ca.hash().to_base16(),
            dir.display_path(&path)
        );
        return Ok(DrvHash(Sha256::digest(s)));
    }

    let resolved = resolve_inputs(drv, dir, |drv_path, output| {
        lookup(drv_path, output).ok_or_else(|| DrvHashError::MissingInputRealization {
            drv_path: drv_path.clone(),
            output: output.clone(),
        })
    })?;
    floating_hash(dir, &resolved)
}

/// Compute the structural pseudo-hash of `drv`.
///
/// Inputs are substituted with synthetic zero-digest paths keyed by output
/// name only, so structurally equivalent derivations referencing different
/// input derivation paths agree.
pub fn pseudo_hash(dir: &StoreDir, drv: &Derivation) -> Result<DrvHash, DrvHashError> {
    if drv.fixed_output().is_some() {
        return realization_hash(dir, drv, |_, _| None);
    }
    let resolved = resolve_inputs(drv, dir, |_, output| {
        // Output names are valid store path names.
        let name = output.as_str().parse().unwrap();
        Ok(StorePath::new(StorePathDigest::ZERO, name))
    })?;
    floating_hash(dir, &resolved)
}

fn floating_hash(dir: &StoreDir, resolved: &Derivation) -> Result<DrvHash, DrvHashError> {
    let marshalled = aterm::unparse(dir, resolved)?;
    let s = format!("floating:{}:{}", resolved.name, marshalled);
    Ok(DrvHash(Sha256::digest(s)))
}

#[cfg(test)]
mod unittests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::*;
    use crate::derivation::DerivationOutput;
    use zb_utils_hash::Algorithm;

    fn store_dir() -> StoreDir {
        StoreDir::new("/zb/store").unwrap()
    }

    fn floating_drv(name: &str, input_drv: Option<&str>) -> Derivation {
        let mut input_derivations = BTreeMap::new();
        let mut env = BTreeMap::new();
        if let Some(input_drv) = input_drv {
            let drv_path: StorePath = input_drv.parse().unwrap();
            let out = OutputName::out();
            env.insert(
                "in".to_owned(),
                unknown_ca_output_placeholder(&drv_path, &out),
            );
            input_derivations.insert(drv_path, BTreeSet::from([out]));
        }
        Derivation {
            name: name.parse().unwrap(),
            system: "x86_64-linux".to_owned(),
            builder: "/bin/sh".to_owned(),
            args: vec![],
            env,
            input_sources: BTreeSet::new(),
            input_derivations,
            outputs: BTreeMap::from([(OutputName::out(), DerivationOutput::floating())]),
        }
    }

    #[test]
    fn test_fixed_hash_ignores_lookup() {
        let dir = store_dir();
        let ca = ContentAddress::Flat(Algorithm::SHA256.digest("Hello, World!\n"));
        let mut drv = floating_drv("hello.txt", None);
        drv.outputs = BTreeMap::from([(OutputName::out(), DerivationOutput::Fixed(ca))]);

        let a = realization_hash(&dir, &drv, |_, _| None).unwrap();
        // A different builder must not change the hash of a fixed drv.
        let mut other = drv.clone();
        other.builder = "/bin/false".to_owned();
        let b = realization_hash(&dir, &other, |_, _| None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_floating_hash_depends_on_realized_input() {
        let dir = store_dir();
        let drv = floating_drv(
            "hello2.txt",
            Some("g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-dep.drv"),
        );

        let realized_a: StorePath = "ac8da0sqpg4pyhzyr0qgl26d5dnpn7qp-dep".parse().unwrap();
        let realized_b: StorePath = "bc8da0sqpg4pyhzyr0qgl26d5dnpn7qp-dep".parse().unwrap();

        let ha = realization_hash(&dir, &drv, |_, _| Some(realized_a.clone())).unwrap();
        let hb = realization_hash(&dir, &drv, |_, _| Some(realized_b.clone())).unwrap();
        assert_ne!(ha, hb);

        // Same realized input, same hash.
        let ha2 = realization_hash(&dir, &drv, |_, _| Some(realized_a.clone())).unwrap();
        assert_eq!(ha, ha2);
    }

    #[test]
    fn test_missing_input_is_error() {
        let dir = store_dir();
        let drv = floating_drv(
            "hello2.txt",
            Some("g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-dep.drv"),
        );
        assert!(matches!(
            realization_hash(&dir, &drv, |_, _| None),
            Err(DrvHashError::MissingInputRealization { .. })
        ));
    }

    /// Derivations that differ only in which (structurally equivalent)
    /// input derivation path they reference agree on their pseudo-hash.
    #[test]
    fn test_pseudo_hash_ignores_input_drv_path() {
        let dir = store_dir();
        let a = floating_drv(
            "hello2.txt",
            Some("g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-dep.drv"),
        );
        let b = floating_drv(
            "hello2.txt",
            Some("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-dep.drv"),
        );
        assert_eq!(
            pseudo_hash(&dir, &a).unwrap(),
            pseudo_hash(&dir, &b).unwrap()
        );
    }

    #[test]
    fn test_pseudo_hash_distinguishes_builders() {
        let dir = store_dir();
        let a = floating_drv("hello2.txt", None);
        let mut b = a.clone();
        b.builder = "/bin/bash".to_owned();
        assert_ne!(
            pseudo_hash(&dir, &a).unwrap(),
            pseudo_hash(&dir, &b).unwrap()
        );
    }

    #[test]
    fn test_equivalence_class_display() {
        assert_eq!(EquivalenceClass::zero().to_string(), "source");
        assert!(EquivalenceClass::zero().is_zero());

        let hash = DrvHash::new(Sha256::digest("x"));
        let class = EquivalenceClass::new(hash, OutputName::out());
        assert!(!class.is_zero());
        assert!(class.to_string().ends_with("!out"));
    }
}
