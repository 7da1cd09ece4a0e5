// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Derivations: immutable build recipes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use zb_utils_hash::Algorithm;

use crate::content_address::ContentAddress;
use crate::store_path::{StorePath, StorePathName};

/// Filename extension for derivation store objects.
pub const DRV_EXTENSION: &str = ".drv";

/// The default output name.
pub const DEFAULT_OUTPUT: &str = "out";

/// A validated derivation output name.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct OutputName(String);

impl OutputName {
    pub fn out() -> OutputName {
        OutputName(DEFAULT_OUTPUT.to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OutputName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for OutputName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutputName({})", self.0)
    }
}

#[derive(Error, Debug, PartialEq, Eq, Clone)]
#[error("'{0}' is not a valid output name")]
pub struct InvalidOutputName(String);

impl FromStr for OutputName {
    type Err = InvalidOutputName;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty()
            || s.len() > 64
            || !s
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'_'))
        {
            return Err(InvalidOutputName(s.to_owned()));
        }
        Ok(OutputName(s.to_owned()))
    }
}

impl Serialize for OutputName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for OutputName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// How a derivation output is addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DerivationOutput {
    /// The content address is declared up front; the produced bytes must
    /// match it.
    Fixed(ContentAddress),
    /// The content address is discovered after the build by hashing the
    /// canonical serialization of the output.
    Floating { algorithm: Algorithm, recursive: bool },
}

impl DerivationOutput {
    /// The floating output form every non-fixed output uses.
    pub fn floating() -> DerivationOutput {
        DerivationOutput::Floating {
            algorithm: Algorithm::SHA256,
            recursive: true,
        }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self, DerivationOutput::Fixed(_))
    }
}

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum DerivationError {
    #[error("derivation '{0}' has no outputs")]
    NoOutputs(String),
    #[error("derivation '{0}' has a fixed output but more than one output")]
    FixedMultipleOutputs(String),
    #[error("derivation '{0}' has a fixed output not named '{DEFAULT_OUTPUT}'")]
    FixedWrongName(String),
    #[error("derivation '{0}' has a floating output that is not recursive sha256")]
    FloatingNotSha256(String),
}

/// An immutable build recipe.
///
/// `name` comes from the derivation's store path (without the `.drv`
/// suffix); the store directory is fixed by the server and is not part of
/// the recipe value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Derivation {
    pub name: StorePathName,
    pub system: String,
    pub builder: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub input_sources: BTreeSet<StorePath>,
    pub input_derivations: BTreeMap<StorePath, BTreeSet<OutputName>>,
    pub outputs: BTreeMap<OutputName, DerivationOutput>,
}

impl Derivation {
    /// Check the structural invariants: at least one output; a fixed output
    /// implies exactly one output named `out`; floating outputs are
    /// recursive SHA-256.
    pub fn validate(&self) -> Result<(), DerivationError> {
        let name = self.name.to_string();
        if self.outputs.is_empty() {
            return Err(DerivationError::NoOutputs(name));
        }
        for (out_name, output) in &self.outputs {
            match output {
                DerivationOutput::Fixed(_) => {
                    if self.outputs.len() != 1 {
                        return Err(DerivationError::FixedMultipleOutputs(name));
                    }
                    if out_name.as_str() != DEFAULT_OUTPUT {
                        return Err(DerivationError::FixedWrongName(name));
                    }
                }
                DerivationOutput::Floating { algorithm, recursive } => {
                    if *algorithm != Algorithm::SHA256 || !recursive {
                        return Err(DerivationError::FloatingNotSha256(name));
                    }
                }
            }
        }
        Ok(())
    }

    /// The single fixed content address, if this is a fixed-output
    /// derivation.
    pub fn fixed_output(&self) -> Option<&ContentAddress> {
        if self.outputs.len() != 1 {
            return None;
        }
        match self.outputs.values().next() {
            Some(DerivationOutput::Fixed(ca)) => Some(ca),
            _ => None,
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed_output().is_some()
    }

    /// Apply exact string substitutions to `builder`, `args`, and `env`
    /// values. Used both for placeholder expansion before a build and for
    /// realization hashing.
    pub fn substitute(&mut self, replacements: &BTreeMap<String, String>) {
        if replacements.is_empty() {
            return;
        }
        let apply = |s: &mut String| {
            for (from, to) in replacements {
                if s.contains(from.as_str()) {
                    *s = s.replace(from.as_str(), to);
                }
            }
        };
        apply(&mut self.builder);
        for arg in &mut self.args {
            apply(arg);
        }
        for value in self.env.values_mut() {
            apply(value);
        }
    }
}

#[cfg(test)]
mod unittests {
    use super::*;
    use zb_utils_hash::Sha256;

    fn base_drv() -> Derivation {
        Derivation {
            name: "demo".parse().unwrap(),
            system: "x86_64-linux".to_owned(),
            builder: "/bin/sh".to_owned(),
            args: vec!["-c".to_owned(), "echo hi > $out".to_owned()],
            env: BTreeMap::new(),
            input_sources: BTreeSet::new(),
            input_derivations: BTreeMap::new(),
            outputs: BTreeMap::from([(OutputName::out(), DerivationOutput::floating())]),
        }
    }

    #[test]
    fn test_validate_ok() {
        base_drv().validate().unwrap();
    }

    #[test]
    fn test_validate_no_outputs() {
        let mut drv = base_drv();
        drv.outputs.clear();
        assert!(matches!(
            drv.validate(),
            Err(DerivationError::NoOutputs(_))
        ));
    }

    #[test]
    fn test_validate_fixed_must_be_out() {
        let ca = ContentAddress::Flat(Algorithm::SHA256.digest("x"));
        let mut drv = base_drv();
        drv.outputs =
            BTreeMap::from([("lib".parse().unwrap(), DerivationOutput::Fixed(ca))]);
        assert!(matches!(
            drv.validate(),
            Err(DerivationError::FixedWrongName(_))
        ));
    }

    #[test]
    fn test_validate_fixed_single() {
        let ca = ContentAddress::Text(Sha256::digest("x"));
        let mut drv = base_drv();
        drv.outputs.insert(
            OutputName::out(),
            DerivationOutput::Fixed(ca),
        );
        drv.outputs
            .insert("dev".parse().unwrap(), DerivationOutput::floating());
        assert!(matches!(
            drv.validate(),
            Err(DerivationError::FixedMultipleOutputs(_))
        ));
    }

    #[test]
    fn test_validate_floating_shape() {
        let mut drv = base_drv();
        drv.outputs.insert(
            OutputName::out(),
            DerivationOutput::Floating {
                algorithm: Algorithm::SHA1,
                recursive: true,
            },
        );
        assert!(matches!(
            drv.validate(),
            Err(DerivationError::FloatingNotSha256(_))
        ));
    }

    #[test]
    fn test_substitute() {
        let mut drv = base_drv();
        drv.env
            .insert("out".to_owned(), "/placeholder-xyz".to_owned());
        drv.args[1] = "cp in /placeholder-xyz".to_owned();
        let subs = BTreeMap::from([(
            "/placeholder-xyz".to_owned(),
            "/zb/store/abc-demo".to_owned(),
        )]);
        drv.substitute(&subs);
        assert_eq!(drv.env["out"], "/zb/store/abc-demo");
        assert_eq!(drv.args[1], "cp in /zb/store/abc-demo");
    }
}
