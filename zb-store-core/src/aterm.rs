// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! ATerm serialization and deserialization for derivation (`.drv`) files.
//!
//! The on-disk representation for derivations:
//!
//! ```text
//! Derive([(outputs)],[(input_drvs)],[(input_srcs)],"system","builder",[(args)],[(env)])
//! ```
//!
//! Each output row is `(name, path, methodAlgo, hash)`. Floating outputs
//! carry an empty path and hash with methodAlgo `r:sha256`; fixed outputs
//! carry their computed output path and the declared hash in hex.
//!
//! `unparse` is the canonical marshalling also used for realization
//! hashing, so it must stay byte-stable.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use zb_utils_hash::{Algorithm, Hash, Sha256};

use crate::content_address::{ContentAddress, MakeStorePathError, PathRefs, fixed_ca_output_path};
use crate::derivation::{Derivation, DerivationOutput, OutputName};
use crate::placeholder::output_path_name;
use crate::store_path::{StoreDir, StorePath, StorePathName};

/// Errors that can occur during ATerm parsing.
#[derive(Debug, Error)]
pub enum ATermError {
    #[error("unexpected end of input at position {0}")]
    UnexpectedEof(usize),
    #[error("at position {pos}: expected {expected}, got {got:?}")]
    Expected {
        pos: usize,
        expected: String,
        got: String,
    },
    #[error("invalid store path: {0}")]
    InvalidStorePath(String),
    #[error("invalid derivation output: {0}")]
    InvalidOutput(String),
    #[error("invalid hash in output: {0}")]
    InvalidHash(String),
}

fn method_algo(ca: &ContentAddress) -> String {
    match ca {
        ContentAddress::Text(_) => "text:sha256".to_owned(),
        ContentAddress::Flat(h) => h.algorithm().to_string(),
        ContentAddress::Recursive(h) => format!("r:{}", h.algorithm()),
        ContentAddress::Source { .. } => "r:sha256".to_owned(),
    }
}

fn escape_into(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('"');
}

/// Serialize a derivation to its canonical ATerm form.
pub fn unparse(dir: &StoreDir, drv: &Derivation) -> Result<String, MakeStorePathError> {
    let mut s = String::with_capacity(1024);
    s.push_str("Derive([");

    let mut first = true;
    for (out_name, output) in &drv.outputs {
        if !first {
            s.push(',');
        }
        first = false;
        s.push('(');
        escape_into(&mut s, out_name.as_str());
        match output {
            DerivationOutput::Fixed(ca) => {
                let path = fixed_ca_output_path(
                    dir,
                    &output_path_name(&drv.name, out_name),
                    ca,
                    &PathRefs::none(),
                )?;
                s.push(',');
                escape_into(&mut s, &dir.display_path(&path));
                s.push(',');
                escape_into(&mut s, &method_algo(ca));
                s.push(',');
                escape_into(&mut s, &ca.hash().to_base16());
            }
            DerivationOutput::Floating { algorithm, recursive } => {
                s.push_str(",\"\",");
                let ma = if *recursive {
                    format!("r:{algorithm}")
                } else {
                    algorithm.to_string()
                };
                escape_into(&mut s, &ma);
                s.push_str(",\"\"");
            }
        }
        s.push(')');
    }
    s.push_str("],[");

    first = true;
    for (drv_path, outs) in &drv.input_derivations {
        if !first {
            s.push(',');
        }
        first = false;
        s.push('(');
        escape_into(&mut s, &dir.display_path(drv_path));
        s.push_str(",[");
        let mut first_out = true;
        for out in outs {
            if !first_out {
                s.push(',');
            }
            first_out = false;
            escape_into(&mut s, out.as_str());
        }
        s.push_str("])");
    }
    s.push_str("],[");

    first = true;
    for src in &drv.input_sources {
        if !first {
            s.push(',');
        }
        first = false;
        escape_into(&mut s, &dir.display_path(src));
    }
    s.push_str("],");

    escape_into(&mut s, &drv.system);
    s.push(',');
    escape_into(&mut s, &drv.builder);
    s.push_str(",[");

    first = true;
    for arg in &drv.args {
        if !first {
            s.push(',');
        }
        first = false;
        escape_into(&mut s, arg);
    }
    s.push_str("],[");

    first = true;
    for (k, v) in &drv.env {
        if !first {
            s.push(',');
        }
        first = false;
        s.push('(');
        escape_into(&mut s, k);
        s.push(',');
        escape_into(&mut s, v);
        s.push(')');
    }
    s.push_str("])");

    Ok(s)
}

/// Parse a `.drv` file in ATerm format.
///
/// `name` is the derivation name, extracted from the `.drv` store path.
pub fn parse(dir: &StoreDir, name: &StorePathName, input: &str) -> Result<Derivation, ATermError> {
    let mut p = Parser::new(input);

    p.expect_str("Derive(")?;
    let outputs = p.parse_outputs()?;
    p.expect_char(',')?;
    let input_derivations = p.parse_input_drvs(dir)?;
    p.expect_char(',')?;
    let input_sources = p.parse_input_srcs(dir)?;
    p.expect_char(',')?;
    let system = p.parse_string()?;
    p.expect_char(',')?;
    let builder = p.parse_string()?;
    p.expect_char(',')?;
    let args = p.parse_string_list()?;
    p.expect_char(',')?;
    let env = p.parse_env()?;
    p.expect_char(')')?;

    Ok(Derivation {
        name: name.clone(),
        system,
        builder,
        args,
        env,
        input_sources,
        input_derivations,
        outputs,
    })
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Parser { input, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Result<char, ATermError> {
        let c = self
            .peek()
            .ok_or(ATermError::UnexpectedEof(self.pos))?;
        self.pos += c.len_utf8();
        Ok(c)
    }

    fn expect_char(&mut self, expected: char) -> Result<(), ATermError> {
        let pos = self.pos;
        let got = self.bump()?;
        if got != expected {
            return Err(ATermError::Expected {
                pos,
                expected: expected.to_string(),
                got: got.to_string(),
            });
        }
        Ok(())
    }

    fn expect_str(&mut self, expected: &str) -> Result<(), ATermError> {
        if self.input[self.pos..].starts_with(expected) {
            self.pos += expected.len();
            Ok(())
        } else {
            let got: String = self.input[self.pos..]
                .chars()
                .take(expected.len())
                .collect();
            Err(ATermError::Expected {
                pos: self.pos,
                expected: expected.to_owned(),
                got,
            })
        }
    }

    fn parse_string(&mut self) -> Result<String, ATermError> {
        self.expect_char('"')?;
        let mut out = String::new();
        loop {
            match self.bump()? {
                '"' => return Ok(out),
                '\\' => match self.bump()? {
                    'n' => out.push('\n'),
                    'r' => out.push('\r'),
                    't' => out.push('\t'),
                    c => out.push(c),
                },
                c => out.push(c),
            }
        }
    }

    /// Parse a `[...]` list, calling `item` for each element.
    fn parse_list<T>(
        &mut self,
        mut item: impl FnMut(&mut Self) -> Result<T, ATermError>,
    ) -> Result<Vec<T>, ATermError> {
        self.expect_char('[')?;
        let mut items = Vec::new();
        if self.peek() == Some(']') {
            self.bump()?;
            return Ok(items);
        }
        loop {
            items.push(item(self)?);
            match self.bump()? {
                ']' => return Ok(items),
                ',' => continue,
                c => {
                    return Err(ATermError::Expected {
                        pos: self.pos - c.len_utf8(),
                        expected: "',' or ']'".to_owned(),
                        got: c.to_string(),
                    });
                }
            }
        }
    }

    fn parse_string_list(&mut self) -> Result<Vec<String>, ATermError> {
        self.parse_list(|p| p.parse_string())
    }

    fn parse_store_path(&mut self, dir: &StoreDir) -> Result<StorePath, ATermError> {
        let s = self.parse_string()?;
        dir.parse_object_path(&s)
            .map_err(|e| ATermError::InvalidStorePath(format!("{s}: {e}")))
    }

    fn parse_outputs(
        &mut self,
    ) -> Result<BTreeMap<OutputName, DerivationOutput>, ATermError> {
        let rows = self.parse_list(|p| {
            p.expect_char('(')?;
            let name = p.parse_string()?;
            p.expect_char(',')?;
            let _path = p.parse_string()?;
            p.expect_char(',')?;
            let method_algo = p.parse_string()?;
            p.expect_char(',')?;
            let hash_hex = p.parse_string()?;
            p.expect_char(')')?;
            Ok((name, method_algo, hash_hex))
        })?;

        let mut outputs = BTreeMap::new();
        for (name, method_algo, hash_hex) in rows {
            let out_name: OutputName = name
                .parse()
                .map_err(|e| ATermError::InvalidOutput(format!("{e}")))?;
            let output = parse_output(&method_algo, &hash_hex)?;
            outputs.insert(out_name, output);
        }
        Ok(outputs)
    }

    fn parse_input_drvs(
        &mut self,
        dir: &StoreDir,
    ) -> Result<BTreeMap<StorePath, BTreeSet<OutputName>>, ATermError> {
        let rows = self.parse_list(|p| {
            p.expect_char('(')?;
            let drv_path = p.parse_store_path(dir)?;
            p.expect_char(',')?;
            let outs = p.parse_string_list()?;
            p.expect_char(')')?;
            Ok((drv_path, outs))
        })?;

        let mut map = BTreeMap::new();
        for (drv_path, outs) in rows {
            let mut set = BTreeSet::new();
            for out in outs {
                set.insert(
                    out.parse()
                        .map_err(|e| ATermError::InvalidOutput(format!("{e}")))?,
                );
            }
            map.insert(drv_path, set);
        }
        Ok(map)
    }

    fn parse_input_srcs(&mut self, dir: &StoreDir) -> Result<BTreeSet<StorePath>, ATermError> {
        Ok(self
            .parse_list(|p| p.parse_store_path(dir))?
            .into_iter()
            .collect())
    }

    fn parse_env(&mut self) -> Result<BTreeMap<String, String>, ATermError> {
        let rows = self.parse_list(|p| {
            p.expect_char('(')?;
            let k = p.parse_string()?;
            p.expect_char(',')?;
            let v = p.parse_string()?;
            p.expect_char(')')?;
            Ok((k, v))
        })?;
        Ok(rows.into_iter().collect())
    }
}

fn parse_output(method_algo: &str, hash_hex: &str) -> Result<DerivationOutput, ATermError> {
    let (recursive, algo_s) = match method_algo.strip_prefix("r:") {
        Some(rest) => (true, rest),
        None => (false, method_algo),
    };

    if hash_hex.is_empty() {
        let algorithm: Algorithm = algo_s
            .parse()
            .map_err(|e| ATermError::InvalidOutput(format!("{e}")))?;
        return Ok(DerivationOutput::Floating { algorithm, recursive });
    }

    if method_algo == "text:sha256" {
        let hash = Hash::parse_digest(Algorithm::SHA256, hash_hex)
            .map_err(|e| ATermError::InvalidHash(format!("{e}")))?;
        let sha256: Sha256 = hash.try_into().unwrap();
        return Ok(DerivationOutput::Fixed(ContentAddress::Text(sha256)));
    }

    let algorithm: Algorithm = algo_s
        .parse()
        .map_err(|e| ATermError::InvalidOutput(format!("{e}")))?;
    let hash = Hash::parse_digest(algorithm, hash_hex)
        .map_err(|e| ATermError::InvalidHash(format!("{e}")))?;
    Ok(DerivationOutput::Fixed(if recursive {
        ContentAddress::Recursive(hash)
    } else {
        ContentAddress::Flat(hash)
    }))
}

#[cfg(test)]
mod unittests {
    use super::*;

    fn store_dir() -> StoreDir {
        StoreDir::new("/zb/store").unwrap()
    }

    fn sample_drv() -> Derivation {
        Derivation {
            name: "hello2.txt".parse().unwrap(),
            system: "x86_64-linux".to_owned(),
            builder: "/bin/sh".to_owned(),
            args: vec![
                "-c".to_owned(),
                "while read line; do echo \"$line\"; done < $in > $out".to_owned(),
            ],
            env: BTreeMap::from([
                ("in".to_owned(), "/zb/store/ac8da0sqpg4pyhzyr0qgl26d5dnpn7qp-hello.txt".to_owned()),
                ("out".to_owned(), "/1rz4g4znpzjwh1xymhjpm42vipw92pr73vdgl6xs1hycac8kf2n9".to_owned()),
            ]),
            input_sources: BTreeSet::from([
                "ac8da0sqpg4pyhzyr0qgl26d5dnpn7qp-hello.txt".parse().unwrap(),
            ]),
            input_derivations: BTreeMap::from([(
                "g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-dep.drv".parse().unwrap(),
                BTreeSet::from([OutputName::out()]),
            )]),
            outputs: BTreeMap::from([(OutputName::out(), DerivationOutput::floating())]),
        }
    }

    #[test]
    fn test_roundtrip_floating() {
        let dir = store_dir();
        let drv = sample_drv();
        let text = unparse(&dir, &drv).unwrap();
        assert!(text.starts_with("Derive([(\"out\",\"\",\"r:sha256\",\"\")],"));
        let back = parse(&dir, &drv.name, &text).unwrap();
        assert_eq!(back, drv);
    }

    #[test]
    fn test_roundtrip_fixed() {
        let dir = store_dir();
        let mut drv = sample_drv();
        drv.input_derivations.clear();
        let ca = ContentAddress::Flat(Algorithm::SHA256.digest("Hello, World!\n"));
        drv.outputs = BTreeMap::from([(OutputName::out(), DerivationOutput::Fixed(ca))]);

        let text = unparse(&dir, &drv).unwrap();
        // Fixed outputs carry the computed path and the declared hash.
        assert!(text.contains("\"sha256\""));
        let back = parse(&dir, &drv.name, &text).unwrap();
        assert_eq!(back, drv);
    }

    #[test]
    fn test_escaping() {
        let dir = store_dir();
        let mut drv = sample_drv();
        drv.input_derivations.clear();
        drv.env.insert(
            "tricky".to_owned(),
            "line1\nline2\t\"quoted\" \\backslash".to_owned(),
        );
        let text = unparse(&dir, &drv).unwrap();
        let back = parse(&dir, &drv.name, &text).unwrap();
        assert_eq!(back.env["tricky"], drv.env["tricky"]);
    }

    #[test]
    fn test_unparse_is_stable() {
        let dir = store_dir();
        let drv = sample_drv();
        assert_eq!(unparse(&dir, &drv).unwrap(), unparse(&dir, &drv).unwrap());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let dir = store_dir();
        let name: StorePathName = "x".parse().unwrap();
        assert!(parse(&dir, &name, "NotADerive()").is_err());
        assert!(parse(&dir, &name, "Derive([").is_err());
    }
}
