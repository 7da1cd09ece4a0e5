// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Base encodings used by the zb store.
//!
//! The store's own digest encoding is the reversed base32 form in
//! [`base32`]; hex and base64 appear at the boundaries (database rows,
//! fixed-output hash declarations) and come from `data-encoding`.

use data_encoding::{BASE64, HEXLOWER_PERMISSIVE};
use thiserror::Error;

pub mod base32;

#[derive(derive_more::Display, Debug, PartialEq, Eq, Clone, Copy)]
pub enum Base {
    #[display("hex")]
    Hex,
    #[display("nixbase32")]
    NixBase32,
    #[display("base64")]
    Base64,
}

impl Base {
    /// Length of the encoded form of `len` raw bytes in this base.
    pub const fn input_len(&self, len: usize) -> usize {
        match self {
            Base::Hex => len * 2,
            Base::NixBase32 => base32::encode_len(len),
            Base::Base64 => len.div_ceil(3) * 4,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq, Clone)]
#[error("invalid {base} input: {message}")]
pub struct DecodeError {
    pub base: Base,
    pub message: String,
}

/// Decode `input` in the given base.
pub fn decode(base: Base, input: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let wrap = |message: String| DecodeError { base, message };
    match base {
        Base::Hex => HEXLOWER_PERMISSIVE
            .decode(input)
            .map_err(|e| wrap(e.to_string())),
        Base::NixBase32 => base32::decode(input).map_err(|e| wrap(e.to_string())),
        Base::Base64 => BASE64.decode(input).map_err(|e| wrap(e.to_string())),
    }
}

#[cfg(test)]
mod unittests {
    use super::*;

    #[test]
    fn test_input_len() {
        assert_eq!(Base::Hex.input_len(32), 64);
        assert_eq!(Base::NixBase32.input_len(32), 52);
        assert_eq!(Base::Base64.input_len(32), 44);
    }

    #[test]
    fn test_decode_dispatch() {
        assert_eq!(decode(Base::Hex, b"1f2f").unwrap(), vec![0x1f, 0x2f]);
        assert_eq!(decode(Base::NixBase32, b"0bqz").unwrap(), vec![0x1f, 0x2f]);
        assert_eq!(decode(Base::Base64, b"Hy8=").unwrap(), vec![0x1f, 0x2f]);
    }

    #[test]
    fn test_decode_error_names_base() {
        let err = decode(Base::NixBase32, b"0|").unwrap_err();
        assert_eq!(err.base, Base::NixBase32);
        assert!(err.to_string().contains("nixbase32"));
    }
}
