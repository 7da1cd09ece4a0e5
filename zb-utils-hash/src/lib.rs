// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Hash types and digest computation for the zb store.
//!
//! [`Hash`] carries an algorithm tag plus digest bytes; [`Sha256`] and
//! [`NarHash`] are the fixed-algorithm forms used where the store only
//! ever deals in SHA-256. [`Context`] is the streaming
//! init-update-finish interface and [`HashSink`] adapts it to
//! [`tokio::io::AsyncWrite`].

use std::convert::TryInto;
use std::fmt;
use std::str::FromStr;

use data_encoding::BASE64;
use ring::digest;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use zb_utils_base_encoding::base32;

mod algo;

pub use algo::{Algorithm, UnknownAlgorithm};

const LARGEST_ALGORITHM: Algorithm = Algorithm::LARGEST;

#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[error("hash has wrong length {length} != {} for hash type '{algorithm}'", algorithm.size())]
pub struct InvalidHashError {
    algorithm: Algorithm,
    length: usize,
}

/// Errors from parsing a textual hash form.
#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum ParseHashError {
    #[error(transparent)]
    UnknownAlgorithm(#[from] UnknownAlgorithm),
    #[error("hash '{0}' is not in the form '<algorithm>:<digest>'")]
    MissingAlgorithm(String),
    #[error("hash '{hash}' has wrong length for hash type '{algorithm}'")]
    WrongLength { algorithm: Algorithm, hash: String },
    #[error("hash '{hash}' is not valid {base}: {message}")]
    InvalidEncoding {
        base: zb_utils_base_encoding::Base,
        hash: String,
        message: String,
    },
    #[error("hash should have type '{expected}' but got '{actual}'")]
    TypeMismatch {
        expected: Algorithm,
        actual: Algorithm,
    },
}

/// A digest value tagged with its [`Algorithm`].
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct Hash {
    algorithm: Algorithm,
    data: [u8; LARGEST_ALGORITHM.size()],
}

impl Hash {
    pub const fn new(algorithm: Algorithm, hash: &[u8]) -> Hash {
        let mut data = [0u8; LARGEST_ALGORITHM.size()];
        let (hash_data, _postfix) = data.split_at_mut(algorithm.size());
        hash_data.copy_from_slice(hash);
        Hash { algorithm, data }
    }

    pub fn from_slice(algorithm: Algorithm, hash: &[u8]) -> Result<Hash, InvalidHashError> {
        if hash.len() != algorithm.size() {
            return Err(InvalidHashError {
                algorithm,
                length: hash.len(),
            });
        }
        Ok(Hash::new(algorithm, hash))
    }

    #[inline]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    #[inline]
    pub fn digest_bytes(&self) -> &[u8] {
        &self.data[0..(self.algorithm.size())]
    }

    /// The digest in the store's base32 encoding (no algorithm prefix).
    pub fn to_base32(&self) -> String {
        base32::encode_string(self.digest_bytes())
    }

    /// The digest in lowercase hex (no algorithm prefix).
    pub fn to_base16(&self) -> String {
        data_encoding::HEXLOWER.encode(self.digest_bytes())
    }

    /// Parse `<algorithm>:<digest>` where the digest may be hex, base32,
    /// or base64, disambiguated by length.
    pub fn parse(s: &str) -> Result<Hash, ParseHashError> {
        let (algo_s, digest_s) = s
            .split_once(':')
            .ok_or_else(|| ParseHashError::MissingAlgorithm(s.to_owned()))?;
        let algorithm: Algorithm = algo_s.parse()?;
        Self::parse_digest(algorithm, digest_s)
    }

    /// Parse a bare digest with a known algorithm.
    pub fn parse_digest(algorithm: Algorithm, digest_s: &str) -> Result<Hash, ParseHashError> {
        use zb_utils_base_encoding::Base;
        let size = algorithm.size();
        let base = if digest_s.len() == Base::Hex.input_len(size) {
            Base::Hex
        } else if digest_s.len() == Base::NixBase32.input_len(size) {
            Base::NixBase32
        } else if digest_s.len() == Base::Base64.input_len(size) {
            Base::Base64
        } else {
            return Err(ParseHashError::WrongLength {
                algorithm,
                hash: digest_s.to_owned(),
            });
        };

        let digest = zb_utils_base_encoding::decode(base, digest_s.as_bytes()).map_err(|err| {
            ParseHashError::InvalidEncoding {
                base,
                hash: digest_s.to_owned(),
                message: err.to_string(),
            }
        })?;
        Hash::from_slice(algorithm, &digest).map_err(|_| ParseHashError::WrongLength {
            algorithm,
            hash: digest_s.to_owned(),
        })
    }

    /// The SRI form `<algorithm>-<base64>`.
    pub fn to_sri(&self) -> String {
        format!("{}-{}", self.algorithm, BASE64.encode(self.digest_bytes()))
    }
}

impl std::ops::Deref for Hash {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.digest_bytes()
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        self.digest_bytes()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.to_base32())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({self})")
    }
}

impl FromStr for Hash {
    type Err = ParseHashError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hash::parse(s)
    }
}

impl TryFrom<digest::Digest> for Hash {
    type Error = UnknownAlgorithm;
    fn try_from(digest: digest::Digest) -> Result<Self, Self::Error> {
        Ok(Hash::new(digest.algorithm().try_into()?, digest.as_ref()))
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de;

        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// A SHA-256 digest.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct Sha256([u8; Algorithm::SHA256.size()]);

impl Sha256 {
    pub const fn new(digest: &[u8]) -> Self {
        let mut data = [0u8; Algorithm::SHA256.size()];
        data.copy_from_slice(digest);
        Self(data)
    }

    pub const fn from_slice(digest: &[u8]) -> Result<Self, InvalidHashError> {
        if digest.len() != Algorithm::SHA256.size() {
            return Err(InvalidHashError {
                algorithm: Algorithm::SHA256,
                length: digest.len(),
            });
        }
        Ok(Self::new(digest))
    }

    /// Returns the digest of `data` using sha256.
    ///
    /// ```
    /// # use zb_utils_hash::Sha256;
    /// let hash = Sha256::digest("abc");
    ///
    /// assert_eq!("1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s", hash.to_base32());
    /// ```
    pub fn digest<B: AsRef<[u8]>>(data: B) -> Self {
        Algorithm::SHA256.digest(data).try_into().unwrap()
    }

    #[inline]
    pub fn digest_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base32(&self) -> String {
        base32::encode_string(&self.0)
    }

    pub fn to_base16(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0)
    }
}

impl AsRef<[u8]> for Sha256 {
    fn as_ref(&self) -> &[u8] {
        self.digest_bytes()
    }
}

impl fmt::Display for Sha256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.to_base32())
    }
}

impl fmt::Debug for Sha256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha256({})", self.to_base32())
    }
}

impl From<Sha256> for Hash {
    fn from(value: Sha256) -> Self {
        Hash::new(Algorithm::SHA256, value.as_ref())
    }
}

impl TryFrom<Hash> for Sha256 {
    type Error = ParseHashError;

    fn try_from(value: Hash) -> Result<Self, Self::Error> {
        if value.algorithm() != Algorithm::SHA256 {
            return Err(ParseHashError::TypeMismatch {
                expected: Algorithm::SHA256,
                actual: value.algorithm(),
            });
        }
        Ok(Self::new(value.as_ref()))
    }
}

impl Serialize for Sha256 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        Hash::from(*self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Sha256 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hash = Hash::deserialize(deserializer)?;
        hash.try_into().map_err(serde::de::Error::custom)
    }
}

/// The SHA-256 hash of a canonical archive serialization.
#[derive(Clone, Copy, Eq, Hash, PartialEq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct NarHash(Sha256);

impl NarHash {
    pub const fn new(digest: &[u8]) -> NarHash {
        NarHash(Sha256::new(digest))
    }

    pub fn from_slice(digest: &[u8]) -> Result<NarHash, InvalidHashError> {
        Sha256::from_slice(digest).map(NarHash)
    }

    pub fn digest<D: AsRef<[u8]>>(data: D) -> Self {
        NarHash(Sha256::digest(data))
    }

    #[inline]
    pub fn digest_bytes(&self) -> &[u8] {
        self.0.digest_bytes()
    }

    pub fn to_base32(&self) -> String {
        self.0.to_base32()
    }

    pub fn to_base16(&self) -> String {
        self.0.to_base16()
    }
}

impl fmt::Display for NarHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for NarHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NarHash({})", self.to_base32())
    }
}

impl From<Sha256> for NarHash {
    fn from(value: Sha256) -> Self {
        NarHash(value)
    }
}

impl From<NarHash> for Hash {
    fn from(value: NarHash) -> Self {
        value.0.into()
    }
}

impl TryFrom<Hash> for NarHash {
    type Error = ParseHashError;

    fn try_from(value: Hash) -> Result<Self, Self::Error> {
        Ok(NarHash(value.try_into()?))
    }
}

impl Serialize for NarHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for NarHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Sha256::deserialize(deserializer).map(NarHash)
    }
}

#[derive(Clone)]
enum InnerContext {
    MD5(md5::Context),
    Ring(digest::Context),
}

/// A context for multi-step (Init-Update-Finish) digest calculation.
///
/// # Examples
///
/// ```
/// use zb_utils_hash as hash;
///
/// let one_shot = hash::Algorithm::SHA256.digest("hello, world");
///
/// let mut ctx = hash::Context::new(hash::Algorithm::SHA256);
/// ctx.update("hello");
/// ctx.update(", ");
/// ctx.update("world");
/// let multi_path = ctx.finish();
///
/// assert_eq!(one_shot, multi_path);
/// ```
#[derive(Clone)]
pub struct Context(Algorithm, InnerContext);

impl Context {
    /// Constructs a new context with `algorithm`.
    pub fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::MD5 => Context(algorithm, InnerContext::MD5(md5::Context::new())),
            _ => Context(
                algorithm,
                InnerContext::Ring(digest::Context::new(algorithm.digest_algorithm())),
            ),
        }
    }

    /// Update the digest with all the data in `data`.
    /// `update` may be called zero or more times before `finish` is called.
    pub fn update<D: AsRef<[u8]>>(&mut self, data: D) {
        let data = data.as_ref();
        match &mut self.1 {
            InnerContext::MD5(ctx) => ctx.consume(data),
            InnerContext::Ring(ctx) => ctx.update(data),
        }
    }

    /// Finalizes the digest calculation and returns the [`Hash`] value.
    /// This consumes the context to prevent misuse.
    ///
    /// [`Hash`]: struct@Hash
    pub fn finish(self) -> Hash {
        match self.1 {
            InnerContext::MD5(ctx) => Hash::new(self.0, ctx.finalize().as_ref()),
            InnerContext::Ring(ctx) => ctx.finish().try_into().unwrap(),
        }
    }

    /// The algorithm that this context is using.
    pub fn algorithm(&self) -> Algorithm {
        self.0
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Context").field(&self.0).finish()
    }
}

/// A hash sink that implements [`AsyncWrite`].
///
/// # Examples
///
/// ```
/// use tokio::io;
/// use zb_utils_hash as hash;
///
/// # #[tokio::main]
/// # async fn main() -> std::io::Result<()> {
/// let mut reader: &[u8] = b"hello, world";
/// let mut sink = hash::HashSink::new(hash::Algorithm::SHA256);
///
/// io::copy(&mut reader, &mut sink).await?;
/// let (size, hash) = sink.finish();
///
/// let one_shot = hash::Algorithm::SHA256.digest("hello, world");
/// assert_eq!(one_shot, hash);
/// assert_eq!(12, size);
/// # Ok(())
/// # }
/// ```
///
/// [`AsyncWrite`]: tokio::io::AsyncWrite
#[derive(Debug)]
pub struct HashSink(Option<(u64, Context)>);

impl HashSink {
    /// Constructs a new sink with `algorithm`.
    pub fn new(algorithm: Algorithm) -> HashSink {
        HashSink(Some((0, Context::new(algorithm))))
    }

    /// Finalizes this sink and returns the hash and number of bytes written to the sink.
    pub fn finish(self) -> (u64, Hash) {
        let (read, ctx) = self.0.unwrap();
        (read, ctx.finish())
    }
}

impl tokio::io::AsyncWrite for HashSink {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<Result<usize, std::io::Error>> {
        match self.0.as_mut() {
            None => {
                return std::task::Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "cannot write to HashSink after calling finish()",
                )));
            }
            Some((read, ctx)) => {
                *read += buf.len() as u64;
                ctx.update(buf)
            }
        }
        std::task::Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        std::task::Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod unittests {
    use hex_literal::hex;
    use rstest::rstest;

    use super::*;

    /// value taken from: https://tools.ietf.org/html/rfc1321
    const MD5_ABC: Hash = Hash::new(Algorithm::MD5, &hex!("900150983cd24fb0d6963f7d28e17f72"));

    /// value taken from: https://tools.ietf.org/html/rfc3174
    const SHA1_ABC: Hash = Hash::new(
        Algorithm::SHA1,
        &hex!("a9993e364706816aba3e25717850c26c9cd0d89d"),
    );

    /// value taken from: https://tools.ietf.org/html/rfc4634
    const SHA256_ABC: Hash = Hash::new(
        Algorithm::SHA256,
        &hex!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"),
    );
    /// value taken from: https://tools.ietf.org/html/rfc4634
    const SHA256_LONG: Hash = Hash::new(
        Algorithm::SHA256,
        &hex!("248d6a61d20638b8e5c026930c3e6039a33ce45964ff2167f6ecedd419db06c1"),
    );

    /// value taken from: https://tools.ietf.org/html/rfc4634
    const SHA512_ABC: Hash = Hash::new(
        Algorithm::SHA512,
        &hex!(
            "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
        ),
    );

    #[rstest]
    #[case::md5_abc(&MD5_ABC, "abc")]
    #[case::sha1_abc(&SHA1_ABC, "abc")]
    #[case::sha256_abc(&SHA256_ABC, "abc")]
    #[case::sha256_long(&SHA256_LONG, "abcdbcdecdefdefgefghfghighijhijkijkljklmklmnlmnomnopnopq")]
    #[case::sha512_abc(&SHA512_ABC, "abc")]
    fn test_digest(#[case] expected: &Hash, #[case] input: &str) {
        let actual = expected.algorithm().digest(input);
        assert_eq!(actual, *expected);
    }

    #[rstest]
    #[case::base16("sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")]
    #[case::base32("sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s")]
    #[case::base64("sha256:ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0=")]
    fn test_parse_encodings(#[case] input: &str) {
        let hash = Hash::parse(input).unwrap();
        assert_eq!(hash, SHA256_ABC);
    }

    #[test]
    fn test_display_roundtrip() {
        let rendered = SHA256_ABC.to_string();
        assert_eq!(
            rendered,
            "sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s"
        );
        assert_eq!(rendered.parse::<Hash>().unwrap(), SHA256_ABC);
    }

    #[test]
    fn test_multi_step_context() {
        let mut ctx = Context::new(Algorithm::SHA256);
        ctx.update("ab");
        ctx.update("c");
        assert_eq!(ctx.finish(), SHA256_ABC);
    }

    #[test]
    fn unknown_algorithm() {
        assert_eq!(
            Err(UnknownAlgorithm("test".into())),
            "test".parse::<Algorithm>()
        );
    }

    #[test]
    fn test_wrong_length_rejected() {
        let err = Hash::parse("sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5").unwrap_err();
        assert!(matches!(err, ParseHashError::WrongLength { .. }));
    }

    #[test]
    fn test_serde_roundtrip() {
        let json = serde_json::to_value(SHA256_ABC).unwrap();
        assert_eq!(
            json.as_str().unwrap(),
            "sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s"
        );
        let back: Hash = serde_json::from_value(json).unwrap();
        assert_eq!(back, SHA256_ABC);
    }

    #[test]
    fn test_sha256_type_mismatch() {
        let result: Result<Sha256, _> = SHA1_ABC.try_into();
        assert!(matches!(result, Err(ParseHashError::TypeMismatch { .. })));
    }
}
