// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Reference scanning for store path outputs.
//!
//! After a build completes we need to discover which store paths the
//! output refers to. [`RefFinder`] is a streaming scanner fed arbitrary
//! byte chunks (typically the raw archive stream) that finds store path
//! digests efficiently.
//!
//! # Algorithm
//!
//! Rather than searching for each candidate separately (O(n×k)):
//!
//! 1. Slide a window of digest length across the input.
//! 2. Validate characters right-to-left against the base32 alphabet; on
//!    an invalid character at offset j, skip ahead j+1 positions
//!    (Boyer-Moore style).
//! 3. When a valid window is found, look it up in a `HashSet`.
//!
//! This is O(n/32) amortized on binary data, independent of the number of
//! candidates. Chunk-boundary matches are handled with a carried tail.

use std::collections::{BTreeSet, HashSet};

use zb_store_core::store_path::{DIGEST_LEN, StorePath};
use zb_utils_base_encoding::base32;

/// 256-byte lookup table: `true` for bytes in the digest alphabet.
const BASE32_VALID: [bool; 256] = {
    let mut table = [false; 256];
    let chars = base32::ALPHABET_BYTES;
    let mut i = 0;
    while i < chars.len() {
        table[chars[i] as usize] = true;
        i += 1;
    }
    table
};

/// A streaming scanner that finds candidate store path digests in byte
/// data.
///
/// Feed it chunks via [`feed`](Self::feed), then collect results with
/// [`found`](Self::found).
pub struct RefFinder {
    /// Digests still being looked for (removed on first match).
    pending: HashSet<[u8; DIGEST_LEN]>,
    /// Digests found so far.
    seen: HashSet<[u8; DIGEST_LEN]>,
    /// Map from digest back to the candidate path.
    back_map: Vec<([u8; DIGEST_LEN], StorePath)>,
    /// Tail bytes from the previous chunk for boundary matching.
    tail: Vec<u8>,
}

impl RefFinder {
    /// Create a scanner for the given candidate store paths.
    ///
    /// `candidates` is typically the build's input closure; `self_path`
    /// (when given) detects self-references.
    pub fn new<'a>(
        candidates: impl IntoIterator<Item = &'a StorePath>,
        self_path: Option<&StorePath>,
    ) -> Self {
        let mut pending = HashSet::new();
        let mut back_map = Vec::new();

        for sp in candidates {
            let digest = *sp.digest().as_bytes();
            if pending.insert(digest) {
                back_map.push((digest, sp.clone()));
            }
        }
        if let Some(sp) = self_path {
            let digest = *sp.digest().as_bytes();
            if pending.insert(digest) {
                back_map.push((digest, sp.clone()));
            }
        }

        Self {
            pending,
            seen: HashSet::new(),
            back_map,
            tail: Vec::with_capacity(DIGEST_LEN),
        }
    }

    /// Feed a chunk of bytes to the scanner.
    pub fn feed(&mut self, data: &[u8]) {
        if self.pending.is_empty() {
            return;
        }

        let tail_len = data.len().min(DIGEST_LEN);

        // Search the overlap region: old tail + start of new data.
        if !self.tail.is_empty() {
            let mut overlap = self.tail.clone();
            overlap.extend_from_slice(&data[..tail_len]);
            search(&overlap, &mut self.pending, &mut self.seen);
        }

        search(data, &mut self.pending, &mut self.seen);

        // Rebuild tail: keep up to DIGEST_LEN bytes total.
        let rest = DIGEST_LEN - tail_len;
        if rest < self.tail.len() {
            let drop = self.tail.len() - rest;
            self.tail.drain(..drop);
        }
        self.tail.extend_from_slice(&data[data.len() - tail_len..]);
    }

    /// The candidate paths whose digests were found.
    pub fn found(&self) -> BTreeSet<StorePath> {
        let mut result = BTreeSet::new();
        for (digest, store_path) in &self.back_map {
            if self.seen.contains(digest) {
                result.insert(store_path.clone());
            }
        }
        result
    }
}

/// Scan `data` for valid base32 windows of digest length, with
/// Boyer-Moore-style skipping. Matched digests move from `pending` to
/// `seen`.
#[inline]
fn search(
    data: &[u8],
    pending: &mut HashSet<[u8; DIGEST_LEN]>,
    seen: &mut HashSet<[u8; DIGEST_LEN]>,
) {
    if data.len() < DIGEST_LEN {
        return;
    }

    let mut i = 0;
    while i + DIGEST_LEN <= data.len() {
        let mut j = DIGEST_LEN;
        loop {
            if j == 0 {
                break;
            }
            j -= 1;
            if !BASE32_VALID[data[i + j] as usize] {
                i += j + 1;
                break;
            }
        }
        if j > 0 {
            // Broke out early due to an invalid character; i already
            // advanced.
            continue;
        }

        let window: [u8; DIGEST_LEN] = data[i..i + DIGEST_LEN]
            .try_into()
            .expect("slice length matches DIGEST_LEN");
        if pending.remove(&window) {
            seen.insert(window);
        }

        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(digest_char: char, name: &str) -> StorePath {
        format!("{}-{name}", digest_char.to_string().repeat(DIGEST_LEN))
            .parse()
            .unwrap()
    }

    #[test]
    fn test_finds_reference_in_text() {
        let input = path('a', "input");
        let data = format!(
            "some content /zb/store/{}-input more stuff",
            input.digest()
        );

        let mut finder = RefFinder::new([&input], None);
        finder.feed(data.as_bytes());
        assert!(finder.found().contains(&input));
    }

    #[test]
    fn test_detects_self_reference() {
        let self_path = path('b', "self");
        let data = format!("#!/bin/sh\nexec /zb/store/{}-self/bin/real\n", self_path.digest());

        let mut finder = RefFinder::new([], Some(&self_path));
        finder.feed(data.as_bytes());
        assert!(finder.found().contains(&self_path));
    }

    #[test]
    fn test_no_match_in_binary_noise() {
        let input = path('a', "input");
        let mut finder = RefFinder::new([&input], None);
        finder.feed(&[0xffu8; 4096]);
        assert!(finder.found().is_empty());
    }

    /// Feed data in every possible chunk size to verify the tail logic
    /// handles digests spanning any number of chunks.
    #[test]
    fn test_scan_across_chunk_boundary() {
        let input = path('a', "test");
        let content = format!("prefix{}suffix", input.digest());
        let bytes = content.as_bytes();

        for chunk_size in 1..=bytes.len() {
            let mut finder = RefFinder::new([&input], None);
            for chunk in bytes.chunks(chunk_size) {
                finder.feed(chunk);
            }
            assert!(
                finder.found().contains(&input),
                "digest should be found with chunk_size={chunk_size}"
            );
        }
    }
}
