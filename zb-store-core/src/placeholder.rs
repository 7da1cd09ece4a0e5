// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Opaque stand-in strings for store paths not yet known.
//!
//! Placeholders survive round-tripping through a derivation's `env` as
//! plain strings, so they are fixed-width base32 digests prefixed with `/`,
//! chosen so they cannot collide with legitimate derivation inputs. They
//! must be substituted exactly before the builder is invoked.

use zb_utils_base_encoding::base32;
use zb_utils_hash::Sha256;

use crate::content_address::compress_hash;
use crate::derivation::OutputName;
use crate::store_path::{StorePath, StorePathDigest, StorePathName};

/// The store path name an output of a derivation gets: the derivation name,
/// suffixed with `-<output>` for outputs other than `out`.
pub fn output_path_name(drv_name: &StorePathName, output: &OutputName) -> StorePathName {
    let base = drv_name
        .as_str()
        .strip_suffix(crate::derivation::DRV_EXTENSION)
        .unwrap_or(drv_name.as_str());
    let name = if output.as_str() == crate::derivation::DEFAULT_OUTPUT {
        base.to_owned()
    } else {
        format!("{base}-{output}")
    };
    // A valid derivation name with a valid output suffix is a valid name.
    name.parse().unwrap()
}

fn render(hash: Sha256) -> String {
    format!("/{}", base32::encode_string(hash.digest_bytes()))
}

/// Placeholder for one of the current derivation's own outputs.
pub fn hash_placeholder(output: &OutputName) -> String {
    render(Sha256::digest(format!("nix-output:{output}")))
}

/// Placeholder for an output of another derivation whose content address
/// is not yet known.
pub fn unknown_ca_output_placeholder(drv_path: &StorePath, output: &OutputName) -> String {
    let drv_name_s = drv_path
        .name()
        .as_str()
        .strip_suffix(crate::derivation::DRV_EXTENSION)
        .unwrap_or(drv_path.name().as_str());
    // Stripping ".drv" from a valid store path name yields a valid name.
    let drv_name: StorePathName = drv_name_s.parse().unwrap();
    let clear_text = format!(
        "nix-upstream-output:{}:{}",
        drv_path.digest(),
        output_path_name(&drv_name, output)
    );
    render(Sha256::digest(clear_text))
}

/// The temporary store path a floating output is produced at before its
/// content address (and therefore its final path) is known.
pub fn temp_output_path(
    drv_path_display: &str,
    drv_name: &StorePathName,
    output: &OutputName,
) -> StorePath {
    let clear_text = format!("rewrite:{drv_path_display}:name:{output}");
    let hash = Sha256::digest(clear_text);
    let digest = StorePathDigest::from_bytes(&compress_hash::<20>(hash.digest_bytes()));
    StorePath::new(digest, output_path_name(drv_name, output))
}
