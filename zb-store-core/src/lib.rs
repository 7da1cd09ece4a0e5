// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Core zb store semantics.
//!
//! This crate provides the fundamental types and pure computation logic for
//! working with the zb store. It is intentionally IO-free - all operations
//! are pure functions that operate on values, enabling easy testing and
//! composition.
//!
//! # Key Modules
//!
//! - `store_path` - Store directory and path types, parsing, validation
//! - `content_address` - Content addresses and output path derivation
//! - `placeholder` - Opaque stand-in strings for not-yet-known paths
//! - `derivation` - Build recipes and their validation rules
//! - `aterm` - The on-disk `.drv` serialization
//! - `drv_hash` - Realization hashing and equivalence classes
//!
//! # Design Principles
//!
//! 1. **No IO**: No filesystem, no network, no `async`
//! 2. **Pure functions**: Deterministic, testable, referentially transparent
//! 3. **Explicit errors**: All fallible operations return `Result`

pub mod aterm;
pub mod content_address;
pub mod derivation;
pub mod drv_hash;
pub mod placeholder;
pub mod store_path;

pub use content_address::{ContentAddress, PathRefs};
pub use derivation::{Derivation, DerivationOutput, OutputName};
pub use drv_hash::{DrvHash, EquivalenceClass};
pub use store_path::{StoreDir, StorePath, StorePathDigest, StorePathName};
