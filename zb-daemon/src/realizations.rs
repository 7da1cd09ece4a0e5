// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Selection of prior realizations compatible with the current build.
//!
//! One build carries a [`RealizationCache`]: the equivalence classes it
//! has already bound to output paths. Reusing a stored realization is
//! only sound when its recorded closure agrees with every binding already
//! made, so candidates are checked pairwise and the cache either commits
//! a candidate's whole closure or rolls back untouched.

use std::collections::BTreeMap;

use tracing::debug;

use zb_store_core::derivation::OutputName;
use zb_store_core::drv_hash::{DrvHash, EquivalenceClass};
use zb_store_core::store_path::StorePath;
use zb_store_db::RealizationCandidate;

use crate::error::{Result, ServerError};
use crate::store::Store;

/// A selected realization for one equivalence class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRealization {
    pub path: StorePath,
    /// The object is recorded but its bytes are no longer in the store.
    pub absent: bool,
}

/// Outcome of a realization search. `NotFound` and `Ambiguous` both make
/// the caller proceed to build (the latter biases toward rebuild over an
/// arbitrary choice among incompatible candidates).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetch {
    Hit(StorePath),
    NotFound,
    Ambiguous,
}

#[derive(Debug, Clone, Default)]
pub struct RealizationCache {
    map: BTreeMap<EquivalenceClass, CachedRealization>,
}

impl RealizationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, class: &EquivalenceClass) -> Option<&CachedRealization> {
        self.map.get(class)
    }

    /// Bind a class to a path produced by the current build.
    pub fn insert_built(&mut self, class: EquivalenceClass, path: StorePath) {
        self.map.insert(
            class,
            CachedRealization {
                path,
                absent: false,
            },
        );
    }

    /// Every class currently bound to `path`.
    pub fn classes_for(&self, path: &StorePath) -> Vec<EquivalenceClass> {
        self.map
            .iter()
            .filter(|(_, cached)| cached.path == *path)
            .map(|(class, _)| class.clone())
            .collect()
    }

    /// A `(path, class)` pair is compatible when the class is zero (a
    /// source path) or any existing binding maps it to the same path.
    fn is_compatible(&self, path: &StorePath, class: &EquivalenceClass) -> bool {
        if class.is_zero() {
            return true;
        }
        match self.map.get(class) {
            Some(existing) => existing.path == *path,
            None => true,
        }
    }

    /// Find a stored realization of `class` compatible with the bindings
    /// made so far, and commit its closure into the cache.
    ///
    /// On any error the cache is left exactly as it was.
    pub async fn fetch_realization(
        &mut self,
        store: &Store,
        class: &EquivalenceClass,
        must_exist: bool,
    ) -> Result<Fetch> {
        if let Some(cached) = self.map.get(class) {
            if must_exist && cached.absent {
                return Ok(Fetch::NotFound);
            }
            return Ok(Fetch::Hit(cached.path.clone()));
        }

        let (Some(drv_hash), Some(output_name)) = (class.drv_hash(), class.output_name()) else {
            return Ok(Fetch::NotFound);
        };

        let bits = drv_hash.as_bytes().to_vec();
        let output_name_s = output_name.as_str().to_owned();
        let candidates = store
            .with_db(move |db| {
                Ok(db.realization_candidates(DrvHash::ALGORITHM, &bits, &output_name_s)?)
            })
            .await?;

        let (present, absent): (Vec<_>, Vec<_>) =
            candidates.into_iter().partition(|c| c.present);

        let snapshot = self.map.clone();
        let outcome = async {
            match self.pick_from(store, class, &present).await? {
                Fetch::NotFound if !must_exist => self.pick_from(store, class, &absent).await,
                other => Ok(other),
            }
        }
        .await;

        match outcome {
            Ok(Fetch::Hit(path)) => Ok(Fetch::Hit(path)),
            Ok(other) => {
                self.map = snapshot;
                Ok(other)
            }
            Err(e) => {
                self.map = snapshot;
                Err(e)
            }
        }
    }

    /// Pick the first compatible candidate; require it to be the only
    /// compatible one.
    async fn pick_from(
        &mut self,
        store: &Store,
        class: &EquivalenceClass,
        candidates: &[RealizationCandidate],
    ) -> Result<Fetch> {
        let mut chosen: Option<(StorePath, Vec<(StorePath, EquivalenceClass, bool)>)> = None;

        for candidate in candidates {
            let closure = self.closure_of(store, candidate, class).await?;
            let Some(closure) = closure else {
                continue;
            };
            let compatible = closure
                .iter()
                .all(|(path, cls, _)| self.is_compatible(path, cls));
            if !compatible {
                continue;
            }
            match &chosen {
                None => {
                    let path = store.parse_path(&candidate.path)?;
                    chosen = Some((path, closure));
                }
                Some((first, _)) => {
                    debug!(
                        "realization of {class} is ambiguous: {first} vs {}",
                        candidate.path
                    );
                    return Ok(Fetch::Ambiguous);
                }
            }
        }

        let Some((path, closure)) = chosen else {
            return Ok(Fetch::NotFound);
        };

        for (closure_path, closure_class, present) in closure {
            if !closure_class.is_zero() {
                self.map
                    .entry(closure_class)
                    .or_insert(CachedRealization {
                        path: closure_path,
                        absent: !present,
                    });
            }
        }
        let path_present = store
            .with_db({
                let full = store.dir().display_path(&path);
                move |db| Ok(db.is_valid_object(&full)?)
            })
            .await?;
        self.map.insert(
            class.clone(),
            CachedRealization {
                path: path.clone(),
                absent: !path_present,
            },
        );
        Ok(Fetch::Hit(path))
    }

    /// Load a candidate's recorded closure as `(path, class, present)`
    /// triples, or `None` when a row cannot be interpreted.
    async fn closure_of(
        &self,
        store: &Store,
        candidate: &RealizationCandidate,
        class: &EquivalenceClass,
    ) -> Result<Option<Vec<(StorePath, EquivalenceClass, bool)>>> {
        let output_name = class
            .output_name()
            .expect("non-zero class has an output name")
            .as_str()
            .to_owned();
        let candidate_path = candidate.path.clone();
        let rows = store
            .with_db(move |db| {
                let rows = db.reference_class_rows(&candidate_path, &output_name)?;
                let mut out = Vec::with_capacity(rows.len());
                for row in rows {
                    let present = db.is_valid_object(&row.reference_path)?;
                    out.push((row, present));
                }
                Ok(out)
            })
            .await?;

        let mut closure = Vec::with_capacity(rows.len());
        for (row, present) in rows {
            let path = store.parse_path(&row.reference_path)?;
            let cls = match (&row.drv_hash, &row.output_name) {
                (None, _) | (_, None) => EquivalenceClass::zero(),
                (Some(hash_row), Some(output)) => {
                    if hash_row.algo != DrvHash::ALGORITHM {
                        return Ok(None);
                    }
                    let Some(hash) = DrvHash::from_bytes(&hash_row.bits) else {
                        return Ok(None);
                    };
                    let output: OutputName = output
                        .parse()
                        .map_err(|e| ServerError::internal(format!("bad output name: {e}")))?;
                    EquivalenceClass::new(hash, output)
                }
            };
            closure.push((path, cls, present));
        }
        Ok(Some(closure))
    }

    /// Fetch realizations for all `classes`, requiring every one to be
    /// present in the store. Rolls the whole cache back on any miss.
    pub async fn fetch_realization_set(
        &mut self,
        store: &Store,
        classes: &[(OutputName, EquivalenceClass)],
    ) -> Result<Option<BTreeMap<OutputName, StorePath>>> {
        let snapshot = self.map.clone();
        let mut result = BTreeMap::new();
        for (output, class) in classes {
            match self.fetch_realization(store, class, true).await {
                Ok(Fetch::Hit(path)) => {
                    result.insert(output.clone(), path);
                }
                Ok(Fetch::NotFound | Fetch::Ambiguous) => {
                    self.map = snapshot;
                    return Ok(None);
                }
                Err(e) => {
                    self.map = snapshot;
                    return Err(e);
                }
            }
        }
        Ok(Some(result))
    }
}
