// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Read query operations for the store database.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use rusqlite::params;

use crate::connection::StoreDb;
use crate::error::Result;
use crate::types::{
    BuildResultRow, BuildRow, DrvHashRow, ObjectInfo, ObjectRow, RealizationCandidate,
    ReferenceClassRow, unix_to_system_time,
};

impl StoreDb {
    /// Look up the interned id of a path string.
    pub fn path_id(&self, path: &str) -> Result<Option<i64>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id FROM paths WHERE path = ?1")?;
        match stmt.query_row(params![path], |row| row.get(0)) {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Query object metadata by full store path.
    ///
    /// Returns `None` if no object row exists.
    pub fn object_info(&self, path: &str) -> Result<Option<ObjectRow>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT p.id, p.path, o.nar_size, o.nar_hash, o.ca
            FROM objects o
            JOIN paths p ON o.path_id = p.id
            WHERE p.path = ?1
            "#,
        )?;

        let row = stmt.query_row(params![path], |row| {
            Ok(ObjectRow {
                id: row.get(0)?,
                info: ObjectInfo {
                    path: row.get(1)?,
                    nar_size: row.get::<_, i64>(2)? as u64,
                    nar_hash: row.get(3)?,
                    ca: row.get(4)?,
                    references: BTreeSet::new(),
                },
            })
        });

        match row {
            Ok(mut row) => {
                row.info.references = self.object_references_by_id(row.id)?;
                Ok(Some(row))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Check if an object row exists for a path.
    pub fn is_valid_object(&self, path: &str) -> Result<bool> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT 1 FROM objects o JOIN paths p ON o.path_id = p.id
            WHERE p.path = ?1 LIMIT 1
            "#,
        )?;
        let exists = stmt.query_row(params![path], |_| Ok(())).is_ok();
        Ok(exists)
    }

    /// Get all paths referenced by a given path.
    pub fn object_references(&self, path: &str) -> Result<BTreeSet<String>> {
        match self.path_id(path)? {
            Some(id) => self.object_references_by_id(id),
            None => Ok(BTreeSet::new()),
        }
    }

    pub(crate) fn object_references_by_id(&self, id: i64) -> Result<BTreeSet<String>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT p.path
            FROM refs r
            JOIN paths p ON r.reference_id = p.id
            WHERE r.referrer_id = ?1
            "#,
        )?;

        let mut refs = BTreeSet::new();
        let mut rows = stmt.query(params![id])?;
        while let Some(row) = rows.next()? {
            refs.insert(row.get(0)?);
        }
        Ok(refs)
    }

    /// Get all paths that reference a given path (reverse dependencies).
    pub fn object_referrers(&self, path: &str) -> Result<BTreeSet<String>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT p.path
            FROM refs r
            JOIN paths p ON r.referrer_id = p.id
            WHERE r.reference_id = (SELECT id FROM paths WHERE path = ?1)
            "#,
        )?;

        let mut refs = BTreeSet::new();
        let mut rows = stmt.query(params![path])?;
        while let Some(row) = rows.next()? {
            refs.insert(row.get(0)?);
        }
        Ok(refs)
    }

    /// Compute the transitive reference closure of the given paths.
    ///
    /// Returns metadata for every reachable object, keyed by path.
    pub fn closure(&self, roots: &[String]) -> Result<BTreeMap<String, ObjectRow>> {
        let mut result: BTreeMap<String, ObjectRow> = BTreeMap::new();
        let mut queue: VecDeque<String> = roots.iter().cloned().collect();
        while let Some(path) = queue.pop_front() {
            if result.contains_key(&path) {
                continue;
            }
            let row = self
                .object_info(&path)?
                .ok_or_else(|| crate::error::Error::ObjectNotExist(path.clone()))?;
            for reference in &row.info.references {
                if reference != &path && !result.contains_key(reference) {
                    queue.push_back(reference.clone());
                }
            }
            result.insert(path, row);
        }
        Ok(result)
    }

    /// Compute the transitive referrers closure of the given paths,
    /// excluding the inputs themselves.
    pub fn referrers_closure(&self, roots: &[String]) -> Result<BTreeSet<String>> {
        let root_set: BTreeSet<String> = roots.iter().cloned().collect();
        let mut seen: BTreeSet<String> = root_set.clone();
        let mut result: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<String> = roots.iter().cloned().collect();
        while let Some(path) = queue.pop_front() {
            for referrer in self.object_referrers(&path)? {
                if seen.insert(referrer.clone()) {
                    result.insert(referrer.clone());
                    queue.push_back(referrer);
                }
            }
        }
        Ok(result)
    }

    /// All paths with object rows. Used by store audits.
    pub fn all_object_paths(&self) -> Result<BTreeSet<String>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT p.path FROM objects o JOIN paths p ON o.path_id = p.id",
        )?;
        let mut paths = BTreeSet::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            paths.insert(row.get(0)?);
        }
        Ok(paths)
    }

    /// Candidate output paths recorded for an equivalence class, split by
    /// whether the object is still present in the store. Ordered
    /// lexicographically by path so selection outcomes are reproducible.
    pub fn realization_candidates(
        &self,
        algo: &str,
        bits: &[u8],
        output_name: &str,
    ) -> Result<Vec<RealizationCandidate>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT p.id, p.path,
                   exists (SELECT 1 FROM objects o WHERE o.path_id = p.id)
            FROM realizations r
            JOIN drv_hashes h ON r.drv_hash_id = h.id
            JOIN paths p ON r.output_path_id = p.id
            WHERE h.algo = ?1 AND h.bits = ?2 AND r.output_name = ?3
            ORDER BY p.path
            "#,
        )?;

        let mut candidates = Vec::new();
        let mut rows = stmt.query(params![algo, bits, output_name])?;
        while let Some(row) = rows.next()? {
            candidates.push(RealizationCandidate {
                path_id: row.get(0)?,
                path: row.get(1)?,
                present: row.get(2)?,
            });
        }
        Ok(candidates)
    }

    /// The recorded closure rows of a realization: every transitively
    /// referenced path with the equivalence classes that may have produced
    /// it (`None` drv hash marks a source path).
    pub fn reference_class_rows(
        &self,
        referrer_path: &str,
        output_name: &str,
    ) -> Result<Vec<ReferenceClassRow>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT p.path, h.algo, h.bits, c.reference_output_name
            FROM reference_classes c
            JOIN paths p ON c.reference_path_id = p.id
            LEFT JOIN drv_hashes h ON c.reference_drv_hash_id = h.id
            WHERE c.referrer_path_id = (SELECT id FROM paths WHERE path = ?1)
              AND c.referrer_output_name = ?2
            ORDER BY p.path
            "#,
        )?;

        let mut out = Vec::new();
        let mut rows = stmt.query(params![referrer_path, output_name])?;
        while let Some(row) = rows.next()? {
            let algo: Option<String> = row.get(1)?;
            let bits: Option<Vec<u8>> = row.get(2)?;
            out.push(ReferenceClassRow {
                reference_path: row.get(0)?,
                drv_hash: match (algo, bits) {
                    (Some(algo), Some(bits)) => Some(DrvHashRow { algo, bits }),
                    _ => None,
                },
                output_name: row.get(3)?,
            });
        }
        Ok(out)
    }

    /// Query a build by id.
    pub fn get_build(&self, build_id: &str) -> Result<Option<BuildRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, started_at, ended_at, status FROM builds WHERE id = ?1",
        )?;
        let row = stmt.query_row(params![build_id], |row| {
            Ok(BuildRow {
                id: row.get(0)?,
                started_at: unix_to_system_time(row.get(1)?),
                ended_at: row.get::<_, Option<i64>>(2)?.map(unix_to_system_time),
                status: row.get(3)?,
            })
        });
        match row {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Query one build result row.
    pub fn get_build_result(
        &self,
        build_id: &str,
        drv_path: &str,
    ) -> Result<Option<BuildResultRow>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT build_id, drv_path, status, output_paths, error
            FROM build_results WHERE build_id = ?1 AND drv_path = ?2
            "#,
        )?;
        let row = stmt.query_row(params![build_id, drv_path], |row| {
            Ok(BuildResultRow {
                build_id: row.get(0)?,
                drv_path: row.get(1)?,
                status: row.get(2)?,
                output_paths: row.get(3)?,
                error: row.get(4)?,
            })
        });
        match row {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All result rows of a build.
    pub fn build_results(&self, build_id: &str) -> Result<Vec<BuildResultRow>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT build_id, drv_path, status, output_paths, error
            FROM build_results WHERE build_id = ?1 ORDER BY drv_path
            "#,
        )?;
        let mut out = Vec::new();
        let mut rows = stmt.query(params![build_id])?;
        while let Some(row) = rows.next()? {
            out.push(BuildResultRow {
                build_id: row.get(0)?,
                drv_path: row.get(1)?,
                status: row.get(2)?,
                output_paths: row.get(3)?,
                error: row.get(4)?,
            });
        }
        Ok(out)
    }
}
