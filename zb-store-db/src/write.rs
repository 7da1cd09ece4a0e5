// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Write operations for the store database.
//!
//! Every multi-statement write runs in an immediate transaction; the
//! deletion pre-pass uses a savepoint so it sees a consistent view.

use std::collections::{BTreeMap, BTreeSet};
use std::time::SystemTime;

use rusqlite::{TransactionBehavior, params};
use tracing::debug;

use crate::connection::StoreDb;
use crate::error::{Error, Result};
use crate::types::{ObjectInfo, ReferenceClassInsert, system_time_to_unix};

fn intern_path(tx: &rusqlite::Transaction<'_>, path: &str) -> Result<i64> {
    tx.execute(
        "INSERT OR IGNORE INTO paths (path) VALUES (?1)",
        params![path],
    )?;
    let id = tx.query_row(
        "SELECT id FROM paths WHERE path = ?1",
        params![path],
        |row| row.get(0),
    )?;
    Ok(id)
}

impl StoreDb {
    /// Insert a new object row with its references.
    ///
    /// If a row already exists, returns [`Error::ObjectExists`] when the
    /// stored metadata matches (idempotent registration) and
    /// [`Error::MismatchesExistingData`] otherwise. Every reference must
    /// already have an object row, except a self-reference.
    pub fn insert_object(&mut self, info: &ObjectInfo) -> Result<i64> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let path_id = intern_path(&tx, &info.path)?;

        let existing: Option<(i64, String, String)> = tx
            .query_row(
                "SELECT nar_size, nar_hash, ca FROM objects WHERE path_id = ?1",
                params![path_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })?;

        if let Some((nar_size, nar_hash, ca)) = existing {
            let mut refs = BTreeSet::new();
            let mut stmt = tx.prepare(
                "SELECT p.path FROM refs r JOIN paths p ON r.reference_id = p.id WHERE r.referrer_id = ?1",
            )?;
            let mut rows = stmt.query(params![path_id])?;
            while let Some(row) = rows.next()? {
                refs.insert(row.get::<_, String>(0)?);
            }
            drop(rows);
            drop(stmt);

            return if nar_size as u64 == info.nar_size
                && nar_hash == info.nar_hash
                && ca == info.ca
                && refs == info.references
            {
                Err(Error::ObjectExists(info.path.clone()))
            } else {
                Err(Error::MismatchesExistingData(info.path.clone()))
            };
        }

        tx.execute(
            "INSERT INTO objects (path_id, nar_size, nar_hash, ca) VALUES (?1, ?2, ?3, ?4)",
            params![path_id, info.nar_size as i64, info.nar_hash, info.ca],
        )?;

        for reference in &info.references {
            let reference_id = if reference == &info.path {
                path_id
            } else {
                let id: Option<i64> = tx
                    .query_row(
                        r#"
                        SELECT p.id FROM objects o JOIN paths p ON o.path_id = p.id
                        WHERE p.path = ?1
                        "#,
                        params![reference],
                        |row| row.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        e => Err(e),
                    })?;
                id.ok_or_else(|| Error::MissingObject(reference.clone()))?
            };
            tx.execute(
                "INSERT INTO refs (referrer_id, reference_id) VALUES (?1, ?2)",
                params![path_id, reference_id],
            )?;
        }

        tx.commit()?;
        debug!("registered object {}", info.path);
        Ok(path_id)
    }

    /// Materialize the doomed set for a deletion: the targets plus (when
    /// `recursive`) their transitive referrers, ordered so every object
    /// precedes the objects it references.
    ///
    /// Fails with [`Error::HasReferrers`] if reverse dependencies exist and
    /// `recursive` is false, and with [`Error::MissingReferencedObjects`]
    /// if the set cannot be ordered by its reference edges.
    pub fn collect_doomed(&mut self, targets: &[String], recursive: bool) -> Result<Vec<String>> {
        let sp = self.conn.savepoint()?;

        // Targets must all be objects.
        for target in targets {
            let exists: bool = sp.query_row(
                "SELECT exists (SELECT 1 FROM objects o JOIN paths p ON o.path_id = p.id WHERE p.path = ?1)",
                params![target],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(Error::ObjectNotExist(target.clone()));
            }
        }
        drop(sp);

        let referrers = self.referrers_closure(targets)?;
        let target_set: BTreeSet<String> = targets.iter().cloned().collect();
        let extra: BTreeSet<String> = referrers.difference(&target_set).cloned().collect();
        if !extra.is_empty() && !recursive {
            return Err(Error::HasReferrers { referrers: extra });
        }

        let mut doomed: BTreeSet<String> = target_set;
        doomed.extend(extra);

        // Reverse-topological order by references: delete referrers before
        // the objects they reference. Self-references are ignored.
        let mut blockers: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for path in &doomed {
            let entry = blockers.entry(path.clone()).or_default();
            for referrer in self.object_referrers(path)? {
                if referrer != *path && doomed.contains(&referrer) {
                    entry.insert(referrer);
                }
            }
        }

        let mut order = Vec::with_capacity(doomed.len());
        let mut remaining = doomed;
        while !remaining.is_empty() {
            let ready: Vec<String> = remaining
                .iter()
                .filter(|p| blockers.get(*p).is_none_or(|b| b.is_empty()))
                .cloned()
                .collect();
            if ready.is_empty() {
                return Err(Error::MissingReferencedObjects);
            }
            for path in ready {
                remaining.remove(&path);
                order.push(path.clone());
                for b in blockers.values_mut() {
                    b.remove(&path);
                }
            }
        }
        Ok(order)
    }

    /// Delete the doomed objects' `refs` and `objects` rows in one
    /// immediate transaction. The set is re-verified inside the
    /// transaction: each object must still exist and must have no live
    /// referrer outside the doomed set.
    pub fn delete_doomed(&mut self, doomed: &[String]) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let doomed_set: BTreeSet<&str> = doomed.iter().map(String::as_str).collect();
        let mut ids = Vec::with_capacity(doomed.len());
        for path in doomed {
            let id: Option<i64> = tx
                .query_row(
                    "SELECT o.path_id FROM objects o JOIN paths p ON o.path_id = p.id WHERE p.path = ?1",
                    params![path],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    e => Err(e),
                })?;
            let id = id.ok_or_else(|| Error::ObjectNotExist(path.clone()))?;

            let mut stmt = tx.prepare_cached(
                "SELECT p.path FROM refs r JOIN paths p ON r.referrer_id = p.id WHERE r.reference_id = ?1",
            )?;
            let mut rows = stmt.query(params![id])?;
            while let Some(row) = rows.next()? {
                let referrer: String = row.get(0)?;
                if !doomed_set.contains(referrer.as_str()) {
                    return Err(Error::HasReferrers {
                        referrers: BTreeSet::from([referrer]),
                    });
                }
            }
            ids.push(id);
        }

        for id in &ids {
            tx.execute("DELETE FROM refs WHERE referrer_id = ?1", params![id])?;
        }
        for id in &ids {
            tx.execute("DELETE FROM objects WHERE path_id = ?1", params![id])?;
        }

        tx.commit()?;
        debug!("deleted {} object(s)", doomed.len());
        Ok(())
    }

    /// Record a realization and its closure rows in one immediate
    /// transaction. Idempotent: duplicate rows are ignored.
    pub fn record_realization(
        &mut self,
        algo: &str,
        bits: &[u8],
        output_name: &str,
        output_path: &str,
        closure: &[ReferenceClassInsert],
    ) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let drv_hash_id = intern_drv_hash(&tx, algo, bits)?;
        let output_path_id = intern_path(&tx, output_path)?;

        tx.execute(
            r#"
            INSERT OR IGNORE INTO realizations (drv_hash_id, output_name, output_path_id)
            VALUES (?1, ?2, ?3)
            "#,
            params![drv_hash_id, output_name, output_path_id],
        )?;

        for row in closure {
            let reference_path_id = intern_path(&tx, &row.reference_path)?;
            let reference_drv_hash_id = match &row.drv_hash {
                Some(h) => Some(intern_drv_hash(&tx, &h.algo, &h.bits)?),
                None => None,
            };
            tx.execute(
                r#"
                INSERT OR IGNORE INTO reference_classes
                    (referrer_path_id, referrer_output_name, reference_path_id,
                     reference_drv_hash_id, reference_output_name)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    output_path_id,
                    output_name,
                    reference_path_id,
                    reference_drv_hash_id,
                    row.output_name,
                ],
            )?;
        }

        tx.commit()?;
        debug!("recorded realization {output_path} for {output_name}");
        Ok(())
    }

    /// Create a build row in `active` state.
    pub fn create_build(&self, build_id: &str, started_at: SystemTime) -> Result<()> {
        self.conn.execute(
            "INSERT INTO builds (id, started_at, status) VALUES (?1, ?2, 'active')",
            params![build_id, system_time_to_unix(started_at)],
        )?;
        Ok(())
    }

    /// Transition a build to a terminal status.
    pub fn finish_build(&self, build_id: &str, status: &str, ended_at: SystemTime) -> Result<()> {
        self.conn.execute(
            "UPDATE builds SET status = ?2, ended_at = ?3 WHERE id = ?1",
            params![build_id, status, system_time_to_unix(ended_at)],
        )?;
        Ok(())
    }

    /// Insert a pending build result row for one derivation.
    pub fn insert_build_result(&self, build_id: &str, drv_path: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO build_results (build_id, drv_path, status) VALUES (?1, ?2, 'active')",
            params![build_id, drv_path],
        )?;
        Ok(())
    }

    /// Finalize a build result row with a terminal status.
    pub fn finalize_build_result(
        &self,
        build_id: &str,
        drv_path: &str,
        status: &str,
        output_paths: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE build_results SET status = ?3, output_paths = ?4, error = ?5
            WHERE build_id = ?1 AND drv_path = ?2
            "#,
            params![build_id, drv_path, status, output_paths, error],
        )?;
        Ok(())
    }
}

fn intern_drv_hash(tx: &rusqlite::Transaction<'_>, algo: &str, bits: &[u8]) -> Result<i64> {
    tx.execute(
        "INSERT OR IGNORE INTO drv_hashes (algo, bits) VALUES (?1, ?2)",
        params![algo, bits],
    )?;
    let id = tx.query_row(
        "SELECT id FROM drv_hashes WHERE algo = ?1 AND bits = ?2",
        params![algo, bits],
        |row| row.get(0),
    )?;
    Ok(id)
}
