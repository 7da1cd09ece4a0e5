// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! End-to-end exercises of the store database against a real SQLite file.

use std::collections::BTreeSet;
use std::time::SystemTime;

use zb_store_db::{
    Error, ObjectInfo, OpenMode, ReferenceClassInsert, StoreDb,
};

fn object(path: &str, refs: &[&str]) -> ObjectInfo {
    ObjectInfo {
        path: path.to_owned(),
        nar_size: 128,
        nar_hash: "sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s".to_owned(),
        ca: "source:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s".to_owned(),
        references: refs.iter().map(|s| s.to_string()).collect(),
    }
}

const A: &str = "/zb/store/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-a";
const B: &str = "/zb/store/bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-b";
const C: &str = "/zb/store/cccccccccccccccccccccccccccccccc-c";

#[test]
fn test_open_create_and_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let db_path = dir.path().join("store.sqlite");

    {
        let mut db = StoreDb::open(&db_path, OpenMode::Create).unwrap();
        assert!(db.has_schema().unwrap());
        db.insert_object(&object(A, &[])).unwrap();
    }

    let db = StoreDb::open(&db_path, OpenMode::ReadOnly).unwrap();
    assert!(db.is_valid_object(A).unwrap());
    assert!(!db.is_valid_object(B).unwrap());
}

#[test]
fn test_insert_is_idempotent_when_matching() {
    let mut db = StoreDb::open_memory().unwrap();
    db.insert_object(&object(A, &[])).unwrap();

    // Same metadata: ObjectExists, which callers upgrade to success.
    match db.insert_object(&object(A, &[])) {
        Err(Error::ObjectExists(path)) => assert_eq!(path, A),
        other => panic!("expected ObjectExists, got {other:?}"),
    }

    // Different metadata: mismatch.
    let mut changed = object(A, &[]);
    changed.nar_size = 999;
    match db.insert_object(&changed) {
        Err(Error::MismatchesExistingData(path)) => assert_eq!(path, A),
        other => panic!("expected MismatchesExistingData, got {other:?}"),
    }
}

#[test]
fn test_references_require_objects() {
    let mut db = StoreDb::open_memory().unwrap();
    match db.insert_object(&object(B, &[A])) {
        Err(Error::MissingObject(path)) => assert_eq!(path, A),
        other => panic!("expected MissingObject, got {other:?}"),
    }

    // Self-references are allowed without a pre-existing row.
    db.insert_object(&object(A, &[A])).unwrap();
    let info = db.object_info(A).unwrap().unwrap();
    assert_eq!(info.info.references, BTreeSet::from([A.to_owned()]));
}

#[test]
fn test_closure_and_referrers() {
    let mut db = StoreDb::open_memory().unwrap();
    db.insert_object(&object(A, &[])).unwrap();
    db.insert_object(&object(B, &[A])).unwrap();
    db.insert_object(&object(C, &[B])).unwrap();

    let closure = db.closure(&[C.to_owned()]).unwrap();
    assert_eq!(
        closure.keys().cloned().collect::<Vec<_>>(),
        vec![A.to_owned(), B.to_owned(), C.to_owned()]
    );

    assert_eq!(
        db.object_referrers(A).unwrap(),
        BTreeSet::from([B.to_owned()])
    );
    assert_eq!(
        db.referrers_closure(&[A.to_owned()]).unwrap(),
        BTreeSet::from([B.to_owned(), C.to_owned()])
    );
}

#[test]
fn test_delete_ordering_and_referrer_guard() {
    let mut db = StoreDb::open_memory().unwrap();
    db.insert_object(&object(A, &[])).unwrap();
    db.insert_object(&object(B, &[A])).unwrap();

    // Non-recursive delete of A is blocked by B.
    match db.collect_doomed(&[A.to_owned()], false) {
        Err(Error::HasReferrers { referrers }) => {
            assert_eq!(referrers, BTreeSet::from([B.to_owned()]));
        }
        other => panic!("expected HasReferrers, got {other:?}"),
    }

    // Recursive delete orders B (the referrer) before A.
    let doomed = db.collect_doomed(&[A.to_owned()], true).unwrap();
    assert_eq!(doomed, vec![B.to_owned(), A.to_owned()]);

    db.delete_doomed(&doomed).unwrap();
    assert!(!db.is_valid_object(A).unwrap());
    assert!(!db.is_valid_object(B).unwrap());
    assert!(db.all_object_paths().unwrap().is_empty());
}

#[test]
fn test_delete_self_reference() {
    let mut db = StoreDb::open_memory().unwrap();
    db.insert_object(&object(A, &[A])).unwrap();
    let doomed = db.collect_doomed(&[A.to_owned()], false).unwrap();
    assert_eq!(doomed, vec![A.to_owned()]);
    db.delete_doomed(&doomed).unwrap();
    assert!(!db.is_valid_object(A).unwrap());
}

#[test]
fn test_realizations_survive_object_deletion() {
    let mut db = StoreDb::open_memory().unwrap();
    db.insert_object(&object(A, &[])).unwrap();

    let bits = [7u8; 32];
    db.record_realization(
        "sha256",
        &bits,
        "out",
        A,
        &[ReferenceClassInsert {
            reference_path: A.to_owned(),
            drv_hash: Some(zb_store_db::DrvHashRow {
                algo: "sha256".to_owned(),
                bits: bits.to_vec(),
            }),
            output_name: Some("out".to_owned()),
        }],
    )
    .unwrap();

    let candidates = db.realization_candidates("sha256", &bits, "out").unwrap();
    assert_eq!(candidates.len(), 1);
    assert!(candidates[0].present);

    let rows = db.reference_class_rows(A, "out").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].reference_path, A);
    assert!(rows[0].drv_hash.is_some());

    // Recording the same realization twice is a no-op.
    db.record_realization("sha256", &bits, "out", A, &[]).unwrap();
    assert_eq!(
        db.realization_candidates("sha256", &bits, "out")
            .unwrap()
            .len(),
        1
    );

    // Deleting the object keeps the realization but flips `present`.
    let doomed = db.collect_doomed(&[A.to_owned()], false).unwrap();
    db.delete_doomed(&doomed).unwrap();
    let candidates = db.realization_candidates("sha256", &bits, "out").unwrap();
    assert_eq!(candidates.len(), 1);
    assert!(!candidates[0].present);
}

#[test]
fn test_build_lifecycle() {
    let db = StoreDb::open_memory().unwrap();
    let now = SystemTime::now();
    db.create_build("ab12", now).unwrap();
    db.insert_build_result("ab12", "/zb/store/x.drv").unwrap();

    let build = db.get_build("ab12").unwrap().unwrap();
    assert_eq!(build.status, "active");
    assert!(build.ended_at.is_none());

    let result = db
        .get_build_result("ab12", "/zb/store/x.drv")
        .unwrap()
        .unwrap();
    assert_eq!(result.status, "active");

    db.finalize_build_result(
        "ab12",
        "/zb/store/x.drv",
        "success",
        Some(r#"{"out":"/zb/store/y"}"#),
        None,
    )
    .unwrap();
    db.finish_build("ab12", "success", now).unwrap();

    let build = db.get_build("ab12").unwrap().unwrap();
    assert_eq!(build.status, "success");
    assert!(build.ended_at.is_some());
    assert_eq!(db.build_results("ab12").unwrap().len(), 1);
}
