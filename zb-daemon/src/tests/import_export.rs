// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Export stream properties and the export → import round trip.

#![cfg(unix)]

use std::collections::BTreeSet;
use std::io::Read;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use zb_store_core::store_path::{StoreDir, StorePath};

use crate::export;
use crate::receiver;
use crate::store::Store;
use crate::tests::support::test_env;

/// A store with a fixed logical directory, so exports from one can be
/// imported into another.
fn shared_dir_store(root: &TempDir, name: &str) -> Store {
    let real = root.path().join(name);
    std::fs::create_dir_all(&real).unwrap();
    Store::new(
        StoreDir::new("/zb/store").unwrap(),
        real,
        zb_store_db::StoreDb::open_memory().unwrap(),
    )
}

async fn import_chain(store: &Store) -> Vec<StorePath> {
    let ctx = CancellationToken::new();
    let mut paths = Vec::new();
    let mut previous: Option<StorePath> = None;
    for name in ["a.txt", "b.txt", "c.txt"] {
        let content = match &previous {
            None => format!("{name}: base\n"),
            Some(previous) => {
                format!("{name}: see {}\n", store.dir().display_path(previous))
            }
        };

        let scratch = TempDir::new().unwrap();
        let file = scratch.path().join("payload");
        std::fs::write(&file, &content).unwrap();
        let mut nar = Vec::new();
        zb_nar::dump(&mut nar, &file).unwrap();

        let scan = zb_nar::source_ca(&nar[..], zb_nar::SourceCaOptions::default()).unwrap();
        let refs = zb_store_core::content_address::PathRefs {
            self_ref: false,
            others: previous.iter().cloned().collect(),
        };
        let path = zb_store_core::content_address::fixed_ca_output_path(
            store.dir(),
            &name.parse().unwrap(),
            &scan.ca,
            &refs,
        )
        .unwrap();

        let mut rx = receiver::Receiver::new(store.clone());
        std::io::Write::write_all(&mut rx, &nar).unwrap();
        rx.commit(
            &ctx,
            &export::Trailer {
                store_path: store.dir().display_path(&path),
                references: previous
                    .iter()
                    .map(|p| store.dir().display_path(p))
                    .collect(),
                deriver: None,
                ca: Some(scan.ca),
            },
        )
        .await
        .unwrap();

        previous = Some(path.clone());
        paths.push(path);
    }
    paths
}

/// Decode an export stream into `(nar bytes, trailer)` records.
fn decode_stream(mut r: &[u8]) -> Vec<(Vec<u8>, export::Trailer)> {
    struct Ignore;
    impl zb_nar::NarSink for Ignore {
        fn file(
            &mut self,
            _p: &std::path::Path,
            _x: bool,
            _s: u64,
            _o: u64,
            _c: &mut dyn Read,
        ) -> std::io::Result<()> {
            Ok(())
        }
        fn directory(&mut self, _p: &std::path::Path) -> std::io::Result<()> {
            Ok(())
        }
        fn symlink(&mut self, _p: &std::path::Path, _t: &[u8], _o: u64) -> std::io::Result<()> {
            Ok(())
        }
    }

    let mut records = Vec::new();
    while export::read_continue(&mut r).unwrap() {
        // The archive is self-delimiting; split it off by parsing a copy
        // of the slice.
        let consumed = {
            let mut probe = r;
            zb_nar::parse(&mut probe, &mut Ignore).unwrap()
        };
        let nar = r[..consumed as usize].to_vec();
        r = &r[consumed as usize..];
        let trailer = export::read_trailer(&mut r).unwrap();
        records.push((nar, trailer));
    }
    records
}

/// Closure export emits every object after all of its non-self
/// references.
#[tokio::test(flavor = "multi_thread")]
async fn export_closure_topological_order() {
    let root = TempDir::new().unwrap();
    let store = shared_dir_store(&root, "store1");
    let paths = import_chain(&store).await;
    let c = paths.last().unwrap().clone();

    let mut stream = Vec::new();
    {
        let store = store.clone();
        let c = c.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = Vec::new();
            store.export_blocking(&[c], false, &mut buf).map(|_| buf)
        })
        .await
        .unwrap()
        .map(|buf| stream = buf)
        .unwrap();
    }

    let records = decode_stream(&stream);
    assert_eq!(records.len(), 3);

    let mut seen: BTreeSet<String> = BTreeSet::new();
    for (_, trailer) in &records {
        for reference in &trailer.references {
            if *reference != trailer.store_path {
                assert!(
                    seen.contains(reference),
                    "{} emitted before its reference {reference}",
                    trailer.store_path
                );
            }
        }
        seen.insert(trailer.store_path.clone());
    }
}

/// `excludeReferences` exports exactly the requested paths, in order.
#[tokio::test(flavor = "multi_thread")]
async fn export_exclude_references() {
    let root = TempDir::new().unwrap();
    let store = shared_dir_store(&root, "store1");
    let paths = import_chain(&store).await;
    let c = paths.last().unwrap().clone();

    let stream = {
        let store = store.clone();
        let c = c.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = Vec::new();
            store.export_blocking(&[c], true, &mut buf).map(|_| buf)
        })
        .await
        .unwrap()
        .unwrap()
    };

    let records = decode_stream(&stream);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].1.store_path, store.dir().display_path(&c));
}

/// Exported closures import losslessly into a second store.
#[tokio::test(flavor = "multi_thread")]
async fn export_import_roundtrip() {
    let root = TempDir::new().unwrap();
    let source = shared_dir_store(&root, "store1");
    let target = shared_dir_store(&root, "store2");
    let paths = import_chain(&source).await;
    let c = paths.last().unwrap().clone();

    let stream = {
        let source = source.clone();
        let c = c.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = Vec::new();
            source.export_blocking(&[c], false, &mut buf).map(|_| buf)
        })
        .await
        .unwrap()
        .unwrap()
    };

    let ctx = CancellationToken::new();
    let imported = receiver::import(target.clone(), std::io::Cursor::new(stream), &ctx)
        .await
        .unwrap();
    assert_eq!(imported, 3);

    for path in &paths {
        let original = source.info(path).await.unwrap().unwrap();
        let copied = target.info(path).await.unwrap().unwrap();
        assert_eq!(original, copied);
        assert!(target.exists(&ctx, path).await.unwrap());
    }
}

/// Objects addressed to a foreign store directory are skipped silently.
#[tokio::test(flavor = "multi_thread")]
async fn foreign_store_objects_skipped() {
    let env = test_env();
    let mut rx = receiver::Receiver::new(env.store.clone());
    let nar = env.nar_of_file(b"foreign\n");
    std::io::Write::write_all(&mut rx, &nar).unwrap();
    rx.commit(
        &env.ctx,
        &export::Trailer {
            store_path: "/some/other/store/ac8da0sqpg4pyhzyr0qgl26d5dnpn7qp-x".to_owned(),
            references: vec![],
            deriver: None,
            ca: None,
        },
    )
    .await
    .unwrap();
    env.audit_store().await;
}
