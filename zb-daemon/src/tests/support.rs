// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Shared test harness: a store rooted in a temporary directory, with
//! helpers to import objects and write derivation files through the same
//! code paths production uses.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use zb_store_core::content_address::{ContentAddress, PathRefs, fixed_ca_output_path};
use zb_store_core::derivation::{Derivation, DerivationOutput, OutputName};
use zb_store_core::store_path::{StoreDir, StorePath};
use zb_utils_hash::{Algorithm, Sha256};

use crate::build::{BuildSettings, Builder};
use crate::build_log::BuildLogStore;
use crate::build_users::UserPool;
use crate::error::Result;
use crate::export::Trailer;
use crate::mutex_map::MutexMap;
use crate::receiver::Receiver;
use crate::runner::{RunLimits, host_system};
use crate::store::Store;

pub struct TestEnv {
    pub store: Store,
    pub builder: Builder,
    pub logs: BuildLogStore,
    pub ctx: CancellationToken,
    // Held for its Drop.
    _root: TempDir,
}

pub fn test_env() -> TestEnv {
    let root = TempDir::new().unwrap();
    let store_path = root.path().join("store");
    std::fs::create_dir_all(&store_path).unwrap();

    let dir = StoreDir::new(store_path.to_string_lossy().to_string()).unwrap();
    let db = zb_store_db::StoreDb::open_memory().unwrap();
    let store = Store::new(dir, store_path, db);

    let logs = BuildLogStore::new(root.path().join("logs"));
    let builder = Builder {
        store: store.clone(),
        building: Arc::new(MutexMap::new()),
        users: UserPool::new(&[]).unwrap(),
        logs: logs.clone(),
        settings: BuildSettings {
            build_dir: root.path().join("build"),
            cores: 1,
            sandbox_paths: vec![PathBuf::from("/bin"), PathBuf::from("/usr/bin")],
            allow_keep_failed: true,
            limits: RunLimits::default(),
        },
    };

    TestEnv {
        store,
        builder,
        logs,
        ctx: CancellationToken::new(),
        _root: root,
    }
}

impl TestEnv {
    /// Serialize `content` as a single file and return its archive bytes.
    pub fn nar_of_file(&self, content: &[u8]) -> Vec<u8> {
        let scratch = TempDir::new().unwrap();
        let file = scratch.path().join("payload");
        std::fs::write(&file, content).unwrap();
        let mut nar = Vec::new();
        zb_nar::dump(&mut nar, &file).unwrap();
        nar
    }

    /// Import a single-file object with a flat content address, the way a
    /// client would push it.
    pub async fn import_flat_file(&self, name: &str, content: &[u8]) -> Result<StorePath> {
        let ca = ContentAddress::Flat(Algorithm::SHA256.digest(content));
        let path = fixed_ca_output_path(
            self.store.dir(),
            &name.parse().unwrap(),
            &ca,
            &PathRefs::none(),
        )
        .unwrap();
        self.import_bytes(&path, &self.nar_of_file(content), &[], Some(ca))
            .await?;
        Ok(path)
    }

    /// Import a single-file source object (source content address, with
    /// references). The trailer carries a zero content address, so the
    /// receiving side computes it.
    pub async fn import_source_file(
        &self,
        name: &str,
        content: &[u8],
        references: &[StorePath],
    ) -> Result<StorePath> {
        let nar = self.nar_of_file(content);
        let result = zb_nar::source_ca(&nar[..], zb_nar::SourceCaOptions::default()).unwrap();
        let refs = PathRefs {
            self_ref: false,
            others: references.iter().cloned().collect(),
        };
        let path =
            fixed_ca_output_path(self.store.dir(), &name.parse().unwrap(), &result.ca, &refs)
                .unwrap();
        self.import_bytes(&path, &nar, references, None).await?;
        Ok(path)
    }

    /// Push one `(archive bytes, trailer)` pair through a receiver.
    pub async fn import_bytes(
        &self,
        path: &StorePath,
        nar: &[u8],
        references: &[StorePath],
        ca: Option<ContentAddress>,
    ) -> Result<()> {
        let mut receiver = Receiver::new(self.store.clone());
        receiver.write_all(nar).unwrap();
        let trailer = Trailer {
            store_path: self.store.dir().display_path(path),
            references: references
                .iter()
                .map(|r| self.store.dir().display_path(r))
                .collect(),
            deriver: None,
            ca,
        };
        receiver.commit(&self.ctx, &trailer).await
    }

    /// Write a derivation into the store as a text object referencing its
    /// inputs, and return its store path.
    pub async fn write_drv(&self, drv: &Derivation) -> Result<StorePath> {
        let contents = zb_store_core::aterm::unparse(self.store.dir(), drv).unwrap();
        let ca = ContentAddress::Text(Sha256::digest(contents.as_bytes()));

        let mut references: BTreeSet<StorePath> = drv.input_sources.clone();
        references.extend(drv.input_derivations.keys().cloned());
        let refs = PathRefs {
            self_ref: false,
            others: references.clone(),
        };

        let drv_name = format!("{}{}", drv.name, zb_store_core::derivation::DRV_EXTENSION);
        let path = fixed_ca_output_path(
            self.store.dir(),
            &drv_name.parse().unwrap(),
            &ca,
            &refs,
        )
        .unwrap();

        let references: Vec<StorePath> = references.into_iter().collect();
        self.import_bytes(
            &path,
            &self.nar_of_file(contents.as_bytes()),
            &references,
            Some(ca),
        )
        .await?;
        Ok(path)
    }

    /// Create a build row and realize the given derivations.
    pub async fn realize(&self, want: &[StorePath]) -> (String, Result<()>) {
        let build_id = format!("test{:08x}", rand_u32());
        let id = build_id.clone();
        self.store
            .with_db(move |db| Ok(db.create_build(&id, SystemTime::now())?))
            .await
            .unwrap();
        let result = self
            .builder
            .realize(&build_id, want, false, true, &self.ctx)
            .await;
        let id = build_id.clone();
        let status = match &result {
            Ok(()) => "success",
            Err(e) => crate::build::BuildStatus::for_error(e).as_str(),
        };
        let status = status.to_owned();
        self.store
            .with_db(move |db| Ok(db.finish_build(&id, &status, SystemTime::now())?))
            .await
            .unwrap();
        (build_id, result)
    }

    /// The invariant audit: database object rows and store directory
    /// entries must agree exactly.
    pub async fn audit_store(&self) {
        let rows = self
            .store
            .with_db(|db| Ok(db.all_object_paths()?))
            .await
            .unwrap();
        let db_names: BTreeSet<String> = rows
            .iter()
            .map(|full| full.rsplit('/').next().unwrap().to_owned())
            .collect();

        let mut fs_names = BTreeSet::new();
        for entry in std::fs::read_dir(self.store.real_dir()).unwrap() {
            let name = entry.unwrap().file_name().to_string_lossy().into_owned();
            // Only store-object-shaped names participate; scratch files do
            // not belong in the store directory at all.
            if name.parse::<StorePath>().is_ok() {
                fs_names.insert(name);
            }
        }
        assert_eq!(db_names, fs_names, "database and store directory disagree");
    }
}

fn rand_u32() -> u32 {
    let mut bytes = [0u8; 4];
    getrandom::fill(&mut bytes).unwrap();
    u32::from_le_bytes(bytes)
}

/// A minimal floating derivation running `/bin/sh -c <script>`.
pub fn floating_drv(name: &str, script: &str) -> Derivation {
    Derivation {
        name: name.parse().unwrap(),
        system: host_system(),
        builder: "/bin/sh".to_owned(),
        args: vec!["-c".to_owned(), script.to_owned()],
        env: BTreeMap::from([(
            "out".to_owned(),
            zb_store_core::placeholder::hash_placeholder(&OutputName::out()),
        )]),
        input_sources: BTreeSet::new(),
        input_derivations: BTreeMap::new(),
        outputs: BTreeMap::from([(OutputName::out(), DerivationOutput::floating())]),
    }
}

/// A fixed-output derivation running `/bin/sh -c <script>`.
pub fn fixed_drv(name: &str, script: &str, ca: ContentAddress) -> Derivation {
    let mut drv = floating_drv(name, script);
    drv.outputs = BTreeMap::from([(OutputName::out(), DerivationOutput::Fixed(ca))]);
    drv
}
