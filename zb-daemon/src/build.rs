// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! The builder orchestrator.
//!
//! Realizes a set of desired outputs: walks the dependency graph bottom
//! up, reuses compatible prior realizations where possible (early
//! cutoff), and otherwise expands placeholders, runs the builder, and
//! post-processes outputs into content-addressed store objects.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use zb_nar::SourceCaOptions;
use zb_store_core::content_address::{ContentAddress, PathRefs, fixed_ca_output_path};
use zb_store_core::derivation::{Derivation, DerivationOutput, OutputName};
use zb_store_core::drv_hash::{DrvHash, EquivalenceClass, realization_hash};
use zb_store_core::placeholder::{
    hash_placeholder, output_path_name, temp_output_path, unknown_ca_output_placeholder,
};
use zb_store_core::store_path::StorePath;
use zb_store_db::ReferenceClassInsert;
use zb_utils_hash::NarHash;

use crate::build_log::BuildLogStore;
use crate::build_users::UserPool;
use crate::error::{IoContext, Result, ServerError};
use crate::freeze;
use crate::graph::{self, DependencyGraph, GraphNode};
use crate::mutex_map::MutexMap;
use crate::realizations::RealizationCache;
use crate::references::RefFinder;
use crate::runner::{self, Invocation, RunLimits, RunnerError, RunnerKind};
use crate::store::{ObjectMeta, Store};

/// Build-related server settings.
#[derive(Clone)]
pub struct BuildSettings {
    pub build_dir: PathBuf,
    pub cores: usize,
    pub sandbox_paths: Vec<PathBuf>,
    pub allow_keep_failed: bool,
    pub limits: RunLimits,
}

/// The realization engine. One instance per server; each `realize` call
/// runs one build.
#[derive(Clone)]
pub struct Builder {
    pub store: Store,
    pub building: Arc<MutexMap<StorePath>>,
    pub users: UserPool,
    pub logs: BuildLogStore,
    pub settings: BuildSettings,
}

/// Terminal status of one build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Success,
    Fail,
    Error,
    Cancel,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Success => "success",
            BuildStatus::Fail => "fail",
            BuildStatus::Error => "error",
            BuildStatus::Cancel => "cancel",
        }
    }

    pub fn for_error(err: &ServerError) -> BuildStatus {
        match err {
            ServerError::Cancelled => BuildStatus::Cancel,
            e if e.is_builder_failure() => BuildStatus::Fail,
            _ => BuildStatus::Error,
        }
    }
}

impl Builder {
    /// Realize all outputs of the given derivations.
    ///
    /// With `reuse` disabled, prior realizations are ignored and every
    /// derivation is built.
    pub async fn realize(
        &self,
        build_id: &str,
        want: &[StorePath],
        keep_failed: bool,
        reuse: bool,
        ctx: &CancellationToken,
    ) -> Result<()> {
        let want_outputs: Vec<(StorePath, BTreeSet<OutputName>)> =
            want.iter().map(|p| (p.clone(), BTreeSet::new())).collect();
        let graph = graph::analyze(&self.store, &want_outputs).await?;
        let (_, drv_hashes) = self
            .drive(build_id, &graph, None, keep_failed, reuse, ctx)
            .await?;
        // Reference graphs between objects cannot cycle, but a malformed
        // derivation set could; a wanted derivation left unvisited means
        // the propagation never reached it.
        for drv_path in want {
            if !drv_hashes.contains_key(drv_path) {
                return Err(ServerError::InvalidParams(format!(
                    "derivation '{drv_path}' is unreachable from the dependency roots"
                )));
            }
        }
        Ok(())
    }

    /// Realize the inputs of `drv_path` only, and report the expanded
    /// builder, arguments, and environment with output placeholders
    /// pointing into `temp_dir`.
    pub async fn expand(
        &self,
        build_id: &str,
        drv_path: &StorePath,
        temp_dir: &str,
        ctx: &CancellationToken,
    ) -> Result<serde_json::Value> {
        let want_outputs = vec![(drv_path.clone(), BTreeSet::new())];
        let graph = graph::analyze(&self.store, &want_outputs).await?;
        let (cache, drv_hashes) = self
            .drive(build_id, &graph, Some(drv_path), false, true, ctx)
            .await?;

        let node = graph
            .nodes
            .get(drv_path)
            .ok_or_else(|| ServerError::internal(format!("missing node for {drv_path}")))?;
        let input_realized = self.realized_inputs(&node.derivation, &cache, &drv_hashes)?;

        let mut substitutions = BTreeMap::new();
        for ((input_drv, output), path) in &input_realized {
            substitutions.insert(
                unknown_ca_output_placeholder(input_drv, output),
                self.store.dir().display_path(path),
            );
        }
        for output in node.derivation.outputs.keys() {
            substitutions.insert(
                hash_placeholder(output),
                format!("{}/{}", temp_dir.trim_end_matches('/'), output),
            );
        }
        let mut expanded = node.derivation.clone();
        expanded.substitute(&substitutions);

        let full = self.store.dir().display_path(drv_path);
        let report = serde_json::json!({
            "builder": expanded.builder,
            "args": expanded.args,
            "env": expanded.env,
        });
        let build_id2 = build_id.to_owned();
        let report_for_db = report.to_string();
        self.store
            .with_db(move |db| {
                db.insert_build_result(&build_id2, &full)?;
                db.finalize_build_result(&build_id2, &full, "success", Some(&report_for_db), None)?;
                Ok(())
            })
            .await?;
        Ok(report)
    }

    /// Drive the graph to completion. When `skip` names a derivation, it
    /// is left unrealized (its inputs still are). Returns the realization
    /// cache and per-derivation realization hashes.
    async fn drive(
        &self,
        build_id: &str,
        graph: &DependencyGraph,
        skip: Option<&StorePath>,
        keep_failed: bool,
        reuse: bool,
        ctx: &CancellationToken,
    ) -> Result<(RealizationCache, BTreeMap<StorePath, DrvHash>)> {
        let mut stack: Vec<StorePath> = graph.roots.clone();
        let mut completed: BTreeSet<StorePath> = BTreeSet::new();
        let mut cache = RealizationCache::new();
        let mut drv_hashes: BTreeMap<StorePath, DrvHash> = BTreeMap::new();

        while let Some(drv_path) = stack.pop() {
            if ctx.is_cancelled() {
                return Err(ServerError::Cancelled);
            }
            if completed.contains(&drv_path) {
                continue;
            }
            let node = graph
                .nodes
                .get(&drv_path)
                .ok_or_else(|| ServerError::internal(format!("missing node for {drv_path}")))?;

            if skip == Some(&drv_path) {
                completed.insert(drv_path.clone());
                continue;
            }

            // All inputs are realized by ordering; compute this
            // derivation's realization hash from them.
            let input_realized = self.realized_inputs(&node.derivation, &cache, &drv_hashes)?;
            let drv_hash = realization_hash(self.store.dir(), &node.derivation, |input, out| {
                input_realized.get(&(input.clone(), out.clone())).cloned()
            })
            .map_err(|e| ServerError::internal(format!("hashing {drv_path}: {e}")))?;
            drv_hashes.insert(drv_path.clone(), drv_hash);

            // At most one concurrent build per derivation path.
            let guard = self
                .building
                .lock(ctx, drv_path.clone())
                .await
                .map_err(|_| ServerError::Cancelled)?;
            let result = self
                .do_derivation(
                    build_id,
                    &drv_path,
                    node,
                    drv_hash,
                    &input_realized,
                    keep_failed,
                    reuse,
                    &mut cache,
                    ctx,
                )
                .await;
            drop(guard);

            if let Err(e) = result {
                let full = self.store.dir().display_path(&drv_path);
                let status = BuildStatus::for_error(&e);
                let message = e.to_string();
                self.logs
                    .append_failure(build_id, drv_path.digest().as_str(), &message);
                let build_id2 = build_id.to_owned();
                let _ = self
                    .store
                    .with_db(move |db| {
                        db.insert_build_result(&build_id2, &full)?;
                        db.finalize_build_result(
                            &build_id2,
                            &full,
                            status.as_str(),
                            None,
                            Some(&message),
                        )?;
                        Ok(())
                    })
                    .await;
                return Err(e);
            }

            completed.insert(drv_path.clone());
            for dependent in graph.ready_dependents(&drv_path, &completed) {
                stack.push(dependent);
            }
        }

        Ok((cache, drv_hashes))
    }

    /// The realized store path of every derivation input.
    fn realized_inputs(
        &self,
        drv: &Derivation,
        cache: &RealizationCache,
        drv_hashes: &BTreeMap<StorePath, DrvHash>,
    ) -> Result<BTreeMap<(StorePath, OutputName), StorePath>> {
        let mut out = BTreeMap::new();
        for (input_drv, outputs) in &drv.input_derivations {
            let hash = drv_hashes.get(input_drv).ok_or_else(|| {
                ServerError::internal(format!("input {input_drv} not yet realized"))
            })?;
            for output in outputs {
                let class = EquivalenceClass::new(*hash, output.clone());
                let cached = cache.lookup(&class).ok_or_else(|| {
                    ServerError::internal(format!("no realization chosen for {class}"))
                })?;
                out.insert((input_drv.clone(), output.clone()), cached.path.clone());
            }
        }
        Ok(out)
    }

    /// Build-or-reuse one derivation. Returns the realized output paths.
    #[allow(clippy::too_many_arguments)]
    async fn do_derivation(
        &self,
        build_id: &str,
        drv_path: &StorePath,
        node: &GraphNode,
        drv_hash: DrvHash,
        input_realized: &BTreeMap<(StorePath, OutputName), StorePath>,
        keep_failed: bool,
        reuse: bool,
        cache: &mut RealizationCache,
        ctx: &CancellationToken,
    ) -> Result<BTreeMap<OutputName, StorePath>> {
        let full = self.store.dir().display_path(drv_path);
        {
            let build_id = build_id.to_owned();
            let full = full.clone();
            self.store
                .with_db(move |db| Ok(db.insert_build_result(&build_id, &full)?))
                .await?;
        }

        // Early cutoff: a compatible prior realization of every used
        // output skips the builder entirely.
        let classes: Vec<(OutputName, EquivalenceClass)> = node
            .used_outputs
            .iter()
            .map(|out| (out.clone(), EquivalenceClass::new(drv_hash, out.clone())))
            .collect();
        if reuse
            && let Some(reused) = cache
                .fetch_realization_set(&self.store, &classes)
                .await?
        {
            debug!("reusing realization of {drv_path}");
            self.finalize_result(build_id, &full, &reused).await?;
            return Ok(reused);
        }

        let outputs = self
            .run_build(
                build_id,
                drv_path,
                node,
                drv_hash,
                input_realized,
                keep_failed,
                cache,
                ctx,
            )
            .await?;

        self.finalize_result(build_id, &full, &outputs).await?;
        Ok(outputs)
    }

    async fn finalize_result(
        &self,
        build_id: &str,
        drv_full: &str,
        outputs: &BTreeMap<OutputName, StorePath>,
    ) -> Result<()> {
        let json: BTreeMap<String, String> = outputs
            .iter()
            .map(|(name, path)| (name.to_string(), self.store.dir().display_path(path)))
            .collect();
        let json = serde_json::to_string(&json)
            .map_err(|e| ServerError::internal(format!("encoding outputs: {e}")))?;
        let build_id = build_id.to_owned();
        let drv_full = drv_full.to_owned();
        self.store
            .with_db(move |db| {
                Ok(db.finalize_build_result(&build_id, &drv_full, "success", Some(&json), None)?)
            })
            .await
    }

    /// Execute the builder and post-process its outputs.
    #[allow(clippy::too_many_arguments)]
    async fn run_build(
        &self,
        build_id: &str,
        drv_path: &StorePath,
        node: &GraphNode,
        drv_hash: DrvHash,
        input_realized: &BTreeMap<(StorePath, OutputName), StorePath>,
        keep_failed: bool,
        cache: &mut RealizationCache,
        ctx: &CancellationToken,
    ) -> Result<BTreeMap<OutputName, StorePath>> {
        let drv = &node.derivation;
        let dir = self.store.dir().clone();

        // Fixed-output fast path: if the declared output already exists on
        // disk, record the realization without running the builder.
        if let Some(ca) = drv.fixed_output() {
            let out = OutputName::out();
            let final_path = fixed_ca_output_path(
                &dir,
                &output_path_name(&drv.name, &out),
                ca,
                &PathRefs::none(),
            )
            .map_err(|e| ServerError::InvalidParams(e.to_string()))?;
            let guard = self
                .store
                .writing()
                .lock(ctx, final_path.clone())
                .await
                .map_err(|_| ServerError::Cancelled)?;
            if std::fs::symlink_metadata(self.store.real_path(&final_path)).is_ok() {
                debug!("fixed output {final_path} already present");
                drop(guard);
                let class = EquivalenceClass::new(drv_hash, out.clone());
                self.record_realization(&class, &final_path, cache).await?;
                return Ok(BTreeMap::from([(out, final_path)]));
            }
            drop(guard);
        }

        if !runner::can_build_locally(&drv.system) {
            return Err(ServerError::SystemMismatch {
                system: drv.system.clone(),
            });
        }

        // Placeholder expansion: own outputs point at their (temporary or
        // final) paths, inputs at their realized paths.
        let mut targets: BTreeMap<OutputName, StorePath> = BTreeMap::new();
        for out in &node.used_outputs {
            let target = match drv.outputs.get(out) {
                Some(DerivationOutput::Fixed(ca)) => fixed_ca_output_path(
                    &dir,
                    &output_path_name(&drv.name, out),
                    ca,
                    &PathRefs::none(),
                )
                .map_err(|e| ServerError::InvalidParams(e.to_string()))?,
                Some(DerivationOutput::Floating { .. }) => temp_output_path(
                    &dir.display_path(drv_path),
                    &drv.name,
                    out,
                ),
                None => {
                    return Err(ServerError::InvalidParams(format!(
                        "derivation {drv_path} has no output '{out}'"
                    )));
                }
            };
            targets.insert(out.clone(), target);
        }

        let mut substitutions = BTreeMap::new();
        for (out, target) in &targets {
            substitutions.insert(hash_placeholder(out), dir.display_path(target));
        }
        for ((input_drv, output), path) in input_realized {
            substitutions.insert(
                unknown_ca_output_placeholder(input_drv, output),
                dir.display_path(path),
            );
        }
        let mut expanded = drv.clone();
        expanded.substitute(&substitutions);
        for path in input_realized.values() {
            expanded.input_sources.insert(path.clone());
        }
        expanded.input_derivations.clear();

        self.check_system_deps(&expanded, &substitutions)?;

        // Every input must actually be on disk before the builder starts.
        for input in &expanded.input_sources {
            if std::fs::symlink_metadata(self.store.real_path(input)).is_err() {
                return Err(ServerError::MissingInput(dir.display_path(input)));
            }
        }

        let user = self
            .users
            .acquire(ctx)
            .await
            .map_err(|_| ServerError::Cancelled)?;

        std::fs::create_dir_all(&self.settings.build_dir).io_context(|| {
            format!(
                "failed to create build parent dir {}",
                self.settings.build_dir.display()
            )
        })?;
        let build_tmp = tempfile::Builder::new()
            .prefix("zb-build-")
            .tempdir_in(&self.settings.build_dir)
            .io_context(|| "failed to create build directory".to_owned())?;

        let log = self.logs.open_sink(build_id, drv_path.digest().as_str())?;

        info!("building {drv_path} in {}", build_tmp.path().display());
        let run_result = RunnerKind::for_derivation(&expanded, self.settings.limits)
            .map_err(map_runner_error)?
            .run(Invocation {
                derivation: &expanded,
                drv_path,
                output_paths: &targets,
                store_dir: &dir,
                real_store_dir: self.store.real_dir(),
                build_dir: build_tmp.path(),
                log,
                user: user.as_ref(),
                cores: self.settings.cores,
                ctx,
            })
            .await
            .map_err(map_runner_error);
        drop(user);

        let post_result = match run_result {
            Err(e) => Err(e),
            Ok(()) => {
                self.postprocess(drv_path, node, drv_hash, &expanded, &targets, cache, ctx)
                    .await
            }
        };

        match post_result {
            Ok(outputs) => Ok(outputs),
            Err(e) => {
                // Remove partial outputs; optionally keep the build dir
                // for inspection.
                for target in targets.values() {
                    let real = self.store.real_path(target);
                    freeze::thaw(&real);
                    let _ = std::fs::remove_dir_all(&real);
                    let _ = std::fs::remove_file(&real);
                }
                if keep_failed && self.settings.allow_keep_failed {
                    let kept = build_tmp.keep();
                    warn!("keeping failed build directory {}", kept.display());
                    self.logs.append_failure(
                        build_id,
                        drv_path.digest().as_str(),
                        &format!("build directory kept at {}", kept.display()),
                    );
                }
                Err(e)
            }
        }
    }

    /// `__buildSystemDeps` entries must be allow-listed and fully
    /// expanded.
    fn check_system_deps(
        &self,
        expanded: &Derivation,
        substitutions: &BTreeMap<String, String>,
    ) -> Result<()> {
        let Some(deps) = expanded.env.get("__buildSystemDeps") else {
            return Ok(());
        };
        for dep in deps.split_whitespace() {
            if substitutions.keys().any(|ph| dep.contains(ph.as_str())) {
                return Err(ServerError::InvalidParams(format!(
                    "__buildSystemDeps entry '{dep}' contains an unexpanded placeholder"
                )));
            }
            let allowed = self
                .settings
                .sandbox_paths
                .iter()
                .any(|allowed| std::path::Path::new(dep).starts_with(allowed));
            if !allowed {
                return Err(ServerError::InvalidParams(format!(
                    "__buildSystemDeps entry '{dep}' is not in the sandbox allow-list"
                )));
            }
        }
        Ok(())
    }

    /// Verify and register every produced output.
    #[allow(clippy::too_many_arguments)]
    async fn postprocess(
        &self,
        drv_path: &StorePath,
        node: &GraphNode,
        drv_hash: DrvHash,
        expanded: &Derivation,
        targets: &BTreeMap<OutputName, StorePath>,
        cache: &mut RealizationCache,
        ctx: &CancellationToken,
    ) -> Result<BTreeMap<OutputName, StorePath>> {
        // Every declared output must exist on disk.
        for (out, target) in targets {
            if std::fs::symlink_metadata(self.store.real_path(target)).is_err() {
                return Err(ServerError::BuilderFailure(format!(
                    "builder for '{drv_path}' failed to produce output path '{}' ({out})",
                    self.store.dir().display_path(target)
                )));
            }
        }

        let mut outputs = BTreeMap::new();
        for (out, target) in targets {
            let final_path = match node.derivation.outputs.get(out) {
                Some(DerivationOutput::Fixed(ca)) => {
                    self.postprocess_fixed(target, ca, ctx).await?
                }
                Some(DerivationOutput::Floating { .. }) => {
                    self.postprocess_floating(expanded, target, ctx).await?
                }
                None => unreachable!("targets only contain declared outputs"),
            };
            let class = EquivalenceClass::new(drv_hash, out.clone());
            self.record_realization(&class, &final_path, cache).await?;
            outputs.insert(out.clone(), final_path);
        }
        Ok(outputs)
    }

    /// Fixed output: the bytes must match the declared address.
    async fn postprocess_fixed(
        &self,
        target: &StorePath,
        ca: &ContentAddress,
        ctx: &CancellationToken,
    ) -> Result<StorePath> {
        let _guard = self
            .store
            .writing()
            .lock(ctx, target.clone())
            .await
            .map_err(|_| ServerError::Cancelled)?;

        let real = self.store.real_path(target);
        let declared = *ca;
        let target2 = target.clone();
        let (nar, computed) = tokio::task::spawn_blocking(move || -> Result<_> {
            let mut nar = Vec::new();
            zb_nar::dump(&mut nar, &real)?;
            let computed = crate::store::compute_ca_for(&nar[..], &declared, &target2)?;
            Ok((nar, computed))
        })
        .await??;

        if computed != *ca {
            return Err(ServerError::BuilderFailure(format!(
                "fixed output '{}' hash mismatch: declared {ca}, got {computed}",
                self.store.dir().display_path(target)
            )));
        }

        let meta = ObjectMeta {
            path: target.clone(),
            nar_size: nar.len() as u64,
            nar_hash: NarHash::digest(&nar),
            ca: *ca,
            references: BTreeSet::new(),
        };
        self.insert_and_freeze(meta).await?;
        Ok(target.clone())
    }

    /// Floating output: one streaming pass discovers the content address
    /// and references, then self-references are rewritten in place and the
    /// tree moves to its final path.
    async fn postprocess_floating(
        &self,
        expanded: &Derivation,
        temp: &StorePath,
        ctx: &CancellationToken,
    ) -> Result<StorePath> {
        // Reference candidates: the inputs and their stored closures.
        let input_full: Vec<String> = expanded
            .input_sources
            .iter()
            .map(|p| self.store.dir().display_path(p))
            .collect();
        let closure_paths: BTreeSet<String> = self
            .store
            .with_db(move |db| {
                let mut all: BTreeSet<String> = BTreeSet::new();
                for path in &input_full {
                    all.insert(path.clone());
                    if db.is_valid_object(path)? {
                        for p in db.closure(&[path.clone()])?.into_keys() {
                            all.insert(p);
                        }
                    }
                }
                Ok(all)
            })
            .await?;
        let mut candidates: BTreeSet<StorePath> = BTreeSet::new();
        for full in &closure_paths {
            candidates.insert(self.store.parse_path(full)?);
        }

        let temp_real = self.store.real_path(temp);
        let temp2 = temp.clone();
        let (scan, found) = tokio::task::spawn_blocking(move || -> Result<_> {
            let mut nar = Vec::new();
            zb_nar::dump(&mut nar, &temp_real)?;
            let mut finder = RefFinder::new(candidates.iter(), Some(&temp2));
            let mut observer = |chunk: &[u8]| finder.feed(chunk);
            let result = zb_nar::source_ca(
                &nar[..],
                SourceCaOptions {
                    self_digest: Some(*temp2.digest()),
                    raw_observer: Some(&mut observer),
                },
            )?;
            Ok((result, finder.found()))
        })
        .await??;
        let ca = scan.ca;
        let raw_hash = scan.nar_hash;
        let raw_size = scan.nar_size;
        let analysis = scan.analysis;

        let self_ref = found.contains(temp);
        let others: BTreeSet<StorePath> = found.into_iter().filter(|p| p != temp).collect();
        let refs = PathRefs {
            self_ref,
            others: others.clone(),
        };

        let final_path = fixed_ca_output_path(self.store.dir(), temp.name(), &ca, &refs)
            .map_err(|e| ServerError::internal(format!("deriving output path: {e}")))?;

        let _guard = self
            .store
            .writing()
            .lock(ctx, final_path.clone())
            .await
            .map_err(|_| ServerError::Cancelled)?;

        let temp_real = self.store.real_path(temp);
        let final_real = self.store.real_path(&final_path);

        if std::fs::symlink_metadata(&final_real).is_ok() {
            // Collision with an existing object: drop our copy, reuse.
            debug!("output {final_path} already in store; reusing");
            let temp_real2 = temp_real.clone();
            tokio::task::spawn_blocking(move || {
                freeze::thaw(&temp_real2);
                let _ = std::fs::remove_dir_all(&temp_real2);
                let _ = std::fs::remove_file(&temp_real2);
            })
            .await?;
            let existing = self.store.info(&final_path).await?;
            if existing.is_none() {
                return Err(ServerError::internal(format!(
                    "object {final_path} on disk but not registered"
                )));
            }
            return Ok(final_path);
        }

        // Rewrite self-references with the final digest and move the tree
        // into place.
        let old_digest = temp.digest().as_str().as_bytes().to_vec();
        let new_digest = final_path.digest().as_str().as_bytes().to_vec();
        let temp_real2 = temp_real.clone();
        let final_real2 = final_real.clone();
        let (nar_hash, nar_size) = tokio::task::spawn_blocking(move || -> Result<_> {
            finalize_floating_output(&temp_real2, &analysis, &old_digest, &new_digest)?;
            std::fs::rename(&temp_real2, &final_real2).io_context(|| {
                format!(
                    "failed to move {} to {}",
                    temp_real2.display(),
                    final_real2.display()
                )
            })?;
            if analysis.has_self_refs() {
                // The digest rewrite changed the archive bytes.
                let mut nar = Vec::new();
                let size = zb_nar::dump(&mut nar, &final_real2)?;
                Ok((NarHash::digest(&nar), size))
            } else {
                Ok((raw_hash, raw_size))
            }
        })
        .await??;

        let mut references = others;
        if self_ref {
            references.insert(final_path.clone());
        }
        let meta = ObjectMeta {
            path: final_path.clone(),
            nar_size,
            nar_hash,
            ca,
            references,
        };
        self.insert_and_freeze(meta).await?;
        Ok(final_path)
    }

    async fn insert_and_freeze(&self, meta: ObjectMeta) -> Result<()> {
        let real = self.store.real_path(&meta.path);
        let db_info = meta.to_db(self.store.dir());
        self.store
            .with_db(move |db| match db.insert_object(&db_info) {
                Ok(_) => Ok(()),
                Err(zb_store_db::Error::ObjectExists(_)) => Ok(()),
                Err(e) => Err(e.into()),
            })
            .await?;
        tokio::task::spawn_blocking(move || freeze::freeze(&real)).await?;
        Ok(())
    }

    /// Record a realization and its closure, and bind it in the cache.
    async fn record_realization(
        &self,
        class: &EquivalenceClass,
        output_path: &StorePath,
        cache: &mut RealizationCache,
    ) -> Result<()> {
        let output_name = class
            .output_name()
            .expect("built realizations have a non-zero class")
            .clone();
        let drv_hash = *class.drv_hash().expect("non-zero class");

        cache.insert_built(class.clone(), output_path.clone());

        // The recorded closure: every transitively referenced path with
        // the class that produced it in this build (zero for sources).
        let full = self.store.dir().display_path(output_path);
        let closure = self
            .store
            .with_db(move |db| Ok(db.closure(&[full])?))
            .await?;

        let mut rows = Vec::with_capacity(closure.len());
        for path_full in closure.keys() {
            let path = self.store.parse_path(path_full)?;
            let path_class = if path == *output_path {
                class.clone()
            } else {
                cache
                    .classes_for(&path)
                    .into_iter()
                    .next()
                    .unwrap_or_else(EquivalenceClass::zero)
            };
            rows.push(ReferenceClassInsert {
                reference_path: path_full.clone(),
                drv_hash: path_class.drv_hash().map(|h| zb_store_db::DrvHashRow {
                    algo: DrvHash::ALGORITHM.to_owned(),
                    bits: h.as_bytes().to_vec(),
                }),
                output_name: path_class.output_name().map(|o| o.to_string()),
            });
        }

        let output_full = self.store.dir().display_path(output_path);
        let bits = drv_hash.as_bytes().to_vec();
        let output_name_s = output_name.to_string();
        self.store
            .with_db(move |db| {
                Ok(db.record_realization(
                    DrvHash::ALGORITHM,
                    &bits,
                    &output_name_s,
                    &output_full,
                    &rows,
                )?)
            })
            .await
    }
}

fn map_runner_error(err: RunnerError) -> ServerError {
    match err {
        RunnerError::Builder(message) => ServerError::BuilderFailure(message),
        RunnerError::Cancelled => ServerError::Cancelled,
        RunnerError::Internal(message) => ServerError::Internal(message),
    }
}

/// Rewrite every recorded self-reference occurrence with the final
/// digest: file contents in place, symlinks by re-creation.
fn finalize_floating_output(
    root: &std::path::Path,
    analysis: &zb_nar::SelfRefAnalysis,
    old_digest: &[u8],
    new_digest: &[u8],
) -> Result<()> {
    use std::io::{Seek, SeekFrom, Write};

    for rewrite in &analysis.rewrites {
        let file_path = root.join(&rewrite.path);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            if let Ok(meta) = std::fs::metadata(&file_path) {
                let mode = meta.permissions().mode();
                if mode & 0o200 == 0 {
                    let _ = std::fs::set_permissions(
                        &file_path,
                        std::fs::Permissions::from_mode(mode | 0o200),
                    );
                }
            }
        }
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&file_path)
            .io_context(|| format!("failed to open {} for rewrite", file_path.display()))?;
        file.seek(SeekFrom::Start(rewrite.offset))
            .io_context(|| format!("failed to seek in {}", file_path.display()))?;
        file.write_all(new_digest)
            .io_context(|| format!("failed to rewrite {}", file_path.display()))?;
    }

    #[cfg(unix)]
    for link in &analysis.symlinks {
        use std::os::unix::ffi::{OsStrExt as _, OsStringExt as _};
        let link_path = root.join(link);
        let target = std::fs::read_link(&link_path)
            .io_context(|| format!("failed to read link {}", link_path.display()))?;
        let target_bytes = target.as_os_str().as_bytes().to_vec();
        let rewritten = replace_all(&target_bytes, old_digest, new_digest);
        std::fs::remove_file(&link_path)
            .io_context(|| format!("failed to remove link {}", link_path.display()))?;
        std::os::unix::fs::symlink(
            std::path::PathBuf::from(std::ffi::OsString::from_vec(rewritten)),
            &link_path,
        )
        .io_context(|| format!("failed to re-create link {}", link_path.display()))?;
    }

    Ok(())
}

fn replace_all(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(needle) {
            out.extend_from_slice(replacement);
            i += needle.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}
