// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! RPC method dispatch.
//!
//! Method names are part of the wire contract; payloads are JSON. The
//! transport framing lives outside this crate; a handler takes a method
//! name plus parameters and returns a JSON value, with `store.export`
//! writing its archive stream to an out-of-band byte sink.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use zb_store_core::store_path::StorePath;

use crate::error::{Result, ServerError};
use crate::server::Server;

#[derive(Clone)]
pub struct Handler {
    server: Server,
}

#[derive(Deserialize)]
struct PathParams {
    path: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportParams {
    paths: Vec<String>,
    #[serde(default)]
    exclude_references: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RealizeParams {
    drv_paths: Vec<String>,
    #[serde(default)]
    keep_failed: bool,
    #[serde(default = "default_true")]
    reuse: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExpandParams {
    drv_path: String,
    temporary_directory: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildParams {
    #[serde(rename = "buildID")]
    build_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildResultParams {
    #[serde(rename = "buildID")]
    build_id: String,
    drv_path: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadLogParams {
    #[serde(rename = "buildID")]
    build_id: String,
    drv_path: String,
    #[serde(default)]
    range_start: u64,
    range_end: Option<u64>,
    /// Block until new bytes arrive or the build result is terminal.
    #[serde(default)]
    follow: bool,
}

fn default_true() -> bool {
    true
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| ServerError::InvalidParams(e.to_string()))
}

impl Handler {
    pub fn new(server: Server) -> Handler {
        Handler { server }
    }

    /// Dispatch one request.
    pub async fn handle(
        &self,
        ctx: &CancellationToken,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        match method {
            "store.nop" => Ok(Value::Null),
            "store.exists" => self.exists(ctx, params).await,
            "store.info" => self.info(params).await,
            "store.realize" => self.realize(params).await,
            "store.expand" => self.expand(params).await,
            "store.getBuild" => self.get_build(params).await,
            "store.getBuildResult" => self.get_build_result(params).await,
            "store.cancelBuild" => self.cancel_build(params).await,
            "store.readLog" => self.read_log(ctx, params).await,
            other => Err(ServerError::InvalidParams(format!(
                "unknown method '{other}'"
            ))),
        }
    }

    async fn exists(&self, ctx: &CancellationToken, params: Value) -> Result<Value> {
        let params: PathParams = parse_params(params)?;
        let path = match self.server.store().parse_path(&params.path) {
            Ok(path) => path,
            // A malformed or foreign path simply does not exist here.
            Err(_) => return Ok(json!(false)),
        };
        Ok(json!(self.server.store().exists(ctx, &path).await?))
    }

    async fn info(&self, params: Value) -> Result<Value> {
        let params: PathParams = parse_params(params)?;
        let path = self.server.store().parse_path(&params.path)?;
        let meta = self.server.store().info(&path).await?;
        let dir = self.server.store().dir();
        Ok(match meta {
            None => json!({ "info": Value::Null }),
            Some(meta) => json!({
                "info": {
                    "path": dir.display_path(&meta.path),
                    "narHash": zb_utils_hash::Hash::from(meta.nar_hash).to_string(),
                    "narSize": meta.nar_size,
                    "ca": meta.ca.to_string(),
                    "references": meta
                        .references
                        .iter()
                        .map(|r| dir.display_path(r))
                        .collect::<Vec<_>>(),
                }
            }),
        })
    }

    /// `store.export` writes its stream out of band; this entry point
    /// resolves and validates the paths, then streams into `sink` on the
    /// blocking pool.
    pub async fn export(
        &self,
        params: Value,
        mut sink: Box<dyn std::io::Write + Send>,
    ) -> Result<()> {
        let params: ExportParams = parse_params(params)?;
        let mut paths = Vec::with_capacity(params.paths.len());
        for path in &params.paths {
            paths.push(self.server.store().parse_path(path)?);
        }
        let store = self.server.store().clone();
        let exclude = params.exclude_references;
        tokio::task::spawn_blocking(move || store.export_blocking(&paths, exclude, &mut *sink))
            .await?
    }

    async fn realize(&self, params: Value) -> Result<Value> {
        let params: RealizeParams = parse_params(params)?;
        if params.drv_paths.is_empty() {
            return Err(ServerError::InvalidParams(
                "realize needs at least one derivation".to_owned(),
            ));
        }
        let mut drv_paths: Vec<StorePath> = Vec::with_capacity(params.drv_paths.len());
        let mut seen = BTreeSet::new();
        for path in &params.drv_paths {
            let parsed = self.server.store().parse_path(path)?;
            if !parsed.is_derivation() {
                return Err(ServerError::InvalidParams(format!(
                    "'{path}' is not a derivation"
                )));
            }
            if seen.insert(parsed.clone()) {
                drv_paths.push(parsed);
            }
        }
        let build_id = self
            .server
            .start_realize(drv_paths, params.keep_failed, params.reuse)
            .await?;
        Ok(json!({ "buildID": build_id }))
    }

    async fn expand(&self, params: Value) -> Result<Value> {
        let params: ExpandParams = parse_params(params)?;
        let drv_path = self.server.store().parse_path(&params.drv_path)?;
        if !drv_path.is_derivation() {
            return Err(ServerError::InvalidParams(format!(
                "'{}' is not a derivation",
                params.drv_path
            )));
        }
        let build_id = self
            .server
            .start_expand(drv_path, params.temporary_directory)
            .await?;
        Ok(json!({ "buildID": build_id }))
    }

    async fn get_build(&self, params: Value) -> Result<Value> {
        let params: BuildParams = parse_params(params)?;
        let id = params.build_id.clone();
        let row = self
            .server
            .store()
            .with_db(move |db| Ok(db.get_build(&id)?))
            .await?
            .ok_or(ServerError::UnknownBuild(params.build_id))?;
        Ok(json!({
            "id": row.id,
            "status": row.status,
            "startedAt": unix(row.started_at),
            "endedAt": row.ended_at.map(unix),
        }))
    }

    async fn get_build_result(&self, params: Value) -> Result<Value> {
        let params: BuildResultParams = parse_params(params)?;
        let id = params.build_id.clone();
        let drv = params.drv_path.clone();
        let row = self
            .server
            .store()
            .with_db(move |db| Ok(db.get_build_result(&id, &drv)?))
            .await?
            .ok_or_else(|| {
                ServerError::InvalidParams(format!(
                    "no result for '{}' in build '{}'",
                    params.drv_path, params.build_id
                ))
            })?;
        let outputs: Value = row
            .output_paths
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or(Value::Null);
        Ok(json!({
            "drvPath": row.drv_path,
            "status": row.status,
            "outputs": outputs,
            "error": row.error,
        }))
    }

    async fn cancel_build(&self, params: Value) -> Result<Value> {
        let params: BuildParams = parse_params(params)?;
        self.server.cancel_build(&params.build_id).await?;
        Ok(Value::Null)
    }

    async fn read_log(&self, ctx: &CancellationToken, params: Value) -> Result<Value> {
        let params: ReadLogParams = parse_params(params)?;
        let drv_path = self.server.store().parse_path(&params.drv_path)?;
        let (bytes, next, done) = self
            .server
            .read_log(
                ctx,
                &params.build_id,
                &drv_path,
                params.range_start,
                params.range_end,
                params.follow,
            )
            .await?;
        Ok(json!({
            "log": String::from_utf8_lossy(&bytes),
            "nextOffset": next,
            "done": done,
        }))
    }
}

fn unix(time: std::time::SystemTime) -> i64 {
    time.duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
