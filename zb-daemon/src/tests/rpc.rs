// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! The JSON method surface, driven through a handler.

#![cfg(unix)]

use serde_json::json;

use crate::server::Server;
use crate::server::handler::Handler;
use crate::tests::support::{floating_drv, test_env};

async fn handler() -> (crate::tests::support::TestEnv, Handler) {
    let env = test_env();
    let server = Server::from_parts(env.store.clone(), env.builder.clone(), env.logs.clone());
    let handler = Handler::new(server);
    (env, handler)
}

async fn wait_terminal(handler: &Handler, ctx: &tokio_util::sync::CancellationToken, build_id: &str) -> serde_json::Value {
    for _ in 0..300 {
        let build = handler
            .handle(ctx, "store.getBuild", json!({ "buildID": build_id }))
            .await
            .unwrap();
        if build["status"] != "active" {
            return build;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("build {build_id} did not finish");
}

#[tokio::test(flavor = "multi_thread")]
async fn nop_and_unknown_method() {
    let (env, handler) = handler().await;
    assert_eq!(
        handler
            .handle(&env.ctx, "store.nop", json!(null))
            .await
            .unwrap(),
        json!(null)
    );
    assert!(
        handler
            .handle(&env.ctx, "store.frobnicate", json!(null))
            .await
            .is_err()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn exists_and_info() {
    let (env, handler) = handler().await;
    let path = env
        .import_flat_file("hello.txt", b"Hello, World!\n")
        .await
        .unwrap();
    let full = env.store.dir().display_path(&path);

    let exists = handler
        .handle(&env.ctx, "store.exists", json!({ "path": full }))
        .await
        .unwrap();
    assert_eq!(exists, json!(true));

    // Paths outside the store simply do not exist.
    let exists = handler
        .handle(&env.ctx, "store.exists", json!({ "path": "/nowhere/at-all" }))
        .await
        .unwrap();
    assert_eq!(exists, json!(false));

    let info = handler
        .handle(&env.ctx, "store.info", json!({ "path": full }))
        .await
        .unwrap();
    assert_eq!(info["info"]["path"], json!(full));
    assert_eq!(info["info"]["narSize"], json!(128));
    assert_eq!(info["info"]["references"], json!([]));

    let missing = format!("{}/{}-gone", env.store.dir(), "0".repeat(32));
    let info = handler
        .handle(&env.ctx, "store.info", json!({ "path": missing }))
        .await
        .unwrap();
    assert_eq!(info["info"], json!(null));
}

#[tokio::test(flavor = "multi_thread")]
async fn realize_and_poll_and_read_log() {
    let (env, handler) = handler().await;
    let drv = floating_drv("noisy.txt", "echo building loudly; echo done > $out");
    let drv_path = env.write_drv(&drv).await.unwrap();
    let drv_full = env.store.dir().display_path(&drv_path);

    let started = handler
        .handle(
            &env.ctx,
            "store.realize",
            json!({ "drvPaths": [drv_full] }),
        )
        .await
        .unwrap();
    let build_id = started["buildID"].as_str().unwrap().to_owned();

    let build = wait_terminal(&handler, &env.ctx, &build_id).await;
    assert_eq!(build["status"], "success");
    assert!(build["endedAt"].is_i64());

    let result = handler
        .handle(
            &env.ctx,
            "store.getBuildResult",
            json!({ "buildID": build_id, "drvPath": drv_full }),
        )
        .await
        .unwrap();
    assert_eq!(result["status"], "success");
    let out = result["outputs"]["out"].as_str().unwrap().to_owned();
    let out_path = env.store.parse_path(&out).unwrap();
    assert_eq!(
        std::fs::read(env.store.real_path(&out_path)).unwrap(),
        b"done\n"
    );

    let log = handler
        .handle(
            &env.ctx,
            "store.readLog",
            json!({ "buildID": build_id, "drvPath": drv_full, "rangeStart": 0 }),
        )
        .await
        .unwrap();
    assert!(
        log["log"].as_str().unwrap().contains("building loudly"),
        "log: {log}"
    );
}

/// Following a running build's log streams new bytes as the builder
/// emits them and reports `done` once the build is terminal and the log
/// is drained.
#[tokio::test(flavor = "multi_thread")]
async fn follow_log_tails_live_build() {
    let (env, handler) = handler().await;
    let drv = floating_drv(
        "chatty.txt",
        "echo first line; sleep 1; echo second line; echo done > $out",
    );
    let drv_path = env.write_drv(&drv).await.unwrap();
    let drv_full = env.store.dir().display_path(&drv_path);

    let started = handler
        .handle(
            &env.ctx,
            "store.realize",
            json!({ "drvPaths": [drv_full] }),
        )
        .await
        .unwrap();
    let build_id = started["buildID"].as_str().unwrap().to_owned();

    // Tail from offset 0 until the server says the log is complete. Each
    // follow call blocks until bytes arrive or the build ends, so this
    // loop needs no sleeps of its own.
    let mut collected = String::new();
    let mut offset = 0u64;
    let mut saw_partial_read = false;
    for round in 0.. {
        assert!(round < 100, "follow never reported done");
        let chunk = handler
            .handle(
                &env.ctx,
                "store.readLog",
                json!({
                    "buildID": build_id,
                    "drvPath": drv_full,
                    "rangeStart": offset,
                    "follow": true,
                }),
            )
            .await
            .unwrap();
        collected.push_str(chunk["log"].as_str().unwrap());
        offset = chunk["nextOffset"].as_u64().unwrap();
        if chunk["done"].as_bool().unwrap() {
            break;
        }
        // The sleep in the builder forces at least one read that sees the
        // first line but not yet the second.
        if collected.contains("first line") && !collected.contains("second line") {
            saw_partial_read = true;
        }
    }

    assert!(collected.contains("first line"), "log: {collected}");
    assert!(collected.contains("second line"), "log: {collected}");
    assert!(
        saw_partial_read,
        "expected to observe the log mid-build, got only: {collected}"
    );

    // The build itself finished successfully.
    let build = handler
        .handle(&env.ctx, "store.getBuild", json!({ "buildID": build_id }))
        .await
        .unwrap();
    assert_eq!(build["status"], "success");
}

/// Following a log of an already-finished build returns everything and
/// terminates immediately.
#[tokio::test(flavor = "multi_thread")]
async fn follow_log_of_finished_build_ends() {
    let (env, handler) = handler().await;
    let drv = floating_drv("quick.txt", "echo only line; echo done > $out");
    let drv_path = env.write_drv(&drv).await.unwrap();
    let drv_full = env.store.dir().display_path(&drv_path);

    let started = handler
        .handle(
            &env.ctx,
            "store.realize",
            json!({ "drvPaths": [drv_full] }),
        )
        .await
        .unwrap();
    let build_id = started["buildID"].as_str().unwrap().to_owned();
    wait_terminal(&handler, &env.ctx, &build_id).await;

    let first = handler
        .handle(
            &env.ctx,
            "store.readLog",
            json!({
                "buildID": build_id,
                "drvPath": drv_full,
                "rangeStart": 0,
                "follow": true,
            }),
        )
        .await
        .unwrap();
    assert!(first["log"].as_str().unwrap().contains("only line"));

    let next = first["nextOffset"].as_u64().unwrap();
    let second = handler
        .handle(
            &env.ctx,
            "store.readLog",
            json!({
                "buildID": build_id,
                "drvPath": drv_full,
                "rangeStart": next,
                "follow": true,
            }),
        )
        .await
        .unwrap();
    assert_eq!(second["log"], json!(""));
    assert_eq!(second["done"], json!(true));
}

#[tokio::test(flavor = "multi_thread")]
async fn realize_rejects_non_derivations() {
    let (env, handler) = handler().await;
    let path = env
        .import_flat_file("hello.txt", b"Hello, World!\n")
        .await
        .unwrap();
    let err = handler
        .handle(
            &env.ctx,
            "store.realize",
            json!({ "drvPaths": [env.store.dir().display_path(&path)] }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, crate::error::ServerError::InvalidParams(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_unknown_build() {
    let (env, handler) = handler().await;
    let err = handler
        .handle(
            &env.ctx,
            "store.cancelBuild",
            json!({ "buildID": "feedfacefeedfacefeedfacefeedface" }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, crate::error::ServerError::UnknownBuild(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn expand_reports_substituted_invocation() {
    let (env, handler) = handler().await;
    let input = env
        .import_flat_file("hello.txt", b"Hello, World!\n")
        .await
        .unwrap();

    let mut inner = floating_drv("dep.txt", "cat $in > $out");
    inner
        .env
        .insert("in".to_owned(), env.store.dir().display_path(&input));
    inner.input_sources.insert(input);
    let inner_path = env.write_drv(&inner).await.unwrap();

    let mut outer = floating_drv("top.txt", "cat $in $in > $out");
    outer.env.insert(
        "in".to_owned(),
        zb_store_core::placeholder::unknown_ca_output_placeholder(
            &inner_path,
            &zb_store_core::derivation::OutputName::out(),
        ),
    );
    outer.input_derivations.insert(
        inner_path.clone(),
        std::collections::BTreeSet::from([zb_store_core::derivation::OutputName::out()]),
    );
    let outer_path = env.write_drv(&outer).await.unwrap();

    let started = handler
        .handle(
            &env.ctx,
            "store.expand",
            json!({
                "drvPath": env.store.dir().display_path(&outer_path),
                "temporaryDirectory": "/tmp/expand-test",
            }),
        )
        .await
        .unwrap();
    let build_id = started["buildID"].as_str().unwrap().to_owned();
    let build = wait_terminal(&handler, &env.ctx, &build_id).await;
    assert_eq!(build["status"], "success");

    let result = handler
        .handle(
            &env.ctx,
            "store.getBuildResult",
            json!({
                "buildID": build_id,
                "drvPath": env.store.dir().display_path(&outer_path),
            }),
        )
        .await
        .unwrap();
    let report = &result["outputs"];
    assert_eq!(report["builder"], json!("/bin/sh"));
    let in_env = report["env"]["in"].as_str().unwrap();
    assert!(
        in_env.starts_with(env.store.dir().as_str()),
        "input placeholder expanded to a realized path: {in_env}"
    );
    assert_eq!(report["env"]["out"], json!("/tmp/expand-test/out"));
}
