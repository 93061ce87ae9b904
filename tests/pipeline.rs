//! End-to-end pipeline tests: spool directory and blob root in, HTTP query
//! API out.

use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;

use flamestore::config::{Config, StoreBackendKind};
use flamestore::engine::Engine;
use flamestore::ingest::queue::QueueMessage;
use flamestore::store::{Store, Tier};

fn config(dir: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.store.backend = StoreBackendKind::Memory;
    cfg.ingest.queue.spool_dir = dir.join("spool");
    cfg.ingest.blobs.root = dir.join("blobs");
    cfg.ingest.poll_interval = Duration::from_millis(10);
    cfg.writer.flush_interval = Duration::from_millis(10);
    cfg.query.addr = "127.0.0.1:0".to_string();
    cfg.health.addr = "127.0.0.1:0".to_string();
    cfg
}

fn gzip(body: &str) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(body.as_bytes()).expect("gzip write");
    enc.finish().expect("gzip finish")
}

fn put_blob(dir: &Path, key: &str, body: &[u8]) {
    let path = dir.join("blobs").join(key);
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    std::fs::write(path, body).expect("write blob");
}

/// Writes a message file atomically so the poll loop never sees it half
/// written.
fn spool_raw(dir: &Path, name: &str, body: &[u8]) {
    let tmp = dir.join("spool").join(format!("{name}.tmp"));
    std::fs::write(&tmp, body).expect("write message");
    std::fs::rename(&tmp, dir.join("spool").join(name)).expect("publish message");
}

fn spool(dir: &Path, name: &str, msg: &QueueMessage) {
    spool_raw(dir, name, &serde_json::to_vec(msg).expect("serialize"));
}

fn message(key: &str) -> QueueMessage {
    QueueMessage {
        service_id: 7,
        service_name: "checkout".to_string(),
        blob_key: key.to_string(),
        enqueued_at: None,
        perf_events: Some(vec!["cpu-clock".to_string()]),
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

fn spool_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir.join("spool"))
        .expect("read spool")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn minute_samples(engine: &Engine, service_id: u64) -> u64 {
    match engine.store().map(|s| s.as_ref()) {
        Some(Store::Memory(mem)) => mem.total_samples(Tier::Minute, service_id),
        _ => 0,
    }
}

async fn get(addr: SocketAddr, path: &str) -> (u16, String) {
    let resp = reqwest::get(format!("http://{addr}{path}"))
        .await
        .expect("request");
    let status = resp.status().as_u16();
    (status, resp.text().await.expect("body"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_artifact_flows_from_spool_to_query_api() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut engine = Engine::new(config(dir.path())).expect("engine");
    engine.start().await.expect("start");

    put_blob(
        dir.path(),
        "2024/03/01/a1.gz",
        &gzip(concat!(
            "#{\"hostname\":\"h1\",\"continuous\":true,\"session_html\":\"<html>s</html>\"}\n",
            "main;foo 5\n",
            "main;bar 3\n",
            "swapper;idle 9\n",
            "not a stack line\n",
        )),
    );
    spool(dir.path(), "001.json", &message("2024/03/01/a1.gz"));

    wait_for("artifact ack", || spool_entries(dir.path()).is_empty()).await;
    wait_for("minute rows", || minute_samples(&engine, 7) == 8).await;

    let blobs = dir.path().join("blobs");
    let session = blobs.join("products/checkout/stacks/a1.html");
    assert_eq!(
        std::fs::read_to_string(&session).expect("session blob"),
        "<html>s</html>"
    );
    let meta = std::fs::read_to_string(blobs.join("products/checkout/stacks/a1.html.meta.json"))
        .expect("metadata");
    assert!(meta.contains("cpu-clock"));

    let addr = engine.query_addr().expect("query addr");
    let (status, body) = get(addr, "/api/v1/services/7/flamegraph?format=collapsed").await;
    assert_eq!(status, 200);
    assert_eq!(body, "main;bar 3\nmain;foo 5\n");

    let (status, body) = get(addr, "/api/v1/services/7/flamegraph").await;
    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_str(&body).expect("json");
    assert_eq!(json["total"], 8);
    assert_eq!(json["violations"], 0);

    let health = engine.health().render().expect("render");
    assert!(health.contains("flamestore_artifacts_processed_total 1"));
    assert!(health.contains("flamestore_idle_lines_skipped_total 1"));
    assert!(health.contains("flamestore_partial_rows_skipped_total 1"));

    engine.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bad_inputs_are_acknowledged_and_counted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut engine = Engine::new(config(dir.path())).expect("engine");
    engine.start().await.expect("start");

    put_blob(dir.path(), "bad.gz", &gzip("#{not json\nmain 1\n"));
    spool(dir.path(), "001.json", &message("bad.gz"));
    spool(dir.path(), "002.json", &message("missing.gz"));
    spool_raw(dir.path(), "003.json", b"{garbage");

    wait_for("spool drained", || {
        spool_entries(dir.path()) == vec!["003.rejected".to_string()]
    })
    .await;

    let health = engine.health().render().expect("render");
    assert!(health.contains("flamestore_artifacts_failed_total{reason=\"malformed_artifact\"} 1"));
    assert!(health.contains("flamestore_artifacts_failed_total{reason=\"missing_blob\"} 1"));
    assert_eq!(minute_samples(&engine, 7), 0);

    engine.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_inflight_messages_recovered_on_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(dir.path().join("spool")).expect("mkdir");

    put_blob(dir.path(), "r.gz", &gzip("#{\"hostname\":\"h\"}\nmain 4\n"));
    let body = serde_json::to_vec(&message("r.gz")).expect("serialize");
    std::fs::write(dir.path().join("spool/001.json.inflight"), body).expect("write");

    let mut engine = Engine::new(config(dir.path())).expect("engine");
    engine.start().await.expect("start");

    wait_for("recovered artifact", || minute_samples(&engine, 7) == 4).await;
    wait_for("artifact ack", || spool_entries(dir.path()).is_empty()).await;

    engine.stop().await.expect("stop");
}
