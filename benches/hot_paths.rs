use std::fmt::Write;

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use flamestore::config::RuleConfig;
use flamestore::ingest::stack_rows;
use flamestore::query::flamegraph::FlameGraph;
use flamestore::stack::decode::{decode_artifact, IdleFilter};
use flamestore::stack::hash::path_hash;
use flamestore::stack::normalize::RuleSet;

/// Artifact with `stacks` distinct lines sharing a handful of prefixes.
fn artifact_body(stacks: usize) -> String {
    let mut body = String::from("#{\"hostname\":\"bench-host\",\"continuous\":true}\n");
    for i in 0..stacks {
        let _ = writeln!(
            body,
            "[python3];main;handler_{};db.query;cursor.execute_{} {}",
            i % 16,
            i,
            1 + i % 50
        );
        if i % 10 == 0 {
            let _ = writeln!(body, "swapper;cpu_idle {}", 100 + i);
        }
    }
    body
}

fn rules() -> RuleSet {
    RuleSet::compile(&[RuleConfig {
        pattern: r"_\d+$".to_string(),
        replacement: String::new(),
    }])
    .expect("compile rules")
}

fn bench_hash(c: &mut Criterion) {
    let frames = ["main", "handler", "db.query", "cursor.execute", "socket.recv"];

    c.bench_function("path_hash/depth_5", |b| {
        b.iter(|| path_hash(black_box(&frames)))
    });
}

fn bench_decode(c: &mut Criterion) {
    let body = artifact_body(2_000);
    let rules = rules();
    let idle = IdleFilter::default();

    c.bench_function("decode_artifact/2k_lines", |b| {
        b.iter(|| {
            let artifact =
                decode_artifact(black_box(&body), &rules, &idle).expect("decode artifact");
            black_box(artifact.entry_count())
        })
    });
}

fn bench_flamegraph(c: &mut Criterion) {
    let artifact =
        decode_artifact(&artifact_body(2_000), &rules(), &IdleFilter::default()).expect("decode");
    let rows = stack_rows(&artifact, 1, Utc::now());
    let graph = FlameGraph::build(&rows);

    c.bench_function("flamegraph/build", |b| {
        b.iter(|| black_box(FlameGraph::build(black_box(&rows)).total()))
    });

    c.bench_function("flamegraph/write_json", |b| {
        b.iter(|| {
            let mut out = String::new();
            graph.write_json(&mut out);
            black_box(out.len())
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_hash(c);
    bench_decode(c);
    bench_flamegraph(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
