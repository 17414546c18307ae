use criterion::{black_box, criterion_group, criterion_main, Criterion};

use atelier_collab::protocol::{ClientEvent, ServerMessage};
use atelier_collab::resolver::ConflictResolver;
use uuid::Uuid;

/// Synthetic source file with `lines` numbered statements.
fn doc(lines: usize) -> String {
    (0..lines)
        .map(|i| format!("let value_{i} = {i};"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn bench_clean_merge(c: &mut Criterion) {
    let resolver = ConflictResolver::new();
    let base = doc(200);
    let mut local_lines: Vec<String> = base.lines().map(String::from).collect();
    local_lines[10] = "let value_10 = 1010;".to_string();
    let local = local_lines.join("\n");
    let mut remote_lines: Vec<String> = base.lines().map(String::from).collect();
    remote_lines[150] = "let value_150 = 5150;".to_string();
    let remote = remote_lines.join("\n");

    c.bench_function("smart_merge_200_lines_disjoint", |b| {
        b.iter(|| {
            black_box(
                resolver
                    .resolve(
                        black_box(&base),
                        black_box(&local),
                        black_box(&remote),
                        "main.rs",
                        "bench",
                    )
                    .unwrap(),
            );
        })
    });
}

fn bench_manual_conflict(c: &mut Criterion) {
    let resolver = ConflictResolver::new();

    c.bench_function("forced_manual_assignment_conflict", |b| {
        b.iter(|| {
            black_box(
                resolver
                    .resolve(
                        black_box("x = 1"),
                        black_box("x = 2"),
                        black_box("x = 3"),
                        "main.rs",
                        "bench",
                    )
                    .unwrap(),
            );
        })
    });
}

fn bench_semantic_merge(c: &mut Criterion) {
    let resolver = ConflictResolver::new();
    let base = doc(100);
    let local = format!("{base}\nlet added_local = 1;");
    let remote = format!("{base}\nlet added_remote = 2;");

    c.bench_function("semantic_merge_100_lines_appends", |b| {
        b.iter(|| {
            black_box(
                resolver
                    .resolve(
                        black_box(&base),
                        black_box(&local),
                        black_box(&remote),
                        "main.rs",
                        "bench",
                    )
                    .unwrap(),
            );
        })
    });
}

fn bench_event_encode(c: &mut Criterion) {
    let event = ClientEvent::Update {
        session_id: Uuid::new_v4(),
        content: doc(50),
        version: 7,
        user_id: "bench".to_string(),
    };

    c.bench_function("update_event_encode_50_lines", |b| {
        b.iter(|| {
            black_box(black_box(&event).encode().unwrap());
        })
    });
}

fn bench_message_decode(c: &mut Criterion) {
    let msg = ServerMessage::FileUpdated {
        content: doc(50),
        version: 7,
        user_id: "bench".to_string(),
    };
    let encoded = msg.encode().unwrap();

    c.bench_function("file_updated_decode_50_lines", |b| {
        b.iter(|| {
            black_box(ServerMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_clean_merge,
    bench_manual_conflict,
    bench_semantic_merge,
    bench_event_encode,
    bench_message_decode
);
criterion_main!(benches);
