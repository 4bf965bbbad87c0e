use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rollupd::dispatch::{ThrottleTable, WorkSignal};
use rollupd::rollup::{fold_detail_rows, DetailKind, DetailRow};
use tokio::time::Instant;

fn build_detail_rows() -> Vec<DetailRow> {
    let mut rows = Vec::with_capacity(DetailKind::ALL.len() * 5);
    for kind in DetailKind::ALL {
        for i in 0..5u32 {
            let row = match kind {
                DetailKind::LastVisitedUser => DetailRow::new(
                    kind.tag(),
                    Some(&format!("10.0.0.{i}/32")),
                    "2024-03-01 10:20:30.123456+07",
                ),
                _ => DetailRow::new(kind.tag(), Some(&format!("entry-{i}")), (100 - i).to_string()),
            };
            rows.push(row);
        }
    }
    rows
}

fn bench_coalesce(c: &mut Criterion) {
    c.bench_function("throttle_table/coalesce_hot_key", |b| {
        let table = ThrottleTable::new(Duration::from_secs(5));
        b.iter(|| {
            let replaced = table.insert(WorkSignal::new(black_box(7u32), || async { Ok(()) }));
            black_box(replaced)
        })
    });

    c.bench_function("throttle_table/drain_1k_keys", |b| {
        b.iter(|| {
            let table = ThrottleTable::new(Duration::from_secs(5));
            for key in 0..1_000u32 {
                table.insert(WorkSignal::new(key, || async { Ok(()) }));
            }
            let now = Instant::now();
            let mut drained = 0usize;
            for key in table.due_keys(now) {
                if table.take_if_due(key, now).is_some() {
                    drained += 1;
                }
            }
            black_box(drained)
        })
    });
}

fn bench_fold(c: &mut Criterion) {
    let rows = build_detail_rows();

    c.bench_function("detail_rows/fold_full_summary", |b| {
        b.iter(|| {
            let summary = fold_detail_rows(black_box(rows.clone()));
            black_box(summary.top_urls.len() + summary.last_visited_users.len())
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_coalesce(c);
    bench_fold(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
