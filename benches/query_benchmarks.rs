//! Query benchmarks: insert throughput, point lookup, filtered scan,
//! and aggregation over the memory module.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use quereus::{Database, Value};

fn seeded_db(rows: i64) -> Database {
    let db = Database::new().expect("open");
    db.exec(
        "CREATE TABLE bench (id INTEGER PRIMARY KEY, grp INTEGER, score REAL)",
        (),
    )
    .expect("create");
    db.exec("BEGIN", ()).expect("begin");
    let mut insert = db
        .prepare("INSERT INTO bench VALUES (?, ?, ?)")
        .expect("prepare");
    for i in 0..rows {
        insert
            .bind(vec![
                Value::Integer(i),
                Value::Integer(i % 10),
                Value::Real((i % 97) as f64),
            ])
            .run()
            .expect("insert");
    }
    db.exec("COMMIT", ()).expect("commit");
    db
}

fn bench_inserts(c: &mut Criterion) {
    c.bench_function("insert_1k_rows", |b| {
        b.iter(|| {
            let db = Database::new().expect("open");
            db.exec("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)", ())
                .expect("create");
            db.exec("BEGIN", ()).expect("begin");
            let mut insert = db.prepare("INSERT INTO t VALUES (?, ?)").expect("prepare");
            for i in 0..1000i64 {
                insert
                    .bind(vec![Value::Integer(i), Value::Text("row".into())])
                    .run()
                    .expect("insert");
            }
            db.exec("COMMIT", ()).expect("commit");
            black_box(db.changes())
        });
    });
}

fn bench_point_select(c: &mut Criterion) {
    let db = seeded_db(10_000);
    let mut select = db
        .prepare("SELECT score FROM bench WHERE id = ?")
        .expect("prepare");
    c.bench_function("point_select", |b| {
        b.iter(|| {
            let rows = select
                .bind(vec![Value::Integer(4242)])
                .all()
                .expect("select");
            black_box(rows.len())
        });
    });
}

fn bench_filtered_scan(c: &mut Criterion) {
    let db = seeded_db(10_000);
    c.bench_function("filtered_scan", |b| {
        b.iter(|| {
            let rows: Vec<_> = db
                .eval("SELECT id FROM bench WHERE score > 90.0", ())
                .expect("eval")
                .collect();
            black_box(rows.len())
        });
    });
}

fn bench_aggregate(c: &mut Criterion) {
    let db = seeded_db(10_000);
    c.bench_function("group_by_aggregate", |b| {
        b.iter(|| {
            let rows: Vec<_> = db
                .eval(
                    "SELECT grp, count(*), avg(score) FROM bench GROUP BY grp",
                    (),
                )
                .expect("eval")
                .collect();
            black_box(rows.len())
        });
    });
}

criterion_group!(
    benches,
    bench_inserts,
    bench_point_select,
    bench_filtered_scan,
    bench_aggregate
);
criterion_main!(benches);
