use std::fs;

use chrono::NaiveDate;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use healthlog::events::{novel_lines, read_tail, TAIL_LINES};
use healthlog::rotation::{LogStream, RotationPolicy};
use tempfile::TempDir;

fn kernel_tail() -> Vec<String> {
    (0..TAIL_LINES)
        .map(|i| format!("[{i:>6}.000000] usb 1-{}: device descriptor read/64, error -71", i % 4))
        .collect()
}

fn kernel_capture() -> String {
    let mut text = String::new();
    for i in (TAIL_LINES / 2)..(TAIL_LINES + 50) {
        text.push_str(&format!(
            "[{i:>6}.000000] usb 1-{}: device descriptor read/64, error -71\n",
            i % 4
        ));
    }
    text
}

fn bench_novel_lines(c: &mut Criterion) {
    let tail = kernel_tail();
    let captured = kernel_capture();

    c.bench_function("novel_lines_100_tail", |b| {
        b.iter(|| black_box(novel_lines(black_box(&captured), black_box(&tail))));
    });
}

fn bench_read_tail(c: &mut Criterion) {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("events_kernel_2024-03-01_000.log");
    let mut text = String::new();
    for line in kernel_tail().iter().cycle().take(5_000) {
        text.push_str(line);
        text.push('\n');
    }
    fs::write(&path, text).expect("write segment");

    c.bench_function("read_tail_5k_lines", |b| {
        b.iter(|| black_box(read_tail(black_box(&path), TAIL_LINES).expect("tail")));
    });
}

fn bench_resolve(c: &mut Criterion) {
    let dir = TempDir::new().expect("temp dir");
    let date = NaiveDate::from_ymd_opt(2024, 3, 1).expect("date");
    let stream = LogStream::event("kernel");
    let policy = RotationPolicy::new(dir.path(), 1_000);

    // Twenty full segments ahead of the live one.
    for index in 0..20 {
        let path = dir.path().join(stream.segment_file_name(date, index));
        fs::write(path, vec![b'x'; 1_000]).expect("write full segment");
    }

    c.bench_function("resolve_past_20_full_segments", |b| {
        b.iter(|| black_box(policy.resolve(black_box(&stream), date).expect("resolve")));
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_novel_lines(c);
    bench_read_tail(c);
    bench_resolve(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
