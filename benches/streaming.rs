//! End-to-end streaming throughput against the simulated transport.
//!
//! Each iteration starts a session, takes a fixed number of buffers through
//! the callback, cancels, and waits for the drain.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use osmosdr::{Device, MockBackend, StreamConfig};

const BUFFERS_PER_RUN: u64 = 256;

fn bench_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_mock");
    let device = Device::open(&MockBackend::new(1), 0).expect("open");

    for buf_len in [16 * 512u32, 64 * 512, 512 * 512] {
        group.throughput(Throughput::Bytes(BUFFERS_PER_RUN * u64::from(buf_len)));
        group.bench_with_input(BenchmarkId::from_parameter(buf_len), &buf_len, |b, &len| {
            b.iter(|| {
                let cancel = device.cancel_handle();
                let mut seen = 0u64;
                let summary = device
                    .read_async(
                        |buf: &[u8]| {
                            black_box(buf[0]);
                            seen += 1;
                            if seen == BUFFERS_PER_RUN {
                                cancel.cancel();
                            }
                        },
                        StreamConfig::new(16, len),
                    )
                    .expect("stream");
                black_box(summary.bytes_delivered);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_stream);
criterion_main!(benches);
