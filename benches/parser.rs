//! Frame parser throughput under the chunkings the engines actually see.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use ringmark::protocol::{encode_header, FrameParser};

fn request_stream(frames: usize, payload_len: u32) -> Vec<u8> {
    let mut wire = Vec::new();
    for _ in 0..frames {
        wire.extend_from_slice(&encode_header(payload_len, 1));
        wire.extend(std::iter::repeat(0x5a).take(payload_len as usize));
    }
    wire
}

fn bench_parser(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_parser");

    for payload in [0u32, 64, 512, 4096] {
        let stream = request_stream(1000, payload);
        group.throughput(Throughput::Bytes(stream.len() as u64));
        group.bench_function(format!("whole_buffer_{payload}b"), |b| {
            b.iter(|| {
                let mut parser = FrameParser::new();
                black_box(parser.consume(black_box(&stream)))
            })
        });
    }

    // Recv-sized chunks: headers straddle the boundaries.
    let stream = request_stream(1000, 300);
    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("chunked_4096", |b| {
        b.iter(|| {
            let mut parser = FrameParser::new();
            let mut total = 0u32;
            for chunk in stream.chunks(4096) {
                total += parser.consume(black_box(chunk)).frames;
            }
            black_box(total)
        })
    });

    group.finish();
}

criterion_group!(benches, bench_parser);
criterion_main!(benches);
