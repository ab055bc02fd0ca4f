use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::{
    io::{BufReader, Write},
    net::TcpStream,
    thread,
};
use tilelite::{
    protocol::{decode, encode_request, Decode, MessageType, Request, Tile},
    Config, RenderError, RenderFn, ShutdownHandle, TileServer,
};

fn request(x: i32) -> Request {
    Request {
        kind: MessageType::TileRequest,
        tile: Tile {
            x,
            y: x + 1,
            z: 12,
            w: 256,
            h: 256,
        },
    }
}

fn pipelined(count: usize) -> Vec<u8> {
    let mut wire = Vec::new();
    for x in 0..count {
        encode_request(&request(x as i32), &mut wire).unwrap();
    }
    wire
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for count in [1, 64, 1024] {
        let wire = pipelined(count);
        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_with_input(BenchmarkId::new("pipelined", count), &wire, |b, wire| {
            b.iter(|| {
                let mut offset = 0;
                while let Decode::Decoded(request, n) = decode(black_box(&wire[offset..])) {
                    black_box(request);
                    offset += n;
                }
                offset
            })
        });
    }

    group.finish();
}

struct ServerHandle {
    shutdown: ShutdownHandle,
    handle: Option<thread::JoinHandle<()>>,
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn bench_round_trip(c: &mut Criterion) {
    let config = Config::from_pairs([("host", "127.0.0.1"), ("port", "0"), ("threads", "4")]).unwrap();
    let renderer = RenderFn(|_: MessageType, _: &Tile| -> Result<Vec<u8>, RenderError> {
        Ok(vec![0u8; 64])
    });
    let server = TileServer::bind(&config, renderer).unwrap();
    let addr = server.local_addr();
    let _server = ServerHandle {
        shutdown: server.shutdown_handle(),
        handle: Some(thread::spawn(move || {
            let _ = server.run();
        })),
    };

    let mut group = c.benchmark_group("round_trip");
    for count in [1, 32] {
        let wire = pipelined(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("requests", count), &wire, |b, wire| {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.set_nodelay(true).unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            b.iter(|| {
                stream.write_all(wire).unwrap();
                for _ in 0..count {
                    black_box(rmpv::decode::read_value(&mut reader).unwrap());
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_decode, bench_round_trip);
criterion_main!(benches);
