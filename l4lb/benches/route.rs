use std::net::Ipv4Addr;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use l4lb::hash::{ConsistentHasher, MaglevHasher};
use l4lb::{EngineSettings, FiveTuple, RealServer, RoutingEngine};
use network_types::ip::IpProto;

fn reals(n: u8) -> Vec<RealServer> {
    (1..=n)
        .map(|i| RealServer::new(Ipv4Addr::new(10, 1, 0, i), 8080))
        .collect()
}

fn bench_build(c: &mut Criterion) {
    let backends = reals(10);
    for table_size in [503u32, 65537] {
        let hasher = MaglevHasher::new(table_size);
        c.bench_function(&format!("build_table_{table_size}"), |b| {
            b.iter(|| hasher.generate_hash_ring(black_box(&backends)).unwrap())
        });
    }
}

fn bench_route(c: &mut Criterion) {
    let engine = RoutingEngine::with_backends(&EngineSettings::default(), &reals(10)).unwrap();
    let flows: Vec<FiveTuple> = (1..=1024u16)
        .map(|port| FiveTuple::new(0x0a00_0001, port, 0x0a00_0009, 80, IpProto::Tcp))
        .collect();
    for flow in &flows {
        engine.route(flow).unwrap();
    }

    c.bench_function("route_affinity_hit", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 1) % flows.len();
            engine.route(black_box(&flows[i])).unwrap()
        })
    });
}

criterion_group!(benches, bench_build, bench_route);
criterion_main!(benches);
