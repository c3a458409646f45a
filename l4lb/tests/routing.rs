use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use l4lb::{EngineSettings, Error, FiveTuple, RealServer, RoutingEngine};
use network_types::ip::IpProto;

fn real(s: &str) -> RealServer {
    s.parse().unwrap()
}

fn abc() -> Vec<RealServer> {
    vec![real("10.1.0.1:1000"), real("10.1.0.2:2000"), real("10.1.0.3:3000")]
}

fn flow(source: u32, source_port: u16) -> FiveTuple {
    FiveTuple::new(
        u32::from(Ipv4Addr::new(10, 0, 0, 0)) + source,
        source_port,
        u32::from(Ipv4Addr::new(10, 0, 0, 9)),
        80,
        IpProto::Udp,
    )
}

#[test]
fn three_backend_scenario() {
    let engine = RoutingEngine::with_backends(&EngineSettings::default(), &abc()).unwrap();
    let generation = engine.generation().unwrap();
    assert_eq!(generation.table().len(), 503);
    for (_, count) in generation.table().slot_counts() {
        assert!((167..=168).contains(&count), "{count}");
    }

    let f = flow(1, 4000);
    let slot = engine.flow_hasher().slot(&f, 503);
    let first = engine.route(&f).unwrap();
    assert_eq!(first, *generation.table().get(slot).unwrap());
    assert_eq!(engine.route(&f).unwrap(), first);

    let mut with_d = abc();
    with_d.push(real("10.1.0.4:4000"));
    engine.reload(&with_d).unwrap();
    assert_eq!(engine.route(&f).unwrap(), first);
}

#[test]
fn affinity_survives_rebuild_that_moves_the_slot() {
    let settings = EngineSettings::default();
    let engine = RoutingEngine::with_backends(&settings, &abc()).unwrap();
    let old = engine.generation().unwrap();

    let mut with_d = abc();
    with_d.push(real("10.1.0.4:4000"));
    let preview = engine.build(&with_d).unwrap();

    // Flows whose slot changes owner once D joins.
    let moved: Vec<FiveTuple> = (1..2000)
        .map(|port| flow(1, port))
        .filter(|f| {
            let slot = engine.flow_hasher().slot(f, 503);
            old.table().get(slot) != preview.table().get(slot)
        })
        .collect();
    assert!(!moved.is_empty());

    let before: Vec<RealServer> = moved.iter().map(|f| engine.route(f).unwrap()).collect();
    engine.reload(&with_d).unwrap();
    let after: Vec<RealServer> = moved.iter().map(|f| engine.route(f).unwrap()).collect();
    assert_eq!(before, after);

    // A flow first seen under the new generation follows the new table.
    let fresh = moved
        .iter()
        .map(|f| FiveTuple { source_addr: f.source_addr + 1000, ..*f })
        .next()
        .unwrap();
    let slot = engine.flow_hasher().slot(&fresh, 503);
    assert_eq!(
        engine.route(&fresh).unwrap(),
        *engine.generation().unwrap().table().get(slot).unwrap()
    );
}

#[test]
fn affinity_expires_after_idle_timeout() {
    let settings = EngineSettings {
        idle_timeout: Duration::from_millis(50),
        ..EngineSettings::default()
    };
    let engine = RoutingEngine::with_backends(&settings, &abc()).unwrap();
    let f = flow(1, 4000);
    engine.route(&f).unwrap();
    assert!(engine.affinity().get(&f).is_some());
    thread::sleep(Duration::from_millis(300));
    assert!(engine.affinity().get(&f).is_none());
}

#[test]
fn single_backend_gets_everything() {
    let engine =
        RoutingEngine::with_backends(&EngineSettings::default(), &[real("10.1.0.1:1000")]).unwrap();
    for port in 1..500 {
        assert_eq!(engine.route(&flow(2, port)).unwrap(), real("10.1.0.1:1000"));
    }
}

#[test]
fn table_too_small_fails_fast() {
    let settings = EngineSettings {
        table_size: 3,
        ..EngineSettings::default()
    };
    let engine = RoutingEngine::new(&settings);
    let err = engine.reload(&abc()).unwrap_err();
    assert_eq!(err, Error::TableTooSmall { backends: 3, table_size: 3 });
    assert_eq!(engine.route(&flow(1, 4000)), Err(Error::UnroutableFlow));
}

#[test]
fn concurrent_routes_during_reloads() {
    let sets: Vec<Vec<RealServer>> = vec![
        abc(),
        vec![real("10.1.0.1:1000"), real("10.1.0.2:2000")],
        vec![
            real("10.1.0.1:1000"),
            real("10.1.0.2:2000"),
            real("10.1.0.3:3000"),
            real("10.1.0.4:4000"),
        ],
    ];
    let known: HashSet<RealServer> = sets.iter().flatten().copied().collect();
    let engine = Arc::new(RoutingEngine::with_backends(&EngineSettings::default(), &sets[0]).unwrap());
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            for i in 0..200 {
                engine.reload(&sets[i % sets.len()]).unwrap();
            }
            done.store(true, Ordering::Release);
        });

        let workers: Vec<_> = (0..8u32)
            .map(|worker| {
                let engine = &engine;
                let done = &done;
                let known = &known;
                s.spawn(move || {
                    let mut routed = 0usize;
                    let mut port = 1u16;
                    while !done.load(Ordering::Acquire) || routed < 1000 {
                        let f = flow(100 + worker, port);
                        let first = engine.route(&f).unwrap();
                        assert!(known.contains(&first));
                        routed += 1;
                        port = port.wrapping_add(1).max(1);
                    }
                    routed
                })
            })
            .collect();

        for worker in workers {
            assert!(worker.join().unwrap() >= 1000);
        }
    });
}

#[test]
fn concurrent_first_packets_share_one_entry() {
    let engine = RoutingEngine::with_backends(&EngineSettings::default(), &abc()).unwrap();
    let f = flow(7, 7777);
    let results: Vec<RealServer> = thread::scope(|s| {
        let handles: Vec<_> = (0..16).map(|_| s.spawn(|| engine.route(&f).unwrap())).collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert!(results.iter().all(|r| *r == results[0]));
    assert_eq!(engine.affinity().get(&f), Some(results[0]));
}
