//! Dispatch of parsed flows to the routing engine of their virtual service.
//!
//! This is the surface the packet interception side calls: one flow key in,
//! either a backend to rewrite the destination to or an error meaning
//! "leave the packet alone".

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::Arc;

use arc_swap::ArcSwap;
use l4lb_common::{FiveTuple, VipKey};
use log::{error, info, warn};
use network_types::ip::IpProto;
use parking_lot::Mutex;

use crate::config::{Config, RealServer};
use crate::engine::{EngineSettings, RoutingEngine};
use crate::error::{Error, Result};
use crate::flow;

/// Human readable `addr:port/proto` form of a VIP.
pub fn describe(key: &VipKey) -> String {
    format!(
        "{}:{}/{:?}",
        std::net::Ipv4Addr::from(key.addr),
        key.port,
        key.proto
    )
}

/// Outcome of applying a configuration to a running balancer.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub added: Vec<VipKey>,
    pub reloaded: Vec<VipKey>,
    pub removed: Vec<VipKey>,
    /// VIPs whose new backend set was rejected. Each keeps whatever it was
    /// serving before, if anything.
    pub failed: Vec<(VipKey, Error)>,
}

impl ApplyReport {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Balancer {
    services: ArcSwap<HashMap<VipKey, Arc<RoutingEngine>>>,
    apply_lock: Mutex<()>,
}

impl Balancer {
    pub fn new() -> Self {
        Balancer {
            services: ArcSwap::from_pointee(HashMap::new()),
            apply_lock: Mutex::new(()),
        }
    }

    /// Build a balancer serving every VIP in `config`. Fails on the first
    /// VIP whose backend set cannot be activated.
    pub fn from_config(config: &Config) -> Result<Self> {
        let balancer = Balancer::new();
        let report = balancer.apply(config);
        if let Some((key, e)) = report.failed.into_iter().next() {
            error!("vip {}: {}", describe(&key), e);
            return Err(e);
        }
        Ok(balancer)
    }

    /// Bring the running services in line with `config`.
    ///
    /// Existing VIPs are reloaded in place and keep their affinity entries,
    /// also across engine settings changes. VIPs missing from `config` stop
    /// being served.
    pub fn apply(&self, config: &Config) -> ApplyReport {
        let _guard = self.apply_lock.lock();
        let settings = EngineSettings::from_config(config);
        let current = self.services.load_full();
        let mut next = HashMap::with_capacity(config.vips.len());
        let mut report = ApplyReport::default();

        for vip in &config.vips {
            let key = vip.key();
            match current.get(&key) {
                Some(engine) => {
                    match engine.reconfigure(&settings, &vip.real_servers) {
                        Ok(_) => report.reloaded.push(key),
                        Err(e) => report.failed.push((key, e)),
                    }
                    next.insert(key, Arc::clone(engine));
                }
                None => match RoutingEngine::with_backends(&settings, &vip.real_servers) {
                    Ok(engine) => {
                        report.added.push(key);
                        next.insert(key, Arc::new(engine));
                    }
                    Err(e) => report.failed.push((key, e)),
                },
            }
        }

        for key in current.keys() {
            if !next.contains_key(key) {
                report.removed.push(*key);
            }
        }

        for (key, e) in &report.failed {
            warn!("vip {}: {}", describe(key), e);
        }
        for key in &report.removed {
            info!("vip {}: removed", describe(key));
        }

        self.services.store(Arc::new(next));
        report
    }

    /// Backend for one packet, or the reason to pass it through unmodified.
    pub fn route(&self, flow: &FiveTuple) -> Result<RealServer> {
        flow::validate(flow)?;
        let services = self.services.load();
        let engine = services.get(&flow.vip()).ok_or(Error::UnroutableFlow)?;
        engine.resolve(flow)
    }

    /// Served VIPs on `addr`, restricted to `proto` when given.
    pub fn find(&self, addr: SocketAddrV4, proto: Option<IpProto>) -> Vec<(VipKey, Arc<RoutingEngine>)> {
        self.services()
            .into_iter()
            .filter(|(key, _)| {
                key.addr == u32::from(*addr.ip())
                    && key.port == addr.port()
                    && proto.map_or(true, |proto| key.proto as u8 == proto as u8)
            })
            .collect()
    }

    pub fn engine(&self, key: &VipKey) -> Option<Arc<RoutingEngine>> {
        self.services.load().get(key).cloned()
    }

    /// All served VIPs, ordered by address, port and protocol.
    pub fn services(&self) -> Vec<(VipKey, Arc<RoutingEngine>)> {
        let mut services: Vec<_> = self
            .services
            .load()
            .iter()
            .map(|(key, engine)| (*key, Arc::clone(engine)))
            .collect();
        services.sort_by_key(|(key, _)| (key.addr, key.port, key.proto as u8));
        services
    }
}

impl Default for Balancer {
    fn default() -> Self {
        Balancer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
vips:
  - vip: 10.0.0.9
    port: 80
    proto: udp
    real_servers: ["10.1.0.1:1000", "10.1.0.2:2000"]
  - vip: 10.0.0.9
    port: 443
    proto: tcp
    real_servers: ["10.2.0.1:443"]
"#;

    fn flow(dst_port: u16, proto: IpProto) -> FiveTuple {
        FiveTuple::new(0x0a00_0001, 4000, 0x0a00_0009, dst_port, proto)
    }

    #[test]
    fn routes_by_vip() {
        let balancer = Balancer::from_config(&Config::from_yaml(CONFIG).unwrap()).unwrap();
        assert_eq!(
            balancer.route(&flow(443, IpProto::Tcp)).unwrap(),
            "10.2.0.1:443".parse::<RealServer>().unwrap()
        );
        let udp = balancer.route(&flow(80, IpProto::Udp)).unwrap();
        assert!(udp.addr.octets()[..2] == [10, 1]);
    }

    #[test]
    fn unknown_vip_passes_through() {
        let balancer = Balancer::from_config(&Config::from_yaml(CONFIG).unwrap()).unwrap();
        assert_eq!(balancer.route(&flow(80, IpProto::Tcp)), Err(Error::UnroutableFlow));
        assert_eq!(balancer.route(&flow(8080, IpProto::Udp)), Err(Error::UnroutableFlow));
        assert_eq!(balancer.route(&flow(80, IpProto::Icmp)), Err(Error::UnroutableFlow));
    }

    #[test]
    fn portless_icmp_is_unroutable() {
        let balancer = Balancer::from_config(&Config::from_yaml(CONFIG).unwrap()).unwrap();
        let icmp = FiveTuple::new(0x0a00_0001, 0, 0x0a00_0009, 0, IpProto::Icmp);
        assert_eq!(balancer.route(&icmp), Err(Error::UnroutableFlow));
    }

    #[test]
    fn malformed_key_to_known_vip_is_reported() {
        let balancer = Balancer::from_config(&Config::from_yaml(CONFIG).unwrap()).unwrap();
        let zero_port = FiveTuple::new(0x0a00_0001, 0, 0x0a00_0009, 80, IpProto::Udp);
        assert_eq!(
            balancer.route(&zero_port),
            Err(Error::MalformedFlowKey("zero source port"))
        );
    }

    #[test]
    fn settings_change_keeps_routed_flows() {
        let balancer = Balancer::from_config(&Config::from_yaml(CONFIG).unwrap()).unwrap();
        let udp_key = VipKey::new(0x0a00_0009, 80, IpProto::Udp);
        let before_engine = balancer.engine(&udp_key).unwrap();
        let flows: Vec<FiveTuple> = (1..2000)
            .map(|port| FiveTuple::new(0x0a00_0001, port, 0x0a00_0009, 80, IpProto::Udp))
            .collect();
        let before: Vec<RealServer> = flows.iter().map(|f| balancer.route(f).unwrap()).collect();

        let mut next = Config::from_yaml(CONFIG).unwrap();
        next.maglev.table_size = 1009;
        let report = balancer.apply(&next);
        assert!(report.is_ok());
        assert!(report.reloaded.contains(&udp_key));

        let engine = balancer.engine(&udp_key).unwrap();
        assert!(Arc::ptr_eq(&before_engine, &engine));
        assert_eq!(engine.generation().unwrap().table().len(), 1009);
        let after: Vec<RealServer> = flows.iter().map(|f| balancer.route(f).unwrap()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn find_filters_by_protocol() {
        let balancer = Balancer::from_config(
            &Config::from_yaml(
                r#"
vips:
  - vip: 10.0.0.9
    port: 53
    proto: udp
    real_servers: ["10.1.0.1:53"]
  - vip: 10.0.0.9
    port: 53
    proto: tcp
    real_servers: ["10.1.0.2:53"]
"#,
            )
            .unwrap(),
        )
        .unwrap();
        let addr: SocketAddrV4 = "10.0.0.9:53".parse().unwrap();
        assert_eq!(balancer.find(addr, None).len(), 2);
        let tcp = balancer.find(addr, Some(IpProto::Tcp));
        assert_eq!(tcp.len(), 1);
        assert_eq!(tcp[0].0, VipKey::new(0x0a00_0009, 53, IpProto::Tcp));
        assert!(balancer.find("10.0.0.9:80".parse().unwrap(), None).is_empty());
    }

    #[test]
    fn apply_adds_reloads_and_removes() {
        let balancer = Balancer::from_config(&Config::from_yaml(CONFIG).unwrap()).unwrap();
        let udp_key = VipKey::new(0x0a00_0009, 80, IpProto::Udp);
        let before = balancer.engine(&udp_key).unwrap();

        let next = Config::from_yaml(
            r#"
vips:
  - vip: 10.0.0.9
    port: 80
    proto: udp
    real_servers: ["10.1.0.1:1000", "10.1.0.2:2000", "10.1.0.3:3000"]
  - vip: 10.0.0.10
    port: 53
    proto: 17
    real_servers: ["10.3.0.1:53"]
"#,
        )
        .unwrap();
        let report = balancer.apply(&next);
        assert!(report.is_ok());
        assert_eq!(report.reloaded, vec![udp_key]);
        assert_eq!(report.added, vec![VipKey::new(0x0a00_000a, 53, IpProto::Udp)]);
        assert_eq!(report.removed, vec![VipKey::new(0x0a00_0009, 443, IpProto::Tcp)]);

        // Reloaded in place: same engine, new generation.
        let after = balancer.engine(&udp_key).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.generation().unwrap().backends().len(), 3);
        assert_eq!(balancer.services().len(), 2);
    }

    #[test]
    fn failed_vip_keeps_serving_previous_generation() {
        let balancer = Balancer::from_config(&Config::from_yaml(CONFIG).unwrap()).unwrap();
        let mut next = Config::from_yaml(CONFIG).unwrap();
        next.vips[0].real_servers.clear();

        let report = balancer.apply(&next);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].1, Error::NoBackends);
        assert!(balancer.route(&flow(80, IpProto::Udp)).is_ok());
    }

    #[test]
    fn describe_vip() {
        assert_eq!(
            describe(&VipKey::new(0x0a00_0009, 80, IpProto::Udp)),
            "10.0.0.9:80/Udp"
        );
    }
}
