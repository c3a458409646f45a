use anyhow::Context;
use clap::{Parser, Subcommand};
use l4lb::balancer::{describe, Balancer};
use l4lb::config::{parse_ip_proto, Config};
use l4lb::FiveTuple;
use log::{info, warn};
use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};

#[derive(Debug, Parser)]
struct Opt {
    #[clap(short, long, default_value = "config.yaml")]
    config: PathBuf,
    /// Default log filter when RUST_LOG is not set.
    #[clap(short, long, default_value = "info")]
    log_level: String,
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve until Ctrl-C, reloading the config file on SIGHUP.
    Run,
    /// Print per-backend slot counts, and optionally every slot, for each VIP.
    Table {
        /// Only show this VIP (addr:port).
        #[clap(long)]
        vip: Option<SocketAddrV4>,
        /// With --vip, only show the tcp or udp service on it.
        #[clap(long, requires = "vip")]
        proto: Option<String>,
        #[clap(long)]
        slots: bool,
    },
    /// Print the backend a flow would be sent to.
    Route {
        #[clap(long)]
        src: SocketAddrV4,
        #[clap(long)]
        dst: SocketAddrV4,
        #[clap(long, default_value = "udp")]
        proto: String,
    },
}

fn log_balance(balancer: &Balancer) {
    for (key, engine) in balancer.services() {
        if let Some(generation) = engine.generation() {
            let (min, max) = generation.table().spread();
            info!(
                "vip {}: generation {}, {} backends, {}..={} slots each",
                describe(&key),
                generation.id(),
                generation.backends().len(),
                min,
                max
            );
        }
    }
}

fn log_stats(balancer: &Balancer) {
    for (key, engine) in balancer.services() {
        let stats = engine.affinity().stats();
        info!(
            "vip {}: {} flows, {} hits, {} misses, {} stale, {} evicted, {} expired",
            describe(&key),
            stats.entries,
            stats.hits,
            stats.misses,
            stats.stale,
            stats.evictions,
            stats.expirations
        );
    }
}

fn stats_ticker(secs: u64) -> tokio::time::Interval {
    tokio::time::interval(Duration::from_secs(secs.max(1)))
}

async fn run(opt: &Opt, config: Config) -> Result<(), anyhow::Error> {
    let balancer = Balancer::from_config(&config).context("failed to build balancer")?;
    log_balance(&balancer);

    let mut hangup = unix_signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    let mut stats_interval = config.stats_interval_secs;
    let mut ticker = stats_ticker(stats_interval);

    info!("Waiting for Ctrl-C...");
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            _ = hangup.recv() => {
                info!("SIGHUP, reloading {}", opt.config.display());
                let config = match Config::load(&opt.config) {
                    Ok(config) => config,
                    Err(e) => {
                        warn!("keeping running config: {:#}", e);
                        continue;
                    }
                };
                let report = balancer.apply(&config);
                info!(
                    "reload: {} added, {} reloaded, {} removed, {} failed",
                    report.added.len(),
                    report.reloaded.len(),
                    report.removed.len(),
                    report.failed.len()
                );
                log_balance(&balancer);
                if config.stats_interval_secs != stats_interval {
                    stats_interval = config.stats_interval_secs;
                    ticker = stats_ticker(stats_interval);
                }
            }
            _ = ticker.tick(), if stats_interval > 0 => log_stats(&balancer),
        }
    }
    info!("Exiting...");

    Ok(())
}

fn print_table(
    config: &Config,
    vip: Option<SocketAddrV4>,
    proto: Option<&str>,
    slots: bool,
) -> Result<(), anyhow::Error> {
    let proto = proto
        .map(|p| parse_ip_proto(p).with_context(|| format!("unsupported protocol {p:?}")))
        .transpose()?;
    let balancer = Balancer::from_config(config).context("failed to build balancer")?;
    let services = match vip {
        Some(vip) => balancer.find(vip, proto),
        None => balancer.services(),
    };
    for (key, engine) in services {
        let Some(generation) = engine.generation() else {
            continue;
        };
        let table = generation.table();
        println!("{} ({} slots)", describe(&key), table.len());
        for (real, count) in table.slot_counts() {
            println!("  {:<21} {:>6}", real.to_string(), count);
        }
        if slots {
            for (slot, real) in table.iter() {
                println!("  [{:>6}] {}", slot, real);
            }
        }
    }
    Ok(())
}

fn print_route(config: &Config, src: SocketAddrV4, dst: SocketAddrV4, proto: &str) -> Result<(), anyhow::Error> {
    let proto = parse_ip_proto(proto).with_context(|| format!("unsupported protocol {proto:?}"))?;
    let balancer = Balancer::from_config(config).context("failed to build balancer")?;
    let flow = FiveTuple::new(
        u32::from(*src.ip()),
        src.port(),
        u32::from(*dst.ip()),
        dst.port(),
        proto,
    );
    match balancer.route(&flow) {
        Ok(real) => println!("{} -> {} ({:?}): {}", src, dst, proto, real),
        Err(e) => println!("{} -> {} ({:?}): pass through ({})", src, dst, proto, e),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let opt = Opt::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&opt.log_level)).init();

    let config = Config::load(&opt.config).context("failed to load config")?;

    match &opt.command {
        None | Some(Command::Run) => run(&opt, config).await,
        Some(Command::Table { vip, proto, slots }) => {
            print_table(&config, *vip, proto.as_deref(), *slots)
        }
        Some(Command::Route { src, dst, proto }) => print_route(&config, *src, *dst, proto),
    }
}
