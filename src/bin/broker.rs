use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{App, Arg};
use vermeer::{Broker, BrokerConfig, PoolEntry, Result, SegmentConfig};

fn main() -> Result<()> {
    env_logger::init();

    let matches = App::new("vermeer-broker")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Central broker for the Vermeer shared-memory transport")
        .arg(
            Arg::with_name("runtime-dir")
                .long("runtime-dir")
                .value_name("DIR")
                .help("Directory for control sockets")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("segment-dir")
                .long("segment-dir")
                .value_name("DIR")
                .help("Directory for segment backing files")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("pool")
                .long("pool")
                .value_name("SIZE:COUNT")
                .help("Add a pool size class, e.g. 1024:64 (repeatable)")
                .multiple(true)
                .number_of_values(1)
                .takes_value(true),
        )
        .arg(
            Arg::with_name("access-group")
                .long("access-group")
                .value_name("NAME")
                .help("Access group the configured pools belong to")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("discovery-interval")
                .long("discovery-interval")
                .value_name("MS")
                .help("Discovery tick interval in milliseconds")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("keep-alive-threshold")
                .long("keep-alive-threshold")
                .value_name("MS")
                .help("Keep-alive staleness threshold in milliseconds")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("max-publishers")
                .long("max-publishers")
                .value_name("N")
                .help("Publisher port pool capacity")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("max-subscribers")
                .long("max-subscribers")
                .value_name("N")
                .help("Subscriber port pool capacity")
                .takes_value(true),
        )
        .get_matches();

    let mut config = BrokerConfig::default();
    if let Some(dir) = matches.value_of("runtime-dir") {
        config.runtime_dir = PathBuf::from(dir);
    }
    if let Some(dir) = matches.value_of("segment-dir") {
        config.segment_dir = PathBuf::from(dir);
    }
    if let Some(ms) = matches.value_of("discovery-interval") {
        config.discovery_interval_ms = ms.parse().unwrap_or(config.discovery_interval_ms);
    }
    if let Some(ms) = matches.value_of("keep-alive-threshold") {
        config.keep_alive_threshold_ms = ms.parse().unwrap_or(config.keep_alive_threshold_ms);
    }
    if let Some(n) = matches.value_of("max-publishers") {
        config.max_publishers = n.parse().unwrap_or(config.max_publishers);
    }
    if let Some(n) = matches.value_of("max-subscribers") {
        config.max_subscribers = n.parse().unwrap_or(config.max_subscribers);
    }

    if let Some(pools) = matches.values_of("pool") {
        let group = matches.value_of("access-group").unwrap_or("default");
        let mut segment = SegmentConfig::new(group);
        for spec in pools {
            match parse_pool(spec) {
                Some(entry) => segment.pools.push(entry),
                None => {
                    eprintln!("ignoring malformed pool spec '{}'", spec);
                }
            }
        }
        if !segment.pools.is_empty() {
            segment.pools.sort_by_key(|entry| entry.block_size);
            config.segments = vec![segment];
        }
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&shutdown);
    ctrlc_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    });

    let mut broker = Broker::new(config)?;
    log::info!("vermeer-broker {} up", env!("CARGO_PKG_VERSION"));
    broker.run(shutdown);
    Ok(())
}

fn parse_pool(spec: &str) -> Option<PoolEntry> {
    let (size, count) = spec.split_once(':')?;
    Some(PoolEntry::new(
        size.trim().parse().ok()?,
        count.trim().parse().ok()?,
    ))
}

/// Minimal SIGINT/SIGTERM hook without a signal-handling dependency
fn ctrlc_handler<F: Fn() + Send + Sync + 'static>(handler: F) {
    use std::sync::OnceLock;
    static HANDLER: OnceLock<Box<dyn Fn() + Send + Sync>> = OnceLock::new();
    let _ = HANDLER.set(Box::new(handler));

    extern "C" fn trampoline(_signal: libc::c_int) {
        if let Some(handler) = HANDLER.get() {
            handler();
        }
    }

    let handler = trampoline as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}
