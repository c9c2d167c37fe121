mod config;

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sacn_net::{Receiver, ReceiverHandle, SequenceStatus, SequenceTracker, SourceRegistry, Transmitter};
use sacn_protocol::packets::Packet;
use sacn_protocol::{Cid, MAX_PRIORITY, MAX_UNIVERSE, MIN_UNIVERSE, UNIVERSE_SIZE};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "sacn", about = "sACN (ANSI E1.31) sender, monitor and source browser")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, default_value = "config/sacn.toml", global = true)]
    config: PathBuf,

    /// IPv4 address of the network interface to use (overrides config).
    /// Interface names such as "eth0" are not accepted
    #[arg(short, long, global = true, env = "SACN_INTERFACE")]
    interface: Option<Ipv4Addr>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Transmit DMX levels on one or more universes
    Send {
        /// Universe to transmit on (repeatable)
        #[arg(short, long = "universe", required = true, value_parser = universe_parser())]
        universes: Vec<u16>,
        /// Slot level, 0-255
        #[arg(short, long, default_value_t = 255)]
        level: u8,
        /// Frames per second per universe
        #[arg(short, long, default_value_t = 30, value_parser = clap::value_parser!(u32).range(1..=1000))]
        rate: u32,
        /// Run a moving chase instead of a static level
        #[arg(long)]
        chase: bool,
        /// Source name (overrides config)
        #[arg(long)]
        name: Option<String>,
        /// Priority 0-200 (overrides config)
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=MAX_PRIORITY as i64))]
        priority: Option<u8>,
    },
    /// Watch universes and the discovery channel
    Monitor {
        /// Universe to listen on (repeatable)
        #[arg(short, long = "universe", value_parser = universe_parser())]
        universes: Vec<u16>,
        /// Seconds between per-universe summaries
        #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
        summary_secs: u64,
    },
    /// List sources advertising on the discovery channel
    Sources {
        /// Seconds to listen before printing (discovery repeats every 10s)
        #[arg(short, long, default_value_t = 12)]
        wait: u64,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn universe_parser() -> clap::builder::RangedI64ValueParser<u16> {
    clap::value_parser!(u16).range(MIN_UNIVERSE as i64..=MAX_UNIVERSE as i64)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::load(&args.config).await?;
    if let Some(interface) = args.interface {
        config.network.interface = interface;
    }

    let cancel = shutdown_signal();

    match args.command {
        Commands::Send { universes, level, rate, chase, name, priority } => {
            if let Some(name) = name {
                config.source.name = name;
            }
            if let Some(priority) = priority {
                config.source.priority = priority;
            }
            run_send(&config, &universes, level, rate, chase, cancel).await
        }
        Commands::Monitor { universes, summary_secs } => {
            run_monitor(&config, &universes, Duration::from_secs(summary_secs), cancel).await
        }
        Commands::Sources { wait, json } => {
            run_sources(&config, Duration::from_secs(wait), json, cancel).await
        }
    }
}

/// Token cancelled on Ctrl-C.
fn shutdown_signal() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("Shutting down...");
        token.cancel();
    });
    cancel
}

// -- send --

async fn run_send(
    config: &Config,
    universes: &[u16],
    level: u8,
    rate: u32,
    chase: bool,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let transmitter = Transmitter::bind(config.source.name.as_str(), &config.socket_options())?
        .with_priority(config.source.priority)
        .with_discovery_interval(config.discovery_interval());
    let transmitter = Arc::new(transmitter);

    for &universe in universes {
        transmitter.register_universe(universe)?;
    }
    let discovery_handle = transmitter.start_discovery();

    info!(
        cid = %transmitter.cid(),
        name = %transmitter.source_name(),
        priority = config.source.priority,
        universes = ?universes,
        rate,
        "sACN transmitter running"
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(1) / rate);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut frame = [level; UNIVERSE_SIZE];
    let mut step = 0usize;
    let mut frames: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if chase {
                    chase_frame(&mut frame, level, step);
                    step = (step + 1) % UNIVERSE_SIZE;
                }
                for &universe in universes {
                    if let Err(e) = transmitter.send_data(universe, &frame).await {
                        warn!(universe, "Send failed: {}", e);
                    }
                }
                frames += 1;
            }
        }
    }

    transmitter.close();
    if let Err(e) = discovery_handle.await {
        error!("Discovery task failed: {}", e);
    }
    info!(frames, "sACN transmitter stopped");
    Ok(())
}

/// Width of the lit block in chase mode
const CHASE_WIDTH: usize = 8;

/// One block of `CHASE_WIDTH` slots at `level` starting at `step`, wrapping
/// around the end of the universe. Everything else is dark.
fn chase_frame(frame: &mut [u8; UNIVERSE_SIZE], level: u8, step: usize) {
    frame.fill(0);
    for offset in 0..CHASE_WIDTH {
        frame[(step + offset) % UNIVERSE_SIZE] = level;
    }
}

// -- monitor --

#[derive(Debug, Default)]
struct UniverseStats {
    frames: u64,
    gaps: u64,
    stale: u64,
    last_source: Option<(Cid, String)>,
    priority: u8,
    /// Leading slots of the most recent frame
    head: Vec<u8>,
}

const HEAD_SLOTS: usize = 8;

async fn run_monitor(
    config: &Config,
    universes: &[u16],
    summary_every: Duration,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let options = config.socket_options();

    let registry = Arc::new(SourceRegistry::with_expiry(config.source_expiry()));
    registry.subscribe(|source| {
        info!(
            cid = %source.cid,
            name = %source.source_name,
            ip = %source.ip,
            universes = ?source.universes,
            "Source advertised"
        );
    });
    let sweep_handle = registry.start_expiry_every(config.sweep_interval());

    let mut receivers: Vec<ReceiverHandle> = Vec::with_capacity(universes.len() + 1);
    receivers.push(start_discovery_listener(config, &registry)?);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<(SocketAddr, Packet)>();
    for &universe in universes {
        let event_tx = event_tx.clone();
        let receiver = Receiver::universe(universe, &options)?.with_read_timeout(config.read_timeout());
        receivers.push(receiver.start(move |from, packet| {
            let _ = event_tx.send((from, packet));
        }));
    }
    drop(event_tx);

    info!(
        universes = ?universes,
        interface = %options.interface,
        "sACN monitor running"
    );

    let mut tracker = SequenceTracker::new();
    let mut stats: BTreeMap<u16, UniverseStats> = universes.iter().map(|&u| (u, UniverseStats::default())).collect();
    let mut summary = tokio::time::interval(summary_every);
    summary.tick().await;
    let mut window_start = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = summary.tick() => {
                print_summary(&mut stats, window_start.elapsed());
                window_start = Instant::now();

                let expired = tracker.sweep(config.source_expiry());
                if expired > 0 {
                    debug!(expired, remaining = tracker.len(), "Dropped silent data streams");
                }
                debug!(sources = registry.len(), streams = tracker.len(), "Registry size");
            }
            event = event_rx.recv() => {
                let Some((from, packet)) = event else { break };
                let Packet::Data(data) = packet else { continue };
                let entry = stats.entry(data.universe).or_default();

                match tracker.observe(data.cid, data.universe, data.sequence) {
                    SequenceStatus::InOrder => {}
                    SequenceStatus::Gap(missed) => {
                        entry.gaps += u64::from(missed);
                        warn!(universe = data.universe, cid = %data.cid, missed, "Sequence gap");
                    }
                    SequenceStatus::Stale => {
                        entry.stale += 1;
                        debug!(universe = data.universe, sequence = data.sequence, %from, "Stale packet dropped");
                        continue;
                    }
                }

                entry.frames += 1;
                entry.priority = data.priority;
                entry.head = data.dmx().iter().take(HEAD_SLOTS).copied().collect();
                if entry.last_source.as_ref().map(|(cid, _)| *cid) != Some(data.cid) {
                    info!(universe = data.universe, cid = %data.cid, name = %data.source_name, %from, "New source on universe");
                }
                entry.last_source = Some((data.cid, data.source_name));
            }
        }
    }

    for receiver in &receivers {
        receiver.stop();
    }
    for receiver in receivers {
        receiver.join().await;
    }
    registry.stop();
    if let Err(e) = sweep_handle.await {
        error!("Expiry task failed: {}", e);
    }

    info!("sACN monitor stopped");
    Ok(())
}

fn print_summary(stats: &mut BTreeMap<u16, UniverseStats>, window: Duration) {
    let secs = window.as_secs_f64().max(f64::EPSILON);
    for (universe, s) in stats.iter_mut() {
        match &s.last_source {
            Some((_, name)) => info!(
                universe = *universe,
                fps = s.frames as f64 / secs,
                source = %name,
                priority = s.priority,
                gaps = s.gaps,
                stale = s.stale,
                head = ?s.head,
                "Universe summary"
            ),
            None => info!(universe = *universe, "No data"),
        }
        s.frames = 0;
    }
}

fn start_discovery_listener(config: &Config, registry: &Arc<SourceRegistry>) -> anyhow::Result<ReceiverHandle> {
    let registry = Arc::clone(registry);
    let receiver = Receiver::discovery(&config.socket_options())?.with_read_timeout(config.read_timeout());
    Ok(receiver.start(move |from, packet| {
        if let Packet::Discovery(page) = packet {
            registry.observe(from, &page);
        }
    }))
}

// -- sources --

#[derive(Debug, Serialize)]
struct SourceRow {
    cid: String,
    name: String,
    ip: String,
    universes: Vec<u16>,
    last_seen_ms: u64,
}

async fn run_sources(config: &Config, wait: Duration, json: bool, cancel: CancellationToken) -> anyhow::Result<()> {
    let registry = Arc::new(SourceRegistry::with_expiry(config.source_expiry()));
    let receiver = start_discovery_listener(config, &registry)?;

    info!(wait_secs = wait.as_secs(), "Listening for universe discovery");
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(wait) => {}
    }

    receiver.stop();
    receiver.join().await;

    let rows: Vec<SourceRow> = registry
        .snapshot()
        .into_iter()
        .map(|s| SourceRow {
            cid: s.cid.to_string(),
            name: s.source_name,
            ip: s.ip.to_string(),
            universes: s.universes,
            last_seen_ms: s.last_seen.elapsed().as_millis() as u64,
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("sACN Sources");
    println!("══════════════════════════════");
    if rows.is_empty() {
        println!("  No sources discovered");
    }
    for row in &rows {
        println!("  {} {} ({})", row.name, row.ip, row.cid);
        println!("      universes: {}", format_universes(&row.universes));
    }
    Ok(())
}

/// Compact "1-4, 7, 10-12" rendering of a sorted universe list.
fn format_universes(universes: &[u16]) -> String {
    let mut parts = Vec::new();
    let mut iter = universes.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&end.wrapping_add(1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{}-{}", start, end));
        }
    }
    if parts.is_empty() {
        "none".to_string()
    } else {
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_universes() {
        assert_eq!(format_universes(&[]), "none");
        assert_eq!(format_universes(&[5]), "5");
        assert_eq!(format_universes(&[1, 2, 3, 4, 7, 10, 11, 12]), "1-4, 7, 10-12");
        assert_eq!(format_universes(&[63998, 63999]), "63998-63999");
    }

    #[test]
    fn test_chase_frame_wraps() {
        let mut frame = [0u8; UNIVERSE_SIZE];
        chase_frame(&mut frame, 200, 508);
        assert_eq!(frame.iter().filter(|&&v| v == 200).count(), CHASE_WIDTH);
        assert_eq!(&frame[508..], &[200; 4]);
        assert_eq!(&frame[..4], &[200; 4]);
        assert_eq!(frame[4], 0);
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["sacn", "send", "-u", "1", "-u", "2", "--chase", "--rate", "44"]).unwrap();
        match args.command {
            Commands::Send { universes, chase, rate, level, .. } => {
                assert_eq!(universes, vec![1, 2]);
                assert!(chase);
                assert_eq!(rate, 44);
                assert_eq!(level, 255);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(args.config, PathBuf::from("config/sacn.toml"));
    }

    #[test]
    fn test_args_reject_out_of_range_universe() {
        assert!(Args::try_parse_from(["sacn", "send", "-u", "0"]).is_err());
        assert!(Args::try_parse_from(["sacn", "monitor", "-u", "64000"]).is_err());
        assert!(Args::try_parse_from(["sacn", "send", "-u", "1", "--priority", "201"]).is_err());
    }

    #[test]
    fn test_global_interface_flag() {
        let args = Args::try_parse_from(["sacn", "sources", "--interface", "10.0.0.5", "--json"]).unwrap();
        assert_eq!(args.interface, Some(Ipv4Addr::new(10, 0, 0, 5)));
        assert!(matches!(args.command, Commands::Sources { json: true, wait: 12 }));
    }

    #[test]
    fn test_interface_takes_an_address_not_a_name() {
        use clap::CommandFactory;

        assert!(Args::try_parse_from(["sacn", "sources", "--interface", "eth0"]).is_err());

        let command = Args::command();
        let help = command
            .get_arguments()
            .find(|arg| arg.get_id() == "interface")
            .and_then(|arg| arg.get_help())
            .map(|help| help.to_string())
            .unwrap_or_default();
        assert!(help.contains("IPv4 address"));
        assert!(help.contains("not accepted"));
    }
}
