use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use satlink::protocol::TopicMask;
use satlink::{Connection, LinkConfig, MuxKey, NodeAddress, Subscriber, TcpTransport, TelemetryPacket};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_LOCAL_NODE: &str = "2";
const DEFAULT_PUBLISHER_NODE: &str = "1";
const DEFAULT_KEY: &str = "10";
const SNAPSHOT_SETTLE_MS: u64 = 300;
const MAX_SNAPSHOT_PACKETS: usize = 16;

type CliResult = Result<(), Box<dyn std::error::Error>>;

struct Target {
    transport: TcpTransport,
    publisher: NodeAddress,
    key: MuxKey,
    config: LinkConfig,
    format: String,
    verbose: bool,
}

#[derive(Serialize)]
struct PacketView {
    source_id: u16,
    len: usize,
    payload: serde_json::Value,
}

impl PacketView {
    fn new(packet: &TelemetryPacket) -> Self {
        let payload = serde_json::from_slice(packet.payload()).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(packet.payload()).into_owned())
        });
        Self {
            source_id: packet.source_id(),
            len: packet.payload().len(),
            payload,
        }
    }
}

fn parse_mask(value: &str) -> Result<TopicMask, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => TopicMask::from_str_radix(hex, 16),
        None => value.parse::<TopicMask>(),
    };
    parsed.map_err(|_| format!("'{}' is not a valid 16-bit topic mask", value))
}

fn validate_number<T: std::str::FromStr>(v: String) -> Result<(), String> {
    v.parse::<T>().map(|_| ()).map_err(|_| format!("'{}' is not a valid number", v))
}

fn mask_arg<'a, 'b>() -> Arg<'a, 'b> {
    Arg::with_name("mask")
        .short("m")
        .long("mask")
        .value_name("MASK")
        .help("Topic mask, decimal or 0x-prefixed hex (0 = all topics)")
        .takes_value(true)
        .default_value("0")
        .validator(|v| parse_mask(&v).map(|_| ()))
}

#[tokio::main]
async fn main() -> CliResult {
    let matches = App::new("satlink")
        .version("0.1.0")
        .author("Space Systems Engineering Team")
        .about("🛰️  satlink - telemetry subscriber and link diagnostics")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON link configuration")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("node")
                .short("n")
                .long("node")
                .value_name("ADDRESS")
                .help("Local node address")
                .takes_value(true)
                .default_value(DEFAULT_LOCAL_NODE)
                .validator(validate_number::<u8>)
                .global(true),
        )
        .arg(
            Arg::with_name("publisher")
                .short("p")
                .long("publisher")
                .value_name("ADDRESS")
                .help("Publisher node address")
                .takes_value(true)
                .default_value(DEFAULT_PUBLISHER_NODE)
                .validator(validate_number::<u8>)
                .global(true),
        )
        .arg(
            Arg::with_name("key")
                .short("k")
                .long("key")
                .value_name("KEY")
                .help("Publisher multiplexing key (0-31)")
                .takes_value(true)
                .default_value(DEFAULT_KEY)
                .validator(validate_number::<u8>)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable verbose output")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("subscribe")
                .about("📈 Stream telemetry matching a topic mask")
                .arg(mask_arg())
                .arg(
                    Arg::with_name("count")
                        .long("count")
                        .value_name("N")
                        .help("Stop after N packets (default: run until Ctrl+C)")
                        .takes_value(true)
                        .validator(validate_number::<usize>),
                )
                .arg(
                    Arg::with_name("duration")
                        .short("d")
                        .long("duration")
                        .value_name("SECONDS")
                        .help("Stop after this many seconds")
                        .takes_value(true)
                        .validator(validate_number::<u64>),
                ),
        )
        .subcommand(
            SubCommand::with_name("snapshot")
                .about("📊 Fetch the latest packet from every matching source")
                .arg(mask_arg()),
        )
        .subcommand(
            SubCommand::with_name("ping")
                .about("🏓 Measure the round trip to the publisher's node"),
        )
        .get_matches();

    let config = match matches.value_of("config") {
        Some(path) => LinkConfig::from_json_file(path)?,
        None => LinkConfig::default(),
    };
    let node = NodeAddress(matches.value_of("node").unwrap_or(DEFAULT_LOCAL_NODE).parse()?);
    let target = Target {
        transport: TcpTransport::new(node, config.clone()),
        publisher: NodeAddress(matches.value_of("publisher").unwrap_or(DEFAULT_PUBLISHER_NODE).parse()?),
        key: MuxKey::new(matches.value_of("key").unwrap_or(DEFAULT_KEY).parse()?)?,
        config,
        format: matches.value_of("format").unwrap_or("table").to_string(),
        verbose: matches.is_present("verbose"),
    };

    if target.verbose {
        println!("{}", "🛰️  satlink".bright_blue().bold());
        println!("{} {} key {}", "Publisher".dimmed(), target.publisher, target.key);
    }

    match matches.subcommand() {
        ("subscribe", Some(sub_matches)) => handle_subscribe(&target, sub_matches).await?,
        ("snapshot", Some(sub_matches)) => handle_snapshot(&target, sub_matches).await?,
        ("ping", _) => handle_ping(&target).await?,
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Stream all telemetry", "satlink subscribe".bright_cyan());
            println!("  {} Latest power sample", "satlink snapshot --mask 0x01".bright_cyan());
            println!("  {} Check the link", "satlink ping".bright_cyan());
        }
    }

    Ok(())
}

fn mask_of(matches: &ArgMatches<'_>) -> Result<TopicMask, String> {
    parse_mask(matches.value_of("mask").unwrap_or("0"))
}

async fn handle_subscribe(target: &Target, matches: &ArgMatches<'_>) -> CliResult {
    let mask = mask_of(matches)?;
    let count = matches.value_of("count").map(str::parse::<usize>).transpose()?;
    let deadline = matches
        .value_of("duration")
        .map(str::parse::<u64>)
        .transpose()?
        .map(|secs| Instant::now() + Duration::from_secs(secs));

    let mut subscriber =
        Subscriber::subscribe(&target.transport, target.publisher, target.key, mask, &target.config).await?;
    println!(
        "{}",
        format!("📡 Subscribed to {} key {} mask 0x{:04X} (Ctrl+C to stop)", target.publisher, target.key, mask)
            .bright_blue()
            .bold()
    );

    let read_timeout = target.config.read_timeout();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut received = 0usize;

    loop {
        if count.is_some_and(|n| received >= n) || deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        let packet = tokio::select! {
            _ = &mut shutdown => break,
            result = subscriber.read(read_timeout) => result?,
        };
        match packet {
            Some(packet) => {
                received += 1;
                print_packet(&packet, &target.format)?;
            }
            None => {
                if target.verbose {
                    println!("{}", "… no telemetry".dimmed());
                }
            }
        }
    }

    subscriber.disconnect().await?;
    if target.verbose {
        println!("{} {} packets", "Received".dimmed(), received);
    }
    Ok(())
}

async fn handle_snapshot(target: &Target, matches: &ArgMatches<'_>) -> CliResult {
    let mask = mask_of(matches)?;
    let mut subscriber =
        Subscriber::subscribe(&target.transport, target.publisher, target.key, mask, &target.config).await?;
    subscriber.request_snapshot(mask).await?;

    // The first read waits for the publisher's next service turn.
    let mut timeout = target.config.read_timeout();
    let mut seen = Vec::new();
    while seen.len() < MAX_SNAPSHOT_PACKETS {
        let Some(packet) = subscriber.read(timeout).await? else {
            break;
        };
        timeout = Duration::from_millis(SNAPSHOT_SETTLE_MS);
        if seen.iter().any(|p: &TelemetryPacket| p.source_id() == packet.source_id()) {
            continue;
        }
        seen.push(packet);
    }
    subscriber.disconnect().await?;

    if seen.is_empty() {
        println!("{}", "No telemetry cached for that mask".yellow());
        return Ok(());
    }
    if target.format == "json" {
        let views: Vec<PacketView> = seen.iter().map(PacketView::new).collect();
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }
    for packet in &seen {
        print_packet(packet, &target.format)?;
    }
    Ok(())
}

async fn handle_ping(target: &Target) -> CliResult {
    if target.verbose {
        println!("{}", "Sending ping...".dimmed());
    }
    let mut connection = Connection::connect(
        &target.transport,
        target.publisher,
        target.key,
        target.config.connect_timeout(),
    )
    .await?;

    let result = connection.ping(target.config.read_timeout()).await?;
    connection.close();

    match (result, target.format.as_str()) {
        (Some(rtt), "json") => println!("{}", serde_json::json!({ "reachable": true, "rtt_us": rtt.as_micros() as u64 })),
        (None, "json") => println!("{}", serde_json::json!({ "reachable": false })),
        (Some(_), "compact") => println!("{}", "PONG".bright_green()),
        (None, "compact") => println!("{}", "TIMEOUT".bright_red()),
        (Some(rtt), _) => println!(
            "{} {} {}",
            "✅".green(),
            format!("{} answered in", target.publisher).bright_green(),
            format!("{:.2} ms", rtt.as_secs_f64() * 1000.0).bright_white()
        ),
        (None, _) => println!("{} {}", "❌".red(), "No ping reply".bright_red()),
    }
    Ok(())
}

fn print_packet(packet: &TelemetryPacket, format: &str) -> CliResult {
    let view = PacketView::new(packet);
    match format {
        "json" => println!("{}", serde_json::to_string(&view)?),
        "compact" => println!("0x{:04X} {}B", view.source_id, view.len),
        _ => {
            println!(
                "{} {} {} {}",
                "▶".bright_blue(),
                format!("source 0x{:04X}", view.source_id).bright_white().bold(),
                format!("{:>3} bytes", view.len).dimmed(),
                view.payload.to_string().cyan()
            );
        }
    }
    Ok(())
}
