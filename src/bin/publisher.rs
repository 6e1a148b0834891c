use clap::{App, Arg};
use satlink::protocol::MAX_PACKET_PAYLOAD;
use satlink::{LinkConfig, MuxKey, NodeAddress, Publisher, TcpTransport, TelemetryPacket};
use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time;
use tracing::{error, info, warn};

const DEFAULT_NODE: &str = "1";
const DEFAULT_KEY: &str = "10";
const DEFAULT_RATE_MS: &str = "1000";

/// Synthetic sources, one topic bit each.
const SOURCES: [(u16, &str); 3] = [(0x01, "power"), (0x02, "thermal"), (0x04, "comms")];

#[derive(Debug, Serialize)]
struct Sample {
    source: &'static str,
    seq: u32,
    timestamp_ms: u64,
    value: f32,
}

fn validate_number<T: std::str::FromStr>(v: String) -> Result<(), String> {
    v.parse::<T>().map(|_| ()).map_err(|_| format!("'{}' is not a valid number", v))
}

fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Serializes `sample` into one packet, or `None` when it would not fit.
fn encode_sample<T: Serialize>(source_id: u16, sample: &T) -> Result<Option<TelemetryPacket>, Box<dyn std::error::Error>> {
    let payload = serde_json::to_vec(sample)?;
    // A cut JSON document is useless to subscribers, so skip it whole.
    if payload.len() > MAX_PACKET_PAYLOAD {
        warn!(source_id, len = payload.len(), max = MAX_PACKET_PAYLOAD, "Sample too large, skipped");
        return Ok(None);
    }
    Ok(Some(TelemetryPacket::new(source_id, &payload)?))
}

fn sample_packet(source_id: u16, source: &'static str, seq: u32) -> Result<Option<TelemetryPacket>, Box<dyn std::error::Error>> {
    let phase = seq as f32 * 0.1 + f32::from(source_id);
    let sample = Sample {
        source,
        seq,
        timestamp_ms: timestamp_ms(),
        value: phase.sin() * 100.0,
    };
    encode_sample(source_id, &sample)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let matches = App::new("satlink-publisher")
        .version("0.1.0")
        .author("Space Systems Engineering Team")
        .about("Telemetry publisher daemon over the TCP packet transport")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON link configuration")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("node")
                .short("n")
                .long("node")
                .value_name("ADDRESS")
                .help("Local node address")
                .takes_value(true)
                .default_value(DEFAULT_NODE)
                .validator(validate_number::<u8>),
        )
        .arg(
            Arg::with_name("key")
                .short("k")
                .long("key")
                .value_name("KEY")
                .help("Multiplexing key to publish on (0-31)")
                .takes_value(true)
                .default_value(DEFAULT_KEY)
                .validator(validate_number::<u8>),
        )
        .arg(
            Arg::with_name("rate")
                .short("r")
                .long("rate")
                .value_name("MS")
                .help("Publish period in milliseconds")
                .takes_value(true)
                .default_value(DEFAULT_RATE_MS)
                .validator(validate_number::<u64>),
        )
        .get_matches();

    let config = match matches.value_of("config") {
        Some(path) => LinkConfig::from_json_file(path)?,
        None => LinkConfig::default(),
    };
    let node = NodeAddress(matches.value_of("node").unwrap_or(DEFAULT_NODE).parse()?);
    let key = MuxKey::new(matches.value_of("key").unwrap_or(DEFAULT_KEY).parse()?)?;
    let rate = Duration::from_millis(matches.value_of("rate").unwrap_or(DEFAULT_RATE_MS).parse::<u64>()?.max(10));

    println!("🛰️  satlink telemetry publisher");
    println!("==============================");

    let transport = TcpTransport::new(node, config.clone());
    let mut publisher = Publisher::bind(&transport, key, config).await?;
    info!(node = %node, key = %key, rate_ms = rate.as_millis() as u64, "📡 Publishing telemetry");

    let mut interval = time::interval(rate);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut seq: u32 = 0;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = interval.tick() => {}
        }

        for (source_id, source) in SOURCES {
            let packet = match sample_packet(source_id, source, seq) {
                Ok(Some(packet)) => packet,
                Ok(None) => continue,
                Err(e) => {
                    error!(source, error = %e, "Failed to build sample");
                    continue;
                }
            };
            match publisher.publish(packet).await {
                Ok(report) => {
                    for id in &report.evicted {
                        warn!(subscriber = %id, "🔌 Subscriber dropped");
                    }
                }
                Err(e) => error!(source, error = %e, "Publish failed"),
            }
        }
        seq = seq.wrapping_add(1);

        match publisher.service_once(rate / 4).await {
            Ok(report) => {
                if let Some(id) = report.accepted {
                    info!(subscriber = %id, total = publisher.num_subscribers(), "🔗 Subscriber connected");
                }
            }
            Err(e) => {
                error!(error = %e, "Endpoint failure");
                break;
            }
        }
    }

    let stats = publisher.stats();
    info!(stats = %serde_json::to_string(&stats)?, "Final statistics");
    publisher.shutdown();
    println!("🚀 Publisher stopped");

    Ok(())
}
