mod client;

use clap::Parser;
use client::ApiClient;
use rand::Rng;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Registers a fleet of virtual devices and keeps them reporting telemetry.
#[derive(Debug, Parser)]
#[command(name = "simulator", version)]
struct Args {
    /// Base URL of the IoT Center server.
    #[arg(long, env = "IOTCENTER_URL", default_value = "http://localhost:5000")]
    server: String,

    /// Number of virtual devices.
    #[arg(long, env = "DEVICES", default_value_t = 10)]
    devices: usize,

    /// Seconds between telemetry rounds.
    #[arg(long, env = "INTERVAL_SECS", default_value_t = 10)]
    interval_secs: u64,

    /// Device id prefix; a random one is used when absent.
    #[arg(long, env = "DEVICE_PREFIX")]
    prefix: Option<String>,

    /// Stop after this many rounds.
    #[arg(long, env = "ROUNDS")]
    rounds: Option<u64>,
}

fn device_ids(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{}-{}", prefix, i)).collect()
}

/// Interval with up to 10% jitter either way, so fleets started together drift apart.
fn jittered(interval: Duration, rng: &mut impl Rng) -> Duration {
    let factor = rng.gen_range(0.9..=1.1);
    interval.mul_f64(factor)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let prefix = args
        .prefix
        .clone()
        .unwrap_or_else(|| format!("sim-{}", &Uuid::new_v4().simple().to_string()[..8]));

    info!("Starting IoT Center simulator");
    info!(
        "Server: {}, Devices: {}, Interval: {}s, Prefix: {}",
        args.server, args.devices, args.interval_secs, prefix
    );

    let client = match ApiClient::new(&args.server) {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to create HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let mut fleet = Vec::with_capacity(args.devices);
    for device_id in device_ids(&prefix, args.devices) {
        if let Err(e) = client.create_device(&device_id).await {
            warn!("Failed to create device {}: {}", device_id, e);
            continue;
        }
        match client.register(&device_id).await {
            Ok(true) => info!("Registered {}", device_id),
            Ok(false) => info!("{} was already registered", device_id),
            Err(e) => {
                warn!("Failed to register {}: {}", device_id, e);
                continue;
            }
        }
        fleet.push(device_id);
    }

    if fleet.is_empty() {
        error!("No devices could be registered, exiting");
        std::process::exit(1);
    }
    info!("{} devices online, starting to report telemetry", fleet.len());

    let interval = Duration::from_secs(args.interval_secs.max(1));
    let mut rng = rand::thread_rng();
    let mut round = 0u64;

    loop {
        round += 1;

        match client.generate(&fleet).await {
            Ok(outcomes) => {
                let failed: Vec<_> = outcomes.iter().filter(|o| !o.ok).collect();
                for outcome in &failed {
                    warn!(
                        "Write failed for {}: {}",
                        outcome.device_id,
                        outcome.error.as_deref().unwrap_or("unknown error")
                    );
                }
                info!(
                    "Round {}: {} of {} writes succeeded",
                    round,
                    outcomes.len() - failed.len(),
                    outcomes.len()
                );
            }
            Err(e) => error!("Round {} failed: {}", round, e),
        }

        if args.rounds.is_some_and(|limit| round >= limit) {
            info!("Completed {} rounds", round);
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(jittered(interval, &mut rng)) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    info!("Shutting down");
}
