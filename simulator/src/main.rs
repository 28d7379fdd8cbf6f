mod telemetry;

use clap::Parser;
use rand::Rng;
use serde_json::json;
use std::time::Duration;
use telemetry::{CheckIn, CheckInReply, CommandAck, CAPABILITIES};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Simulates pull-only sensor devices checking in with the coordinator.
#[derive(Debug, Clone, Parser)]
struct Args {
    /// Coordinator base URL
    #[arg(long, env = "COORDINATOR_URL", default_value = "http://localhost:8080")]
    url: String,

    /// Number of simulated devices
    #[arg(long, env = "DEVICES", default_value_t = 10)]
    devices: usize,

    /// Seconds between check-ins of one device
    #[arg(long, env = "INTERVAL_SECS", default_value_t = 5)]
    interval_secs: u64,

    #[arg(long, env = "DEVICE_TYPE", default_value = "esp32")]
    device_type: String,

    /// Owner ids attached to every reading; omit to use the device's bindings
    #[arg(long, env = "OWNERS", value_delimiter = ',')]
    owners: Vec<i64>,

    /// Device id prefix; a random one is generated when omitted
    #[arg(long, env = "DEVICE_PREFIX")]
    prefix: Option<String>,

    /// Share of delivered commands acknowledged as failed
    #[arg(long, env = "FAILURE_RATE", default_value_t = 0.1)]
    failure_rate: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let prefix = args.prefix.clone().unwrap_or_else(|| {
        let run = uuid::Uuid::new_v4().simple().to_string();
        format!("sim-{}", &run[..8])
    });

    info!("Starting device simulator");
    info!(
        "Coordinator: {}, Devices: {}, Interval: {}s, Prefix: {}",
        args.url, args.devices, args.interval_secs, prefix
    );

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;

    let mut handles = Vec::with_capacity(args.devices);
    for n in 0..args.devices {
        let device_id = format!("{}-{}", prefix, n);
        let client = client.clone();
        let args = args.clone();
        handles.push(tokio::spawn(async move {
            run_device(client, args, device_id).await;
        }));
    }

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}

async fn run_device(client: reqwest::Client, args: Args, device_id: String) {
    let endpoint = format!("{}/api/v1/checkin", args.url.trim_end_matches('/'));
    let owners = (!args.owners.is_empty()).then(|| args.owners.clone());

    let mut config_hash: Option<String> = None;
    let mut pending_acks: Vec<CommandAck> = Vec::new();
    let mut check_ins = 0u64;

    // Spread the devices over the first interval.
    let offset = rand::thread_rng().gen_range(0..=args.interval_secs * 1000);
    tokio::time::sleep(Duration::from_millis(offset)).await;

    loop {
        let request = CheckIn {
            device_id: device_id.clone(),
            device_type: args.device_type.clone(),
            firmware_version: "sim-1.0.0".to_string(),
            capabilities: CAPABILITIES.iter().map(|c| c.to_string()).collect(),
            config_hash: config_hash.clone(),
            telemetry: telemetry::generate_readings(&mut rand::thread_rng(), owners.as_deref()),
            acks: pending_acks.clone(),
        };

        match check_in(&client, &endpoint, &request).await {
            Ok(reply) => {
                check_ins += 1;
                pending_acks.clear();

                if reply.config.status == "changed" {
                    info!(
                        device = %device_id,
                        mode = %reply.mode,
                        master = ?reply.master_name,
                        "Received new configuration"
                    );
                    config_hash = reply.config.hash;
                }

                for command in reply.commands {
                    let success = !rand::thread_rng().gen_bool(args.failure_rate.clamp(0.0, 1.0));
                    info!(
                        device = %device_id,
                        command_id = command.id,
                        command_type = %command.command_type,
                        attempt = command.attempt,
                        success,
                        "Executing command"
                    );
                    debug!(payload = %command.payload, "Command payload");
                    pending_acks.push(CommandAck {
                        command_id: command.id,
                        success,
                        result: json!({ "simulated": true }),
                    });
                }

                if check_ins % 100 == 0 {
                    info!(device = %device_id, "Completed {} check-ins", check_ins);
                }
                debug!(
                    device = %device_id,
                    server_interval = reply.check_in_interval_secs,
                    "Check-in done"
                );
            }
            Err(e) => {
                // Acks stay queued for the next attempt.
                warn!(device = %device_id, "Check-in failed: {}", e);
            }
        }

        tokio::time::sleep(Duration::from_secs(args.interval_secs)).await;
    }
}

async fn check_in(
    client: &reqwest::Client,
    endpoint: &str,
    request: &CheckIn,
) -> anyhow::Result<CheckInReply> {
    let response = client.post(endpoint).json(request).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("coordinator answered {}: {}", status, body);
    }
    Ok(response.json::<CheckInReply>().await?)
}
