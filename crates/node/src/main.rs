mod controller;
mod sim;

use anyhow::{bail, Context, Result};
use std::{env, time::Duration};
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use unitboard_protocol::{decode_command, encode, LineFramer, Message};

use controller::Controller;
use sim::{Scenario, TankSim};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
const PROBES_PER_TANK: usize = 4;

struct NodeConfig {
    host: String,
    telemetry_port: u16,
    command_port: u16,
    sample_every: Duration,
    scenario: Scenario,
    tank_count: usize,
    fw_version: u32,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl NodeConfig {
    fn from_env() -> Self {
        Self {
            host: env::var("BRIDGE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            telemetry_port: env_or("TELEMETRY_PORT", 7000),
            command_port: env_or("COMMAND_PORT", 7001),
            sample_every: Duration::from_secs(env_or("SAMPLE_EVERY_S", 5).max(1)),
            scenario: Scenario::from_str_lossy(
                &env::var("SIM_SCENARIO").unwrap_or_default(),
            ),
            tank_count: env_or("TANK_COUNT", 4_usize).clamp(1, 32),
            fw_version: env_or("FW_VERSION", 100),
        }
    }
}

async fn send(stream: &mut TcpStream, msg: &Message) -> Result<()> {
    let bytes = encode(msg).context("encode failed")?;
    stream.write_all(&bytes).await.context("telemetry write failed")?;
    Ok(())
}

/// One connected session: telemetry out on the first connection, commands
/// in on the second, replies back out on the first. Returns when either
/// connection drops.
async fn run_session(
    cfg: &NodeConfig,
    controller: &mut Controller,
    sim: &mut TankSim,
) -> Result<()> {
    let mut telemetry = TcpStream::connect((cfg.host.as_str(), cfg.telemetry_port))
        .await
        .with_context(|| format!("connect {}:{}", cfg.host, cfg.telemetry_port))?;
    let mut commands = TcpStream::connect((cfg.host.as_str(), cfg.command_port))
        .await
        .with_context(|| format!("connect {}:{}", cfg.host, cfg.command_port))?;
    info!(host = %cfg.host, "connected to bridge");

    let mut ticker = tokio::time::interval(cfg.sample_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut framer = LineFramer::default();
    let mut buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let packet = controller.sample(sim, OffsetDateTime::now_utc());
                debug!(order = packet.order, readings = packet.values.len(), "sending telemetry");
                send(&mut telemetry, &Message::Sensor(packet)).await?;
            }
            read = commands.read(&mut buf) => {
                let n = read.context("command read failed")?;
                if n == 0 {
                    bail!("bridge closed the command connection");
                }
                framer.extend(&buf[..n]);
                while let Some(line) = framer.next_line() {
                    let line = match line {
                        Ok(line) => line,
                        Err(e) => {
                            warn!("command framing error: {e}");
                            continue;
                        }
                    };
                    match decode_command(&line) {
                        Ok(cmd) => {
                            let reply = controller.apply(&cmd);
                            send(&mut telemetry, &reply).await?;
                        }
                        Err(e) => warn!("dropping command: {e}"),
                    }
                }
            }
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let cfg = NodeConfig::from_env();
    info!(
        host = %cfg.host,
        telemetry_port = cfg.telemetry_port,
        command_port = cfg.command_port,
        tanks = cfg.tank_count,
        scenario = %cfg.scenario,
        fw_version = cfg.fw_version,
        "unit simulator starting"
    );

    let mut controller = Controller::new(cfg.tank_count, cfg.fw_version);
    let mut sim = TankSim::new(cfg.scenario, cfg.tank_count, PROBES_PER_TANK);

    loop {
        if let Err(e) = run_session(&cfg, &mut controller, &mut sim).await {
            warn!("session ended: {e:#}. reconnecting...");
        }
        sleep(RECONNECT_BACKOFF).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
