//! Pump controller demo
//!
//! Runs a short dosing sequence against the built-in simulator, or against a
//! real controller when a port is given.
//!
//! Usage:
//!   cargo run --example pump_demo -- [OPTIONS]
//!
//! Options:
//!   --port PORT       Serial port of a real controller (default: simulator)
//!   --config FILE     TOML or JSON configuration file
//!   --list            List serial ports and exit
//!
//! Set `RUST_LOG=peristaltic_core=debug` to see every frame.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use peristaltic_core::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

struct Options {
    port: Option<String>,
    config: Option<String>,
    list: bool,
}

fn parse_args() -> Result<Options> {
    let mut options = Options {
        port: None,
        config: None,
        list: false,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--port" => options.port = Some(args.next().context("--port needs a value")?),
            "--config" => options.config = Some(args.next().context("--config needs a value")?),
            "--list" => options.list = true,
            other => bail!("Unknown option '{}'", other),
        }
    }
    Ok(options)
}

async fn run(controller: &Controller) -> Result<()> {
    let pump = controller.pump(0)?;
    info!(
        "Pump 0: {:.3}..{:.1} uL/s, at most {:.0} uL per run",
        pump.min_flow_rate_ul_per_sec(),
        pump.max_flow_rate_ul_per_sec(),
        pump.max_volume_ul()
    );

    pump.pump_volume(60.0, 12.0, Some(Direction::Clockwise), true)
        .await?;
    info!("Dosed 60 uL");

    pump.pump_continuous(30.0, Some(Direction::CounterClockwise))
        .await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    pump.set_flow_rate_ul_per_sec(6.0).await?;
    info!("Status: {:?}", pump.status().await?);
    pump.pump_stop().await?;

    pump.pump_volume(120.0, 1.0, None, false).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let left = pump.pump_stop().await?;
    info!("Stopped with {:.2} uL left", left);

    controller.stop_all().await?;
    if let Some(stats) = controller.transport_stats() {
        info!("Link: {:?}", stats);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let options = parse_args()?;
    if options.list {
        for port in Controller::list_ports() {
            println!("{:?}", port);
        }
        return Ok(());
    }

    let mut config = match &options.config {
        Some(path) => DeviceConfig::load(path).with_context(|| format!("loading {}", path))?,
        None => DeviceConfig::default(),
    };

    match options.port {
        Some(port) => {
            config.device.serial_port = port;
            let mut controller = Controller::new(config);
            controller.connect().await?;
            run(&controller).await
        }
        None => {
            let (_device, link) = SimulatedDevice::spawn(SimConfig {
                time_scale: 20.0,
                ..Default::default()
            })?;
            let mut controller = Controller::new(config);
            controller.connect_with(Box::new(link)).await?;
            run(&controller).await
        }
    }
}
