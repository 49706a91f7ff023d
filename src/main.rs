//! Bench probe: connect one device from a JSON config and report on it.
//!
//! ```text
//! kiosk-devices <config.json> [status|identify|poll <secs>]
//! ```

use anyhow::{bail, Context, Result};
use kiosk_devices::logging::{default_log_dir, init_logging};
use kiosk_devices::{DeviceConfig, DeviceEvent, DeviceManager};
use std::time::Duration;
use tracing::{info, warn};

const USAGE: &str = "usage: kiosk-devices <config.json> [status|identify|poll <secs>]";

enum Action {
    Status,
    Identify,
    Poll(u64),
}

fn parse_args(args: &[String]) -> Result<(String, Action)> {
    let path = args.first().context(USAGE)?.clone();
    let action = match args.get(1).map(String::as_str) {
        None | Some("status") => Action::Status,
        Some("identify") => Action::Identify,
        Some("poll") => {
            let secs = args
                .get(2)
                .map(|s| s.parse::<u64>())
                .transpose()
                .context("poll duration must be a number of seconds")?
                .unwrap_or(10);
            Action::Poll(secs)
        }
        Some(other) => bail!("unknown action '{other}'\n{USAGE}"),
    };
    Ok((path, action))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = init_logging(&default_log_dir());
    info!(
        "kiosk-devices v{} ({}, built {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_GIT_SHA"),
        env!("BUILD_TIMESTAMP")
    );

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (path, action) = parse_args(&args)?;

    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))?;
    let config = DeviceConfig::from_value(&value)?;

    let manager = DeviceManager::new();
    let (manager, result) = tokio::task::spawn_blocking(move || {
        let result = manager.connect_device(Some("probe"), config);
        (manager, result)
    })
    .await?;
    let mut events = match result {
        Ok((_, events)) => Some(events),
        Err(e) if manager.is_connected("probe") => {
            warn!("Device connected degraded: {e}");
            None
        }
        Err(e) => return Err(e).context("connecting device"),
    };
    let device = manager.device("probe").context("device not registered")?;

    match action {
        Action::Status => {
            let summary = manager.summary("probe");
            println!("{}", serde_json::to_string_pretty(&summary)?);
            println!("{}", serde_json::to_string_pretty(&device.denominations())?);
        }
        Action::Identify => {
            let d = device.clone();
            let identification = tokio::task::spawn_blocking(move || d.identify()).await??;
            println!("{}", serde_json::to_string_pretty(&identification)?);
        }
        Action::Poll(secs) => {
            device.start_default_polling()?;
            let deadline = tokio::time::sleep(Duration::from_secs(secs));
            tokio::pin!(deadline);
            loop {
                let next = async {
                    match events.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending::<Option<DeviceEvent>>().await,
                    }
                };
                tokio::select! {
                    _ = &mut deadline => break,
                    event = next => match event {
                        Some(event) => println!("{}", serde_json::to_string(&event)?),
                        None => break,
                    },
                }
            }
            device.stop_polling();
        }
    }

    tokio::task::spawn_blocking(move || manager.shutdown()).await?;
    Ok(())
}
