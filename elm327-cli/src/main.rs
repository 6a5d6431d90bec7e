use std::error::Error;
use std::time::Duration;

use clap::Parser;
use elm327_lib::Elm327;
use elm327_lib::error::Elm327Error;
use elm327_lib::transport::{TcpTransport, Transport};
use tokio::time::MissedTickBehavior;
use tracing::warn;

/// Poll engine coolant temperature from an ELM327 OBD-II adapter.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Adapter address: host:port of a WiFi adapter, or a Bluetooth MAC
    /// with --bluetooth
    address: Option<String>,

    /// Connect over Bluetooth RFCOMM instead of TCP
    #[cfg(feature = "bluetooth")]
    #[arg(long)]
    bluetooth: bool,

    /// List paired adapters and exit
    #[arg(long)]
    list_devices: bool,

    /// Polling interval in milliseconds
    #[arg(long, default_value_t = 2000)]
    interval_ms: u64,

    /// Per-command reply timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// Send a single raw command instead of polling
    #[arg(long)]
    raw: Option<String>,

    /// Echo adapter traffic to stderr
    #[arg(long)]
    debug_traffic: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    #[cfg(feature = "bluetooth")]
    if args.bluetooth {
        let transport = elm327_lib::bluetooth::BluetoothTransport::new().await?;
        return run(Elm327::new(transport), args).await;
    }

    run(Elm327::new(TcpTransport::new()), args).await
}

async fn run<T: Transport>(mut session: Elm327<T>, args: Args) -> Result<(), Box<dyn Error>> {
    if args.list_devices {
        for device in session.list_devices().await? {
            println!("{}  {}", device.address, device.name.unwrap_or_default());
        }
        return Ok(());
    }

    let address = args.address.ok_or("adapter address is required")?;

    session.set_timeout(Duration::from_millis(args.timeout_ms));
    if args.debug_traffic {
        session.set_debug_sink(|direction, line| eprintln!("{direction} {line}"));
    }

    session.connect(&address).await?;
    println!("Connected to ELM327 at {address}");

    if let Some(command) = args.raw {
        println!("{}", session.send_raw(&command).await?);
        session.disconnect().await;
        return Ok(());
    }

    // One poll at a time: the adapter is half-duplex, so the next read
    // only starts once the previous one has completed.
    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                match session.read_temperature().await {
                    Ok(Some(celsius)) => println!("Coolant: {celsius} °C"),
                    Ok(None) => println!("Coolant: no data this cycle"),
                    // A timed-out command leaves the session ready for
                    // the next cycle; only connection-level failures end
                    // the loop.
                    Err(e @ Elm327Error::Timeout(_)) => {
                        warn!(error = %e, "poll timed out, retrying next cycle");
                    }
                    Err(e) => {
                        warn!(error = %e, "poll failed");
                        break;
                    }
                }
            }
        }
    }

    session.disconnect().await;
    Ok(())
}
