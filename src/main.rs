use std::process::exit;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;

use _core::{logging, AxonSerial, BoardCatalog, MemoryCatalog, SerialParams, Transport};

#[derive(Parser, Debug)]
#[command(name = "axon-demo", about = "Connect to an NTL Axon and print EEG records")]
struct Args {
    /// Seconds to stream before stopping
    #[arg(short, long, default_value_t = 5)]
    seconds: u64,

    #[command(subcommand)]
    transport: TransportArgs,
}

#[derive(Subcommand, Debug)]
enum TransportArgs {
    /// Connect over BLE (requires the `bluez` feature)
    Ble {
        /// Accept only this MAC address (e.g. C8:2B:96:XX:XX:XX)
        #[arg(long)]
        mac: Option<String>,
        /// Accept only this advertised serial number
        #[arg(long)]
        serial_number: Option<String>,
        /// Scan timeout in seconds
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
    /// Connect over a serial port
    Serial {
        /// Port path (e.g. /dev/ttyUSB0)
        port: String,
        /// Handshake timeout in seconds
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
}

fn main() {
    logging::init_rust_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let (tx, rx) = mpsc::channel::<Vec<f64>>();
    let sink = Arc::new(move |record: &[f64]| {
        let _ = tx.send(record.to_vec());
    });
    let catalog = Arc::new(MemoryCatalog::new());

    let mut board: Box<dyn Transport> = match args.transport {
        TransportArgs::Serial { port, timeout } => {
            let params = SerialParams {
                port_name: port,
                timeout_secs: timeout,
            };
            let catalog: Arc<dyn BoardCatalog> = catalog.clone();
            Box::new(AxonSerial::system(params, sink, Some(catalog)))
        }
        TransportArgs::Ble {
            mac,
            serial_number,
            timeout,
        } => ble_board(mac, serial_number, timeout, sink, catalog.clone())?,
    };

    println!("--- Preparing Axon session ---");
    board.prepare_session()?;
    if let Some(descr) = catalog.get(board.board_id()) {
        println!("Board layout: {}", descr.to_json()?);
    }

    println!("Streaming for {}s...", args.seconds);
    board.start_stream()?;
    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let mut received = 0usize;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(left.min(Duration::from_millis(500))) {
            Ok(record) => {
                received += 1;
                if received % 250 == 1 {
                    let (eeg, tail) = record.split_at(record.len().saturating_sub(4));
                    println!(
                        "[{:>6}] EEG[0..4]: {:?} | status/battery/ts/marker: {:?}",
                        received,
                        &eeg[..eeg.len().min(4)],
                        tail
                    );
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    println!("Stopping...");
    board.stop_stream()?;
    board.release_session();
    info!("received {} records", received);
    println!("Done. {received} records.");
    Ok(())
}

#[cfg(feature = "bluez")]
fn ble_board(
    mac_address: Option<String>,
    serial_number: Option<String>,
    timeout_secs: u64,
    sink: Arc<dyn _core::SampleSink>,
    catalog: Arc<MemoryCatalog>,
) -> Result<Box<dyn Transport>> {
    let params = _core::BleParams {
        mac_address,
        serial_number,
        timeout_secs,
    };
    let catalog: Arc<dyn BoardCatalog> = catalog;
    Ok(Box::new(_core::AxonBle::new(
        _core::BluezBackend::new()?,
        _core::BleConfig::default(),
        params,
        sink,
        Some(catalog),
    )))
}

#[cfg(not(feature = "bluez"))]
fn ble_board(
    _mac_address: Option<String>,
    _serial_number: Option<String>,
    _timeout_secs: u64,
    _sink: Arc<dyn _core::SampleSink>,
    _catalog: Arc<MemoryCatalog>,
) -> Result<Box<dyn Transport>> {
    anyhow::bail!("BLE support not compiled in; rebuild with `--features bluez`")
}
