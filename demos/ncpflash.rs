// SPDX-License-Identifier: MIT OR Apache-2.0
//! Serial firmware update utility for EZSP/Spinel NCP adapters: probe the
//! attached module, restart it between application and bootloader, flash a
//! GBL/EBL image, or bring an Elelabs product to its packaged firmware.

use clap::{Args, Parser, Subcommand, ValueEnum};
use ncpflash::control::{AdapterMode, Catalog, Controller, Protocol, Target};
use ncpflash::SerialLane;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "ncpflash", about = "Elelabs EZSP/Spinel serial firmware update utility")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check if the device responds and print its firmware version
    Probe(Common),
    /// Restart the adapter into bootloader or normal mode
    Restart {
        #[command(flatten)]
        common: Common,
        /// Required operation mode
        #[arg(short, long, value_enum)]
        mode: Mode,
    },
    /// Upload a GBL/EBL image to any product with a Gecko bootloader
    Flash {
        #[command(flatten)]
        common: Common,
        /// GBL file to upload
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Update an Elelabs product to the latest packaged firmware
    #[command(name = "ele_update")]
    EleUpdate {
        #[command(flatten)]
        common: Common,
        /// Required protocol version
        #[arg(short = 'v', long = "version", value_enum)]
        protocol: Proto,
    },
}

#[derive(Args)]
struct Common {
    /// Serial port for the NCP
    #[arg(short, long)]
    port: String,
    /// Serial baud rate for the NCP (115200/57600)
    #[arg(short, long, default_value_t = 115_200)]
    baudrate: u32,
    /// Debug verbosity level
    #[arg(short, long, value_enum, default_value = "INFO")]
    dlevel: Dlevel,
}

#[derive(Clone, Copy, ValueEnum)]
enum Dlevel {
    /// Every on-the-wire byte in both directions
    #[value(name = "RAW")]
    Raw,
    /// Decoded EZSP/Spinel payloads
    #[value(name = "PACKET")]
    Packet,
    /// State transitions and command names
    #[value(name = "DEBUG")]
    Debug,
    /// Human summary only
    #[value(name = "INFO")]
    Info,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Btl,
    Nrml,
}

#[derive(Clone, Copy, ValueEnum)]
enum Proto {
    Zigbee,
    Thread,
}

/// Packaged Elelabs firmware images, keyed by board and protocol
struct EleCatalog;

impl Catalog for EleCatalog {
    fn image(&self, board: &str, protocol: Protocol) -> Option<PathBuf> {
        let path = match (board, protocol) {
            ("ELR023" | "ELU013", Protocol::Thread) => {
                "data/EFR32MG13/ELE_MG13_ot_rcp_123_220206.gbl"
            }
            ("ELR023" | "ELU013", Protocol::Zigbee) => {
                "data/EFR32MG13/ELE_MG13_zb_ncp_115200_610_211112.gbl"
            }
            ("ELU0143", Protocol::Thread) => "data/EFR32MG21/ELU0143_MG21_ot_rcp_123_220131.gbl",
            ("ELU0143", Protocol::Zigbee) => "data/EFR32MG21/ELU0143_MG21_zb_ncp_6103_220131.gbl",
            ("ELU0141" | "ELU0142", Protocol::Thread) => {
                "data/EFR32MG21/ELU0141_MG21_ot_rcp_123_211204.gbl"
            }
            ("ELU0141" | "ELU0142", Protocol::Zigbee) => {
                "data/EFR32MG21/ELU0141_MG21_zb_ncp_6103_211204.gbl"
            }
            _ => return None,
        };
        Some(PathBuf::from(path))
    }
}

fn init_logging(dlevel: Dlevel) {
    let level = match dlevel {
        Dlevel::Raw => log::LevelFilter::Trace,
        Dlevel::Packet | Dlevel::Debug => log::LevelFilter::Debug,
        Dlevel::Info => log::LevelFilter::Info,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_secs()
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let common = match &cli.command {
        Command::Probe(common)
        | Command::Restart { common, .. }
        | Command::Flash { common, .. }
        | Command::EleUpdate { common, .. } => common,
    };
    init_logging(common.dlevel);
    let mut controller = Controller::new(SerialLane::new(&common.port), common.baudrate);
    let result = match &cli.command {
        Command::Probe(_) => controller.probe().and_then(|report| {
            if report.mode == AdapterMode::Error {
                Err(ncpflash::Error::Timeout)
            } else {
                Ok(())
            }
        }),
        Command::Restart { mode, .. } => controller.restart(match mode {
            Mode::Btl => Target::Bootloader,
            Mode::Nrml => Target::Normal,
        }),
        Command::Flash { file, .. } => controller.flash(file),
        Command::EleUpdate { protocol, .. } => controller.update(
            match protocol {
                Proto::Zigbee => Protocol::Zigbee,
                Proto::Thread => Protocol::Thread,
            },
            &EleCatalog,
        ),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
