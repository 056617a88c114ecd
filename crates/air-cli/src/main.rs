//! `air`: command-line interface for the AIR command queue.
//!
//! ```text
//! USAGE:
//!   air config                       Print the effective host configuration
//!   air encode <command> [args]      Encode one packet, print its eight words
//!   air decode <w0> .. <w7>          Decode eight packet words
//!   air probe                        Read the queue header on the board
//!   air validate [scenario]          Run bring-up scenarios
//! ```
//!
//! Configuration comes from `AIR_*` environment variables, see `air config`.

use air_host::validation::Scenario;
use air_host::{AirDevice, BackendSelection, HostConfig, QueueHeader, QueueKind, SharedMemory, WaitPolicy};
use air_packet::layout::queue_region_size;
use air_packet::{Command, DeviceInit, Dim, Direction, DispatchPacket, HerdInit, NdMemcpy};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "air", about = "AIR command queue CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print the effective configuration (defaults plus AIR_* overrides).
    Config,
    /// Encode a packet and print its words.
    Encode {
        #[command(subcommand)]
        packet: EncodeCmd,
    },
    /// Decode eight packet words (hex with 0x, or decimal).
    Decode {
        /// Words 0..8 of the record.
        #[arg(num_args = 8, value_parser = parse_u64)]
        words: Vec<u64>,
    },
    /// Read the queue header from the hardware queue region.
    Probe,
    /// Run validation scenarios.
    Validate {
        /// Scenario to run.
        #[arg(value_enum, default_value_t = ScenarioArg::All)]
        scenario: ScenarioArg,
        /// Consumer behind the queue.
        #[arg(long, value_enum, default_value_t = BackendArg::Software)]
        backend: BackendArg,
        /// Give up on a packet after this many milliseconds (0 waits forever).
        #[arg(long, default_value_t = 10_000)]
        timeout_ms: u64,
    },
}

#[derive(Subcommand)]
enum EncodeCmd {
    /// Declare a herd.
    HerdInit {
        #[arg(long, default_value_t = 0)]
        herd: u16,
        #[arg(long)]
        col: u8,
        #[arg(long, default_value_t = 1)]
        cols: u8,
        #[arg(long, default_value_t = 0)]
        row: u8,
        #[arg(long, default_value_t = 1)]
        rows: u8,
    },
    /// Initialise the shim columns.
    DeviceInit {
        #[arg(long)]
        columns: u8,
    },
    /// Contiguous or strided shim DMA transfer.
    NdMemcpy {
        #[arg(long, default_value_t = 0)]
        herd: u16,
        #[arg(long)]
        col: u8,
        #[arg(long, default_value_t = 0)]
        channel: u8,
        #[arg(long, value_enum)]
        direction: DirectionArg,
        /// Physical address.
        #[arg(long, value_parser = parse_u64)]
        addr: u64,
        /// Bytes per innermost run.
        #[arg(long)]
        len: u32,
        /// Outer dimensions as count:stride, innermost first (up to three).
        #[arg(long = "dim", value_parser = parse_dim)]
        dims: Vec<Dim>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DirectionArg {
    /// Host to device (MM2S)
    H2d,
    /// Device to host (S2MM)
    D2h,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Auto,
    Hardware,
    Software,
}

#[derive(Clone, Copy, ValueEnum)]
enum ScenarioArg {
    ShimDma,
    MatrixAdd,
    All,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Config => cmd_config()?,
        Cmd::Encode { packet } => cmd_encode(&packet)?,
        Cmd::Decode { words } => cmd_decode(&words)?,
        Cmd::Probe => cmd_probe()?,
        Cmd::Validate {
            scenario,
            backend,
            timeout_ms,
        } => cmd_validate(scenario, backend, timeout_ms)?,
    }

    Ok(())
}

fn cmd_config() -> Result<()> {
    let c = HostConfig::from_env()?;
    println!("Memory device : {}", c.mem_device.display());
    println!(
        "Queue         : {:#x}  {} slots  {}  ({:#x} bytes)",
        c.queue_base,
        c.queue_capacity,
        c.queue_kind,
        c.queue_region_size()
    );
    println!(
        "Staging       : {:#x}  {:#x} bytes",
        c.staging_base, c.staging_size
    );
    println!("Columns       : {}", c.num_columns);
    Ok(())
}

fn cmd_encode(packet: &EncodeCmd) -> Result<()> {
    let command = match *packet {
        EncodeCmd::HerdInit {
            herd,
            col,
            cols,
            row,
            rows,
        } => Command::HerdInit(HerdInit {
            herd_id: herd,
            start_column: col,
            num_columns: cols,
            start_row: row,
            num_rows: rows,
        }),
        EncodeCmd::DeviceInit { columns } => {
            Command::DeviceInit(DeviceInit { num_columns: columns })
        }
        EncodeCmd::NdMemcpy {
            herd,
            col,
            channel,
            direction,
            addr,
            len,
            ref dims,
        } => {
            if dims.len() > 3 {
                bail!("at most three outer dimensions, got {}", dims.len());
            }
            let direction = match direction {
                DirectionArg::H2d => Direction::HostToDevice,
                DirectionArg::D2h => Direction::DeviceToHost,
            };
            let mut outer = [Dim::UNIT; 3];
            outer[..dims.len()].copy_from_slice(dims);
            let m = NdMemcpy::contiguous(herd, col, channel, direction, addr, len)
                .with_dims(outer[0], outer[1], outer[2]);
            println!(
                "# {} bytes, extent {:#x}",
                m.total_bytes(),
                m.extent_bytes()
            );
            Command::NdMemcpy(m)
        }
    };

    println!("# {command}");
    for (i, w) in command.encode().to_words().iter().enumerate() {
        println!("{i}: {w:#018x}");
    }
    Ok(())
}

fn cmd_decode(words: &[u64]) -> Result<()> {
    let words: [u64; 8] = words
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected 8 words, got {}", words.len()))?;
    let pkt = DispatchPacket::from_words(words);
    println!(
        "header {:#06x} ({})  type {:#x}  signal {}",
        pkt.header,
        if pkt.is_active() { "active" } else { "pending" },
        pkt.kind,
        pkt.completion_signal
    );
    let command = Command::decode(&pkt).context("not an AIR packet")?;
    println!("{command}");
    Ok(())
}

fn cmd_probe() -> Result<()> {
    let c = HostConfig::from_env()?;
    let mem = SharedMemory::map_physical(&c.mem_device, c.queue_base, queue_region_size(c.queue_capacity))
        .with_context(|| format!("mapping queue at {:#x}", c.queue_base))?;
    let h: QueueHeader = QueueHeader::read(&mem)?;

    let kind = QueueKind::from_code(h.kind)
        .map_or_else(|| format!("unknown ({})", h.kind), |k| k.to_string());
    println!("Queue id      : {}", h.id);
    println!("Type          : {kind}");
    println!("Features      : {:#x}", h.features);
    println!("Base address  : {:#x}", h.base_address);
    println!("Size          : {} slots", h.size);
    println!("Read index    : {}", h.read_index);
    println!("Write index   : {}", h.write_index);
    println!("Published     : {}", h.published());
    println!("In flight     : {}", h.in_flight());
    Ok(())
}

fn cmd_validate(scenario: ScenarioArg, backend: BackendArg, timeout_ms: u64) -> Result<()> {
    let selection = match backend {
        BackendArg::Auto => BackendSelection::Auto,
        BackendArg::Hardware => BackendSelection::Hardware,
        BackendArg::Software => BackendSelection::Software,
    };
    let device = AirDevice::open(HostConfig::from_env()?, selection)?;
    println!("Backend: {}", device.backend_type());

    let policy = if timeout_ms == 0 {
        WaitPolicy::indefinite()
    } else {
        WaitPolicy::bounded(Duration::from_millis(timeout_ms))
    };
    let scenarios: &[Scenario] = match scenario {
        ScenarioArg::ShimDma => &[Scenario::ShimDma],
        ScenarioArg::MatrixAdd => &[Scenario::MatrixAdd],
        ScenarioArg::All => &Scenario::ALL,
    };

    let mut failed = 0;
    for s in scenarios {
        let report = s.run(&device, &policy).with_context(|| format!("running {s}"))?;
        println!("{report}");
        for m in report.mismatches.iter().take(8) {
            println!("  {m}");
        }
        if !report.passed() {
            failed += 1;
        }
    }

    if failed > 0 {
        bail!("{failed} scenario(s) failed");
    }
    Ok(())
}

fn parse_u64(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid number {s:?}: {e}"))
}

fn parse_dim(s: &str) -> Result<Dim, String> {
    let (count, stride) = s
        .split_once(':')
        .ok_or_else(|| format!("expected count:stride, got {s:?}"))?;
    let count = count.parse().map_err(|e| format!("bad count {count:?}: {e}"))?;
    let stride = stride.parse().map_err(|e| format!("bad stride {stride:?}: {e}"))?;
    Ok(Dim::new(count, stride))
}
