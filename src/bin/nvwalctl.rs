use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use nvwal::{InitMode, NvWal, NvWalConfig};

#[derive(Parser)]
#[command(name = "nvwalctl")]
#[command(about = "Operate a standalone nvwal instance")]
struct Cli {
    /// NV-backed metadata/segment root
    #[arg(long, global = true)]
    nv_root: PathBuf,

    /// Disk-backed archive root
    #[arg(long, global = true)]
    disk_root: PathBuf,

    /// Number of writer slots to register
    #[arg(long, global = true, default_value_t = 1)]
    writer_count: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a fresh instance, print its initial durable epoch, then exit.
    Init,
    /// Restart an existing instance and print its recovered durable epoch.
    Status,
    /// Restart an existing instance, advance SE/NE once, and block until a
    /// target epoch is durable.
    WaitDurable {
        /// Epoch to wait for
        #[arg(long)]
        epoch: u64,
        /// Timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = NvWalConfig::new(cli.nv_root, cli.disk_root);
    config.writer_count = cli.writer_count;

    match cli.command {
        Command::Init => {
            let wal = NvWal::init(config, InitMode::CreateIfNotExists)?;
            println!("{}", wal.query_durable_epoch());
            wal.uninit()?;
        }
        Command::Status => {
            let wal = NvWal::init(config, InitMode::Restart)?;
            println!("{}", wal.query_durable_epoch());
            wal.uninit()?;
        }
        Command::WaitDurable { epoch, timeout_secs } => {
            let wal = NvWal::init(config, InitMode::Restart)?;
            wal.advance_next_epoch(epoch + 1)?;
            wal.advance_stable_epoch(epoch)?;
            wal.wait_until_durable(epoch, Duration::from_secs(timeout_secs))?;
            println!("{}", wal.query_durable_epoch());
            wal.uninit()?;
        }
    }
    Ok(())
}
