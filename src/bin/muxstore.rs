//! muxstore CLI
//!
//! Inspect and edit a multiplexed directory from the command line.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use muxstore::{DirectoryConfig, MuxDirectory, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// muxstore CLI
#[derive(Parser, Debug)]
#[command(name = "muxstore")]
#[command(about = "Inspect and edit multiplexed directories")]
#[command(version)]
struct Args {
    /// Multiplexed directory
    dir: PathBuf,

    /// Write-close grace interval in milliseconds
    #[arg(long, default_value = "1000")]
    grace_ms: u64,

    /// Data file roll-over size in MB
    #[arg(long, default_value = "64")]
    data_file_mb: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List files with their lengths and stream counts
    Ls,

    /// Print a file to stdout
    Cat {
        /// File name
        name: String,

        /// Logical bytes to skip
        #[arg(long, default_value = "0")]
        offset: u64,

        /// Decompress each segment
        #[arg(long)]
        decompress: bool,
    },

    /// Append stdin to a file, creating it if needed
    Append {
        /// File name
        name: String,

        /// Write stdin as one LZ4-compressed segment
        #[arg(long)]
        compress: bool,
    },

    /// Delete a file
    Rm {
        /// File name
        name: String,
    },

    /// Reclaim data files left behind by deletes
    Compact,

    /// Print file, stream and data-file counts
    Stat,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,muxstore=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    tracing::debug!("muxstore v{}", muxstore::VERSION);

    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = DirectoryConfig::builder()
        .write_close_grace(Duration::from_millis(args.grace_ms))
        .max_data_file_size(args.data_file_mb * 1024 * 1024)
        .build();

    match args.command {
        Commands::Ls => {
            let dir = MuxDirectory::open_read_only(&args.dir)?;
            for file in dir.list_files()? {
                println!(
                    "{:>8}  {:>12}  {:>4}  {}",
                    file.file_id(),
                    file.length(),
                    file.stream_ids().len(),
                    file.name()
                );
            }
        }

        Commands::Cat {
            name,
            offset,
            decompress,
        } => {
            let dir = MuxDirectory::open_read_only(&args.dir)?;
            let file = dir.open_file(&name, false)?;
            let mut reader = file.read(offset, decompress)?;
            let mut stdout = io::stdout().lock();
            io::copy(&mut reader, &mut stdout)?;
            stdout.flush()?;
        }

        Commands::Append { name, compress } => {
            let dir = MuxDirectory::open(&args.dir, config)?;
            let file = dir.open_file(&name, true)?;

            let mut input = Vec::new();
            io::stdin().lock().read_to_end(&mut input)?;

            let mut writer = if compress {
                file.append_compressed()?
            } else {
                file.append()?
            };
            writer.write_all(&input)?;
            writer.close()?;
            dir.close()?;

            tracing::info!("appended {} bytes to {}", input.len(), name);
        }

        Commands::Rm { name } => {
            let dir = MuxDirectory::open(&args.dir, config)?;
            dir.open_file(&name, false)?.delete()?;
            dir.close()?;
        }

        Commands::Compact => {
            let dir = MuxDirectory::open(&args.dir, config)?;
            let stats = dir.compact()?;
            dir.close()?;
            println!(
                "removed {} data file(s), rewrote {}, moved {} block(s), reclaimed {} bytes",
                stats.files_removed, stats.files_rewritten, stats.blocks_moved, stats.bytes_reclaimed
            );
        }

        Commands::Stat => {
            let dir = MuxDirectory::open_read_only(&args.dir)?;
            let streams = dir.stream_manager();
            println!("files:        {}", dir.file_count());
            println!("streams:      {}", streams.stream_count());
            println!("data files:   {}", streams.data_file_count());
            println!("active files: {}", streams.get_active_files().len());
        }
    }

    Ok(())
}
