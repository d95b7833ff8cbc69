use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use deltapull::delta::table::ChecksumTable;
use deltapull::delta::{plan_download, ChecksumSource, Range};
use deltapull::settings::Config;
use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Inspection tool for the delta-transfer core: produce checksum blobs
/// the way a mirror serves them and plan delta downloads against local
/// candidate files.
#[derive(Parser)]
#[command(name = "deltapull", version, about)]
struct Cli {
    /// Optional config file (speed caps, TLS flag, ignore patterns)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the block-checksum blob for a local file
    Blob {
        /// File to checksum
        file: PathBuf,
        /// Where to write the blob
        #[arg(short, long)]
        output: PathBuf,
        /// Block size (power of two, at least 4096)
        #[arg(long, default_value_t = 4096)]
        blocksize: u32,
    },
    /// Plan a delta download of a blob against candidate files
    Plan {
        /// Checksum blob of the remote file (from `blob`)
        blob: PathBuf,
        /// Local candidate files, scanned in order
        candidates: Vec<PathBuf>,
    },
    /// Query the running client for the sync state of a path
    #[cfg(unix)]
    State {
        /// Path to ask about
        path: PathBuf,
        /// Overlay socket of the running client
        #[arg(long)]
        socket: PathBuf,
    },
}

/// Reads a blob produced by the `blob` subcommand (or fetched out of
/// band) instead of going through the API.
struct BlobFileSource {
    path: PathBuf,
}

impl ChecksumSource for BlobFileSource {
    fn fetch(&mut self, _fileid: u64) -> deltapull::Result<ChecksumTable> {
        let mut file = File::open(&self.path).map_err(|_| deltapull::NetError::LocalFile {
            path: self.path.clone(),
        })?;
        ChecksumTable::parse(&mut file)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    if let Some(ref path) = cli.config {
        Config::load(path)
            .with_context(|| format!("loading config {}", path.display()))?
            .apply();
    }

    match cli.command {
        Command::Blob {
            file,
            output,
            blocksize,
        } => {
            let table = ChecksumTable::compute(&file, blocksize)
                .with_context(|| format!("checksumming {}", file.display()))?;
            let out = File::create(&output)
                .with_context(|| format!("creating {}", output.display()))?;
            let mut out = BufWriter::new(out);
            table.write_blob(&mut out)?;
            out.flush()?;
            println!(
                "{}: {} bytes in {} blocks of {}",
                output.display(),
                table.filesize,
                table.block_count(),
                table.blocksize
            );
        }
        Command::Plan { blob, candidates } => {
            let mut source = BlobFileSource { path: blob.clone() };
            let filesize = source.fetch(0).map(|t| t.filesize)?;
            let plan = plan_download(&mut source, 0, filesize, &candidates)
                .with_context(|| format!("planning against {}", blob.display()))?;

            let mut copied = 0u64;
            let mut transferred = 0u64;
            for range in &plan {
                match range {
                    Range::Transfer { off, len } => {
                        transferred += len;
                        println!("TRANSFER off={:<12} len={}", off, len);
                    }
                    Range::Copy { src, off, len } => {
                        copied += len;
                        println!(
                            "COPY     off={:<12} len={:<12} src={}",
                            off,
                            len,
                            src.display()
                        );
                    }
                }
            }
            let total = copied + transferred;
            if total > 0 {
                println!(
                    "{} bytes total: {} reused locally ({}%), {} to download",
                    total,
                    copied,
                    copied * 100 / total,
                    transferred
                );
            }
        }
        #[cfg(unix)]
        Command::State { path, socket } => {
            use deltapull::ipc::{query_state, FileState};
            let state = query_state(&socket, &path)
                .with_context(|| format!("querying {}", socket.display()))?;
            match state {
                FileState::InSync => println!("in sync"),
                FileState::InProgress => println!("sync in progress"),
                FileState::NoSync | FileState::Invalid => {
                    anyhow::bail!("path is not synchronized")
                }
            }
        }
    }
    Ok(())
}
