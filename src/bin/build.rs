//! Builds a dataset directory from a file of canonically-encoded blocks.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

use clap::Parser;

use siacache::config::{BuildConfig, IndexConfig};
use siacache::error::{Error, Result};
use siacache::types::{Block, BlockReader};
use siacache::Builder;

#[derive(Parser)]
#[command(name = "siacache-build", about = "Build a light-client index dataset")]
struct Args {
    /// Input file with consecutive encoded blocks.
    #[arg(long)]
    blocks: PathBuf,

    /// Output directory for the dataset (must be empty).
    #[arg(long)]
    files: PathBuf,

    /// Memory limit for each external sorter, in bytes.
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    memlimit: usize,

    /// Stop after this many blocks (0 = all).
    #[arg(long, default_value_t = 0)]
    nblocks: u64,

    /// Width of offsets into the blockchain file.
    #[arg(long, default_value_t = 8)]
    offset_len: usize,

    /// Width of item indices in the secondary files.
    #[arg(long, default_value_t = 4)]
    offset_index_len: usize,

    #[arg(long, default_value_t = 4096)]
    address_page_len: usize,
    #[arg(long, default_value_t = 16)]
    address_prefix_len: usize,
    #[arg(long, default_value_t = 5)]
    address_fastmap_prefix_len: usize,
    #[arg(long, default_value_t = 4)]
    address_offset_len: usize,

    #[arg(long, default_value_t = 4096)]
    contract_page_len: usize,
    #[arg(long, default_value_t = 16)]
    contract_prefix_len: usize,
    #[arg(long, default_value_t = 5)]
    contract_fastmap_prefix_len: usize,
    #[arg(long, default_value_t = 4)]
    contract_offset_len: usize,
}

impl Args {
    fn config(&self) -> BuildConfig {
        BuildConfig::default()
            .mem_limit(self.memlimit)
            .offset_len(self.offset_len)
            .offset_index_len(self.offset_index_len)
            .address(IndexConfig {
                page_len: self.address_page_len,
                prefix_len: self.address_prefix_len,
                fastmap_prefix_len: self.address_fastmap_prefix_len,
                offset_len: self.address_offset_len,
            })
            .contract(IndexConfig {
                page_len: self.contract_page_len,
                prefix_len: self.contract_prefix_len,
                fastmap_prefix_len: self.contract_fastmap_prefix_len,
                offset_len: self.contract_offset_len,
            })
    }
}

fn run(args: &Args) -> Result<()> {
    let mut builder = Builder::new(&args.files, args.config())?;

    let input = File::open(&args.blocks)
        .map_err(|e| Error::Io(format!("opening {}: {e}", args.blocks.display())))?;
    let mut reader = BlockReader::new(BufReader::new(input));

    // The reader thread decodes ahead of the builder over a small bounded
    // channel; dropping the receiver stops it.
    let (sender, receiver) = mpsc::sync_channel::<Result<Block>>(2);
    let decoder = thread::spawn(move || loop {
        match reader.next_block() {
            Ok(Some(block)) => {
                if sender.send(Ok(block)).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                let _ = sender.send(Err(err));
                return;
            }
        }
    });

    let mut height = 0u64;
    for message in &receiver {
        let block = message?;
        builder.add(&block)?;
        height += 1;
        if height % 1000 == 0 {
            tracing::info!(height, "building");
        }
        if args.nblocks != 0 && height >= args.nblocks {
            tracing::info!(height, "reached block limit");
            break;
        }
    }
    drop(receiver);
    decoder.join().map_err(|_| Error::Io("block decoder thread panicked".into()))?;
    builder.close()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    if let Err(err) = run(&args) {
        tracing::error!(error = %err, "build failed");
        std::process::exit(1);
    }
}
