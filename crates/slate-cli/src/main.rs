#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use slate_block::{BlockDevice, FileBlockDevice};
use slate_ondisk::{Geometry, Superblock};
use slate_types::{BSIZE, SUPERBLOCK_BLOCK};
use std::path::{Path, PathBuf};

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "slate", about = "SlateFS — research filesystem toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a filesystem image file and format it.
    Mkfs {
        /// Path of the image file to create.
        image: PathBuf,
        /// Device size in blocks.
        #[arg(long, default_value_t = 4096)]
        blocks: u32,
        /// Inode table capacity.
        #[arg(long, default_value_t = 1024)]
        ninodes: u32,
    },
    /// Print the geometry and usage of a formatted image.
    Inspect {
        /// Path to the filesystem image.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    size: u32,
    nblocks: u32,
    ninodes: u32,
    data_start: u32,
    free_blocks: u32,
    reclaim_queue: usize,
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    match Cli::parse().command {
        Command::Mkfs {
            image,
            blocks,
            ninodes,
        } => mkfs(&image, blocks, ninodes),
        Command::Inspect { image, json } => inspect(&image, json),
    }
}

fn mkfs(image: &Path, blocks: u32, ninodes: u32) -> Result<()> {
    let device = FileBlockDevice::create(image, blocks)
        .with_context(|| format!("creating image {}", image.display()))?;
    slate_core::format(&device, ninodes).context("formatting image")?;
    println!(
        "{}: {blocks} blocks, {ninodes} inodes, block size {BSIZE}",
        image.display()
    );
    Ok(())
}

fn inspect(image: &Path, json: bool) -> Result<()> {
    let device = FileBlockDevice::open(image)
        .with_context(|| format!("opening image {}", image.display()))?;

    let mut raw = vec![0_u8; BSIZE];
    device.read_block(SUPERBLOCK_BLOCK, &mut raw)?;
    let sb = Superblock::parse(&raw).context("parsing superblock")?;
    let geo = Geometry::from_superblock(&sb);

    let mut free_blocks = 0_u32;
    for index in 0..geo.bitmap_blocks {
        device.read_block(geo.bitmap_block(index), &mut raw)?;
        let bits = geo.bits_in_bitmap_block(index) as usize;
        for bi in 0..bits {
            if raw[bi / 8] & (1 << (bi % 8)) == 0 {
                free_blocks += 1;
            }
        }
    }

    let out = InspectOutput {
        size: sb.size,
        nblocks: sb.nblocks,
        ninodes: sb.ninodes,
        data_start: geo.data_start,
        free_blocks,
        reclaim_queue: sb.reclaim_inodes.len(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("size:          {} blocks", out.size);
        println!("data blocks:   {}", out.nblocks);
        println!("inodes:        {}", out.ninodes);
        println!("data start:    block {}", out.data_start);
        println!("free blocks:   {}", out.free_blocks);
        println!("reclaim queue: {} inodes", out.reclaim_queue);
    }
    Ok(())
}
