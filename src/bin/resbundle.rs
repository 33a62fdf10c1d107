//! resbundle command line tool
//!
//! Inspect, pack and extract resource bundles

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use resbundle::{
    AddressWidth, BundleReader, BundleWriter, ChunkInfo, ChunkSource, ChunkType,
    CompressionConfig, CompressionMethod, Handlers, ResourceBlock, WriterConfig,
};
use serde::Serialize;
use std::cell::RefCell;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "resbundle")]
#[command(about = "Inspect, pack and extract resource bundles")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the header and directory as JSON
    Inspect {
        bundle: PathBuf,
    },

    /// Pack files into a bundle, one raw chunk per file
    Pack {
        /// Output bundle
        out: PathBuf,

        /// Files to pack; the file name becomes the chunk name
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Chunk type id for every file
        #[arg(short = 't', long = "type", default_value = "0")]
        type_id: u32,

        /// Compression method (none, lz4, zstd)
        #[arg(short, long, default_value = "lz4")]
        compression: String,

        /// Zstd level
        #[arg(long, default_value = "3")]
        level: i32,

        /// Write a 32-bit layout
        #[arg(long)]
        narrow: bool,

        /// Opaque value stored in the header
        #[arg(long, default_value = "0")]
        user_data: u64,
    },

    /// Write the data of one chunk to a file
    Extract {
        bundle: PathBuf,
        /// Chunk name
        name: String,
        out: PathBuf,
    },
}

#[derive(Serialize)]
struct Inspection {
    header: resbundle::BundleHeader,
    chunks: Vec<resbundle::DirectoryInfo>,
}

fn inspect(bundle: PathBuf) -> anyhow::Result<()> {
    let mut reader = BundleReader::open(&bundle)
        .with_context(|| format!("Cannot open {}", bundle.display()))?;
    let header = reader.peek_header()?;
    let chunks = reader.directory()?;
    println!("{}", serde_json::to_string_pretty(&Inspection { header, chunks })?);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn pack(
    out: PathBuf,
    files: Vec<PathBuf>,
    type_id: u32,
    compression: &str,
    level: i32,
    narrow: bool,
    user_data: u64,
) -> anyhow::Result<()> {
    let method: CompressionMethod = compression.parse()?;
    let config = WriterConfig {
        address_width: if narrow {
            AddressWidth::Bits32
        } else {
            AddressWidth::host()
        },
        compression: CompressionConfig { method, level },
    };

    let mut writer = BundleWriter::new(config);
    for file in &files {
        let name = file
            .file_name()
            .and_then(|name| name.to_str())
            .with_context(|| format!("{} has no usable file name", file.display()))?;
        let data = std::fs::read(file).with_context(|| format!("Cannot read {}", file.display()))?;
        writer.add_raw_binary_chunk(name, ChunkType::new(type_id), &data)?;
    }

    let written = writer.write_file(&out, user_data)?;
    info!("Wrote {} chunks ({} bytes) to {}", files.len(), written, out.display());
    Ok(())
}

fn extract(bundle: PathBuf, name: String, out: PathBuf) -> anyhow::Result<()> {
    let mut reader = BundleReader::open(&bundle)
        .with_context(|| format!("Cannot open {}", bundle.display()))?;
    let Some(entry) = reader.directory()?.into_iter().find(|entry| entry.name == name) else {
        bail!("No chunk named '{}' in {}", name, bundle.display());
    };

    let data = RefCell::new(Vec::new());
    let handlers = Handlers::new().with(entry.type_id, |_: &ChunkInfo<'_>, block: &mut ResourceBlock| {
        *data.borrow_mut() = block.data().to_vec();
        true
    });
    reader.read(&name, &handlers)?;
    drop(handlers);

    std::fs::write(&out, data.into_inner())
        .with_context(|| format!("Cannot write {}", out.display()))?;
    info!("Extracted '{}' to {}", name, out.display());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    match Args::parse().command {
        Command::Inspect { bundle } => inspect(bundle),
        Command::Pack {
            out,
            files,
            type_id,
            compression,
            level,
            narrow,
            user_data,
        } => pack(out, files, type_id, &compression, level, narrow, user_data),
        Command::Extract { bundle, name, out } => extract(bundle, name, out),
    }
}
