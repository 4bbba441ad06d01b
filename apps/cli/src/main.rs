use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use sha2::{Digest, Sha256};
use tracing::error;
use zota_core::codec;
use zota_core::session::SessionConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "OTA upgrade file inspection tool", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse an upgrade file and print its header and sub-elements
    Inspect {
        /// Path to the upgrade file
        file: PathBuf,
    },
    /// Validate an upgrade file's structure and firmware container CRCs
    Verify {
        /// Path to the upgrade file
        file: PathBuf,
    },
    /// Write a session configuration file with default values
    InitConfig {
        /// Path of the configuration file to create
        path: PathBuf,
    },
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let result = match args.command {
        Commands::Inspect { file } => inspect(&file),
        Commands::Verify { file } => verify(&file),
        Commands::InitConfig { path } => init_config(&path),
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_image(path: &PathBuf) -> Result<codec::Image> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;

    let Some(start) = codec::find_image_start(&bytes) else {
        bail!("upgrade file identifier not found in {}", path.display());
    };
    if start > 0 {
        println!("note: upgrade file starts at offset {start}");
    }

    Ok(codec::parse_image(&bytes[start..])?)
}

fn inspect(path: &PathBuf) -> Result<()> {
    let image = load_image(path)?;
    let header = &image.header;

    println!("header version:     0x{:04x}", header.header_version);
    println!("header length:      {}", header.header_length);
    println!("manufacturer code:  {}", header.manufacturer_code);
    println!("image type:         {}", header.image_type);
    println!("file version:       {}", header.file_version);
    println!("stack version:      {}", header.stack_version);
    println!("header string:      {:?}", header.header_string);
    println!("total image size:   {}", header.total_image_size);

    if let Some(credential) = header.security_credential_version {
        println!("security credential: {credential}");
    }
    if let Some(destination) = header.upgrade_file_destination {
        println!("destination:        {}", hex::encode(destination));
    }
    if let Some(min) = header.minimum_hardware_version {
        println!("hardware version:   {} - {}", min, header.maximum_hardware_version.unwrap_or(min));
    }

    println!("elements:           {}", image.elements.len());
    for element in &image.elements {
        println!("  tag 0x{:04x}  length {}", element.tag_id, element.length);
    }

    Ok(())
}

fn verify(path: &PathBuf) -> Result<()> {
    let image = load_image(path)?;

    codec::validate_image(&image)?;

    println!("file version:  {}", image.header.file_version);
    println!("total size:    {}", image.header.total_image_size);
    println!("sha256:        {}", hex::encode(Sha256::digest(&image.raw)));
    println!("ok");

    Ok(())
}

fn init_config(path: &PathBuf) -> Result<()> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }

    SessionConfig::default()
        .save_to_file(path)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("wrote {}", path.display());

    Ok(())
}
