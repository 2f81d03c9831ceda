use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fbl_host_tool::{FblCommands, SerialTransport, ToolConfig, Transport};
use fbl_protocol::{PropertyTag, PropertyValue, ResponseCode};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Largest block moved by one read/write command
const TRANSFER_BLOCK_SIZE: u32 = 1024;

#[derive(Parser)]
#[command(name = "fbl-tool")]
#[command(about = "Flash bootloader host tool")]
#[command(version)]
struct Cli {
    /// Serial port to connect to (overrides the config file)
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate (overrides the config file)
    #[arg(short, long)]
    baud: Option<u32>,

    /// TOML settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    Ports,
    /// Ping the bootloader and print its version
    Ping,
    /// Read a property (name or number)
    GetProperty {
        #[arg(value_parser = parse_property)]
        tag: PropertyTag,
    },
    /// Write a property and verify it
    SetProperty {
        #[arg(value_parser = parse_property)]
        tag: PropertyTag,
        #[arg(value_parser = parse_hex)]
        value: u32,
    },
    /// Erase all flash
    EraseAll {
        #[arg(short, long, value_parser = parse_hex, default_value = "0")]
        memory_id: u32,
    },
    /// Erase a flash region
    EraseRegion {
        /// Start address (hex)
        #[arg(value_parser = parse_hex)]
        address: u32,
        /// Size in bytes (hex)
        #[arg(value_parser = parse_hex)]
        size: u32,
        #[arg(short, long, value_parser = parse_hex, default_value = "0")]
        memory_id: u32,
    },
    /// Mass erase, leaving the flash unsecured
    Unsecure,
    /// Unlock flash security with the backdoor key
    SecurityDisable {
        #[arg(value_parser = parse_hex_u64)]
        key: u64,
    },
    /// Read memory to file
    Read {
        /// Start address (hex)
        #[arg(value_parser = parse_hex)]
        address: u32,
        /// Size to read in bytes (hex)
        #[arg(value_parser = parse_hex)]
        size: u32,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Write file to memory
    Write {
        /// Start address (hex)
        #[arg(value_parser = parse_hex)]
        address: u32,
        /// Input file path
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Jump to an address
    Execute {
        #[arg(value_parser = parse_hex)]
        jump: u32,
        #[arg(value_parser = parse_hex)]
        arg: u32,
        /// Stack pointer address
        #[arg(value_parser = parse_hex)]
        sp: u32,
    },
    /// Reset the device
    Reset,
}

fn parse_hex(s: &str) -> Result<u32, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

fn parse_hex_u64(s: &str) -> Result<u64, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

fn parse_property(s: &str) -> Result<PropertyTag, String> {
    if let Ok(value) = parse_hex(s) {
        return PropertyTag::try_from(value).map_err(|v| format!("unknown property {}", v));
    }
    let wanted = s.replace(['-', '_'], "").to_ascii_lowercase();
    PropertyTag::ALL
        .iter()
        .copied()
        .find(|tag| format!("{:?}", tag).to_ascii_lowercase() == wanted)
        .ok_or_else(|| format!("unknown property '{}'", s))
}

fn progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::default_bar().template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
    ) {
        pb.set_style(style);
    }
    pb
}

/// Reject transfers running past the end of the 32-bit address space
fn check_range(address: u32, len: usize) -> Result<()> {
    let end = address as u64 + len as u64;
    if end > 1u64 << 32 {
        bail!(
            "Range 0x{:08X} + 0x{:X} exceeds the 32-bit address space",
            address,
            len
        );
    }
    Ok(())
}

fn check(status: ResponseCode, what: &str) -> Result<()> {
    if !status.is_success() {
        bail!("{} failed: {}", what, status);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Commands::Ports = cli.command {
        for port in SerialTransport::available_ports() {
            println!("{}", port);
        }
        return Ok(());
    }

    let mut config = ToolConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(port) = cli.port {
        config.serial.port = port;
    }
    if let Some(baud) = cli.baud {
        config.serial.baud_rate = baud;
    }

    info!(port = %config.serial.port, "Connecting");
    let transport = SerialTransport::new(config.serial.clone());
    let mut fbl = FblCommands::new(transport, config.engine.clone());

    let cancel = fbl.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            cancel.cancel();
        }
    });

    let mut unsolicited = fbl.transport().subscribe_unsolicited();
    tokio::spawn(async move {
        loop {
            match unsolicited.recv().await {
                Ok(data) => warn!(data = %hex::encode(&data), "Unsolicited device data"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Unsolicited data dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let version = fbl.connect().await.context("Failed to connect to bootloader")?;

    match cli.command {
        Commands::Ports => {}

        Commands::Ping => {
            println!("Bootloader version: {}", version);
            println!("Options: 0x{:04X}", fbl.options().unwrap_or_default());
        }

        Commands::GetProperty { tag } => {
            let (status, value) = fbl.get_property(tag).await?;
            check(status, "GetProperty")?;
            println!("{}", PropertyValue { tag, value });
        }

        Commands::SetProperty { tag, value } => {
            check(fbl.set_property(tag, value).await?, "SetProperty")?;
            println!("{:?} set to 0x{:08X}", tag, value);
        }

        Commands::EraseAll { memory_id } => {
            println!("Erasing all flash...");
            check(fbl.flash_erase_all(memory_id).await?, "Erase")?;
            println!("Flash erased successfully!");
        }

        Commands::EraseRegion {
            address,
            size,
            memory_id,
        } => {
            println!("Erasing flash at 0x{:08X}, size: {} bytes...", address, size);
            check(
                fbl.flash_erase_region(address, size, memory_id).await?,
                "Erase",
            )?;
            println!("Flash erased successfully!");
        }

        Commands::Unsecure => {
            check(fbl.flash_erase_all_unsecure().await?, "Unsecure erase")?;
            println!("Flash erased and unsecured");
        }

        Commands::SecurityDisable { key } => {
            check(fbl.flash_security_disable(key).await?, "Security disable")?;
            println!("Flash security disabled");
        }

        Commands::Read {
            address,
            size,
            output,
        } => {
            check_range(address, size as usize)?;
            println!("Reading {} bytes at 0x{:08X}...", size, address);
            let pb = progress_bar(size as u64);
            let mut data = Vec::with_capacity(size as usize);

            let mut offset = 0u32;
            while offset < size {
                let len = TRANSFER_BLOCK_SIZE.min(size - offset);
                let (status, block) = fbl.read_memory(address + offset, len).await?;
                check(status, "Read")
                    .with_context(|| format!("At address 0x{:08X}", address + offset))?;
                data.extend_from_slice(&block);
                offset += len;
                pb.set_position(offset as u64);
            }
            pb.finish_with_message("Read completed!");

            fs::write(&output, &data)
                .await
                .with_context(|| format!("Failed to write file: {:?}", output))?;
            println!("Saved to {:?}", output);
        }

        Commands::Write { address, file } => {
            let data = fs::read(&file)
                .await
                .with_context(|| format!("Failed to read file: {:?}", file))?;
            check_range(address, data.len())?;
            println!("Writing {} bytes at 0x{:08X}...", data.len(), address);
            let pb = progress_bar(data.len() as u64);

            let mut offset = 0usize;
            for block in data.chunks(TRANSFER_BLOCK_SIZE as usize) {
                let block_address = address + offset as u32;
                check(fbl.write_memory(block_address, block).await?, "Write")
                    .with_context(|| format!("At address 0x{:08X}", block_address))?;
                offset += block.len();
                pb.set_position(offset as u64);
            }
            pb.finish_with_message("Write completed!");
            println!("Data written successfully!");
        }

        Commands::Execute { jump, arg, sp } => {
            check(fbl.execute(jump, arg, sp).await?, "Execute")?;
            println!("Jumped to 0x{:08X}", jump);
        }

        Commands::Reset => {
            check(fbl.reset().await?, "Reset")?;
            println!("Device reset");
        }
    }

    fbl.transport_mut().disconnect().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("0x1000").unwrap(), 0x1000);
        assert_eq!(parse_hex("4096").unwrap(), 4096);
        assert_eq!(parse_hex_u64("0x0123456789ABCDEF").unwrap(), 0x0123_4567_89AB_CDEF);
        assert!(parse_hex("0xZZ").is_err());
    }

    #[test]
    fn test_parse_property() {
        assert_eq!(parse_property("verify-writes").unwrap(), PropertyTag::VerifyWrites);
        assert_eq!(parse_property("FlashSectorSize").unwrap(), PropertyTag::FlashSectorSize);
        assert_eq!(parse_property("0x0A").unwrap(), PropertyTag::VerifyWrites);
        assert!(parse_property("0x08").is_err());
        assert!(parse_property("nonsense").is_err());
    }

    #[test]
    fn test_check_range() {
        assert!(check_range(0x0000_8000, 0x800).is_ok());
        assert!(check_range(0xFFFF_FC00, 0x400).is_ok());
        assert!(check_range(0xFFFF_FC00, 0x800).is_err());
        assert!(check_range(u32::MAX, 2).is_err());
    }
}
