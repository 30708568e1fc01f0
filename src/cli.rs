// CLI definitions using clap

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hidpad")]
#[command(author, version, about = "Connect to HID game controllers and print their events")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Where the session config comes from
#[derive(Args, Clone)]
pub struct ConfigSource {
    /// Config file path (default: ~/.config/hidpad/session.toml)
    #[arg(short, long, conflicts_with = "preset")]
    pub config: Option<PathBuf>,

    /// Use a built-in layout instead of a config file
    #[arg(short, long)]
    pub preset: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List attached HID devices
    #[command(visible_alias = "ls")]
    List {
        /// Only devices with this vendor id (hex)
        #[arg(long, value_parser = parse_hex_u16)]
        vid: Option<u16>,
        /// Only devices with this product id (hex)
        #[arg(long, value_parser = parse_hex_u16)]
        pid: Option<u16>,
    },

    /// Run a session and print events until Ctrl-C
    #[command(visible_alias = "w")]
    Watch {
        #[command(flatten)]
        source: ConfigSource,
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Connect, fire one rumble pulse, disconnect
    Rumble {
        #[command(flatten)]
        source: ConfigSource,
        /// Pulse length in milliseconds
        #[arg(short, long, default_value = "500")]
        duration_ms: u64,
        /// Give up if no device connects within this many milliseconds
        #[arg(long, default_value = "5000")]
        connect_timeout_ms: u64,
    },

    /// List built-in layouts or print one as TOML
    Presets {
        /// Preset to print
        #[arg(long, value_name = "NAME")]
        dump: Option<String>,
    },
}

/// Parse a USB id like `054c`, `0x054C` or `054C`
pub fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex id '{s}': {e}"))
}
