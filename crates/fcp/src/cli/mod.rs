//! CLI subcommands: device discovery, raw commands, meters, events.

mod cmd;
mod config_cmd;
mod devices;
mod events;
mod init;
mod meter;
mod version;

use std::path::{Path, PathBuf};

use clap::Subcommand;
use serde::Serialize;

pub(super) use crate::RUNNING;
pub(super) use fcp_lib::FcpError;
pub(super) use fcp_lib::config::Config;
pub(super) use fcp_lib::error::Result;
pub(super) use fcp_lib::reconnect::{self, Backoff};
pub(super) use fcp_lib::session::FcpSession;
pub(super) use fcp_lib::transport::Transport;
pub(super) use fcp_lib::usb::{self, DiscoveredDevice, UsbSession};

const PADDING: usize = 2;

/// Compute alignment width for a command's key-value output.
/// Ensures at least PADDING spaces after the longest key in either level,
/// with top-level and indent values aligned to the same column.
pub(super) fn kv_width(top: &[&str], indent: &[&str]) -> usize {
    let top_max = top.iter().map(|k| k.len()).max().unwrap_or(0);
    let indent_max = indent.iter().map(|k| k.len()).max().unwrap_or(0);
    let top_need = if top.is_empty() { 0 } else { top_max + PADDING };
    // Indent keys lose 2 chars of inner width to the "  " prefix
    let indent_need = if indent.is_empty() {
        0
    } else {
        indent_max + PADDING + 2
    };
    top_need.max(indent_need)
}

pub(super) fn format_kv(key: &str, value: impl std::fmt::Display, w: usize) -> String {
    format!("{key:<width$}{value}", width = w)
}

pub(super) fn kv(key: &str, value: impl std::fmt::Display, w: usize) {
    println!("{}", format_kv(key, value, w));
}

pub(super) fn kv_indent(key: &str, value: impl std::fmt::Display, w: usize) {
    println!("  {key:<width$}{value}", width = w - 2);
}

/// Classic 16-bytes-per-line dump: `  0000: AB CD ...`.
pub(super) fn hex_dump(data: &[u8]) -> Vec<String> {
    data.chunks(16)
        .enumerate()
        .map(|(i, chunk)| {
            let bytes: Vec<String> = chunk.iter().map(|b| format!("{b:02X}")).collect();
            format!("  {:04X}: {}", i * 16, bytes.join(" "))
        })
        .collect()
}

/// Lowercase hex string with no separators, for JSON output.
pub(super) fn hex_string(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

/// Parse a hex byte string. Spaces, colons and a leading `0x` are ignored.
pub(super) fn parse_hex(s: &str) -> std::result::Result<Vec<u8>, String> {
    let s = s.trim();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    let digits: Vec<char> = s.chars().filter(|c| !matches!(c, ' ' | ':')).collect();
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in \"{s}\""));
    }
    digits
        .chunks(2)
        .map(|pair| {
            let byte: String = pair.iter().collect();
            u8::from_str_radix(&byte, 16).map_err(|_| format!("invalid hex byte \"{byte}\""))
        })
        .collect()
}

/// Parse a u32 given in decimal or `0x` hex.
pub(super) fn parse_u32(s: &str) -> std::result::Result<u32, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number \"{s}\": {e}"))
}

/// Load the config from `custom` if given, else from the default location.
pub(super) fn load_config(custom: Option<&Path>) -> Config {
    match custom {
        Some(path) => {
            let (config, warnings) = Config::load_from(path);
            for w in &warnings {
                log::warn!("{w}");
            }
            config
        }
        None => Config::load(),
    }
}

/// Open the configured device and bring it to `Ready`.
pub(super) fn open_ready(config: &Config) -> Result<UsbSession> {
    let session = usb::open_session(&config.device_serial, config)?;
    session.start(config)?;
    Ok(session)
}

pub(super) fn print_json(value: &impl Serialize) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| FcpError::Config(format!("JSON output: {e}")))?;
    println!("{text}");
    Ok(())
}

// ── JSON output structs ──

#[derive(Debug, Serialize)]
pub(super) struct DevicesOutput {
    pub count: usize,
    pub devices: Vec<DiscoveredDevice>,
}

#[derive(Debug, Serialize)]
pub(super) struct VersionOutput {
    pub cli: String,
    pub protocol: String,
    pub protocol_packed: u32,
}

#[derive(Debug, Serialize)]
pub(super) struct InitOutput {
    pub step0: String,
    pub size: usize,
    pub handshake: bool,
}

#[derive(Debug, Serialize)]
pub(super) struct CmdOutput {
    pub opcode: String,
    pub request: String,
    pub response: String,
}

#[derive(Debug, Serialize)]
pub(super) struct ChannelLevel {
    pub index: usize,
    pub label: Option<String>,
    pub level: u32,
}

#[derive(Debug, Serialize)]
pub(super) struct MeterOutput {
    pub slots: u16,
    pub channels: Vec<ChannelLevel>,
}

#[derive(Debug, Serialize)]
pub(super) struct EventOutput {
    pub bits: u32,
    pub hex: String,
}

#[derive(Debug, Serialize)]
pub(super) struct ConfigOutput {
    pub config_file: Option<String>,
    pub config_file_exists: bool,
    pub settings: Config,
    pub problems: Vec<String>,
}

#[derive(Subcommand)]
pub enum Command {
    /// List connected Focusrite devices
    Devices,

    /// Show the control-protocol version implemented by this tool
    Version,

    /// Run init step 0 and dump the device's reply
    Init {
        /// Step 0 reply size in bytes (default: from config)
        #[arg(long)]
        size: Option<usize>,
        /// Also send the INIT_1 command after step 0
        #[arg(long)]
        handshake: bool,
    },

    /// Execute a raw FCP command
    Cmd {
        /// Opcode, decimal or 0x-prefixed hex
        #[arg(value_parser = parse_u32)]
        opcode: u32,
        /// Request payload as hex bytes (e.g. "01 00 00 00")
        // Fully qualified so clap parses one value into the whole buffer
        #[arg(long, value_parser = parse_hex)]
        data: Option<::std::vec::Vec<u8>>,
        /// Expected response payload size in bytes
        #[arg(long, default_value_t = 0)]
        resp_size: usize,
    },

    /// Read the level meters
    Meter {
        /// Slot per channel, comma-separated; -1 reports zero (overrides config)
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        map: Option<Vec<i16>>,
        /// Raw meter slots on the device (default: config, else highest mapped slot + 1)
        #[arg(long)]
        slots: Option<u16>,
        /// NUL-separated channel names file (overrides config)
        #[arg(long)]
        labels: Option<PathBuf>,
        /// Keep reading until Ctrl+C
        #[arg(long)]
        watch: bool,
        /// Milliseconds between reads in --watch mode
        #[arg(long, default_value_t = 100)]
        interval: u64,
    },

    /// Print device events as they arrive
    Events {
        /// Stop after this many reads
        #[arg(long)]
        count: Option<usize>,
    },

    /// Show current configuration and file paths
    Config {
        /// Write the effective settings back to the config file
        #[arg(long)]
        write: bool,
    },
}

/// Warn if `--json` was passed to a command that doesn't support it.
fn warn_json_unsupported(cmd_name: &str) {
    log::warn!("--json is not supported for `{cmd_name}` (ignored)");
}

pub fn run(cmd: Command, json: bool, config_path: Option<&Path>) -> Result<()> {
    match cmd {
        Command::Devices => devices::cmd_devices(json),
        Command::Version => version::cmd_version(json),
        Command::Init { size, handshake } => init::cmd_init(size, handshake, json, config_path),
        Command::Cmd {
            opcode,
            data,
            resp_size,
        } => cmd::cmd_cmd(opcode, data.unwrap_or_default(), resp_size, json, config_path),
        Command::Meter {
            map,
            slots,
            labels,
            watch,
            interval,
        } => {
            if json && watch {
                warn_json_unsupported("meter --watch");
            }
            let opts = meter::MeterOpts {
                map,
                slots,
                labels,
                watch,
                interval,
            };
            meter::cmd_meter(opts, json && !watch, config_path)
        }
        Command::Events { count } => events::cmd_events(count, json, config_path),
        Command::Config { write } => config_cmd::cmd_config(write, json, config_path),
    }
}
