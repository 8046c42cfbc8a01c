//! `version` subcommand: control-protocol version, no device needed.

use fcp_lib::protocol::{VERSION, unpack_version};

use super::{Result, VersionOutput, kv, kv_width, print_json};

fn protocol_string(packed: u32) -> String {
    let (major, minor, sub) = unpack_version(packed);
    format!("{major}.{minor}.{sub}")
}

pub(super) fn cmd_version(json: bool) -> Result<()> {
    let output = VersionOutput {
        cli: env!("CARGO_PKG_VERSION").to_string(),
        protocol: protocol_string(VERSION),
        protocol_packed: VERSION,
    };
    if json {
        return print_json(&output);
    }
    let w = kv_width(&["fcp-cli:", "Protocol:"], &[]);
    kv("fcp-cli:", &output.cli, w);
    kv(
        "Protocol:",
        format_args!("{} ({:#010x})", output.protocol, output.protocol_packed),
        w,
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_string_formats_packed_version() {
        assert_eq!(protocol_string(VERSION), "2.0.0");
        assert_eq!(protocol_string(0x0001_0203), "1.2.3");
    }

    #[test]
    fn cmd_version_succeeds() {
        assert!(cmd_version(false).is_ok());
        assert!(cmd_version(true).is_ok());
    }
}
