//! `cmd` subcommand: execute one raw FCP command.

use std::path::Path;

use super::{
    CmdOutput, FcpSession, Result, Transport, hex_dump, hex_string, kv, kv_width, load_config,
    open_ready, print_json,
};

fn cmd_output(opcode: u32, request: &[u8], response: &[u8]) -> CmdOutput {
    CmdOutput {
        opcode: format!("{opcode:#010x}"),
        request: hex_string(request),
        response: hex_string(response),
    }
}

fn print_response(opcode: u32, request: &[u8], response: &[u8]) {
    let w = kv_width(&["Opcode:", "Request:", "Response:"], &[]);
    kv("Opcode:", format_args!("{opcode:#010x}"), w);
    kv("Request:", format_args!("{} bytes", request.len()), w);
    if response.is_empty() {
        kv("Response:", "(empty)", w);
    } else {
        kv("Response:", format_args!("{} bytes", response.len()), w);
        for line in hex_dump(response) {
            println!("{line}");
        }
    }
}

pub(super) fn execute<T: Transport>(
    session: &FcpSession<T>,
    opcode: u32,
    data: &[u8],
    resp_size: usize,
    json: bool,
) -> Result<CmdOutput> {
    let response = session.command(opcode, data, resp_size)?;
    let output = cmd_output(opcode, data, &response);
    if json {
        print_json(&output)?;
    } else {
        print_response(opcode, data, &response);
    }
    Ok(output)
}

pub(super) fn cmd_cmd(
    opcode: u32,
    data: Vec<u8>,
    resp_size: usize,
    json: bool,
    config_path: Option<&Path>,
) -> Result<()> {
    let config = load_config(config_path);
    let session = open_ready(&config)?;
    execute(&session, opcode, &data, resp_size, json).map(|_| ())
}
