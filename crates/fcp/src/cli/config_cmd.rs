//! `config` subcommand: show current configuration and file paths.

use std::path::Path;

use super::{Config, ConfigOutput, FcpError, Result, kv, kv_indent, kv_width, print_json};

fn problems(config: &Config) -> Vec<String> {
    match config.validate() {
        Ok(()) => Vec::new(),
        Err(errors) => errors.iter().map(ToString::to_string).collect(),
    }
}

fn or_placeholder(value: &str, placeholder: &str) -> String {
    if value.is_empty() {
        placeholder.to_string()
    } else {
        value.to_string()
    }
}

fn format_map(map: &[i16]) -> String {
    if map.is_empty() {
        return "(none)".to_string();
    }
    map.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

pub(super) fn cmd_config(write: bool, json: bool, custom_path: Option<&Path>) -> Result<()> {
    let config = super::load_config(custom_path);
    let config_path = custom_path.map(|p| p.to_path_buf()).or_else(Config::path);
    if write {
        let Some(path) = &config_path else {
            return Err(FcpError::Config("no config directory".into()));
        };
        config.save_to(path)?;
        log::info!("wrote {}", path.display());
    }
    let config_exists = config_path.as_ref().is_some_and(|p| p.exists());
    let problems = problems(&config);

    if json {
        return print_json(&ConfigOutput {
            config_file: config_path.as_ref().map(|p| p.display().to_string()),
            config_file_exists: config_exists,
            settings: config,
            problems,
        });
    }

    let w = kv_width(
        &["Config file:"],
        &[
            "device_serial:",
            "step0_size:",
            "transfer_timeout_ms:",
            "completion_timeout_ms:",
            "send_retries:",
            "retry_base_delay_ms:",
            "slots:",
            "map:",
            "labels_path:",
        ],
    );

    match &config_path {
        Some(p) if config_exists => kv("Config file:", format_args!("{} (loaded)", p.display()), w),
        Some(p) => kv(
            "Config file:",
            format_args!("{} (not found, using defaults)", p.display()),
            w,
        ),
        None => kv("Config file:", "(no config directory)", w),
    }
    println!();

    println!("Settings:");
    kv_indent(
        "device_serial:",
        or_placeholder(&config.device_serial, "(first device)"),
        w,
    );
    kv_indent("step0_size:", config.step0_size, w);
    kv_indent("transfer_timeout_ms:", config.transfer_timeout_ms, w);
    kv_indent("completion_timeout_ms:", config.completion_timeout_ms, w);
    kv_indent("send_retries:", config.send_retries, w);
    kv_indent("retry_base_delay_ms:", config.retry_base_delay_ms, w);
    println!();

    println!("Meter:");
    kv_indent("slots:", config.meter.slots, w);
    kv_indent("map:", format_map(&config.meter.map), w);
    kv_indent(
        "labels_path:",
        or_placeholder(&config.meter.labels_path, "(none)"),
        w,
    );

    if !problems.is_empty() {
        println!();
        println!("Problems:");
        for p in &problems {
            println!("  {p}");
        }
    }
    Ok(())
}
