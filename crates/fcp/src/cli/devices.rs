//! `devices` subcommand: list connected Focusrite devices.

use super::{DevicesOutput, Result, print_json, usb};

pub(super) fn cmd_devices(json: bool) -> Result<()> {
    let devices = usb::enumerate_devices();

    if json {
        let output = DevicesOutput {
            count: devices.len(),
            devices,
        };
        return print_json(&output);
    }

    if devices.is_empty() {
        println!("No Focusrite devices found.");
        return Ok(());
    }

    println!(
        "Found {} Focusrite device{}:",
        devices.len(),
        if devices.len() == 1 { "" } else { "s" }
    );
    println!();

    for (i, dev) in devices.iter().enumerate() {
        println!(
            "  [{}] {} {}",
            i + 1,
            dev.path,
            dev.product.as_deref().unwrap_or("(unknown product)")
        );
        if let Some(ref serial) = dev.serial {
            println!("      Serial: {serial}");
        }
        println!("      Control interface: {}", dev.interface_number);
    }

    Ok(())
}
