//! `meter` subcommand: read level meters once, or follow them with `--watch`.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;

use fcp_lib::protocol::{MAX_METER_LABELS_SIZE, METER_LEVEL_MAX};

use super::{
    Backoff, ChannelLevel, Config, FcpError, FcpSession, MeterOutput, RUNNING, Result, Transport,
    UsbSession, load_config, open_ready, print_json, reconnect,
};

const BAR_WIDTH: usize = 32;

pub(super) struct MeterOpts {
    pub map: Option<Vec<i16>>,
    pub slots: Option<u16>,
    pub labels: Option<PathBuf>,
    pub watch: bool,
    pub interval: u64,
}

/// Fold command-line overrides into the meter section of `config`.
fn apply_overrides(config: &mut Config, opts: &MeterOpts) -> Result<()> {
    if let Some(map) = &opts.map {
        config.meter.map = map.clone();
    }
    if let Some(slots) = opts.slots {
        config.meter.slots = slots;
    }
    if let Some(path) = &opts.labels {
        config.meter.labels_path = path.display().to_string();
    }
    if config.meter.map.is_empty() {
        return Err(FcpError::InvalidArgument(
            "no meter map: pass --map or set meter.map in the config".into(),
        ));
    }
    if config.meter.slots == 0 {
        config.meter.slots = default_slots(&config.meter.map);
    }
    Ok(())
}

/// One past the highest mapped slot.
fn default_slots(map: &[i16]) -> u16 {
    map.iter()
        .map(|&s| (i32::from(s) + 1).clamp(0, i32::from(u16::MAX)) as u16)
        .max()
        .unwrap_or(0)
}

/// Split a NUL-separated label blob into names.
pub(super) fn split_labels(blob: &[u8]) -> Vec<String> {
    let blob = blob.strip_suffix(&[0]).unwrap_or(blob);
    if blob.is_empty() {
        return Vec::new();
    }
    blob.split(|&b| b == 0)
        .map(|name| String::from_utf8_lossy(name).into_owned())
        .collect()
}

fn bar(level: u32) -> String {
    let filled = (level.min(METER_LEVEL_MAX) as usize * BAR_WIDTH) / METER_LEVEL_MAX as usize;
    format!("{}{}", "#".repeat(filled), ".".repeat(BAR_WIDTH - filled))
}

fn channel_label(labels: &[String], index: usize) -> Option<String> {
    labels.get(index).filter(|l| !l.is_empty()).cloned()
}

pub(super) fn render_levels(levels: &[u32], labels: &[String]) -> Vec<String> {
    let names: Vec<String> = (0..levels.len())
        .map(|i| channel_label(labels, i).unwrap_or_else(|| format!("Ch {}", i + 1)))
        .collect();
    let w = names.iter().map(|n| n.len()).max().unwrap_or(0);
    levels
        .iter()
        .zip(&names)
        .map(|(&level, name)| format!("  {name:<w$}  {level:>4}  {}", bar(level)))
        .collect()
}

pub(super) fn meter_output<T: Transport>(session: &FcpSession<T>) -> Result<MeterOutput> {
    let levels = session.read_meter()?;
    let labels = split_labels(&session.meter_labels(MAX_METER_LABELS_SIZE)?);
    let slots = session.meter_info()?.slots;
    let channels = levels
        .into_iter()
        .enumerate()
        .map(|(index, level)| ChannelLevel {
            index,
            label: channel_label(&labels, index),
            level,
        })
        .collect();
    Ok(MeterOutput { slots, channels })
}

fn print_levels<T: Transport>(session: &FcpSession<T>, json: bool) -> Result<()> {
    let output = meter_output(session)?;
    if json {
        return print_json(&output);
    }
    let levels: Vec<u32> = output.channels.iter().map(|c| c.level).collect();
    let labels: Vec<String> = output
        .channels
        .iter()
        .map(|c| c.label.clone().unwrap_or_default())
        .collect();
    for line in render_levels(&levels, &labels) {
        println!("{line}");
    }
    Ok(())
}

fn watch(session: UsbSession, config: &Config, interval: Duration) {
    println!("Watching level meters (Ctrl+C to stop)...");
    let mut session = Some(session);
    let mut backoff = Backoff::default();

    while RUNNING.load(Ordering::SeqCst) {
        if session.is_none() {
            session = reconnect::try_reattach(&mut backoff, config);
            if session.is_some() {
                println!("[device] reconnected");
            }
        }
        if let Some(s) = &session {
            println!();
            match print_levels(s, false) {
                Ok(()) => {}
                Err(e) if reconnect::is_disconnect(&e) => {
                    println!("[device] lost: {e}");
                    session = None;
                }
                Err(e) => log::warn!("meter read failed: {e}"),
            }
        }
        std::thread::sleep(interval);
    }
}

pub(super) fn cmd_meter(opts: MeterOpts, json: bool, config_path: Option<&Path>) -> Result<()> {
    let mut config = load_config(config_path);
    apply_overrides(&mut config, &opts)?;
    let session = open_ready(&config)?;

    if opts.watch {
        watch(session, &config, Duration::from_millis(opts.interval.max(1)));
        Ok(())
    } else {
        print_levels(&session, json)
    }
}
