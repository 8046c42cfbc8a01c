//! Level meter: remaps the device's raw meter slots onto exposed channels.
//!
//! The device answers GET_METER with one u32 per raw slot. A user-supplied
//! map picks, for each exposed channel, either a slot index or `-1`
//! (report zero). The exposed channels are published through a
//! [`ControlRegistry`] as a single "Level Meter" control whose channel count
//! follows the map length. An opaque label blob rides alongside for tools
//! that want to name the channels.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{FcpError, Result};
use crate::protocol::{
    MAX_METER_LABELS_SIZE, MAX_METER_MAP_LEN, METER_CONTROL_NAME, METER_LEVEL_MAX,
    METER_LEVEL_MIN, METER_LEVELS_GET_MAGIC, OPCODE_GET_METER,
};
use crate::transaction::TransactionEngine;
use crate::transport::Transport;

/// Handle to a registered control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ControlId(pub u32);

/// Owner of control lifecycles (the host's mixer / control surface).
pub trait ControlRegistry: Send {
    /// Register a read-only integer control with `channels` values.
    fn add_meter(&mut self, name: &str, channels: usize) -> Result<ControlId>;

    fn remove(&mut self, id: ControlId);
}

/// A control as seen by [`LocalRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisteredControl {
    pub name: String,
    pub channels: usize,
}

/// In-process registry: keeps a table of live controls.
#[derive(Debug, Default)]
pub struct LocalRegistry {
    next_id: u32,
    controls: BTreeMap<ControlId, RegisteredControl>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ControlId) -> Option<&RegisteredControl> {
        self.controls.get(&id)
    }

    pub fn len(&self) -> usize {
        self.controls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }
}

impl ControlRegistry for LocalRegistry {
    fn add_meter(&mut self, name: &str, channels: usize) -> Result<ControlId> {
        if channels == 0 {
            return Err(FcpError::InvalidArgument(format!(
                "control \"{name}\": needs at least one channel"
            )));
        }
        self.next_id += 1;
        let id = ControlId(self.next_id);
        self.controls.insert(
            id,
            RegisteredControl {
                name: name.to_string(),
                channels,
            },
        );
        log::debug!("registered control {} \"{name}\" ({channels} channels)", id.0);
        Ok(id)
    }

    fn remove(&mut self, id: ControlId) {
        if self.controls.remove(&id).is_some() {
            log::debug!("removed control {}", id.0);
        }
    }
}

/// Snapshot of the meter configuration, for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MeterInfo {
    pub slots: u16,
    pub channels: usize,
    pub control: Option<ControlId>,
    pub min: u32,
    pub max: u32,
    pub step: u32,
    pub labels_size: usize,
}

/// Map, slot count, label blob and registered control of one device.
#[derive(Debug, Default)]
pub struct MeterState {
    slot_count: u16,
    map: Vec<i16>,
    labels: Vec<u8>,
    control: Option<ControlId>,
}

impl MeterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&self) -> &[i16] {
        &self.map
    }

    pub fn slot_count(&self) -> u16 {
        self.slot_count
    }

    pub fn control(&self) -> Option<ControlId> {
        self.control
    }

    /// Validate and install a new map.
    ///
    /// A new control is registered when none exists yet or the channel
    /// count changes; the old one is removed only after that succeeds.
    pub fn install_map(
        &mut self,
        registry: &mut dyn ControlRegistry,
        map: &[i16],
        slot_count: u16,
    ) -> Result<()> {
        if map.len() > MAX_METER_MAP_LEN {
            return Err(FcpError::InvalidArgument(format!(
                "meter map has {} entries (max {MAX_METER_MAP_LEN})",
                map.len()
            )));
        }
        if let Some((i, &idx)) = map
            .iter()
            .enumerate()
            .find(|&(_, &idx)| idx < -1 || i32::from(idx) >= i32::from(slot_count))
        {
            return Err(FcpError::InvalidArgument(format!(
                "meter map entry {i} = {idx} outside [-1, {slot_count})"
            )));
        }

        let mut new_map = Vec::new();
        new_map.try_reserve_exact(map.len())?;
        new_map.extend_from_slice(map);

        if new_map.is_empty() {
            // Nothing to expose: drop any existing control.
            self.release(registry);
        } else if self.control.is_none() || self.map.len() != new_map.len() {
            let id = registry.add_meter(METER_CONTROL_NAME, new_map.len())?;
            if let Some(old) = self.control.replace(id) {
                registry.remove(old);
            }
        }

        self.map = new_map;
        self.slot_count = slot_count;
        log::info!(
            "meter map installed: {} channels from {slot_count} slots",
            self.map.len()
        );
        Ok(())
    }

    /// Read the device meters and remap them onto the exposed channels.
    pub fn read<T: Transport>(&self, engine: &mut TransactionEngine<T>) -> Result<Vec<u32>> {
        if self.control.is_none() {
            return Err(FcpError::InvalidArgument(
                "no meter map installed".into(),
            ));
        }

        let mut req = [0u8; 8];
        req[2..4].copy_from_slice(&self.slot_count.to_le_bytes());
        req[4..8].copy_from_slice(&METER_LEVELS_GET_MAGIC.to_le_bytes());

        let raw = engine.execute(OPCODE_GET_METER, &req, usize::from(self.slot_count) * 4)?;

        let levels = self
            .map
            .iter()
            .map(|&idx| match usize::try_from(idx) {
                Ok(slot) => {
                    let off = slot * 4;
                    u32::from_le_bytes([raw[off], raw[off + 1], raw[off + 2], raw[off + 3]])
                }
                Err(_) => 0,
            })
            .collect();
        Ok(levels)
    }

    /// Replace the label blob. Empty clears it; oversize leaves the old one.
    pub fn set_labels(&mut self, blob: &[u8]) -> Result<()> {
        if blob.len() > MAX_METER_LABELS_SIZE {
            return Err(FcpError::InvalidArgument(format!(
                "meter labels are {} bytes (max {MAX_METER_LABELS_SIZE})",
                blob.len()
            )));
        }
        let mut labels = Vec::new();
        labels.try_reserve_exact(blob.len())?;
        labels.extend_from_slice(blob);
        self.labels = labels;
        Ok(())
    }

    /// The label blob, truncated to `capacity` bytes.
    pub fn labels(&self, capacity: usize) -> &[u8] {
        &self.labels[..self.labels.len().min(capacity)]
    }

    pub fn info(&self) -> MeterInfo {
        MeterInfo {
            slots: self.slot_count,
            channels: self.map.len(),
            control: self.control,
            min: METER_LEVEL_MIN,
            max: METER_LEVEL_MAX,
            step: 1,
            labels_size: self.labels.len(),
        }
    }

    /// Unregister the control (device going away).
    pub fn release(&mut self, registry: &mut dyn ControlRegistry) {
        if let Some(id) = self.control.take() {
            registry.remove(id);
        }
    }
}
