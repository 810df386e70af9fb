//! Display-name → signal lookup.
//!
//! Scripts refer to hardware by display names (`"Galil RBV"`, `"ION Power"`).
//! A [`DeviceTable`] maps each display name to a device path: either a
//! top-level attribute of the [`DeviceSet`] (`galil_rbv`) or a dotted path
//! into a device's components (`ION_Pump_PS.Pwr_I`). The registry resolves
//! every path once, when it is built.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{AppResult, DaqError};
use crate::hardware::{DeviceNode, DeviceSet, Signal};

/// One row of the device table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub name: String,
    pub path: String,
}

impl DeviceEntry {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// Ordered display name → device path table.
///
/// Deserializes from a list of `{ name, path }` entries, so a configuration
/// file can replace the whole table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceTable {
    entries: Vec<DeviceEntry>,
}

impl DeviceTable {
    pub fn new(entries: Vec<DeviceEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[DeviceEntry] {
        &self.entries
    }

    pub fn path(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.path.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new(vec![
            DeviceEntry::new("Galil RBV", "galil_rbv"),
            DeviceEntry::new("Galil VAL", "galil_val"),
            DeviceEntry::new("ION Power", "ION_Pump_PS.Pwr_I"),
            DeviceEntry::new("ION Current", "ION_Pump_PS.I_I"),
            DeviceEntry::new("ION Voltage", "ION_Pump_PS.E_I"),
            DeviceEntry::new("ION Arc Rate", "ION_Pump_PS.Rate_Arc_I"),
            DeviceEntry::new("ION KWH Count", "ION_Pump_PS.Cnt_Target_KwHr_RB"),
            DeviceEntry::new("ION Output Enable", "ION_Pump_PS.Enbl_Out_Cmd"),
        ])
    }
}

/// Resolved display names.
#[derive(Clone)]
pub struct DeviceRegistry {
    order: Vec<String>,
    signals: HashMap<String, Arc<dyn Signal>>,
}

impl DeviceRegistry {
    /// Resolve every entry of `table` against `devices`.
    ///
    /// Fails with [`DaqError::UnknownDevice`] naming the first path that does
    /// not lead to a signal.
    pub fn build(table: &DeviceTable, devices: &DeviceSet) -> AppResult<Self> {
        let mut order = Vec::with_capacity(table.entries.len());
        let mut signals = HashMap::with_capacity(table.entries.len());
        for entry in &table.entries {
            let signal = resolve_path(&entry.path, devices)?;
            if signals.insert(entry.name.clone(), signal).is_none() {
                order.push(entry.name.clone());
            }
        }
        Ok(Self { order, signals })
    }

    /// Signal registered under a display name.
    pub fn resolve(&self, name: &str) -> AppResult<Arc<dyn Signal>> {
        self.signals
            .get(name)
            .cloned()
            .ok_or_else(|| DaqError::UnknownDevice(name.to_string()))
    }

    /// Display names in table order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("names", &self.order)
            .finish()
    }
}

fn resolve_path(path: &str, devices: &DeviceSet) -> AppResult<Arc<dyn Signal>> {
    let unknown = || DaqError::UnknownDevice(path.to_string());
    let mut segments = path.split('.');
    let root = segments.next().ok_or_else(unknown)?;
    let mut node = devices.get(root).cloned().ok_or_else(unknown)?;

    for segment in segments {
        node = match node {
            DeviceNode::Device(device) => device.component(segment).ok_or_else(unknown)?,
            _ => return Err(unknown()),
        };
    }

    match node {
        DeviceNode::Signal(signal) => Ok(signal),
        _ => Err(unknown()),
    }
}
