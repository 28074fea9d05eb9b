//! Device set
//!
//! A fixed-capacity table of the devices the compositor exposes. Indices
//! are stable while a device stays attached. Every change is mirrored into
//! the shared-memory device table.

use log::info;

use crate::error::IpcError;
use crate::shm::layout::DEVICE_NAME_LEN;
use crate::shm::{DeviceRecord, DeviceTableRecord, DeviceWriter, MAX_DEVICES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DeviceKind {
    Display = 1,
    Controller = 2,
    Tracker = 3,
    Other = 4,
}

/// A device the compositor reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Human-readable name; truncated to fit the shared-memory record
    pub name: String,
    pub kind: DeviceKind,
    /// Distinguishes devices that share a name
    pub serial: u64,
}

impl DeviceInfo {
    pub fn new(name: &str, kind: DeviceKind, serial: u64) -> Self {
        Self {
            name: name.to_string(),
            kind,
            serial,
        }
    }

    fn to_record(&self) -> DeviceRecord {
        let mut name = [0u8; DEVICE_NAME_LEN];
        let mut len = self.name.len().min(DEVICE_NAME_LEN - 1);
        while !self.name.is_char_boundary(len) {
            len -= 1;
        }
        name[..len].copy_from_slice(&self.name.as_bytes()[..len]);
        DeviceRecord {
            name,
            kind: self.kind as u32,
            connected: 1,
            serial: self.serial,
        }
    }
}

/// Bounded set of attached devices
pub struct DeviceSet {
    slots: [Option<DeviceInfo>; MAX_DEVICES],
    writer: DeviceWriter,
}

impl DeviceSet {
    /// Populate from the startup list; devices past capacity are ignored
    pub fn new(writer: DeviceWriter, initial: Vec<DeviceInfo>) -> Self {
        let mut set = Self {
            slots: Default::default(),
            writer,
        };
        for (index, device) in initial.into_iter().enumerate() {
            if index >= MAX_DEVICES {
                log::warn!("Ignoring device {:?}: device set is full", device.name);
                continue;
            }
            info!("Device {}: {} ({:?})", index, device.name, device.kind);
            set.slots[index] = Some(device);
        }
        set.sync();
        set
    }

    /// Attach a device in the first free slot
    pub fn attach(&mut self, device: DeviceInfo) -> Result<u32, IpcError> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(IpcError::ResourceExhausted("device slot"))?;
        info!("Device {} attached: {}", index, device.name);
        self.slots[index] = Some(device);
        self.sync();
        Ok(index as u32)
    }

    pub fn detach(&mut self, index: u32) -> Result<DeviceInfo, IpcError> {
        let device = self
            .slots
            .get_mut(index as usize)
            .and_then(Option::take)
            .ok_or(IpcError::NotFound)?;
        info!("Device {} detached: {}", index, device.name);
        self.sync();
        Ok(device)
    }

    pub fn get(&self, index: u32) -> Option<&DeviceInfo> {
        self.slots.get(index as usize).and_then(Option::as_ref)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sync(&mut self) {
        let mut table: DeviceTableRecord = bytemuck::Zeroable::zeroed();
        for (record, slot) in table.devices.iter_mut().zip(self.slots.iter()) {
            if let Some(device) = slot {
                *record = device.to_record();
            }
        }
        table.count = self.len() as u32;
        self.writer.write(&table);
    }
}
