//! Per-session swapchain table
//!
//! Indices are stable for the life of the session. A slot is reusable only
//! after [`SwapchainTable::free`]; between [`SwapchainTable::take`] and
//! `free` it is reserved while the compositor releases its resources.

use std::sync::Arc;

use crate::compositor::Swapchain;
use crate::error::IpcError;

/// Metadata kept for an occupied slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainData {
    pub width: u32,
    pub height: u32,
    pub format: u64,
    pub image_count: u32,
    pub active: bool,
}

enum Entry {
    Free,
    Active {
        data: SwapchainData,
        swapchain: Arc<dyn Swapchain>,
    },
    Releasing,
}

pub struct SwapchainTable {
    entries: Vec<Entry>,
}

impl SwapchainTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: (0..capacity).map(|_| Entry::Free).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of slots not free
    pub fn occupied(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !matches!(e, Entry::Free))
            .count()
    }

    /// Lowest free index
    pub fn first_free(&self) -> Result<u32, IpcError> {
        self.entries
            .iter()
            .position(|e| matches!(e, Entry::Free))
            .map(|i| i as u32)
            .ok_or(IpcError::ResourceExhausted("swapchain slot"))
    }

    /// Occupy a free slot
    pub fn insert(&mut self, index: u32, swapchain: Arc<dyn Swapchain>) -> Result<(), IpcError> {
        let entry = self.entry_mut(index)?;
        if !matches!(entry, Entry::Free) {
            return Err(IpcError::InvalidState("swapchain slot in use"));
        }
        let info = *swapchain.info();
        *entry = Entry::Active {
            data: SwapchainData {
                width: info.width,
                height: info.height,
                format: info.format,
                image_count: info.image_count,
                active: true,
            },
            swapchain,
        };
        Ok(())
    }

    /// Metadata and handle of an active slot
    ///
    /// Out-of-range and inactive indices are argument errors.
    pub fn get(&self, index: u32) -> Result<(&SwapchainData, &Arc<dyn Swapchain>), IpcError> {
        match self.entries.get(index as usize) {
            None => Err(self.out_of_range(index)),
            Some(Entry::Active { data, swapchain }) => Ok((data, swapchain)),
            Some(_) => Err(IpcError::InvalidArgument(format!(
                "swapchain {} is not active",
                index
            ))),
        }
    }

    /// Validate an image index against an active slot
    pub fn image(&self, index: u32, image_index: u32) -> Result<&Arc<dyn Swapchain>, IpcError> {
        let (data, swapchain) = self.get(index)?;
        if image_index >= data.image_count {
            return Err(IpcError::InvalidArgument(format!(
                "image {} out of range for swapchain {} with {} images",
                image_index, index, data.image_count
            )));
        }
        Ok(swapchain)
    }

    /// Reserve an active slot for destruction and hand back its swapchain
    ///
    /// Returns `Ok(None)` when the slot is already inactive.
    pub fn take(&mut self, index: u32) -> Result<Option<Arc<dyn Swapchain>>, IpcError> {
        let entry = self.entry_mut(index)?;
        match std::mem::replace(entry, Entry::Releasing) {
            Entry::Active { swapchain, .. } => Ok(Some(swapchain)),
            other => {
                *entry = other;
                Ok(None)
            }
        }
    }

    /// Mark a reserved slot free again
    pub fn free(&mut self, index: u32) {
        if let Some(entry) = self.entries.get_mut(index as usize) {
            if matches!(entry, Entry::Releasing) {
                *entry = Entry::Free;
            }
        }
    }

    /// Indices of all active slots
    pub fn active_indices(&self) -> Vec<u32> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, Entry::Active { .. }))
            .map(|(i, _)| i as u32)
            .collect()
    }

    fn entry_mut(&mut self, index: u32) -> Result<&mut Entry, IpcError> {
        let capacity = self.entries.len();
        self.entries.get_mut(index as usize).ok_or_else(|| {
            IpcError::InvalidArgument(format!(
                "swapchain index {} out of range (capacity {})",
                index, capacity
            ))
        })
    }

    fn out_of_range(&self, index: u32) -> IpcError {
        IpcError::InvalidArgument(format!(
            "swapchain index {} out of range (capacity {})",
            index,
            self.entries.len()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::{format, Compositor, HeadlessCompositor, SwapchainInfo};
    use crate::ipc::protocol::SwapchainUsage;

    fn swapchain(compositor: &HeadlessCompositor, images: u32) -> Arc<dyn Swapchain> {
        let mut client = compositor.create_client(0).unwrap();
        client
            .create_swapchain(&SwapchainInfo {
                format: format::ARGB8888,
                width: 16,
                height: 16,
                image_count: images,
                usage: SwapchainUsage::COLOR,
            })
            .unwrap()
    }

    fn destroy(table: &mut SwapchainTable, index: u32) {
        if let Some(sc) = table.take(index).unwrap() {
            drop(sc);
            table.free(index);
        }
    }

    #[test]
    fn test_first_free_and_exhaustion() {
        let compositor = HeadlessCompositor::new();
        let mut table = SwapchainTable::new(2);
        for expected in 0..2 {
            let index = table.first_free().unwrap();
            assert_eq!(index, expected);
            table.insert(index, swapchain(&compositor, 2)).unwrap();
        }
        assert!(matches!(
            table.first_free(),
            Err(IpcError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let compositor = HeadlessCompositor::new();
        let mut table = SwapchainTable::new(4);
        table.insert(0, swapchain(&compositor, 2)).unwrap();
        assert_eq!(table.occupied(), 1);

        destroy(&mut table, 0);
        assert_eq!(table.occupied(), 0);
        // Second destroy is a no-op success.
        assert!(table.take(0).unwrap().is_none());
        assert_eq!(table.occupied(), 0);
        // Never-created slot as well.
        assert!(table.take(3).unwrap().is_none());
        // Out of range is still a protocol error.
        assert!(table.take(4).is_err());
    }

    #[test]
    fn test_reserved_slot_not_reused_until_freed() {
        let compositor = HeadlessCompositor::new();
        let mut table = SwapchainTable::new(1);
        table.insert(0, swapchain(&compositor, 1)).unwrap();
        let sc = table.take(0).unwrap().unwrap();
        assert!(table.first_free().is_err());
        assert!(table.get(0).is_err());
        drop(sc);
        table.free(0);
        assert_eq!(table.first_free().unwrap(), 0);
    }

    #[test]
    fn test_image_bounds() {
        let compositor = HeadlessCompositor::new();
        let mut table = SwapchainTable::new(2);
        table.insert(1, swapchain(&compositor, 2)).unwrap();
        assert!(table.image(1, 1).is_ok());
        assert!(matches!(table.image(1, 2), Err(IpcError::InvalidArgument(_))));
        assert!(matches!(table.image(0, 0), Err(IpcError::InvalidArgument(_))));
        assert!(matches!(table.image(9, 0), Err(IpcError::InvalidArgument(_))));
        assert_eq!(table.get(1).unwrap().0.image_count, 2);
    }

    #[test]
    fn test_occupancy_never_exceeds_capacity() {
        let compositor = HeadlessCompositor::new();
        let mut table = SwapchainTable::new(3);
        let mut live: Vec<u32> = Vec::new();
        // Deterministic pseudo-random create/destroy sequence.
        let mut x: u32 = 12345;
        for _ in 0..200 {
            x = x.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            if x % 3 != 0 {
                match table.first_free() {
                    Ok(index) => {
                        assert!(!live.contains(&index));
                        table.insert(index, swapchain(&compositor, 1)).unwrap();
                        live.push(index);
                    }
                    Err(IpcError::ResourceExhausted(_)) => assert_eq!(live.len(), 3),
                    Err(e) => panic!("unexpected error {:?}", e),
                }
            } else {
                let index = (x >> 8) % 3;
                destroy(&mut table, index);
                live.retain(|&i| i != index);
            }
            assert!(table.occupied() <= table.capacity());
            let mut active = table.active_indices();
            active.sort_unstable();
            let mut expected = live.clone();
            expected.sort_unstable();
            assert_eq!(active, expected);
        }
    }
}
