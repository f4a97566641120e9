//! Device side of the virtio contract.
//!
//! A [`VirtioDevice`] describes itself through [`DeviceDesc`] and is driven by a transport, which
//! hands it a [`VirtioController`] whenever a queue is notified. The controller is the device's
//! only way to reach its queues, guest memory and shared memory regions.

use crate::memory::{AddrRange, GuestMemory};
use crate::message::VqMessage;
use crate::queue::QueueDesc;
use crate::transport::TransportError;
use core::any::Any;
use std::collections::BTreeMap;

pub const VIRTIO_DEVICE_NONE: u32 = 0;
pub const VIRTIO_DEVICE_NET: u32 = 1;
pub const VIRTIO_DEVICE_BLOCK: u32 = 2;
pub const VIRTIO_DEVICE_CONSOLE: u32 = 3;
pub const VIRTIO_DEVICE_RNG: u32 = 4;
pub const VIRTIO_DEVICE_P9FS: u32 = 9;
pub const VIRTIO_DEVICE_GPU: u32 = 16;
pub const VIRTIO_DEVICE_INPUT: u32 = 18;
pub const VIRTIO_DEVICE_SOUND: u32 = 25;

pub const VIRTIO_VENDOR_NONE: u32 = 0;
/// `"vqkt"` as a little-endian fourcc.
pub const VIRTIO_VENDOR_VQKIT: u32 = u32::from_le_bytes(*b"vqkt");

pub const VIRTIO_F_RING_INDIRECT_DESC: u64 = 1 << 28;
pub const VIRTIO_F_RING_EVENT_IDX: u64 = 1 << 29;
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;
pub const VIRTIO_F_ACCESS_PLATFORM: u64 = 1 << 33;
pub const VIRTIO_F_RING_PACKED: u64 = 1 << 34;
pub const VIRTIO_F_IN_ORDER: u64 = 1 << 35;
pub const VIRTIO_F_ORDER_PLATFORM: u64 = 1 << 36;
pub const VIRTIO_F_SR_IOV: u64 = 1 << 37;
pub const VIRTIO_F_NOTIFICATION_DATA: u64 = 1 << 38;
pub const VIRTIO_F_NOTIF_CONFIG_DATA: u64 = 1 << 39;
pub const VIRTIO_F_RING_RESET: u64 = 1 << 40;
pub const VIRTIO_F_ADMIN_VQ: u64 = 1 << 41;

pub const VIRTIO_STATUS_ACKNOWLEDGE: u8 = 1;
pub const VIRTIO_STATUS_DRIVER: u8 = 2;
pub const VIRTIO_STATUS_DRIVER_OK: u8 = 4;
pub const VIRTIO_STATUS_FEATURES_OK: u8 = 8;
pub const VIRTIO_STATUS_DEVICE_NEEDS_RESET: u8 = 0x40;
pub const VIRTIO_STATUS_FAILED: u8 = 0x80;

pub const VIRTIO_STATUS_FEATURE_CHECK: u8 = VIRTIO_STATUS_DRIVER | VIRTIO_STATUS_FEATURES_OK;
pub const VIRTIO_STATUS_DEVICE_READY: u8 =
    VIRTIO_STATUS_DRIVER | VIRTIO_STATUS_FEATURES_OK | VIRTIO_STATUS_DRIVER_OK;

pub const VIRTIO_IRQSTATUS_VQUEUE: u32 = 1 << 0;
pub const VIRTIO_IRQSTATUS_CONFIG: u32 = 1 << 1;
pub const VIRTIO_IRQSTATUS_MASK: u32 = VIRTIO_IRQSTATUS_VQUEUE | VIRTIO_IRQSTATUS_CONFIG;

/// Exclusive upper bound for virtqueue ids.
pub const VIRTQUEUE_MAX: u32 = 1024;

/// PCI class code reported by devices that do not pick one.
pub const PCI_CLASS_OTHERS: u32 = 0xff_0000;

pub fn feature_check(status: u8) -> bool {
    status & VIRTIO_STATUS_FEATURE_CHECK == VIRTIO_STATUS_FEATURE_CHECK
}

pub fn device_ready(status: u8) -> bool {
    status & VIRTIO_STATUS_DEVICE_READY == VIRTIO_STATUS_DEVICE_READY
}

/// A shared memory region requested by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmDesc {
    pub shmid: u32,
    pub capacity: u64,
}

/// What a device reports about itself during identification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDesc {
    pub device_id: u32,
    pub vendor_id: u32,
    pub pci_class: u32,
    /// Shared memory the transport can provide; set by the transport before identification.
    pub shm_capacity: u64,
    pub virtqueues: BTreeMap<u32, QueueDesc>,
    pub shmems: BTreeMap<u32, ShmDesc>,
}

impl Default for DeviceDesc {
    fn default() -> Self {
        Self {
            device_id: VIRTIO_DEVICE_NONE,
            vendor_id: VIRTIO_VENDOR_NONE,
            pci_class: PCI_CLASS_OTHERS,
            shm_capacity: 0,
            virtqueues: BTreeMap::new(),
            shmems: BTreeMap::new(),
        }
    }
}

impl DeviceDesc {
    pub fn request_virtqueue(&mut self, id: u32, max_size: u32) {
        self.virtqueues
            .entry(id)
            .or_insert_with(|| QueueDesc::new(id, max_size));
    }

    pub fn remaining_shm_capacity(&self) -> u64 {
        let used: u64 = self.shmems.values().map(|shm| shm.capacity).sum();
        self.shm_capacity.saturating_sub(used)
    }

    /// Reserves `capacity` bytes of shared memory for region `shmid`.
    pub fn request_shm(&mut self, shmid: u32, capacity: u64) -> bool {
        if capacity == 0 || capacity > self.remaining_shm_capacity() {
            return false;
        }
        if self.shmems.contains_key(&shmid) {
            return false;
        }
        self.shmems.insert(shmid, ShmDesc { shmid, capacity });
        true
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Transport services available to a device while it handles a notification.
pub trait VirtioController {
    /// Dequeues the next available message of queue `vqid`.
    fn get(&mut self, vqid: u32) -> Result<Option<VqMessage>, TransportError>;

    /// Completes `msg` on queue `vqid`, raising the queue interrupt if the driver asked for it.
    fn put(&mut self, vqid: u32, msg: &mut VqMessage) -> Result<(), TransportError>;

    /// Signals a configuration change to the driver.
    fn notify(&mut self) -> bool;

    /// Guest memory backing the queues and their buffers.
    fn memory(&mut self) -> &mut dyn GuestMemory;

    fn shm_map(&mut self, shmid: u32, id: u64, offset: u64, data: Vec<u8>) -> bool;
    fn shm_unmap(&mut self, shmid: u32, id: u64) -> bool;
}

/// A virtio device model.
pub trait VirtioDevice {
    /// Fills in the device description. `desc` has been reset by the caller.
    fn identify(&mut self, desc: &mut DeviceDesc);

    /// The driver notified queue `vqid`. Returns `false` if the device failed.
    fn notify(&mut self, vqid: u32, ctrl: &mut dyn VirtioController) -> bool;

    fn reset(&mut self);

    /// Device-specific feature bits. Transport feature bits are added by the transport.
    fn read_features(&self) -> u64;

    /// Accepts the feature set negotiated by the driver.
    fn write_features(&mut self, features: u64) -> bool;

    fn read_config(&self, addr: AddrRange, data: &mut [u8]) -> bool;
    fn write_config(&mut self, addr: AddrRange, data: &[u8]) -> bool;

    fn read_shm(&self, _shmid: u32, _addr: AddrRange, _data: &mut [u8]) -> bool {
        false
    }

    fn write_shm(&mut self, _shmid: u32, _addr: AddrRange, _data: &[u8]) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Stands in for a device on a transport that has nothing attached.
///
/// Identifies as `VIRTIO_DEVICE_NONE`, offers no features and rejects every access.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubDevice;

impl VirtioDevice for StubDevice {
    fn identify(&mut self, desc: &mut DeviceDesc) {
        desc.reset();
    }

    fn notify(&mut self, _vqid: u32, _ctrl: &mut dyn VirtioController) -> bool {
        false
    }

    fn reset(&mut self) {}

    fn read_features(&self) -> u64 {
        0
    }

    fn write_features(&mut self, _features: u64) -> bool {
        false
    }

    fn read_config(&self, _addr: AddrRange, _data: &mut [u8]) -> bool {
        false
    }

    fn write_config(&mut self, _addr: AddrRange, _data: &[u8]) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shm_requests_respect_capacity() {
        let mut desc = DeviceDesc {
            shm_capacity: 0x3000,
            ..DeviceDesc::default()
        };
        assert!(desc.request_shm(0, 0x2000));
        assert!(!desc.request_shm(1, 0x2000));
        assert!(!desc.request_shm(1, 0));
        assert!(!desc.request_shm(0, 0x800));
        assert!(desc.request_shm(1, 0x1000));
        assert_eq!(desc.remaining_shm_capacity(), 0);

        desc.reset();
        assert_eq!(desc.shm_capacity, 0);
        assert!(desc.shmems.is_empty());
        assert_eq!(desc.pci_class, PCI_CLASS_OTHERS);
    }

    #[test]
    fn requested_queues_start_unconfigured() {
        let mut desc = DeviceDesc::default();
        desc.request_virtqueue(2, 128);
        let q = &desc.virtqueues[&2];
        assert_eq!((q.id, q.limit, q.size), (2, 128, 128));
        assert_eq!(q.desc, 0);
        assert!(!q.has_event_idx);
    }

    #[test]
    fn status_predicates() {
        assert!(!device_ready(VIRTIO_STATUS_DRIVER | VIRTIO_STATUS_FEATURES_OK));
        assert!(feature_check(
            VIRTIO_STATUS_ACKNOWLEDGE | VIRTIO_STATUS_DRIVER | VIRTIO_STATUS_FEATURES_OK
        ));
        assert!(device_ready(VIRTIO_STATUS_DEVICE_READY));
    }

    #[test]
    fn stub_rejects_everything() {
        let mut stub = StubDevice;
        let mut desc = DeviceDesc::default();
        stub.identify(&mut desc);
        assert_eq!(desc.device_id, VIRTIO_DEVICE_NONE);
        assert_eq!(stub.read_features(), 0);
        assert!(!stub.write_features(VIRTIO_F_VERSION_1));
        let mut buf = [0u8; 4];
        assert!(!stub.read_config(AddrRange::new(0, 3), &mut buf));
        assert!(!stub.read_shm(0, AddrRange::new(0, 3), &mut buf));
    }
}
