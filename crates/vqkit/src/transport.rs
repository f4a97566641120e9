//! Transport glue between a [`VirtioDevice`] and its virtqueues.
//!
//! [`VirtioTransport`] implements the register-independent part of a virtio transport: device
//! identification, feature negotiation, the device status state machine, queue lifecycle,
//! interrupt status and shared memory. A bus front end (mmio, pci) maps its registers onto these
//! entry points.

use crate::device::{
    device_ready, feature_check, DeviceDesc, VirtioController, VirtioDevice,
    VIRTIO_F_ORDER_PLATFORM, VIRTIO_F_RING_EVENT_IDX, VIRTIO_F_RING_INDIRECT_DESC,
    VIRTIO_F_RING_PACKED, VIRTIO_F_RING_RESET, VIRTIO_F_VERSION_1, VIRTIO_IRQSTATUS_CONFIG,
    VIRTIO_IRQSTATUS_MASK, VIRTIO_IRQSTATUS_VQUEUE, VIRTIO_STATUS_DEVICE_NEEDS_RESET,
    VIRTIO_STATUS_DRIVER_OK, VIRTIO_STATUS_FEATURES_OK, VIRTQUEUE_MAX,
};
use crate::error::{VirtioStatus, VirtqueueError};
use crate::memory::{AddrRange, GuestMemory};
use crate::message::VqMessage;
use crate::queue::{RingFormat, Virtqueue, VIRTIO_NO_VECTOR};
use crate::shm::SharedMemory;
use std::collections::BTreeMap;
use thiserror::Error;

/// Transport options.
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Offer `VIRTIO_F_RING_PACKED`.
    pub packed_queues: bool,
    /// Offer `VIRTIO_F_RING_EVENT_IDX`.
    pub event_idx: bool,
    /// Offer `VIRTIO_F_RING_INDIRECT_DESC`.
    pub indirect_desc: bool,
    /// Offer `VIRTIO_F_RING_RESET`.
    pub ring_reset: bool,
    /// Offer `VIRTIO_F_ORDER_PLATFORM`.
    pub strong_barriers: bool,
    /// Size of the shared memory window; zero disables shared memory.
    pub shm_capacity: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            packed_queues: false,
            event_idx: true,
            indirect_desc: true,
            ring_reset: true,
            strong_barriers: false,
            shm_capacity: 0,
        }
    }
}

impl TransportConfig {
    /// Transport feature bits added to whatever the device offers.
    pub fn features(&self) -> u64 {
        let mut features = VIRTIO_F_VERSION_1;
        if self.event_idx {
            features |= VIRTIO_F_RING_EVENT_IDX;
        }
        if self.indirect_desc {
            features |= VIRTIO_F_RING_INDIRECT_DESC;
        }
        if self.ring_reset {
            features |= VIRTIO_F_RING_RESET;
        }
        if self.packed_queues {
            features |= VIRTIO_F_RING_PACKED;
        }
        if self.strong_barriers {
            features |= VIRTIO_F_ORDER_PLATFORM;
        }
        features
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("device not ready")]
    NotReady,

    #[error("illegal virtqueue id {0}")]
    InvalidQueue(u32),

    #[error(transparent)]
    Queue(#[from] VirtqueueError),
}

impl TransportError {
    pub fn status(&self) -> VirtioStatus {
        match self {
            Self::NotReady | Self::InvalidQueue(_) => VirtioStatus::Incomplete,
            Self::Queue(err) => err.status(),
        }
    }
}

/// A sink for interrupts produced by the transport.
pub trait InterruptSink {
    fn raise_legacy_irq(&mut self);
    fn lower_legacy_irq(&mut self);
    fn signal_msix(&mut self, vector: u16);
}

#[derive(Debug, Default, Clone)]
pub struct InterruptLog {
    pub legacy_irq_count: u64,
    pub legacy_irq_asserted: bool,
    pub msix_vectors: Vec<u16>,
}

impl InterruptSink for InterruptLog {
    fn raise_legacy_irq(&mut self) {
        self.legacy_irq_count += 1;
        self.legacy_irq_asserted = true;
    }

    fn lower_legacy_irq(&mut self) {
        self.legacy_irq_asserted = false;
    }

    fn signal_msix(&mut self, vector: u16) {
        self.msix_vectors.push(vector);
    }
}

/// Ring placement programmed by the driver before a queue is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLayout {
    pub size: u32,
    pub desc: u64,
    pub driver: u64,
    pub device: u64,
    pub vector: u16,
}

#[derive(Debug)]
struct IrqState {
    status: u32,
    asserted: bool,
    config_vector: u16,
}

impl IrqState {
    fn new() -> Self {
        Self {
            status: 0,
            asserted: false,
            config_vector: VIRTIO_NO_VECTOR,
        }
    }

    fn signal(&mut self, bit: u32, vector: u16, sink: &mut dyn InterruptSink) {
        self.status |= bit;
        if vector != VIRTIO_NO_VECTOR {
            sink.signal_msix(vector);
        } else if !self.asserted {
            sink.raise_legacy_irq();
            self.asserted = true;
        }
    }

    fn ack(&mut self, bits: u32, sink: &mut dyn InterruptSink) {
        self.status &= !(bits & VIRTIO_IRQSTATUS_MASK);
        if self.status == 0 && self.asserted {
            sink.lower_legacy_irq();
            self.asserted = false;
        }
    }
}

/// Controller handed to the device while it handles a notification.
struct QueueContext<'a> {
    queues: &'a mut BTreeMap<u32, Virtqueue>,
    shm: &'a mut SharedMemory,
    irq: &'a mut IrqState,
    interrupts: &'a mut dyn InterruptSink,
    status: u8,
    mem: &'a mut dyn GuestMemory,
}

fn ready_queue<'q>(
    queues: &'q mut BTreeMap<u32, Virtqueue>,
    status: u8,
    op: &str,
    vqid: u32,
) -> Result<&'q mut Virtqueue, TransportError> {
    if !device_ready(status) {
        tracing::warn!("{op}: device not ready");
        return Err(TransportError::NotReady);
    }
    queues.get_mut(&vqid).ok_or_else(|| {
        tracing::warn!("{op}: illegal virtqueue {vqid}");
        TransportError::InvalidQueue(vqid)
    })
}

impl VirtioController for QueueContext<'_> {
    fn get(&mut self, vqid: u32) -> Result<Option<VqMessage>, TransportError> {
        let queue = ready_queue(&mut *self.queues, self.status, "get", vqid)?;
        Ok(queue.get(&mut *self.mem)?)
    }

    fn put(&mut self, vqid: u32, msg: &mut VqMessage) -> Result<(), TransportError> {
        let queue = ready_queue(&mut *self.queues, self.status, "put", vqid)?;
        queue.put(&mut *self.mem, msg)?;
        if queue.notify() {
            let vector = queue.vector();
            self.irq
                .signal(VIRTIO_IRQSTATUS_VQUEUE, vector, &mut *self.interrupts);
        }
        Ok(())
    }

    fn notify(&mut self) -> bool {
        if !device_ready(self.status) {
            tracing::warn!("configuration change notification while inactive");
            return false;
        }
        let vector = self.irq.config_vector;
        self.irq
            .signal(VIRTIO_IRQSTATUS_CONFIG, vector, &mut *self.interrupts);
        true
    }

    fn memory(&mut self) -> &mut dyn GuestMemory {
        &mut *self.mem
    }

    fn shm_map(&mut self, shmid: u32, id: u64, offset: u64, data: Vec<u8>) -> bool {
        self.shm.map(shmid, id, offset, data)
    }

    fn shm_unmap(&mut self, shmid: u32, id: u64) -> bool {
        self.shm.unmap(shmid, id)
    }
}

/// A virtio device behind a transport.
pub struct VirtioTransport {
    config: TransportConfig,
    device: Box<dyn VirtioDevice>,
    interrupts: Box<dyn InterruptSink>,

    device_desc: DeviceDesc,
    shm: SharedMemory,
    queues: BTreeMap<u32, Virtqueue>,

    dev_features: u64,
    drv_features: u64,
    status: u8,
    config_generation: u32,
    irq: IrqState,
}

impl VirtioTransport {
    pub fn new(
        device: Box<dyn VirtioDevice>,
        interrupts: Box<dyn InterruptSink>,
        config: TransportConfig,
    ) -> Self {
        let shm = SharedMemory::new(config.shm_capacity);
        let mut transport = Self {
            config,
            device,
            interrupts,
            device_desc: DeviceDesc::default(),
            shm,
            queues: BTreeMap::new(),
            dev_features: 0,
            drv_features: 0,
            status: 0,
            config_generation: 0,
            irq: IrqState::new(),
        };
        transport.identify();
        transport
    }

    fn identify(&mut self) {
        self.queues.clear();
        self.drv_features = 0;
        self.dev_features = 0;
        self.device_desc.reset();
        self.shm.reset();
        self.device_desc.shm_capacity = self.shm.capacity();

        self.device.identify(&mut self.device_desc);

        for (shmid, desc) in &self.device_desc.shmems {
            if !self.shm.request(*shmid, desc.capacity) {
                tracing::warn!(shmid, "failed to request shared memory");
            }
        }

        self.dev_features = self.device.read_features() | self.config.features();
        tracing::debug!(
            device_id = self.device_desc.device_id,
            queues = self.device_desc.virtqueues.len(),
            features = format_args!("0x{:x}", self.dev_features),
            "identified virtio device"
        );
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn device_desc(&self) -> &DeviceDesc {
        &self.device_desc
    }

    pub fn device_id(&self) -> u32 {
        self.device_desc.device_id
    }

    pub fn vendor_id(&self) -> u32 {
        self.device_desc.vendor_id
    }

    pub fn device_features(&self) -> u64 {
        self.dev_features
    }

    pub fn driver_features(&self) -> u64 {
        self.drv_features
    }

    /// Whether the driver accepted `feature`.
    pub fn has_feature(&self, feature: u64) -> bool {
        self.drv_features & feature == feature
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn is_ready(&self) -> bool {
        device_ready(self.status)
    }

    pub fn interrupt_status(&self) -> u32 {
        self.irq.status
    }

    /// Level of the interrupt line.
    pub fn irq(&self) -> bool {
        self.irq.status != 0
    }

    pub fn config_generation(&self) -> u32 {
        self.config_generation
    }

    pub fn shm(&self) -> &SharedMemory {
        &self.shm
    }

    pub fn queue(&self, vqid: u32) -> Option<&Virtqueue> {
        self.queues.get(&vqid)
    }

    pub fn device_mut<T: VirtioDevice + 'static>(&mut self) -> Option<&mut T> {
        self.device.as_any_mut().downcast_mut::<T>()
    }

    pub fn write_driver_features(&mut self, features: u64) {
        if self.status & VIRTIO_STATUS_FEATURES_OK != 0 {
            tracing::warn!("attempt to change features after negotiation");
            self.status = VIRTIO_STATUS_DEVICE_NEEDS_RESET;
            return;
        }
        self.drv_features = features;
    }

    pub fn write_status(&mut self, val: u8) {
        if val == 0 {
            tracing::debug!("software triggered device reset");
            self.reset();
            return;
        }

        if (val ^ self.status).count_ones() > 1 {
            tracing::warn!("multiple status bits changed at once");
        }
        if self.status.count_ones() > val.count_ones() {
            tracing::warn!("attempt to clear individual status bits");
        }

        self.status = val;
        if feature_check(val) {
            if self.drv_features & !self.dev_features != 0 {
                tracing::warn!(
                    features = format_args!("0x{:x}", self.drv_features & !self.dev_features),
                    "driver accepted features that were not offered"
                );
                self.status &= !VIRTIO_STATUS_FEATURES_OK;
            } else if !self.device.write_features(self.drv_features) {
                tracing::warn!("device refused negotiated features");
                self.status &= !VIRTIO_STATUS_FEATURES_OK;
            } else {
                tracing::debug!(
                    features = format_args!("0x{:x}", self.drv_features),
                    "features negotiated"
                );
            }
        }
    }

    fn known_queue(&self, vqid: u32) -> Result<(), TransportError> {
        if vqid >= VIRTQUEUE_MAX || !self.device_desc.virtqueues.contains_key(&vqid) {
            tracing::warn!("invalid virtqueue: {vqid}");
            return Err(TransportError::InvalidQueue(vqid));
        }
        Ok(())
    }

    /// Programs the ring placement of a disabled queue.
    pub fn configure_queue(&mut self, vqid: u32, layout: QueueLayout) -> Result<(), TransportError> {
        self.known_queue(vqid)?;
        if self.queues.contains_key(&vqid) {
            tracing::warn!("virtqueue {vqid} reconfigured while enabled");
        }
        if let Some(qd) = self.device_desc.virtqueues.get_mut(&vqid) {
            qd.size = layout.size;
            qd.desc = layout.desc;
            qd.driver = layout.driver;
            qd.device = layout.device;
            qd.vector = layout.vector;
        }
        Ok(())
    }

    pub fn set_config_vector(&mut self, vector: u16) {
        self.irq.config_vector = vector;
    }

    pub fn enable_queue(
        &mut self,
        vqid: u32,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), TransportError> {
        tracing::debug!("enabling virtqueue {vqid}");
        self.known_queue(vqid)?;
        if self.queues.contains_key(&vqid) {
            tracing::warn!("virtqueue {vqid} already enabled");
            return Ok(());
        }

        let has_event_idx = self.has_feature(VIRTIO_F_RING_EVENT_IDX);
        let format = if self.has_feature(VIRTIO_F_RING_PACKED) {
            RingFormat::Packed
        } else {
            RingFormat::Split
        };
        let Some(qd) = self.device_desc.virtqueues.get_mut(&vqid) else {
            return Err(TransportError::InvalidQueue(vqid));
        };
        qd.has_event_idx = has_event_idx;
        if qd.size > qd.limit {
            tracing::warn!(
                "virtqueue {vqid} size {} exceeds limit {}, truncated",
                qd.size,
                qd.limit
            );
            qd.size = qd.limit;
        }

        let mut queue = Virtqueue::new(qd.clone(), format);
        if !queue.validate(mem) {
            tracing::warn!("failed to enable virtqueue {vqid}");
            self.status = VIRTIO_STATUS_DEVICE_NEEDS_RESET;
        }
        self.queues.insert(vqid, queue);
        Ok(())
    }

    pub fn disable_queue(&mut self, vqid: u32) -> Result<(), TransportError> {
        tracing::debug!("disabling virtqueue {vqid}");
        self.known_queue(vqid)?;
        if self.queues.remove(&vqid).is_none() {
            tracing::warn!("virtqueue {vqid} already disabled");
        }
        Ok(())
    }

    /// Disables a queue and forgets its configuration.
    pub fn reset_queue(&mut self, vqid: u32) -> Result<(), TransportError> {
        tracing::debug!("resetting virtqueue {vqid}");
        if !self.has_feature(VIRTIO_F_RING_RESET) {
            tracing::warn!("attempt to reset virtqueue without VIRTIO_F_RING_RESET");
        }
        self.known_queue(vqid)?;
        if self.queues.remove(&vqid).is_none() {
            tracing::warn!("virtqueue {vqid} already disabled");
            return Ok(());
        }
        if let Some(qd) = self.device_desc.virtqueues.get_mut(&vqid) {
            qd.size = 0;
            qd.desc = 0;
            qd.driver = 0;
            qd.device = 0;
            qd.vector = VIRTIO_NO_VECTOR;
            qd.has_event_idx = false;
        }
        Ok(())
    }

    /// The driver rang the doorbell of queue `vqid`.
    pub fn queue_notify(
        &mut self,
        vqid: u32,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), TransportError> {
        if !self.is_ready() {
            tracing::warn!("notify: device not ready");
            return Err(TransportError::NotReady);
        }
        if vqid >= VIRTQUEUE_MAX || !self.queues.contains_key(&vqid) {
            tracing::warn!("notify: illegal queue id: {vqid}");
            return Err(TransportError::InvalidQueue(vqid));
        }

        tracing::debug!("notifying virtqueue {vqid}");
        let mut ctx = QueueContext {
            queues: &mut self.queues,
            shm: &mut self.shm,
            irq: &mut self.irq,
            interrupts: &mut *self.interrupts,
            status: self.status,
            mem,
        };
        if !self.device.notify(vqid, &mut ctx) {
            tracing::warn!("notify: device reported failure");
            self.status = VIRTIO_STATUS_DEVICE_NEEDS_RESET;
        }
        Ok(())
    }

    /// Runs `f` with the controller a device would see, without a notification.
    pub fn with_controller<R>(
        &mut self,
        mem: &mut dyn GuestMemory,
        f: impl FnOnce(&mut dyn VirtioController) -> R,
    ) -> R {
        let mut ctx = QueueContext {
            queues: &mut self.queues,
            shm: &mut self.shm,
            irq: &mut self.irq,
            interrupts: &mut *self.interrupts,
            status: self.status,
            mem,
        };
        f(&mut ctx)
    }

    pub fn interrupt_ack(&mut self, bits: u32) {
        self.irq.ack(bits, &mut *self.interrupts);
    }

    /// Raises a configuration change interrupt.
    pub fn config_changed(&mut self) -> bool {
        if !self.is_ready() {
            tracing::warn!("configuration change notification while inactive");
            return false;
        }
        let vector = self.irq.config_vector;
        self.irq
            .signal(VIRTIO_IRQSTATUS_CONFIG, vector, &mut *self.interrupts);
        true
    }

    pub fn read_config(&self, offset: u64, data: &mut [u8]) -> bool {
        match AddrRange::from_len(offset, data.len() as u64) {
            Some(addr) => self.device.read_config(addr, data),
            None => data.is_empty(),
        }
    }

    pub fn write_config(&mut self, offset: u64, data: &[u8]) -> bool {
        if self.status & VIRTIO_STATUS_DRIVER_OK != 0 {
            tracing::warn!("attempt to change configuration after initialization");
            return false;
        }
        let Some(addr) = AddrRange::from_len(offset, data.len() as u64) else {
            return data.is_empty();
        };
        if !self.device.write_config(addr, data) {
            return false;
        }
        self.config_generation = self.config_generation.wrapping_add(1);
        true
    }

    /// Driver read from the shared memory window.
    pub fn read_shm(&self, addr: u64, data: &mut [u8]) -> bool {
        self.shm.read(addr, data)
    }

    /// Driver write to the shared memory window.
    pub fn write_shm(&mut self, addr: u64, data: &[u8]) -> bool {
        self.shm.write(addr, data)
    }

    /// The guest remapped `range`; every enabled queue must re-resolve overlapping rings.
    pub fn invalidate(&mut self, range: AddrRange) {
        for queue in self.queues.values_mut() {
            queue.invalidate(range);
        }
    }

    /// Device reset: drops every queue and negotiated state and identifies the device again.
    pub fn reset(&mut self) {
        self.device.reset();
        self.identify();
        self.status = 0;
        self.irq.ack(VIRTIO_IRQSTATUS_MASK, &mut *self.interrupts);
    }
}

impl core::fmt::Debug for VirtioTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VirtioTransport")
            .field("device_id", &self.device_desc.device_id)
            .field("status", &self.status)
            .field("dev_features", &self.dev_features)
            .field("drv_features", &self.drv_features)
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{
        StubDevice, VIRTIO_STATUS_ACKNOWLEDGE, VIRTIO_STATUS_DEVICE_READY, VIRTIO_STATUS_DRIVER,
    };

    fn stub_transport() -> VirtioTransport {
        VirtioTransport::new(
            Box::new(StubDevice),
            Box::new(InterruptLog::default()),
            TransportConfig::default(),
        )
    }

    #[test]
    fn transport_features_follow_config() {
        let transport = stub_transport();
        let features = transport.device_features();
        assert_ne!(features & VIRTIO_F_VERSION_1, 0);
        assert_ne!(features & VIRTIO_F_RING_EVENT_IDX, 0);
        assert_eq!(features & VIRTIO_F_RING_PACKED, 0);

        let config = TransportConfig {
            packed_queues: true,
            event_idx: false,
            ..TransportConfig::default()
        };
        assert_ne!(config.features() & VIRTIO_F_RING_PACKED, 0);
        assert_eq!(config.features() & VIRTIO_F_RING_EVENT_IDX, 0);
    }

    #[test]
    fn refused_features_clear_features_ok() {
        let mut transport = stub_transport();
        transport.write_status(VIRTIO_STATUS_ACKNOWLEDGE);
        transport.write_status(VIRTIO_STATUS_ACKNOWLEDGE | VIRTIO_STATUS_DRIVER);
        transport.write_driver_features(VIRTIO_F_VERSION_1);
        transport.write_status(
            VIRTIO_STATUS_ACKNOWLEDGE | VIRTIO_STATUS_DRIVER | VIRTIO_STATUS_FEATURES_OK,
        );
        // The stub refuses every feature set.
        assert_eq!(transport.status() & VIRTIO_STATUS_FEATURES_OK, 0);
    }

    #[test]
    fn notify_requires_ready_device() {
        let mut transport = stub_transport();
        let mut mem = crate::memory::GuestRam::new(0x1000);
        assert_eq!(
            transport.queue_notify(0, &mut mem),
            Err(TransportError::NotReady)
        );
        assert_eq!(
            transport.enable_queue(0, &mut mem),
            Err(TransportError::InvalidQueue(0))
        );
        assert!(!transport.config_changed());
        assert_ne!(transport.status(), VIRTIO_STATUS_DEVICE_READY);
    }

    #[test]
    fn error_statuses() {
        assert_eq!(TransportError::NotReady.status(), VirtioStatus::Incomplete);
        assert_eq!(
            TransportError::from(VirtqueueError::Chain("loop")).status(),
            VirtioStatus::ErrChain
        );
    }
}
