//! Virtqueue engine.
//!
//! A [`Virtqueue`] is either a split ring (descriptor table + available ring + used ring) or a
//! packed ring (one descriptor array with in-band ownership bits). Both are driven the same way:
//!
//! - [`Virtqueue::get`] dequeues the next available descriptor chain as a [`VqMessage`], or
//!   returns `Ok(None)` when the driver has not queued anything new.
//! - [`Virtqueue::put`] completes a message and updates [`Virtqueue::notify`], which tells the
//!   caller whether the driver wants an interrupt for this completion.
//!
//! Ring regions are re-resolved through the [`GuestMemory`] port on every access. Validation only
//! records whether the regions were resolvable; [`Virtqueue::invalidate`] drops that record when
//! the guest remaps memory overlapping a ring.

mod packed;
mod split;

pub use packed::PackedVirtqueue;
pub use split::SplitVirtqueue;

use crate::error::VirtqueueError;
use crate::memory::{Access, AddrRange, GuestMemory};
use crate::message::VqMessage;
use bitflags::bitflags;

/// Size of one descriptor record, for both ring formats.
pub const VIRTQ_DESC_SIZE: u64 = 16;

pub const VIRTQ_DESC_F_NEXT: u16 = 1 << 0;
pub const VIRTQ_DESC_F_WRITE: u16 = 1 << 1;
pub const VIRTQ_DESC_F_INDIRECT: u16 = 1 << 2;
pub const VIRTQ_DESC_F_AVAIL: u16 = 1 << 7;
pub const VIRTQ_DESC_F_USED: u16 = 1 << 15;

pub const VRING_AVAIL_F_NO_INTERRUPT: u16 = 1 << 0;
pub const VRING_USED_F_NO_NOTIFY: u16 = 1 << 0;

pub const VRING_PACKED_EVENT_FLAG_ENABLE: u16 = 0;
pub const VRING_PACKED_EVENT_FLAG_DISABLE: u16 = 1;
pub const VRING_PACKED_EVENT_FLAG_DESC: u16 = 2;

/// Largest ring accepted by either format.
pub const VIRTQ_MAX_SIZE: u32 = 32768;

/// Sentinel for "no interrupt vector assigned".
pub const VIRTIO_NO_VECTOR: u16 = 0xffff;

bitflags! {
    /// Descriptor flags. `AVAIL`/`USED` only carry meaning in packed rings.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u16 {
        const NEXT = VIRTQ_DESC_F_NEXT;
        const WRITE = VIRTQ_DESC_F_WRITE;
        const INDIRECT = VIRTQ_DESC_F_INDIRECT;
        const AVAIL = VIRTQ_DESC_F_AVAIL;
        const USED = VIRTQ_DESC_F_USED;
    }
}

/// Queue geometry as negotiated with the driver. Immutable once the queue exists.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDesc {
    pub id: u32,
    /// Maximum ring size offered by the device; also caps the length of a direct chain.
    pub limit: u32,
    /// Negotiated ring size.
    pub size: u32,
    /// Descriptor table.
    pub desc: u64,
    /// Driver area: available ring (split) or driver event suppression structure (packed).
    pub driver: u64,
    /// Device area: used ring (split) or device event suppression structure (packed).
    pub device: u64,
    pub vector: u16,
    pub has_event_idx: bool,
}

impl QueueDesc {
    pub fn new(id: u32, max_size: u32) -> Self {
        Self {
            id,
            limit: max_size,
            size: max_size,
            desc: 0,
            driver: 0,
            device: 0,
            vector: VIRTIO_NO_VECTOR,
            has_event_idx: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingFormat {
    Split,
    Packed,
}

/// A virtqueue of either ring format.
#[derive(Debug)]
pub enum Virtqueue {
    Split(SplitVirtqueue),
    Packed(PackedVirtqueue),
}

impl Virtqueue {
    pub fn new(desc: QueueDesc, format: RingFormat) -> Self {
        match format {
            RingFormat::Split => Self::Split(SplitVirtqueue::new(desc)),
            RingFormat::Packed => Self::Packed(PackedVirtqueue::new(desc)),
        }
    }

    pub fn format(&self) -> RingFormat {
        match self {
            Self::Split(_) => RingFormat::Split,
            Self::Packed(_) => RingFormat::Packed,
        }
    }

    pub fn desc(&self) -> &QueueDesc {
        match self {
            Self::Split(q) => q.desc(),
            Self::Packed(q) => q.desc(),
        }
    }

    pub fn id(&self) -> u32 {
        self.desc().id
    }

    pub fn vector(&self) -> u16 {
        self.desc().vector
    }

    /// Whether the last successful `put` should be signalled to the driver.
    pub fn notify(&self) -> bool {
        match self {
            Self::Split(q) => q.notify(),
            Self::Packed(q) => q.notify(),
        }
    }

    pub fn is_validated(&self) -> bool {
        match self {
            Self::Split(q) => q.is_validated(),
            Self::Packed(q) => q.is_validated(),
        }
    }

    /// Resolves every ring region that is not currently known to be accessible.
    ///
    /// Idempotent; `get` and `put` call it before touching the rings.
    pub fn validate(&mut self, mem: &mut dyn GuestMemory) -> bool {
        match self {
            Self::Split(q) => q.validate(mem),
            Self::Packed(q) => q.validate(mem),
        }
    }

    /// Forgets the resolution of every ring region overlapping `range`.
    pub fn invalidate(&mut self, range: AddrRange) {
        match self {
            Self::Split(q) => q.invalidate(range),
            Self::Packed(q) => q.invalidate(range),
        }
    }

    /// Dequeues the next available descriptor chain.
    ///
    /// `Ok(None)` means the driver has not made anything new available. Any error means the chain
    /// was rejected and nothing must be done with it.
    pub fn get(&mut self, mem: &mut dyn GuestMemory) -> Result<Option<VqMessage>, VirtqueueError> {
        if !self.validate(mem) {
            return Err(VirtqueueError::Unbound { queue: self.id() });
        }

        let result = match self {
            Self::Split(q) => q.get(mem),
            Self::Packed(q) => q.get(mem),
        };

        match result {
            Ok(Some(mut msg)) => {
                msg.status = crate::VirtioStatus::Ok;
                tracing::trace!(queue = self.id(), "get {msg}");
                Ok(Some(msg))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                self.forget_on_unbound(&err);
                Err(err)
            }
        }
    }

    /// Hands a completed message back to the driver.
    ///
    /// On error the ring is left untouched and `notify` is cleared.
    pub fn put(
        &mut self,
        mem: &mut dyn GuestMemory,
        msg: &mut VqMessage,
    ) -> Result<(), VirtqueueError> {
        if !self.validate(mem) {
            return Err(VirtqueueError::Unbound { queue: self.id() });
        }

        tracing::trace!(queue = self.id(), "put {msg}");
        let result = match self {
            Self::Split(q) => q.put(mem, msg),
            Self::Packed(q) => q.put(mem, msg),
        };

        match result {
            Ok(()) => {
                msg.status = crate::VirtioStatus::Ok;
                Ok(())
            }
            Err(err) => {
                msg.status = err.status();
                self.forget_on_unbound(&err);
                Err(err)
            }
        }
    }

    /// Asks the driver to stop (or resume) notifying the device about new buffers.
    ///
    /// This is advisory; the driver may still ring the doorbell.
    pub fn suppress_notifications(
        &mut self,
        mem: &mut dyn GuestMemory,
        suppress: bool,
    ) -> Result<(), VirtqueueError> {
        if !self.validate(mem) {
            return Err(VirtqueueError::Unbound { queue: self.id() });
        }
        let result = match self {
            Self::Split(q) => q.suppress_notifications(mem, suppress),
            Self::Packed(q) => q.suppress_notifications(mem, suppress),
        };
        if let Err(err) = &result {
            self.forget_on_unbound(err);
        }
        result
    }

    fn forget_on_unbound(&mut self, err: &VirtqueueError) {
        if matches!(err, VirtqueueError::Unbound { .. }) {
            self.invalidate(AddrRange::new(0, u64::MAX));
        }
    }
}

/// Number of descriptors in an indirect table of `len` bytes.
pub(crate) fn indirect_table_len(len: u32) -> Result<u32, VirtqueueError> {
    if len == 0 || u64::from(len) % VIRTQ_DESC_SIZE != 0 {
        tracing::warn!(len, "broken indirect descriptor");
        return Err(VirtqueueError::Indirect("table length is not a multiple of 16"));
    }
    Ok(len / VIRTQ_DESC_SIZE as u32)
}

/// Resolves the memory behind a data descriptor with the access its WRITE flag asks for.
pub(crate) fn resolve_buffer(
    mem: &mut dyn GuestMemory,
    addr: u64,
    len: u32,
    is_write: bool,
) -> Result<(), VirtqueueError> {
    let access = if is_write { Access::Write } else { Access::Read };
    mem.resolve(addr, u64::from(len), access).map_err(|err| {
        tracing::warn!(addr, len, %err, "cannot access descriptor buffer");
        VirtqueueError::NoDmi {
            addr,
            len: u64::from(len),
        }
    })
}

/// Appends a resolved span, warning when a readable span follows a writable one.
///
/// The used ring reports chain lengths as `u32`, so a chain whose spans add up to more than that
/// is rejected.
pub(crate) fn append_buffer(
    msg: &mut VqMessage,
    queue: u32,
    addr: u64,
    len: u32,
    is_write: bool,
) -> Result<(), VirtqueueError> {
    if msg.total_len().checked_add(len).is_none() {
        tracing::warn!(queue, index = msg.index, "descriptor chain length overflows");
        return Err(VirtqueueError::Chain("chain length overflows"));
    }
    if !is_write && !msg.writable.is_empty() {
        tracing::warn!(queue, index = msg.index, "invalid descriptor order");
    }
    msg.append(addr, len, is_write);
    Ok(())
}

/// Checks whether a ring region can be resolved with `access`.
pub(crate) fn region_ok(mem: &mut dyn GuestMemory, addr: u64, len: u64, access: Access) -> bool {
    mem.resolve(addr, len, access).is_ok()
}

/// Inclusive range covered by a ring region, if it is non-empty.
pub(crate) fn region(addr: u64, len: u64) -> Option<AddrRange> {
    AddrRange::from_len(addr, len)
}

pub(crate) fn overlaps(region: Option<AddrRange>, range: &AddrRange) -> bool {
    region.is_some_and(|r| r.overlaps(range))
}
