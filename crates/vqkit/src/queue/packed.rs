use super::{
    append_buffer, indirect_table_len, overlaps, region, region_ok, resolve_buffer, DescFlags,
    QueueDesc, VIRTQ_DESC_SIZE, VIRTQ_MAX_SIZE, VRING_PACKED_EVENT_FLAG_DESC,
    VRING_PACKED_EVENT_FLAG_DISABLE, VRING_PACKED_EVENT_FLAG_ENABLE,
};
use crate::error::VirtqueueError;
use crate::memory::{Access, AddrRange, GuestMemory};
use crate::message::VqMessage;
use std::sync::atomic::{fence, Ordering};

const EVENT_SIZE: u64 = 4;

/// Packed-ring descriptor: `u64 addr | u32 len | u16 id | u16 flags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PackedDesc {
    addr: u64,
    len: u32,
    id: u16,
    flags: DescFlags,
}

impl PackedDesc {
    fn from_bytes(raw: &[u8; 16]) -> Self {
        Self {
            addr: u64::from_le_bytes([
                raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
            ]),
            len: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            id: u16::from_le_bytes([raw[12], raw[13]]),
            flags: DescFlags::from_bits_retain(u16::from_le_bytes([raw[14], raw[15]])),
        }
    }

    fn is_write(&self) -> bool {
        self.flags.contains(DescFlags::WRITE)
    }

    /// Whether the driver made this descriptor available for the given wrap counter.
    fn is_avail(&self, wrap: bool) -> bool {
        self.flags.contains(DescFlags::AVAIL) == wrap && self.flags.contains(DescFlags::USED) != wrap
    }
}

fn wrap_flags(flags: DescFlags, wrap: bool) -> DescFlags {
    let mut flags = flags - (DescFlags::AVAIL | DescFlags::USED);
    if wrap {
        flags |= DescFlags::AVAIL | DescFlags::USED;
    }
    flags
}

/// Single-array virtqueue with in-band ownership bits.
///
/// The dequeue side (`next_avail`/`wrap_get`) and the completion side (`next_used`/`wrap_put`)
/// advance independently, so a device may complete chains in any order.
#[derive(Debug)]
pub struct PackedVirtqueue {
    desc: QueueDesc,

    next_avail: u16,
    wrap_get: bool,
    next_used: u16,
    wrap_put: bool,
    notify: bool,

    desc_ok: bool,
    driver_ok: bool,
    device_ok: bool,
}

impl PackedVirtqueue {
    pub fn new(desc: QueueDesc) -> Self {
        if desc.desc == 0 {
            tracing::warn!(queue = desc.id, "invalid virtqueue descriptor address");
        }
        Self {
            desc,
            next_avail: 0,
            wrap_get: true,
            next_used: 0,
            wrap_put: true,
            notify: false,
            desc_ok: false,
            driver_ok: false,
            device_ok: false,
        }
    }

    pub fn desc(&self) -> &QueueDesc {
        &self.desc
    }

    pub fn notify(&self) -> bool {
        self.notify
    }

    /// Next ring position to dequeue and its wrap counter.
    pub fn avail_position(&self) -> (u16, bool) {
        (self.next_avail, self.wrap_get)
    }

    /// Next ring position to complete into and its wrap counter.
    pub fn used_position(&self) -> (u16, bool) {
        (self.next_used, self.wrap_put)
    }

    pub fn is_validated(&self) -> bool {
        self.desc_ok && self.driver_ok && self.device_ok
    }

    fn size(&self) -> u16 {
        // Bounded by VIRTQ_MAX_SIZE once validated.
        self.desc.size as u16
    }

    fn desc_table_len(&self) -> u64 {
        VIRTQ_DESC_SIZE * u64::from(self.desc.size)
    }

    fn desc_addr(&self, pos: u16) -> u64 {
        self.desc.desc + VIRTQ_DESC_SIZE * u64::from(pos)
    }

    pub fn validate(&mut self, mem: &mut dyn GuestMemory) -> bool {
        if self.is_validated() {
            return true;
        }

        let size = self.desc.size;
        if size == 0 || size > VIRTQ_MAX_SIZE {
            tracing::warn!(queue = self.desc.id, size, "illegal packed virtqueue size");
            return false;
        }

        if !self.desc_ok {
            self.desc_ok = region_ok(
                mem,
                self.desc.desc,
                self.desc_table_len(),
                Access::ReadWrite,
            );
        }
        if self.desc.has_event_idx {
            if !self.driver_ok {
                self.driver_ok = region_ok(mem, self.desc.driver, EVENT_SIZE, Access::Read);
            }
            if !self.device_ok {
                self.device_ok = region_ok(mem, self.desc.device, EVENT_SIZE, Access::Write);
            }
        } else {
            self.driver_ok = true;
            self.device_ok = true;
        }

        if !self.is_validated() {
            tracing::warn!(
                queue = self.desc.id,
                desc = format_args!("0x{:x}", self.desc.desc),
                desc_ok = self.desc_ok,
                driver_ok = self.driver_ok,
                device_ok = self.device_ok,
                "failed to resolve packed virtqueue"
            );
            return false;
        }

        tracing::debug!(
            queue = self.desc.id,
            size,
            desc = format_args!("0x{:x}", self.desc.desc),
            event_idx = self.desc.has_event_idx,
            "packed virtqueue validated"
        );
        true
    }

    pub fn invalidate(&mut self, range: AddrRange) {
        if overlaps(region(self.desc.desc, self.desc_table_len()), &range) {
            self.desc_ok = false;
        }
        if self.desc.has_event_idx {
            if overlaps(region(self.desc.driver, EVENT_SIZE), &range) {
                self.driver_ok = false;
            }
            if overlaps(region(self.desc.device, EVENT_SIZE), &range) {
                self.device_ok = false;
            }
        }
    }

    fn unbound(&self) -> VirtqueueError {
        VirtqueueError::Unbound {
            queue: self.desc.id,
        }
    }

    fn read_desc(&self, mem: &dyn GuestMemory, pos: u16) -> Result<PackedDesc, VirtqueueError> {
        let mut raw = [0u8; 16];
        mem.read_into(self.desc_addr(pos), &mut raw)
            .map_err(|_| self.unbound())?;
        Ok(PackedDesc::from_bytes(&raw))
    }

    pub(crate) fn get(
        &mut self,
        mem: &mut dyn GuestMemory,
    ) -> Result<Option<VqMessage>, VirtqueueError> {
        let head = self.read_desc(mem, self.next_avail)?;
        if !head.is_avail(self.wrap_get) {
            return Ok(None);
        }
        fence(Ordering::Acquire);

        let mut msg = VqMessage::new(u32::from(self.next_avail));
        let (next, wrap) = if head.flags.contains(DescFlags::INDIRECT) {
            self.read_indirect(mem, &mut msg, &head)?;
            msg.buffer_id = head.id;
            msg.ring_slots = 1;
            self.advance(self.next_avail, self.wrap_get, 1)
        } else {
            self.read_chain(mem, &mut msg, head)?
        };

        self.next_avail = next;
        self.wrap_get = wrap;
        Ok(Some(msg))
    }

    fn advance(&self, pos: u16, wrap: bool, count: u32) -> (u16, bool) {
        let size = u32::from(self.size());
        let next = u32::from(pos) + count;
        if next >= size {
            ((next - size) as u16, !wrap)
        } else {
            (next as u16, wrap)
        }
    }

    fn read_indirect(
        &self,
        mem: &mut dyn GuestMemory,
        msg: &mut VqMessage,
        head: &PackedDesc,
    ) -> Result<(), VirtqueueError> {
        let queue = self.desc.id;
        let table_len = indirect_table_len(head.len)?;
        if mem.resolve(head.addr, u64::from(head.len), Access::Read).is_err() {
            tracing::warn!(queue, addr = head.addr, "cannot access indirect descriptor");
            return Err(VirtqueueError::Indirect("cannot access indirect table"));
        }

        // Indirect tables are laid out contiguously and walked in full; their NEXT bits carry no
        // information.
        for i in 0..u64::from(table_len) {
            let mut raw = [0u8; 16];
            mem.read_into(head.addr + VIRTQ_DESC_SIZE * i, &mut raw)
                .map_err(|_| VirtqueueError::Indirect("cannot access indirect table"))?;
            let desc = PackedDesc::from_bytes(&raw);

            if desc.flags.contains(DescFlags::INDIRECT) {
                tracing::warn!(queue, index = msg.index, "nested indirect descriptor");
                return Err(VirtqueueError::Indirect("nested indirect descriptor"));
            }
            resolve_buffer(mem, desc.addr, desc.len, desc.is_write())?;
            append_buffer(msg, queue, desc.addr, desc.len, desc.is_write())?;
        }
        Ok(())
    }

    fn read_chain(
        &self,
        mem: &mut dyn GuestMemory,
        msg: &mut VqMessage,
        head: PackedDesc,
    ) -> Result<(u16, bool), VirtqueueError> {
        let queue = self.desc.id;
        let max_chain = self.desc.size.min(self.desc.limit.max(1));

        let mut pos = self.next_avail;
        let mut wrap = self.wrap_get;
        let mut desc = head;
        let mut count = 0u32;
        loop {
            if desc.flags.contains(DescFlags::INDIRECT) {
                tracing::warn!(queue, index = pos, "indirect descriptor inside a chain");
                return Err(VirtqueueError::Indirect("indirect descriptor inside a chain"));
            }

            resolve_buffer(mem, desc.addr, desc.len, desc.is_write())?;
            append_buffer(msg, queue, desc.addr, desc.len, desc.is_write())?;
            count += 1;
            (pos, wrap) = self.advance(pos, wrap, 1);

            if !desc.flags.contains(DescFlags::NEXT) {
                break;
            }
            if count >= max_chain {
                tracing::warn!(queue, count, "descriptor chain too long");
                return Err(VirtqueueError::Chain("chain longer than the ring"));
            }

            let id = desc.id;
            desc = self.read_desc(mem, pos)?;
            if !desc.is_avail(wrap) {
                tracing::warn!(queue, index = pos, id, "descriptor in chain not available");
                return Err(VirtqueueError::NotAvailable {
                    index: u32::from(pos),
                });
            }
        }

        // The buffer id of a chain is carried by its last descriptor.
        msg.buffer_id = desc.id;
        msg.ring_slots = count;
        Ok((pos, wrap))
    }

    /// Reads the driver event structure for a completion covering `slots` ring slots.
    ///
    /// In descriptor mode the driver is notified when the position it asked for is any of the
    /// slots being completed.
    fn driver_wants_notify(
        &self,
        mem: &dyn GuestMemory,
        slots: u32,
    ) -> Result<bool, VirtqueueError> {
        if !self.desc.has_event_idx {
            return Ok(true);
        }

        let off_wrap = mem
            .read_u16_le(self.desc.driver)
            .map_err(|_| self.unbound())?;
        let flags = mem
            .read_u16_le(self.desc.driver + 2)
            .map_err(|_| self.unbound())?;

        Ok(match flags {
            VRING_PACKED_EVENT_FLAG_ENABLE => true,
            VRING_PACKED_EVENT_FLAG_DISABLE => false,
            VRING_PACKED_EVENT_FLAG_DESC => {
                let event = (off_wrap & 0x7fff, off_wrap >> 15 != 0);
                (0..slots).any(|k| self.advance(self.next_used, self.wrap_put, k) == event)
            }
            _ => {
                tracing::warn!(queue = self.desc.id, flags, "illegal driver event flags");
                true
            }
        })
    }

    pub(crate) fn put(
        &mut self,
        mem: &mut dyn GuestMemory,
        msg: &VqMessage,
    ) -> Result<(), VirtqueueError> {
        self.notify = false;

        if msg.index >= self.desc.size {
            tracing::warn!(queue = self.desc.id, index = msg.index, "index out of bounds");
            return Err(VirtqueueError::Desc { index: msg.index });
        }
        let slots = msg.ring_slots.max(1);
        if slots > self.desc.size {
            tracing::warn!(queue = self.desc.id, slots, "completion larger than the ring");
            return Err(VirtqueueError::Chain("completion larger than the ring"));
        }

        let notify = self.driver_wants_notify(mem, slots)?;
        let head = self.read_desc(mem, self.next_used)?;
        let (next_used, next_wrap) = self.advance(self.next_used, self.wrap_put, slots);

        // Every slot must be writable before the first one is touched.
        for k in 0..slots {
            let (pos, _) = self.advance(self.next_used, self.wrap_put, k);
            if mem
                .resolve(self.desc_addr(pos), VIRTQ_DESC_SIZE, Access::Write)
                .is_err()
            {
                tracing::warn!(queue = self.desc.id, pos, "cannot write used descriptor");
                return Err(self.unbound());
            }
        }

        // Trailing slots first, so that the head flags are the last thing the driver sees change.
        let (mut pos, mut wrap) = self.advance(self.next_used, self.wrap_put, 1);
        for _ in 1..slots {
            let addr = self.desc_addr(pos) + 14;
            let flags = mem.read_u16_le(addr).map_err(|_| self.unbound())?;
            let flags = wrap_flags(DescFlags::from_bits_retain(flags), wrap);
            mem.write_u16_le(addr, flags.bits())
                .map_err(|_| self.unbound())?;
            (pos, wrap) = self.advance(pos, wrap, 1);
        }

        let addr = self.desc_addr(self.next_used);
        mem.write_u32_le(addr + 8, msg.total_len())
            .and_then(|()| mem.write_u16_le(addr + 12, msg.buffer_id))
            .map_err(|_| self.unbound())?;

        fence(Ordering::Release);
        let flags = wrap_flags(head.flags, self.wrap_put);
        mem.write_u16_le(addr + 14, flags.bits())
            .map_err(|_| self.unbound())?;

        self.next_used = next_used;
        self.wrap_put = next_wrap;
        self.notify = notify;
        Ok(())
    }

    pub(crate) fn suppress_notifications(
        &mut self,
        mem: &mut dyn GuestMemory,
        suppress: bool,
    ) -> Result<(), VirtqueueError> {
        if !self.desc.has_event_idx {
            tracing::trace!(queue = self.desc.id, "no device event structure");
            return Ok(());
        }
        let flags = if suppress {
            VRING_PACKED_EVENT_FLAG_DISABLE
        } else {
            VRING_PACKED_EVENT_FLAG_ENABLE
        };
        mem.write_u16_le(self.desc.device + 2, flags)
            .map_err(|_| self.unbound())
    }
}
