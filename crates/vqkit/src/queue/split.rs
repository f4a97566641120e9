use super::{
    append_buffer, indirect_table_len, overlaps, region, region_ok, resolve_buffer, DescFlags,
    QueueDesc, VIRTQ_DESC_SIZE, VIRTQ_MAX_SIZE, VRING_AVAIL_F_NO_INTERRUPT,
    VRING_USED_F_NO_NOTIFY,
};
use crate::error::VirtqueueError;
use crate::memory::{Access, AddrRange, GuestMemory};
use crate::message::VqMessage;
use std::sync::atomic::{fence, Ordering};

const RING_HEADER_SIZE: u64 = 4;
const AVAIL_ELEM_SIZE: u64 = 2;
const USED_ELEM_SIZE: u64 = 8;
const EVENT_IDX_SIZE: u64 = 2;

/// Split-ring descriptor: `u64 addr | u32 len | u16 flags | u16 next`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SplitDesc {
    addr: u64,
    len: u32,
    flags: DescFlags,
    next: u16,
}

impl SplitDesc {
    fn from_bytes(raw: &[u8; 16]) -> Self {
        Self {
            addr: u64::from_le_bytes([
                raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
            ]),
            len: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            flags: DescFlags::from_bits_retain(u16::from_le_bytes([raw[12], raw[13]])),
            next: u16::from_le_bytes([raw[14], raw[15]]),
        }
    }

    fn is_write(&self) -> bool {
        self.flags.contains(DescFlags::WRITE)
    }
}

/// Classic three-area virtqueue.
#[derive(Debug)]
pub struct SplitVirtqueue {
    desc: QueueDesc,
    last_avail_idx: u16,
    notify: bool,

    desc_ok: bool,
    avail_ok: bool,
    used_ok: bool,
}

impl SplitVirtqueue {
    pub fn new(desc: QueueDesc) -> Self {
        if desc.desc == 0 || desc.driver == 0 || desc.device == 0 {
            tracing::warn!(queue = desc.id, "invalid virtqueue ring addresses");
        }
        Self {
            desc,
            last_avail_idx: 0,
            notify: false,
            desc_ok: false,
            avail_ok: false,
            used_ok: false,
        }
    }

    pub fn desc(&self) -> &QueueDesc {
        &self.desc
    }

    pub fn notify(&self) -> bool {
        self.notify
    }

    /// Free-running index of the next available ring entry to consume.
    pub fn last_avail_idx(&self) -> u16 {
        self.last_avail_idx
    }

    pub fn is_validated(&self) -> bool {
        self.desc_ok && self.avail_ok && self.used_ok
    }

    fn size(&self) -> u64 {
        u64::from(self.desc.size)
    }

    fn desc_table_len(&self) -> u64 {
        VIRTQ_DESC_SIZE * self.size()
    }

    fn avail_len(&self) -> u64 {
        let len = RING_HEADER_SIZE + AVAIL_ELEM_SIZE * self.size();
        if self.desc.has_event_idx {
            len + EVENT_IDX_SIZE
        } else {
            len
        }
    }

    fn used_len(&self) -> u64 {
        let len = RING_HEADER_SIZE + USED_ELEM_SIZE * self.size();
        if self.desc.has_event_idx {
            len + EVENT_IDX_SIZE
        } else {
            len
        }
    }

    // `used_event` trails the available ring, `avail_event` trails the used ring.
    fn used_event_addr(&self) -> u64 {
        self.desc.driver + RING_HEADER_SIZE + AVAIL_ELEM_SIZE * self.size()
    }

    fn avail_event_addr(&self) -> u64 {
        self.desc.device + RING_HEADER_SIZE + USED_ELEM_SIZE * self.size()
    }

    pub fn validate(&mut self, mem: &mut dyn GuestMemory) -> bool {
        if self.is_validated() {
            return true;
        }

        let size = self.desc.size;
        if size == 0 || size > VIRTQ_MAX_SIZE || !size.is_power_of_two() {
            tracing::warn!(queue = self.desc.id, size, "illegal split virtqueue size");
            return false;
        }

        if !self.desc_ok {
            self.desc_ok = region_ok(mem, self.desc.desc, self.desc_table_len(), Access::Read);
        }
        if !self.avail_ok {
            self.avail_ok = region_ok(mem, self.desc.driver, self.avail_len(), Access::Read);
        }
        if !self.used_ok {
            self.used_ok = region_ok(mem, self.desc.device, self.used_len(), Access::Write);
        }

        if !self.is_validated() {
            tracing::warn!(
                queue = self.desc.id,
                desc = format_args!("0x{:x}", self.desc.desc),
                desc_ok = self.desc_ok,
                driver = format_args!("0x{:x}", self.desc.driver),
                driver_ok = self.avail_ok,
                device = format_args!("0x{:x}", self.desc.device),
                device_ok = self.used_ok,
                "failed to resolve split virtqueue rings"
            );
            return false;
        }

        tracing::debug!(
            queue = self.desc.id,
            size,
            desc = format_args!("0x{:x}", self.desc.desc),
            driver = format_args!("0x{:x}", self.desc.driver),
            device = format_args!("0x{:x}", self.desc.device),
            "split virtqueue validated"
        );
        true
    }

    pub fn invalidate(&mut self, range: AddrRange) {
        if overlaps(region(self.desc.desc, self.desc_table_len()), &range) {
            self.desc_ok = false;
        }
        if overlaps(region(self.desc.driver, self.avail_len()), &range) {
            self.avail_ok = false;
        }
        if overlaps(region(self.desc.device, self.used_len()), &range) {
            self.used_ok = false;
        }
    }

    fn unbound(&self) -> VirtqueueError {
        VirtqueueError::Unbound {
            queue: self.desc.id,
        }
    }

    fn read_ring_u16(&self, mem: &dyn GuestMemory, addr: u64) -> Result<u16, VirtqueueError> {
        mem.read_u16_le(addr).map_err(|_| self.unbound())
    }

    fn write_ring_u16(
        &self,
        mem: &mut dyn GuestMemory,
        addr: u64,
        value: u16,
    ) -> Result<(), VirtqueueError> {
        mem.write_u16_le(addr, value).map_err(|_| self.unbound())
    }

    pub(crate) fn get(
        &mut self,
        mem: &mut dyn GuestMemory,
    ) -> Result<Option<VqMessage>, VirtqueueError> {
        let avail_idx = self.read_ring_u16(mem, self.desc.driver + 2)?;
        if avail_idx == self.last_avail_idx {
            return Ok(None);
        }
        fence(Ordering::Acquire);

        let slot = u64::from(self.last_avail_idx) % self.size();
        let head = self.read_ring_u16(
            mem,
            self.desc.driver + RING_HEADER_SIZE + AVAIL_ELEM_SIZE * slot,
        )?;

        // The entry is consumed even if the chain turns out to be broken, so a single bad request
        // cannot stall the queue.
        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);

        let index = u32::from(head);
        if index >= self.desc.size {
            tracing::warn!(queue = self.desc.id, index, "illegal descriptor index");
            return Err(VirtqueueError::Desc { index });
        }
        if self.desc.has_event_idx {
            self.write_ring_u16(mem, self.avail_event_addr(), self.last_avail_idx)?;
        }

        let mut msg = VqMessage::new(index);
        msg.buffer_id = head;
        msg.ring_slots = 1;
        self.walk_chain(mem, &mut msg, head)?;
        Ok(Some(msg))
    }

    fn read_desc(
        &self,
        mem: &dyn GuestMemory,
        table: u64,
        index: u16,
        indirect: bool,
    ) -> Result<SplitDesc, VirtqueueError> {
        let mut raw = [0u8; 16];
        match mem.read_into(table + VIRTQ_DESC_SIZE * u64::from(index), &mut raw) {
            Ok(()) => Ok(SplitDesc::from_bytes(&raw)),
            Err(_) if indirect => Err(VirtqueueError::Indirect("cannot access indirect table")),
            Err(_) => Err(self.unbound()),
        }
    }

    fn walk_chain(
        &self,
        mem: &mut dyn GuestMemory,
        msg: &mut VqMessage,
        head: u16,
    ) -> Result<(), VirtqueueError> {
        let queue = self.desc.id;
        let mut table = self.desc.desc;
        let mut table_len = self.desc.size;
        let mut max_chain = self.desc.size.min(self.desc.limit.max(1));
        let mut indirect = false;

        let mut desc = self.read_desc(mem, table, head, false)?;
        if desc.flags.contains(DescFlags::INDIRECT) {
            table_len = indirect_table_len(desc.len)?;
            if mem.resolve(desc.addr, u64::from(desc.len), Access::Read).is_err() {
                tracing::warn!(queue, addr = desc.addr, "cannot access indirect descriptor");
                return Err(VirtqueueError::Indirect("cannot access indirect table"));
            }
            table = desc.addr;
            max_chain = table_len;
            indirect = true;
            desc = self.read_desc(mem, table, 0, true)?;
        }

        let mut count = 0u32;
        loop {
            if desc.flags.contains(DescFlags::INDIRECT) {
                tracing::warn!(queue, index = msg.index, "nested indirect descriptor");
                return Err(VirtqueueError::Indirect("nested indirect descriptor"));
            }

            resolve_buffer(mem, desc.addr, desc.len, desc.is_write())?;
            append_buffer(msg, queue, desc.addr, desc.len, desc.is_write())?;
            count += 1;

            if !desc.flags.contains(DescFlags::NEXT) {
                return Ok(());
            }
            if u32::from(desc.next) >= table_len {
                tracing::warn!(queue, next = desc.next, "broken descriptor chain");
                return Err(VirtqueueError::Chain("next index out of bounds"));
            }
            if count >= max_chain {
                tracing::warn!(queue, count, "descriptor chain too long");
                return Err(VirtqueueError::Chain("chain longer than its table"));
            }

            desc = self.read_desc(mem, table, desc.next, indirect)?;
        }
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

        let used_idx = self.read_ring_u16(mem, self.desc.device + 2)?;
        let avail_flags = self.read_ring_u16(mem, self.desc.driver)?;
        let used_event = if self.desc.has_event_idx {
            Some(self.read_ring_u16(mem, self.used_event_addr())?)
        } else {
            None
        };

        let notify =
            used_event == Some(used_idx) || avail_flags & VRING_AVAIL_F_NO_INTERRUPT == 0;

        let slot = u64::from(used_idx) % self.size();
        let elem = self.desc.device + RING_HEADER_SIZE + USED_ELEM_SIZE * slot;
        mem.write_u32_le(elem, msg.index)
            .and_then(|()| mem.write_u32_le(elem + 4, msg.total_len()))
            .map_err(|_| self.unbound())?;

        // Publish the element before the index that makes it visible.
        fence(Ordering::Release);
        self.write_ring_u16(mem, self.desc.device + 2, used_idx.wrapping_add(1))?;

        self.notify = notify;
        Ok(())
    }

    pub(crate) fn suppress_notifications(
        &mut self,
        mem: &mut dyn GuestMemory,
        suppress: bool,
    ) -> Result<(), VirtqueueError> {
        let flags = self.read_ring_u16(mem, self.desc.device)?;
        let flags = if suppress {
            flags | VRING_USED_F_NO_NOTIFY
        } else {
            flags & !VRING_USED_F_NO_NOTIFY
        };
        self.write_ring_u16(mem, self.desc.device, flags)
    }
}
