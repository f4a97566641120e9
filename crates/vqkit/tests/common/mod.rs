//! Driver-side ring builders shared by the integration tests.
#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use vqkit::memory::{
    read_u16_le, read_u32_le, write_u16_le, write_u32_le, write_u64_le, GuestRam,
};
use vqkit::queue::{
    QueueDesc, VIRTQ_DESC_F_AVAIL, VIRTQ_DESC_F_INDIRECT, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_USED,
    VIRTQ_DESC_F_WRITE,
};
use vqkit::transport::{InterruptLog, InterruptSink, QueueLayout};

pub const RAM_SIZE: usize = 0x10_0000;
pub const DESC_BASE: u64 = 0x1_0000;
pub const DRIVER_BASE: u64 = 0x2_0000;
pub const DEVICE_BASE: u64 = 0x3_0000;
pub const BUF_BASE: u64 = 0x4_0000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn ram() -> GuestRam {
    GuestRam::new(RAM_SIZE)
}

/// One buffer of a chain as the driver posts it: `(addr, len, device_writable)`.
pub type Buf = (u64, u32, bool);

/// Driver half of a split ring.
pub struct SplitDriver {
    pub size: u16,
    pub event_idx: bool,
    avail_idx: u16,
}

impl SplitDriver {
    pub fn new(size: u16, event_idx: bool) -> Self {
        Self {
            size,
            event_idx,
            avail_idx: 0,
        }
    }

    pub fn queue_desc(&self, id: u32) -> QueueDesc {
        let mut desc = QueueDesc::new(id, u32::from(self.size));
        desc.desc = DESC_BASE;
        desc.driver = DRIVER_BASE;
        desc.device = DEVICE_BASE;
        desc.has_event_idx = self.event_idx;
        desc
    }

    pub fn layout(&self) -> QueueLayout {
        QueueLayout {
            size: u32::from(self.size),
            desc: DESC_BASE,
            driver: DRIVER_BASE,
            device: DEVICE_BASE,
            vector: vqkit::queue::VIRTIO_NO_VECTOR,
        }
    }

    pub fn write_desc(
        &self,
        mem: &mut GuestRam,
        index: u16,
        addr: u64,
        len: u32,
        flags: u16,
        next: u16,
    ) {
        let base = DESC_BASE + u64::from(index) * 16;
        write_u64_le(mem, base, addr).unwrap();
        write_u32_le(mem, base + 8, len).unwrap();
        write_u16_le(mem, base + 12, flags).unwrap();
        write_u16_le(mem, base + 14, next).unwrap();
    }

    /// Writes `bufs` as a chain at descriptors `first..` without publishing it.
    pub fn write_chain(&self, mem: &mut GuestRam, first: u16, bufs: &[Buf]) {
        for (i, &(addr, len, write)) in bufs.iter().enumerate() {
            let index = first + i as u16;
            let mut flags = if write { VIRTQ_DESC_F_WRITE } else { 0 };
            if i + 1 < bufs.len() {
                flags |= VIRTQ_DESC_F_NEXT;
            }
            self.write_desc(mem, index, addr, len, flags, index + 1);
        }
    }

    /// Writes an indirect table for `bufs` at `table` and points descriptor `index` at it.
    pub fn write_indirect(&self, mem: &mut GuestRam, index: u16, table: u64, bufs: &[Buf]) {
        for (i, &(addr, len, write)) in bufs.iter().enumerate() {
            let base = table + i as u64 * 16;
            let mut flags = if write { VIRTQ_DESC_F_WRITE } else { 0 };
            if i + 1 < bufs.len() {
                flags |= VIRTQ_DESC_F_NEXT;
            }
            write_u64_le(mem, base, addr).unwrap();
            write_u32_le(mem, base + 8, len).unwrap();
            write_u16_le(mem, base + 12, flags).unwrap();
            write_u16_le(mem, base + 14, i as u16 + 1).unwrap();
        }
        self.write_desc(
            mem,
            index,
            table,
            bufs.len() as u32 * 16,
            VIRTQ_DESC_F_INDIRECT,
            0,
        );
    }

    /// Makes the chain starting at `head` available.
    pub fn publish(&mut self, mem: &mut GuestRam, head: u16) {
        let slot = u64::from(self.avail_idx % self.size);
        write_u16_le(mem, DRIVER_BASE + 4 + 2 * slot, head).unwrap();
        self.avail_idx = self.avail_idx.wrapping_add(1);
        write_u16_le(mem, DRIVER_BASE + 2, self.avail_idx).unwrap();
    }

    pub fn set_avail_flags(&self, mem: &mut GuestRam, flags: u16) {
        write_u16_le(mem, DRIVER_BASE, flags).unwrap();
    }

    pub fn set_used_event(&self, mem: &mut GuestRam, value: u16) {
        let addr = DRIVER_BASE + 4 + 2 * u64::from(self.size);
        write_u16_le(mem, addr, value).unwrap();
    }

    pub fn avail_event(&self, mem: &GuestRam) -> u16 {
        let addr = DEVICE_BASE + 4 + 8 * u64::from(self.size);
        read_u16_le(mem, addr).unwrap()
    }

    pub fn used_flags(&self, mem: &GuestRam) -> u16 {
        read_u16_le(mem, DEVICE_BASE).unwrap()
    }

    pub fn used_idx(&self, mem: &GuestRam) -> u16 {
        read_u16_le(mem, DEVICE_BASE + 2).unwrap()
    }

    /// `(id, len)` of used ring element `n` (free running).
    pub fn used_elem(&self, mem: &GuestRam, n: u16) -> (u32, u32) {
        let base = DEVICE_BASE + 4 + 8 * u64::from(n % self.size);
        (
            read_u32_le(mem, base).unwrap(),
            read_u32_le(mem, base + 4).unwrap(),
        )
    }
}

/// Driver half of a packed ring.
pub struct PackedDriver {
    pub size: u16,
    pub event_idx: bool,
    next_avail: u16,
    avail_wrap: bool,
    next_used: u16,
    used_wrap: bool,
}

impl PackedDriver {
    pub fn new(size: u16, event_idx: bool) -> Self {
        Self {
            size,
            event_idx,
            next_avail: 0,
            avail_wrap: true,
            next_used: 0,
            used_wrap: true,
        }
    }

    pub fn queue_desc(&self, id: u32) -> QueueDesc {
        let mut desc = QueueDesc::new(id, u32::from(self.size));
        desc.desc = DESC_BASE;
        desc.driver = DRIVER_BASE;
        desc.device = DEVICE_BASE;
        desc.has_event_idx = self.event_idx;
        desc
    }

    pub fn layout(&self) -> QueueLayout {
        QueueLayout {
            size: u32::from(self.size),
            desc: DESC_BASE,
            driver: DRIVER_BASE,
            device: DEVICE_BASE,
            vector: vqkit::queue::VIRTIO_NO_VECTOR,
        }
    }

    fn avail_bits(wrap: bool) -> u16 {
        if wrap {
            VIRTQ_DESC_F_AVAIL
        } else {
            VIRTQ_DESC_F_USED
        }
    }

    fn write_desc(mem: &mut GuestRam, pos: u16, addr: u64, len: u32, id: u16, flags: u16) {
        let base = DESC_BASE + u64::from(pos) * 16;
        write_u64_le(mem, base, addr).unwrap();
        write_u32_le(mem, base + 8, len).unwrap();
        write_u16_le(mem, base + 12, id).unwrap();
        write_u16_le(mem, base + 14, flags).unwrap();
    }

    /// Posts `bufs` as one chain with buffer id `id`. Returns the head position.
    pub fn post(&mut self, mem: &mut GuestRam, bufs: &[Buf], id: u16) -> u16 {
        let head = self.next_avail;
        let head_wrap = self.avail_wrap;
        let mut head_flags = 0;

        for (i, &(addr, len, write)) in bufs.iter().enumerate() {
            let mut flags = Self::avail_bits(self.avail_wrap);
            if write {
                flags |= VIRTQ_DESC_F_WRITE;
            }
            if i + 1 < bufs.len() {
                flags |= VIRTQ_DESC_F_NEXT;
            }
            if i == 0 {
                // The head is flipped last so the device never sees a partial chain.
                head_flags = flags;
                let hidden = (flags & !(VIRTQ_DESC_F_AVAIL | VIRTQ_DESC_F_USED))
                    | Self::avail_bits(!head_wrap);
                Self::write_desc(mem, self.next_avail, addr, len, id, hidden);
            } else {
                Self::write_desc(mem, self.next_avail, addr, len, id, flags);
            }
            self.advance_avail();
        }
        write_u16_le(mem, DESC_BASE + u64::from(head) * 16 + 14, head_flags).unwrap();
        head
    }

    /// Posts an indirect chain: one ring slot pointing at a table at `table`.
    pub fn post_indirect(
        &mut self,
        mem: &mut GuestRam,
        table: u64,
        bufs: &[Buf],
        id: u16,
    ) -> u16 {
        for (i, &(addr, len, write)) in bufs.iter().enumerate() {
            let base = table + i as u64 * 16;
            write_u64_le(mem, base, addr).unwrap();
            write_u32_le(mem, base + 8, len).unwrap();
            write_u16_le(mem, base + 12, i as u16).unwrap();
            write_u16_le(mem, base + 14, if write { VIRTQ_DESC_F_WRITE } else { 0 }).unwrap();
        }
        let head = self.next_avail;
        let flags = Self::avail_bits(self.avail_wrap) | VIRTQ_DESC_F_INDIRECT;
        Self::write_desc(mem, head, table, bufs.len() as u32 * 16, id, flags);
        self.advance_avail();
        head
    }

    fn advance_avail(&mut self) {
        self.next_avail += 1;
        if self.next_avail == self.size {
            self.next_avail = 0;
            self.avail_wrap = !self.avail_wrap;
        }
    }

    /// Consumes the next used element, which covers `slots` ring slots. Returns `(id, len)`.
    pub fn poll_used(&mut self, mem: &GuestRam, slots: u16) -> Option<(u16, u32)> {
        let base = DESC_BASE + u64::from(self.next_used) * 16;
        let flags = read_u16_le(mem, base + 14).unwrap();
        let avail = flags & VIRTQ_DESC_F_AVAIL != 0;
        let used = flags & VIRTQ_DESC_F_USED != 0;
        if avail != self.used_wrap || used != self.used_wrap {
            return None;
        }

        let id = read_u16_le(mem, base + 12).unwrap();
        let len = read_u32_le(mem, base + 8).unwrap();
        for _ in 0..slots {
            self.next_used += 1;
            if self.next_used == self.size {
                self.next_used = 0;
                self.used_wrap = !self.used_wrap;
            }
        }
        Some((id, len))
    }

    /// Driver event suppression structure: `off_wrap | flags`.
    pub fn set_driver_event(&self, mem: &mut GuestRam, off_wrap: u16, flags: u16) {
        write_u16_le(mem, DRIVER_BASE, off_wrap).unwrap();
        write_u16_le(mem, DRIVER_BASE + 2, flags).unwrap();
    }

    pub fn device_event_flags(&self, mem: &GuestRam) -> u16 {
        read_u16_le(mem, DEVICE_BASE + 2).unwrap()
    }
}

/// Interrupt sink whose log stays readable after the transport takes ownership of it.
#[derive(Clone, Default)]
pub struct SharedIrq(pub Rc<RefCell<InterruptLog>>);

impl SharedIrq {
    pub fn log(&self) -> InterruptLog {
        self.0.borrow().clone()
    }
}

impl InterruptSink for SharedIrq {
    fn raise_legacy_irq(&mut self) {
        self.0.borrow_mut().raise_legacy_irq();
    }

    fn lower_legacy_irq(&mut self) {
        self.0.borrow_mut().lower_legacy_irq();
    }

    fn signal_msix(&mut self, vector: u16) {
        self.0.borrow_mut().signal_msix(vector);
    }
}
