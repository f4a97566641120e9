//! Virtio shared memory regions.
//!
//! Regions are laid out back to back in a window of `capacity` bytes, in the order they were
//! requested. Devices place objects (host-owned byte buffers) inside a region at a fixed offset;
//! driver accesses to the window are served from those objects.

use crate::memory::AddrRange;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedObject {
    pub id: u64,
    /// Window-relative address range of the object.
    pub addr: AddrRange,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SharedRegion {
    shmid: u32,
    addr: AddrRange,
    objects: BTreeMap<u64, SharedObject>,
}

impl SharedRegion {
    fn new(shmid: u32, addr: AddrRange) -> Self {
        Self {
            shmid,
            addr,
            objects: BTreeMap::new(),
        }
    }

    pub fn shmid(&self) -> u32 {
        self.shmid
    }

    pub fn addr(&self) -> AddrRange {
        self.addr
    }

    pub fn base(&self) -> u64 {
        self.addr.start
    }

    pub fn size(&self) -> u64 {
        self.addr.length()
    }

    pub fn map(&mut self, id: u64, offset: u64, data: Vec<u8>) -> bool {
        if self.objects.contains_key(&id) {
            tracing::warn!(shmid = self.shmid, id, "shared object already mapped");
            return false;
        }

        let Some(addr) = offset
            .checked_add(self.base())
            .and_then(|start| AddrRange::from_len(start, data.len() as u64))
        else {
            tracing::warn!(shmid = self.shmid, id, offset, "empty or oversized shared object");
            return false;
        };

        if !self.addr.includes(&addr) {
            tracing::warn!(shmid = self.shmid, id, %addr, "shared object exceeds region");
            return false;
        }

        if let Some(other) = self.objects.values().find(|obj| obj.addr.overlaps(&addr)) {
            tracing::warn!(
                shmid = self.shmid,
                id,
                other = other.id,
                "shared object overlaps another object"
            );
            return false;
        }

        self.objects.insert(id, SharedObject { id, addr, data });
        true
    }

    pub fn unmap(&mut self, id: u64) -> bool {
        self.objects.remove(&id).is_some()
    }

    pub fn find(&self, id: u64) -> Option<&SharedObject> {
        self.objects.get(&id)
    }

    fn object_at_mut(&mut self, addr: &AddrRange) -> Option<&mut SharedObject> {
        self.objects
            .values_mut()
            .find(|obj| obj.addr.includes(addr))
    }

    fn object_at(&self, addr: &AddrRange) -> Option<&SharedObject> {
        self.objects.values().find(|obj| obj.addr.includes(addr))
    }
}

/// All shared memory regions of one device.
#[derive(Debug, Clone)]
pub struct SharedMemory {
    capacity: u64,
    regions: BTreeMap<u32, SharedRegion>,
}

impl SharedMemory {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            regions: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// First address after the last allocated region.
    pub fn next_base(&self) -> u64 {
        self.regions
            .values()
            .map(|region| region.addr.end + 1)
            .max()
            .unwrap_or(0)
    }

    /// Base of region `shmid`, or `u64::MAX` if it does not exist.
    pub fn region_base(&self, shmid: u32) -> u64 {
        self.regions
            .get(&shmid)
            .map_or(u64::MAX, SharedRegion::base)
    }

    /// Size of region `shmid`, or `u64::MAX` if it does not exist.
    pub fn region_size(&self, shmid: u32) -> u64 {
        self.regions
            .get(&shmid)
            .map_or(u64::MAX, SharedRegion::size)
    }

    pub fn region(&self, shmid: u32) -> Option<&SharedRegion> {
        self.regions.get(&shmid)
    }

    pub fn request(&mut self, shmid: u32, capacity: u64) -> bool {
        if self.regions.contains_key(&shmid) {
            tracing::warn!(shmid, "shared memory region already exists");
            return false;
        }

        let base = self.next_base();
        let fits = base
            .checked_add(capacity)
            .is_some_and(|end| end <= self.capacity);
        let Some(addr) = AddrRange::from_len(base, capacity).filter(|_| fits) else {
            tracing::warn!(shmid, capacity, "not enough shared memory");
            return false;
        };

        tracing::debug!(shmid, %addr, "allocated shared memory region");
        self.regions.insert(shmid, SharedRegion::new(shmid, addr));
        true
    }

    pub fn map(&mut self, shmid: u32, id: u64, offset: u64, data: Vec<u8>) -> bool {
        match self.regions.get_mut(&shmid) {
            Some(region) => region.map(id, offset, data),
            None => {
                tracing::warn!(shmid, "invalid shared memory region");
                false
            }
        }
    }

    pub fn unmap(&mut self, shmid: u32, id: u64) -> bool {
        self.regions
            .get_mut(&shmid)
            .is_some_and(|region| region.unmap(id))
    }

    pub fn find(&self, shmid: u32, id: u64) -> Option<&SharedObject> {
        self.regions.get(&shmid)?.find(id)
    }

    /// Reads `data.len()` bytes at window address `addr`. The range must lie inside one object.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> bool {
        let Some(range) = AddrRange::from_len(addr, data.len() as u64) else {
            return data.is_empty();
        };
        let Some(obj) = self
            .regions
            .values()
            .filter(|region| region.addr.includes(&range))
            .find_map(|region| region.object_at(&range))
        else {
            return false;
        };

        let start = (range.start - obj.addr.start) as usize;
        data.copy_from_slice(&obj.data[start..start + data.len()]);
        true
    }

    /// Writes `data` at window address `addr`. The range must lie inside one object.
    pub fn write(&mut self, addr: u64, data: &[u8]) -> bool {
        let Some(range) = AddrRange::from_len(addr, data.len() as u64) else {
            return data.is_empty();
        };
        let Some(obj) = self
            .regions
            .values_mut()
            .filter(|region| region.addr.includes(&range))
            .find_map(|region| region.object_at_mut(&range))
        else {
            return false;
        };

        let start = (range.start - obj.addr.start) as usize;
        obj.data[start..start + data.len()].copy_from_slice(data);
        true
    }

    pub fn reset(&mut self) {
        self.regions.clear();
    }
}
