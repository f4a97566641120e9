use crate::error::{VirtioStatus, VirtqueueError};
use crate::memory::GuestMemory;
use core::fmt;

/// One guest memory span referenced by a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VqBuffer {
    pub addr: u64,
    pub len: u32,
}

/// A dequeued descriptor chain, split into device-readable ("out") and device-writable ("in")
/// spans in chain order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VqMessage {
    pub status: VirtioStatus,
    /// Chain identifier. Must be handed back unchanged to `put`.
    pub index: u32,
    pub readable: Vec<VqBuffer>,
    pub writable: Vec<VqBuffer>,

    // Packed rings: buffer id of the chain and number of ring slots it occupies.
    pub(crate) buffer_id: u16,
    pub(crate) ring_slots: u32,
}

impl VqMessage {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }

    /// Appends a span to the device-writable list if `is_write` is set, else to the readable list.
    pub fn append(&mut self, addr: u64, len: u32, is_write: bool) {
        let buf = VqBuffer { addr, len };
        if is_write {
            self.writable.push(buf);
        } else {
            self.readable.push(buf);
        }
    }

    /// Clamps the writable spans so that they cover at most `max_len` bytes in total.
    pub fn trim(&mut self, mut max_len: u32) {
        for buf in &mut self.writable {
            if buf.len > max_len {
                buf.len = max_len;
                max_len = 0;
            } else {
                max_len -= buf.len;
            }
        }
    }

    /// Total length of the device-readable ("out") spans.
    pub fn readable_len(&self) -> u32 {
        self.readable
            .iter()
            .fold(0u32, |acc, buf| acc.saturating_add(buf.len))
    }

    /// Total length of the device-writable ("in") spans.
    pub fn writable_len(&self) -> u32 {
        self.writable
            .iter()
            .fold(0u32, |acc, buf| acc.saturating_add(buf.len))
    }

    pub fn total_len(&self) -> u32 {
        self.readable_len().saturating_add(self.writable_len())
    }

    pub fn ndescs(&self) -> u32 {
        (self.readable.len() + self.writable.len()) as u32
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Copies `data` into the writable spans, starting `offset` bytes into them.
    ///
    /// Returns the number of bytes copied, which is short when the spans run out. A span that
    /// cannot be resolved aborts the copy with [`VirtqueueError::NoDmi`].
    pub fn copy_out(
        &self,
        mem: &mut dyn GuestMemory,
        data: &[u8],
        mut offset: usize,
    ) -> Result<usize, VirtqueueError> {
        let mut copied = 0usize;
        for buf in &self.writable {
            if copied == data.len() {
                break;
            }
            let len = buf.len as usize;
            if offset >= len {
                offset -= len;
                continue;
            }

            let n = (data.len() - copied).min(len - offset);
            let addr = buf.addr + offset as u64;
            let Some(dst) = mem.get_slice_mut(addr, n) else {
                tracing::error!(addr, len = n, "no memory access for writable span");
                return Err(VirtqueueError::NoDmi {
                    addr,
                    len: n as u64,
                });
            };
            dst.copy_from_slice(&data[copied..copied + n]);
            copied += n;
            offset = 0;
        }
        Ok(copied)
    }

    /// Copies bytes out of the readable spans into `data`, starting `offset` bytes into them.
    ///
    /// Returns the number of bytes copied; see [`VqMessage::copy_out`] for the failure mode.
    pub fn copy_in(
        &self,
        mem: &dyn GuestMemory,
        data: &mut [u8],
        mut offset: usize,
    ) -> Result<usize, VirtqueueError> {
        let mut copied = 0usize;
        for buf in &self.readable {
            if copied == data.len() {
                break;
            }
            let len = buf.len as usize;
            if offset >= len {
                offset -= len;
                continue;
            }

            let n = (data.len() - copied).min(len - offset);
            let addr = buf.addr + offset as u64;
            let Some(src) = mem.get_slice(addr, n) else {
                tracing::error!(addr, len = n, "no memory access for readable span");
                return Err(VirtqueueError::NoDmi {
                    addr,
                    len: n as u64,
                });
            };
            data[copied..copied + n].copy_from_slice(src);
            copied += n;
            offset = 0;
        }
        Ok(copied)
    }
}

fn fmt_span(f: &mut fmt::Formatter<'_>, tag: &str, buf: &VqBuffer) -> fmt::Result {
    let last = buf.addr.wrapping_add(u64::from(buf.len)).wrapping_sub(1);
    write!(
        f,
        "\n  {tag} [0x{:016x}..0x{:016x}] ({} bytes)",
        buf.addr, last, buf.len
    )
}

impl fmt::Display for VqMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VIRTMSG@{} [", self.index)?;
        if !self.writable.is_empty() {
            write!(
                f,
                "in: {} descriptors | {} bytes total",
                self.writable.len(),
                self.writable_len()
            )?;
        }
        if !self.writable.is_empty() && !self.readable.is_empty() {
            f.write_str(" ")?;
        }
        if !self.readable.is_empty() {
            write!(
                f,
                "out: {} descriptors | {} bytes total",
                self.readable.len(),
                self.readable_len()
            )?;
        }
        write!(f, "] ({})", self.status)?;

        for buf in &self.writable {
            fmt_span(f, "IN", buf)?;
        }
        for buf in &self.readable {
            fmt_span(f, "OUT", buf)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AddrRange, GuestRam};

    fn ram_with(bytes: &[(u64, &[u8])]) -> GuestRam {
        let mut ram = GuestRam::new(0x1000);
        for (addr, data) in bytes {
            ram.write_from(*addr, data).unwrap();
        }
        ram
    }

    #[test]
    fn copies_span_discontiguous_segments() {
        let mut ram = ram_with(&[(0x100, b"abc"), (0x200, b"def"), (0x300, b"abcdefg")]);

        let mut msg = VqMessage::new(0);
        msg.append(0x100, 3, false);
        msg.append(0x200, 3, false);
        msg.append(0x300, 7, true);

        let mut buf = [0u8; 5];
        assert_eq!(msg.copy_in(&ram, &mut buf, 1), Ok(5));
        assert_eq!(&buf, b"bcdef");

        assert_eq!(msg.copy_out(&mut ram, b"EFG", 4), Ok(3));
        assert_eq!(ram.get_slice(0x300, 7).unwrap(), b"abcdEFG");
    }

    #[test]
    fn short_copies_are_not_errors() {
        let mut ram = GuestRam::new(0x1000);
        let mut msg = VqMessage::new(1);
        msg.append(0x400, 4, true);
        msg.append(0x500, 2, true);

        assert_eq!(msg.copy_out(&mut ram, &[0xaa; 10], 0), Ok(6));
        assert_eq!(msg.copy_out(&mut ram, &[0xbb; 10], 6), Ok(0));
        assert_eq!(ram.get_slice(0x500, 2).unwrap(), &[0xaa, 0xaa]);

        let mut buf = [0u8; 4];
        assert_eq!(msg.copy_in(&ram, &mut buf, 0), Ok(0));
    }

    #[test]
    fn unresolvable_span_aborts_copy() {
        let mut ram = GuestRam::new(0x1000);
        ram.unmap(AddrRange::from_len(0x600, 0x10).unwrap());

        let mut msg = VqMessage::new(2);
        msg.append(0x500, 4, true);
        msg.append(0x600, 4, true);

        assert_eq!(
            msg.copy_out(&mut ram, &[1u8; 8], 0),
            Err(VirtqueueError::NoDmi {
                addr: 0x600,
                len: 4
            })
        );
    }

    #[test]
    fn lengths_and_trim() {
        let mut msg = VqMessage::new(3);
        msg.append(0x0, 16, false);
        msg.append(0x100, 64, true);
        msg.append(0x200, 64, true);
        assert_eq!(msg.readable_len(), 16);
        assert_eq!(msg.writable_len(), 128);
        assert_eq!(msg.total_len(), 144);
        assert_eq!(msg.ndescs(), 3);

        msg.trim(70);
        assert_eq!(msg.writable[0].len, 64);
        assert_eq!(msg.writable[1].len, 6);
        assert_eq!(msg.writable_len(), 70);
    }

    #[test]
    fn display_lists_every_span() {
        let mut msg = VqMessage::new(7);
        msg.append(0x1000, 16, true);
        msg.status = VirtioStatus::Ok;
        let text = msg.to_string();
        assert!(text.starts_with("VIRTMSG@7 [in: 1 descriptors | 16 bytes total] (VIRTIO_OK)"));
        assert!(text.contains("IN [0x0000000000001000..0x000000000000100f] (16 bytes)"));
    }
}
