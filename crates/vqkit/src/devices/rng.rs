//! virtio-rng: fills every device-writable buffer with random bytes.

use crate::device::{
    DeviceDesc, VirtioController, VirtioDevice, VIRTIO_DEVICE_RNG, VIRTIO_VENDOR_VQKIT,
};
use crate::error::{VirtioStatus, VirtqueueError};
use crate::memory::AddrRange;
use crate::message::VqMessage;
use core::any::Any;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

pub const VIRTIO_RNG_QUEUE: u32 = 0;
pub const VIRTIO_RNG_QUEUE_SIZE: u32 = 64;

const RNG_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone)]
pub struct VirtioRng {
    rng: ChaCha8Rng,
    seed: Option<u64>,
    bytes_served: u64,
}

impl VirtioRng {
    /// Seeds the generator from the operating system.
    pub fn new() -> Self {
        Self {
            rng: ChaCha8Rng::from_entropy(),
            seed: None,
            bytes_served: 0,
        }
    }

    /// Deterministic generator; reset restarts the same byte stream.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            seed: Some(seed),
            bytes_served: 0,
        }
    }

    pub fn bytes_served(&self) -> u64 {
        self.bytes_served
    }

    /// Fills the writable spans of `msg` chunk by chunk. Returns the number of bytes written.
    fn fill(
        &mut self,
        ctrl: &mut dyn VirtioController,
        msg: &VqMessage,
    ) -> Result<usize, VirtqueueError> {
        let total = msg.writable_len() as usize;
        let mut chunk = [0u8; RNG_CHUNK_SIZE];
        let mut offset = 0;
        while offset < total {
            let n = (total - offset).min(RNG_CHUNK_SIZE);
            self.rng.fill_bytes(&mut chunk[..n]);
            let copied = msg.copy_out(ctrl.memory(), &chunk[..n], offset)?;
            if copied == 0 {
                break;
            }
            offset += copied;
        }
        Ok(offset)
    }
}

impl Default for VirtioRng {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtioDevice for VirtioRng {
    fn identify(&mut self, desc: &mut DeviceDesc) {
        desc.device_id = VIRTIO_DEVICE_RNG;
        desc.vendor_id = VIRTIO_VENDOR_VQKIT;
        desc.request_virtqueue(VIRTIO_RNG_QUEUE, VIRTIO_RNG_QUEUE_SIZE);
    }

    fn notify(&mut self, vqid: u32, ctrl: &mut dyn VirtioController) -> bool {
        if vqid != VIRTIO_RNG_QUEUE {
            tracing::warn!(vqid, "notification on unknown virtqueue");
            return false;
        }

        loop {
            let mut msg = match ctrl.get(vqid) {
                Ok(Some(msg)) => msg,
                Ok(None) => return true,
                // Rings that cannot be resolved right now; the driver notifies again once they can.
                Err(err) if err.status() == VirtioStatus::Incomplete => {
                    tracing::debug!(vqid, %err, "virtqueue not available");
                    return true;
                }
                Err(err) => {
                    tracing::warn!(vqid, %err, "failed to dequeue entropy request");
                    return false;
                }
            };

            let written = match self.fill(ctrl, &msg) {
                Ok(n) => n,
                Err(err) => {
                    tracing::warn!(vqid, index = msg.index, %err, "failed to fill entropy buffer");
                    return false;
                }
            };
            self.bytes_served += written as u64;

            match ctrl.put(vqid, &mut msg) {
                Ok(()) => {}
                Err(err) if err.status() == VirtioStatus::Incomplete => {
                    tracing::debug!(vqid, index = msg.index, %err, "virtqueue not available");
                    return true;
                }
                Err(err) => {
                    tracing::warn!(vqid, index = msg.index, %err, "failed to complete entropy request");
                    return false;
                }
            }
        }
    }

    fn reset(&mut self) {
        if let Some(seed) = self.seed {
            self.rng = ChaCha8Rng::seed_from_u64(seed);
        }
        self.bytes_served = 0;
    }

    fn read_features(&self) -> u64 {
        0
    }

    fn write_features(&mut self, _features: u64) -> bool {
        true
    }

    // virtio-rng has no configuration space.
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
