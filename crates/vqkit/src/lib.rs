//! Device-side virtio virtqueue engine.
//!
//! A device model dequeues descriptor chains posted by a guest driver, reads and writes the guest
//! memory they reference, and hands them back with a completion length. This crate provides:
//!
//! - [`memory::GuestMemory`]: the port through which every ring and buffer access is resolved
//! - [`Virtqueue`]: split and packed ring formats behind one `get`/`put` interface
//! - [`VqMessage`]: a dequeued chain as readable/writable span lists with copy helpers
//! - [`device`]: the device/controller contract and protocol constants
//! - [`transport::VirtioTransport`]: feature negotiation, status machine, queue lifecycle and
//!   interrupts for one device
//! - [`registry::DeviceRegistry`]: name-based device construction
//!
//! The engine holds no locks; one caller drives a given queue at a time.

pub mod device;
pub mod devices;
mod error;
pub mod memory;
mod message;
pub mod queue;
pub mod registry;
pub mod shm;
pub mod transport;

pub use device::{DeviceDesc, StubDevice, VirtioController, VirtioDevice};
pub use error::{VirtioStatus, VirtqueueError};
pub use message::{VqBuffer, VqMessage};
pub use queue::{PackedVirtqueue, QueueDesc, RingFormat, SplitVirtqueue, Virtqueue};
pub use registry::{DeviceRegistry, RegistryError};
pub use transport::{TransportConfig, TransportError, VirtioTransport};
