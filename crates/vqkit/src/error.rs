use thiserror::Error;

/// Outcome of a virtqueue operation as recorded on a [`crate::VqMessage`].
///
/// `Incomplete` is not an error: it means there was nothing to do (or the message has not been
/// processed yet). Every `Err*` value means the message must be discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VirtioStatus {
    #[default]
    Incomplete,
    Ok,
    ErrIndirect,
    ErrNoDmi,
    ErrChain,
    ErrDesc,
}

impl VirtioStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Incomplete => 0,
            Self::Ok => 1,
            Self::ErrIndirect => -1,
            Self::ErrNoDmi => -2,
            Self::ErrChain => -3,
            Self::ErrDesc => -4,
        }
    }

    pub fn is_success(self) -> bool {
        self.code() > 0
    }

    pub fn is_failure(self) -> bool {
        self.code() < 0
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Incomplete => "VIRTIO_INCOMPLETE",
            Self::Ok => "VIRTIO_OK",
            Self::ErrIndirect => "VIRTIO_ERR_INDIRECT",
            Self::ErrNoDmi => "VIRTIO_ERR_NODMI",
            Self::ErrChain => "VIRTIO_ERR_CHAIN",
            Self::ErrDesc => "VIRTIO_ERR_DESC",
        }
    }
}

impl core::fmt::Display for VirtioStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ring protocol failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VirtqueueError {
    /// The descriptor table or one of the rings cannot be resolved through the memory port.
    #[error("virtqueue {queue}: rings are not accessible")]
    Unbound { queue: u32 },

    /// Zero-length or misaligned indirect table, unreachable table, or nested indirection.
    #[error("malformed indirect descriptor: {0}")]
    Indirect(&'static str),

    /// A buffer referenced by a descriptor cannot be resolved.
    #[error("no memory access for {len} bytes at 0x{addr:016x}")]
    NoDmi { addr: u64, len: u64 },

    /// Chain longer than its table, or a `next` link pointing outside of it.
    #[error("broken descriptor chain: {0}")]
    Chain(&'static str),

    /// Ring index out of bounds.
    #[error("illegal descriptor index {index}")]
    Desc { index: u32 },

    /// Packed ring descriptor inside a chain that the driver has not made available.
    #[error("descriptor {index} not available")]
    NotAvailable { index: u32 },
}

impl VirtqueueError {
    pub fn status(&self) -> VirtioStatus {
        match self {
            Self::Unbound { .. } => VirtioStatus::Incomplete,
            Self::Indirect(_) => VirtioStatus::ErrIndirect,
            Self::NoDmi { .. } => VirtioStatus::ErrNoDmi,
            Self::Chain(_) => VirtioStatus::ErrChain,
            Self::Desc { .. } | Self::NotAvailable { .. } => VirtioStatus::ErrDesc,
        }
    }
}
