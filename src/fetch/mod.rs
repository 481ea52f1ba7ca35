//-----------------------------------------------------------------------------
// Module fetch
// Delayed fetch of target memory
// Span groups collect the address ranges a batch needs, fetch channels carry them to a transport
// and the dispatcher completes them, synchronously for processes which are paused by the scheduler

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::fmt;

mod slots;
pub(crate) use slots::Slots;

mod span_pool;
pub use span_pool::{GroupDump, PoolConfig, SpanIter, SpanPool, SpanRef};

mod channel;
pub use channel::{ProcessId, Transport, TransportKind};

mod dispatch;
pub use dispatch::{Dispatcher, PendingTransfer, ProcessAccess, TransferSpan};

//----------------------------------------------------------------------------------------------
// LinkError

/// Error type of the calibration data link
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("out of memory: `{0}`")]
    OutOfMemory(&'static str),

    #[error("invalid {kind} handle {id}")]
    InvalidHandle { kind: &'static str, id: u32 },

    #[error("address range {address:#x}+{size} overflows")]
    AddressRange { address: u64, size: u32 },

    #[error("element accessor failed: {0}")]
    AccessorFailure(String),

    #[error("transport timeout in {0}")]
    TransportTimeout(RequestId),

    #[error("transport failure in {0}")]
    TransportFailure(RequestId),

    #[error("channel {0} already has a pending transfer")]
    AlreadyPending(ChannelId),

    #[error("link worker stopped")]
    WorkerStopped,

    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("image format error in line {line}: {reason}")]
    ImageFormat { line: usize, reason: String },
}

//----------------------------------------------------------------------------------------------
// Handles

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub const KIND: &'static str = $kind;

            /// Build a handle from its raw number
            /// Handles built this way are validated on every use
            pub fn from_raw(id: u32) -> $name {
                $name(id)
            }

            pub fn raw(self) -> u32 {
                self.0
            }

            pub(crate) fn invalid(self) -> LinkError {
                LinkError::InvalidHandle { kind: $kind, id: self.0 }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", $kind, self.0)
            }
        }
    };
}

handle_type!(
    /// Span group handle
    GroupId,
    "group"
);
handle_type!(
    /// Fetch channel handle
    ChannelId,
    "channel"
);
handle_type!(
    /// Batch request id, unique among requests in flight
    RequestId,
    "request"
);
handle_type!(
    /// Caller channel handle of the link layer
    LinkChannelId,
    "link channel"
);

//----------------------------------------------------------------------------------------------
// Transfer direction and status

/// Direction of a span group transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    /// Target memory is copied into the span buffers
    #[default]
    Read,
    /// Span buffers are copied to target memory
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => write!(f, "read"),
            Direction::Write => write!(f, "write"),
        }
    }
}

/// Outcome of a span group transfer, passed to the completion callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Done,
    Failed,
    TimedOut,
}

impl TransferStatus {
    pub fn is_success(self) -> bool {
        self == TransferStatus::Done
    }
}

/// Completion callback of a registered transfer, called exactly once with (tag, group, status)
pub type CompletionFn = Box<dyn FnOnce(u64, GroupId, TransferStatus) + Send + 'static>;

/// A registered completion, owned by the span group while its transfer is pending
pub(crate) struct Completion {
    pub tag: u64,
    pub callback: CompletionFn,
}

impl Completion {
    pub fn fire(self, group: GroupId, status: TransferStatus) {
        (self.callback)(self.tag, group, status);
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").field("tag", &self.tag).finish_non_exhaustive()
    }
}
