//-----------------------------------------------------------------------------
// Module channel
// Fetch channel registry and per transport pending lists

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use super::{ChannelId, GroupId, LinkError, Slots};

/// Operating system process id of an external process target
pub type ProcessId = u32;

//----------------------------------------------------------------------------------------------
// Transport

/// Transport kind of a fetch channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    ExternalProcess = 0,
    Xcp = 1,
    Ccp = 2,
    StaticFile = 3,
}

impl TransportKind {
    pub const COUNT: usize = 4;

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::ExternalProcess => "process",
            TransportKind::Xcp => "XCP",
            TransportKind::Ccp => "CCP",
            TransportKind::StaticFile => "static file",
        };
        f.write_str(name)
    }
}

/// Transport of a fetch channel with its kind specific property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Memory of a process, accessed while the scheduler holds it paused
    ExternalProcess { pid: ProcessId },
    /// XCP connection number
    Xcp { connection: u32 },
    /// CCP connection number
    Ccp { connection: u32 },
    /// Static image handle
    StaticFile { handle: u32 },
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::ExternalProcess { .. } => TransportKind::ExternalProcess,
            Transport::Xcp { .. } => TransportKind::Xcp,
            Transport::Ccp { .. } => TransportKind::Ccp,
            Transport::StaticFile { .. } => TransportKind::StaticFile,
        }
    }

    /// Kind specific property: pid, connection number or image handle
    pub fn property(&self) -> u32 {
        match *self {
            Transport::ExternalProcess { pid } => pid,
            Transport::Xcp { connection } | Transport::Ccp { connection } => connection,
            Transport::StaticFile { handle } => handle,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.property())
    }
}

//----------------------------------------------------------------------------------------------
// FetchChannel

#[derive(Debug)]
pub(crate) struct FetchChannel {
    pub transport: Transport,
    pub timeout: Duration,
    /// Absolute time in ns after which a process which cannot be locked fails the transfer
    pub deadline: Option<u64>,
    /// Group of the pending transfer, Some while the channel is in a pending list
    pub in_flight: Option<GroupId>,
    /// Set while a polling driver holds the transfer
    pub claimed: bool,
}

impl FetchChannel {
    pub fn clear_transfer(&mut self) {
        self.in_flight = None;
        self.deadline = None;
        self.claimed = false;
    }
}

//----------------------------------------------------------------------------------------------
// ChannelList

/// All open fetch channels and one FIFO pending list per transport kind
#[derive(Debug)]
pub(crate) struct ChannelList {
    channels: Slots<FetchChannel>,
    pending: [VecDeque<ChannelId>; TransportKind::COUNT],
}

impl ChannelList {
    pub fn new() -> ChannelList {
        ChannelList {
            channels: Slots::new("fetch channel"),
            pending: Default::default(),
        }
    }

    pub fn open(&mut self, transport: Transport, timeout: Duration) -> Result<ChannelId, LinkError> {
        let id = ChannelId(self.channels.insert(FetchChannel {
            transport,
            timeout,
            deadline: None,
            in_flight: None,
            claimed: false,
        })?);
        debug!("open {} on {}, timeout {:?}", id, transport, timeout);
        Ok(id)
    }

    /// Remove a channel and return it, it is removed from its pending list
    pub fn close(&mut self, id: ChannelId) -> Result<FetchChannel, LinkError> {
        let channel = self.channels.remove(id.0).ok_or_else(|| id.invalid())?;
        self.pending[channel.transport.kind().index()].retain(|c| *c != id);
        debug!("close {}", id);
        Ok(channel)
    }

    pub fn get(&self, id: ChannelId) -> Result<&FetchChannel, LinkError> {
        self.channels.get(id.0).ok_or_else(|| id.invalid())
    }

    pub fn get_mut(&mut self, id: ChannelId) -> Result<&mut FetchChannel, LinkError> {
        self.channels.get_mut(id.0).ok_or_else(|| id.invalid())
    }

    /// Append a channel to the pending list of its transport kind
    pub fn push_pending(&mut self, id: ChannelId, kind: TransportKind) {
        debug_assert!(!self.pending[kind.index()].contains(&id));
        self.pending[kind.index()].push_back(id);
    }

    pub fn remove_pending(&mut self, id: ChannelId, kind: TransportKind) {
        self.pending[kind.index()].retain(|c| *c != id);
    }

    /// Pending channels of a transport kind in registration order
    pub fn pending(&self, kind: TransportKind) -> impl Iterator<Item = ChannelId> + '_ {
        self.pending[kind.index()].iter().copied()
    }

    pub fn pending_count(&self, kind: TransportKind) -> usize {
        self.pending[kind.index()].len()
    }

    pub fn open_count(&self) -> usize {
        self.channels.used()
    }
}

//----------------------------------------------------------------------------------------------
// Test module
