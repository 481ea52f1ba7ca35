//-----------------------------------------------------------------------------
// Module request
// Batch request state machine
// A batch reads or writes a list of calibration elements in at most two transport round trips
// Read:  dimension request -> data request -> extract values
// Write: mask request -> merged write data -> done
// The first round trip is skipped when no element needs it

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use bitflags::bitflags;
use std::fmt;
use std::sync::Arc;

use super::worker::AckSender;
use crate::fetch::{ChannelId, Direction, Dispatcher, GroupId, LinkChannelId, LinkError, RequestId, SpanPool, TransferStatus};

//----------------------------------------------------------------------------------------------
// Element

/// A2L link number the accessor resolves element indices in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LinkId(pub u32);

bitflags! {
    /// Access flags of a batch element
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ElementFlags: u32 {
        const PHYSICAL      = 0x1; // Physical instead of raw value
        const TEXT_REPLACE  = 0x2; // Verbal conversion table text
        const UNIT          = 0x4;
    }
}

/// One calibration item of a batch
/// value is the value to write for write batches and the fetched value after a successful read
#[derive(Debug, Clone, PartialEq)]
pub struct Element<V> {
    pub index: u32,
    pub flags: ElementFlags,
    pub value: Option<V>,
    pub user_tag: u64,
    pub success: bool,
    pub error: Option<String>,
    live: bool,
}

impl<V> Element<V> {
    pub fn new(index: u32, flags: ElementFlags) -> Element<V> {
        Element {
            index,
            flags,
            value: None,
            user_tag: 0,
            success: false,
            error: None,
            live: false,
        }
    }

    #[must_use]
    pub fn with_value(mut self, value: V) -> Element<V> {
        self.value = Some(value);
        self
    }

    #[must_use]
    pub fn with_user_tag(mut self, user_tag: u64) -> Element<V> {
        self.user_tag = user_tag;
        self
    }

    /// Value of a successfully accessed element
    pub fn result(&self) -> Result<&V, LinkError> {
        match (&self.value, self.success) {
            (Some(v), true) => Ok(v),
            _ => Err(LinkError::AccessorFailure(self.error.clone().unwrap_or_else(|| format!("element {} has no value", self.index)))),
        }
    }
}

//----------------------------------------------------------------------------------------------
// Accessor interface

/// Accessor call mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessPhase {
    /// Request the array dimension bytes into the dimension group
    DimensionRequest,
    /// Evaluate the dimensions and request the data bytes into the data group
    DataRequest,
    /// Convert the fetched data bytes into the element value
    ExtractValue,
    /// Request the current bytes of partially written items into the dimension group
    MaskRequest,
    /// Merge the value into the current bytes and put them into the data group
    WriteDataRequest,
}

/// The two span groups of a batch, as seen by the accessor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupRole {
    /// Dimension bytes for reads, mask bytes for writes
    Dimension,
    Data,
}

/// Accessor view of the span groups of the current batch
pub struct PhaseGroups<'a> {
    pool: &'a mut SpanPool,
    dimension: GroupId,
    data: GroupId,
}

impl<'a> PhaseGroups<'a> {
    pub(crate) fn new(pool: &'a mut SpanPool, dimension: GroupId, data: GroupId) -> PhaseGroups<'a> {
        PhaseGroups { pool, dimension, data }
    }

    pub fn group_id(&self, role: GroupRole) -> GroupId {
        match role {
            GroupRole::Dimension => self.dimension,
            GroupRole::Data => self.data,
        }
    }

    /// Request size bytes at address to be fetched
    pub fn request(&mut self, role: GroupRole, address: u64, size: u32) -> Result<(), LinkError> {
        self.pool.insert(self.group_id(role), address, size, None)
    }

    /// Put bytes to be written at address
    pub fn write(&mut self, role: GroupRole, address: u64, data: &[u8]) -> Result<(), LinkError> {
        let size = u32::try_from(data.len()).map_err(|_| LinkError::AddressRange { address, size: u32::MAX })?;
        self.pool.insert(self.group_id(role), address, size, Some(data))
    }

    /// Read fetched bytes, bytes never fetched are zero
    pub fn read(&self, role: GroupRole, address: u64, dst: &mut [u8]) -> Result<(), LinkError> {
        self.pool.read_into(self.group_id(role), address, dst)
    }

    pub fn is_empty(&self, role: GroupRole) -> bool {
        self.pool.is_empty(self.group_id(role)).unwrap_or(true)
    }
}

/// Arguments of one accessor call
#[derive(Debug)]
pub struct AccessRequest<'a> {
    pub link: LinkId,
    pub phase: AccessPhase,
    pub index: u32,
    pub flags: ElementFlags,
    pub user_tag: u64,
    /// Error text slot of the element
    pub error: &'a mut Option<String>,
}

/// Per element accessor of the A2L layer
/// Returns the (possibly updated) value to continue with, or None if the element failed
/// Must not block and must not call back into the link
pub trait ElementAccessor: Send + 'static {
    type Value: Send + 'static;

    fn access(&mut self, request: AccessRequest<'_>, value: Option<Self::Value>, groups: &mut PhaseGroups<'_>) -> Option<Self::Value>;
}

//----------------------------------------------------------------------------------------------
// Request state

/// Observable state of a batch request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    ReadDimReq,
    ReadDimAckDataReq,
    ReadData,
    ReadMaskReq,
    ReadMaskAckWriteDataReq,
    WriteData,
    Successful,
    Error,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Successful | RequestState::Error)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Batch outcome passed to the caller callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchStatus {
    pub request: RequestId,
    pub channel: LinkChannelId,
    pub state: RequestState,
    /// Every transfer of the batch succeeded, independent of the element results
    pub success: bool,
    /// A transfer timed out waiting for its process
    pub timed_out: bool,
    /// Number of registered transfers
    pub round_trips: u32,
}

impl BatchStatus {
    /// Transport errors first, then a batch where no element made progress
    pub fn check(&self) -> Result<(), LinkError> {
        if self.timed_out {
            Err(LinkError::TransportTimeout(self.request))
        } else if !self.success {
            Err(LinkError::TransportFailure(self.request))
        } else if self.state == RequestState::Error {
            Err(LinkError::AccessorFailure(format!("no element of {} made progress", self.request)))
        } else {
            Ok(())
        }
    }
}

/// Caller callback, called once per batch on the worker thread
pub type BatchCallback<V> = Arc<dyn Fn(&mut [Element<V>], &BatchStatus) + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    AwaitDimensions(GroupId),
    AwaitData(GroupId),
    AwaitMask(GroupId),
    AwaitWrite(GroupId),
    Done(bool),
}

impl Phase {
    fn awaited(self) -> Option<GroupId> {
        match self {
            Phase::AwaitDimensions(g) | Phase::AwaitData(g) | Phase::AwaitMask(g) | Phase::AwaitWrite(g) => Some(g),
            Phase::Start | Phase::Done(_) => None,
        }
    }
}

/// Result of driving a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Waiting,
    Finished,
}

//----------------------------------------------------------------------------------------------
// BatchRequest

pub(crate) struct BatchRequest<V> {
    id: RequestId,
    link: LinkId,
    channel: LinkChannelId,
    fetch_channel: ChannelId,
    direction: Direction,
    elements: Vec<Element<V>>,
    callback: BatchCallback<V>,
    groups: Option<(GroupId, GroupId)>,
    phase: Phase,
    success: bool,
    timed_out: bool,
    round_trips: u32,
}

impl<V> fmt::Debug for BatchRequest<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchRequest")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("direction", &self.direction)
            .field("elements", &self.elements.len())
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl<V: Send + 'static> BatchRequest<V> {
    pub fn new(
        id: RequestId,
        link: LinkId,
        channel: LinkChannelId,
        fetch_channel: ChannelId,
        direction: Direction,
        elements: Vec<Element<V>>,
        callback: BatchCallback<V>,
    ) -> BatchRequest<V> {
        BatchRequest {
            id,
            link,
            channel,
            fetch_channel,
            direction,
            elements,
            callback,
            groups: None,
            phase: Phase::Start,
            success: true,
            timed_out: false,
            round_trips: 0,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn fetch_channel(&self) -> ChannelId {
        self.fetch_channel
    }

    pub fn state(&self) -> RequestState {
        match (self.phase, self.direction) {
            (Phase::Start, Direction::Read) => RequestState::ReadDimReq,
            (Phase::Start, Direction::Write) => RequestState::ReadMaskReq,
            (Phase::AwaitDimensions(_), _) => RequestState::ReadDimAckDataReq,
            (Phase::AwaitData(_), _) => RequestState::ReadData,
            (Phase::AwaitMask(_), _) => RequestState::ReadMaskAckWriteDataReq,
            (Phase::AwaitWrite(_), _) => RequestState::WriteData,
            (Phase::Done(true), _) => RequestState::Successful,
            (Phase::Done(false), _) => RequestState::Error,
        }
    }

    pub fn status(&self) -> BatchStatus {
        BatchStatus {
            request: self.id,
            channel: self.channel,
            state: self.state(),
            success: self.success,
            timed_out: self.timed_out,
            round_trips: self.round_trips,
        }
    }

    /// Call the caller callback with the elements and the final status
    pub fn notify(&mut self) {
        let status = self.status();
        (self.callback)(&mut self.elements, &status);
    }

    pub fn into_elements(self) -> Vec<Element<V>> {
        self.elements
    }

    // Run one accessor pass over all live elements, returns true if any element is still live
    fn run_pass<A>(&mut self, accessor: &mut A, dispatcher: &Dispatcher, phase: AccessPhase) -> bool
    where
        A: ElementAccessor<Value = V>,
    {
        let Some((dimension, data)) = self.groups else {
            return false;
        };
        let link = self.link;
        let elements = &mut self.elements;
        let live = dispatcher.with_pool(|pool| {
            let mut groups = PhaseGroups::new(pool, dimension, data);
            let mut live = 0usize;
            for e in elements.iter_mut().filter(|e| e.live) {
                let request = AccessRequest {
                    link,
                    phase,
                    index: e.index,
                    flags: e.flags,
                    user_tag: e.user_tag,
                    error: &mut e.error,
                };
                let value = accessor.access(request, e.value.take(), &mut groups);
                e.live = value.is_some();
                e.success &= e.live;
                e.value = value;
                live += usize::from(e.live);
            }
            live
        });
        trace!("{} {:?}: {} of {} elements live", self.id, phase, live, self.elements.len());
        live > 0
    }

    fn acquire_groups(&mut self, dispatcher: &Dispatcher) -> Result<(GroupId, GroupId), LinkError> {
        let dimension = dispatcher.acquire_group(Direction::Read)?;
        match dispatcher.acquire_group(self.direction) {
            Ok(data) => Ok((dimension, data)),
            Err(e) => {
                dispatcher.release_group(dimension)?;
                Err(e)
            }
        }
    }

    // Register the group of phase on the fetch channel and wait for its ack
    fn await_fetch(&mut self, dispatcher: &Dispatcher, acks: &AckSender, phase: Phase) -> Step {
        let Some(group) = phase.awaited() else {
            return self.abandon(dispatcher, "no transfer to wait for");
        };
        self.phase = phase;
        debug!("{} -> {}", self.id, self.state());
        match dispatcher.register(self.fetch_channel, group, u64::from(self.id.0), acks.completion()) {
            Ok(()) => {
                self.round_trips += 1;
                Step::Waiting
            }
            Err(e) => {
                warn!("{} register {} failed: {}", self.id, group, e);
                self.abandon(dispatcher, "transfer not registered")
            }
        }
    }

    /// Run the first phase and register the first transfer
    pub fn start<A>(&mut self, accessor: &mut A, dispatcher: &Dispatcher, acks: &AckSender) -> Step
    where
        A: ElementAccessor<Value = V>,
    {
        debug!("{} start {} of {} elements on {}", self.id, self.direction, self.elements.len(), self.channel);
        let (dimension, data) = match self.acquire_groups(dispatcher) {
            Ok(groups) => groups,
            Err(e) => {
                error!("{} start failed: {}", self.id, e);
                return self.abandon(dispatcher, "no span group");
            }
        };
        self.groups = Some((dimension, data));
        for e in &mut self.elements {
            e.live = true;
            e.success = true;
            e.error = None;
        }

        let (first, second, first_wait, second_wait) = match self.direction {
            Direction::Read => (AccessPhase::DimensionRequest, AccessPhase::DataRequest, Phase::AwaitDimensions(dimension), Phase::AwaitData(data)),
            Direction::Write => (AccessPhase::MaskRequest, AccessPhase::WriteDataRequest, Phase::AwaitMask(dimension), Phase::AwaitWrite(data)),
        };
        if !self.run_pass(accessor, dispatcher, first) {
            return self.finish(dispatcher, false);
        }
        match dispatcher.is_group_empty(dimension) {
            Ok(false) => self.await_fetch(dispatcher, acks, first_wait),
            Ok(true) => {
                // Nothing to fetch first, produce the second request right away
                debug!("{} skip {:?} round trip", self.id, first);
                if !self.run_pass(accessor, dispatcher, second) {
                    return self.finish(dispatcher, false);
                }
                self.await_fetch(dispatcher, acks, second_wait)
            }
            Err(e) => {
                error!("{}: {}", self.id, e);
                self.abandon(dispatcher, "span group lost")
            }
        }
    }

    /// Continue after a transfer completed
    /// Acks for a group the request is not waiting for are ignored
    pub fn on_ack<A>(&mut self, accessor: &mut A, dispatcher: &Dispatcher, acks: &AckSender, group: GroupId, status: TransferStatus) -> Step
    where
        A: ElementAccessor<Value = V>,
    {
        if self.phase.awaited() != Some(group) {
            warn!("{} ignores stale ack of {} in state {}", self.id, group, self.state());
            return Step::Waiting;
        }
        self.success &= status.is_success();
        self.timed_out |= status == TransferStatus::TimedOut;
        if !status.is_success() {
            warn!("{} transfer of {} {:?}", self.id, group, status);
        }
        let Some((_, data)) = self.groups else {
            return self.abandon(dispatcher, "span group lost");
        };

        match self.phase {
            Phase::AwaitDimensions(_) => {
                if !self.run_pass(accessor, dispatcher, AccessPhase::DataRequest) {
                    return self.finish(dispatcher, false);
                }
                self.await_fetch(dispatcher, acks, Phase::AwaitData(data))
            }
            Phase::AwaitData(_) => {
                let progress = self.run_pass(accessor, dispatcher, AccessPhase::ExtractValue);
                self.finish(dispatcher, progress)
            }
            Phase::AwaitMask(_) => {
                if !self.run_pass(accessor, dispatcher, AccessPhase::WriteDataRequest) {
                    return self.finish(dispatcher, false);
                }
                self.await_fetch(dispatcher, acks, Phase::AwaitWrite(data))
            }
            Phase::AwaitWrite(_) => self.finish(dispatcher, true),
            Phase::Start | Phase::Done(_) => Step::Waiting,
        }
    }

    // Release both groups and enter the terminal state
    // The terminal state only depends on element progress, transfer results are kept in success
    fn finish(&mut self, dispatcher: &Dispatcher, progress: bool) -> Step {
        if let Some((dimension, data)) = self.groups.take() {
            for group in [dimension, data] {
                if let Err(e) = dispatcher.release_group(group) {
                    warn!("{} release {}: {}", self.id, group, e);
                }
            }
        }
        self.phase = Phase::Done(progress);
        debug!("{} -> {} after {} round trips", self.id, self.state(), self.round_trips);
        Step::Finished
    }

    // The batch ends without its transfers, elements not failed yet get reason as error
    fn abandon(&mut self, dispatcher: &Dispatcher, reason: &str) -> Step {
        self.success = false;
        for e in self.elements.iter_mut().filter(|e| e.success || e.error.is_none()) {
            e.success = false;
            e.live = false;
            e.error.get_or_insert_with(|| reason.to_string());
        }
        self.finish(dispatcher, false)
    }

    /// The awaited group was aborted and already released by the dispatcher
    /// Returns true if the request is retired
    pub fn retire(&mut self, dispatcher: &Dispatcher, group: GroupId) -> bool {
        if self.phase.awaited() != Some(group) {
            return false;
        }
        if let Some((dimension, data)) = self.groups.take() {
            let other = if group == dimension { data } else { dimension };
            if let Err(e) = dispatcher.release_group(other) {
                warn!("{} release {}: {}", self.id, other, e);
            }
        }
        self.abandon(dispatcher, "transfer aborted");
        debug!("{} retired", self.id);
        true
    }

    /// Give up the request, a transfer still pending is aborted
    pub fn cancel(&mut self, dispatcher: &Dispatcher) {
        if let Some((dimension, data)) = self.groups.take() {
            let awaited = self.phase.awaited();
            for group in [dimension, data] {
                if Some(group) == awaited && matches!(dispatcher.abort(self.fetch_channel, group), Ok(Some(_))) {
                    continue;
                }
                if let Err(e) = dispatcher.release_group(group) {
                    debug!("{} release {}: {}", self.id, group, e);
                }
            }
        }
        self.abandon(dispatcher, "batch cancelled");
    }
}

//----------------------------------------------------------------------------------------------
// Test module

#[cfg(test)]
mod tests {
    use super::super::worker::Control;
    use super::*;
    use crate::fetch::{PoolConfig, Transport};
    use crate::sim::{SimItem, SimProcess, TableAccessor};
    use crossbeam_channel::{unbounded, Receiver};
    use std::time::Duration;

    const PID: u32 = 3;

    struct Fixture {
        sim: Arc<SimProcess>,
        dispatcher: Dispatcher,
        acks: AckSender,
        rx: Receiver<Control>,
        channel: ChannelId,
        accessor: TableAccessor,
    }

    impl Fixture {
        fn new() -> Fixture {
            let sim = Arc::new(SimProcess::new());
            sim.add_process(PID, 0x1000, 0x100);
            let dispatcher = Dispatcher::new(sim.clone(), PoolConfig::default());
            let (tx, rx) = unbounded();
            let channel = dispatcher.open_channel(Transport::ExternalProcess { pid: PID }, Duration::from_millis(5)).unwrap();
            let accessor = TableAccessor::new(vec![
                SimItem::scalar(0x1000, 4),         // 0
                SimItem::array(0x1010, 0x1020, 2), // 1, u16 count at 0x1010
                SimItem::bitfield(0x1030, 1, 0x0F), // 2
                SimItem::scalar(0x5000, 4),         // 3, outside of the process memory
            ]);
            Fixture {
                sim,
                dispatcher,
                acks: AckSender::new(tx),
                rx,
                channel,
                accessor,
            }
        }

        fn request(&self, direction: Direction, elements: Vec<Element<Vec<u8>>>) -> BatchRequest<Vec<u8>> {
            BatchRequest::new(RequestId(1), LinkId(0), LinkChannelId(0), self.channel, direction, elements, Arc::new(|_: &mut [Element<Vec<u8>>], _: &BatchStatus| {}))
        }

        fn start(&mut self, req: &mut BatchRequest<Vec<u8>>) -> Step {
            req.start(&mut self.accessor, &self.dispatcher, &self.acks)
        }

        // Deliver the next ack to the request
        fn pump(&mut self, req: &mut BatchRequest<Vec<u8>>) -> Step {
            match self.rx.try_recv().unwrap() {
                Control::Ack(ack) => {
                    assert_eq!(ack.request, req.id());
                    req.on_ack(&mut self.accessor, &self.dispatcher, &self.acks, ack.group, ack.status)
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_read_scalar_skips_dimension_round_trip() {
        let mut f = Fixture::new();
        f.sim.poke(PID, 0x1000, &[1, 2, 3, 4]);
        let mut req = f.request(Direction::Read, vec![Element::new(0, ElementFlags::empty())]);
        assert_eq!(req.state(), RequestState::ReadDimReq);
        assert_eq!(f.start(&mut req), Step::Waiting);
        assert_eq!(req.state(), RequestState::ReadData);
        assert_eq!(f.pump(&mut req), Step::Finished);

        let status = req.status();
        assert_eq!(status.state, RequestState::Successful);
        assert!(status.success);
        assert_eq!(status.round_trips, 1);
        assert_eq!(req.elements[0].result().unwrap(), &vec![1, 2, 3, 4]);
        assert_eq!(f.dispatcher.with_pool(|p| p.groups_in_use()), 0, "both groups released");
    }

    #[test]
    fn test_read_array_with_dimension() {
        let mut f = Fixture::new();
        f.sim.poke(PID, 0x1010, &[3, 0]);
        f.sim.poke(PID, 0x1020, &[1, 0, 2, 0, 3, 0, 4, 0]);
        let mut req = f.request(Direction::Read, vec![Element::new(1, ElementFlags::PHYSICAL), Element::new(0, ElementFlags::empty())]);
        assert_eq!(f.start(&mut req), Step::Waiting);
        assert_eq!(req.state(), RequestState::ReadDimAckDataReq);
        assert_eq!(f.pump(&mut req), Step::Waiting);
        assert_eq!(req.state(), RequestState::ReadData);
        assert_eq!(f.pump(&mut req), Step::Finished);

        assert_eq!(req.status().round_trips, 2);
        assert!(req.status().check().is_ok());
        assert_eq!(req.elements[0].result().unwrap(), &vec![1, 0, 2, 0, 3, 0]);
        assert!(req.elements.iter().all(|e| e.success));
    }

    #[test]
    fn test_all_elements_fail() {
        let mut f = Fixture::new();
        let mut req = f.request(Direction::Read, vec![Element::new(7, ElementFlags::empty()), Element::new(8, ElementFlags::empty())]);
        assert_eq!(f.start(&mut req), Step::Finished);
        assert_eq!(req.state(), RequestState::Error);
        assert!(req.elements.iter().all(|e| !e.success && e.error.is_some()));
        assert!(req.status().success, "no transfer failed");
        assert!(matches!(req.status().check(), Err(LinkError::AccessorFailure(_))));
        assert!(f.rx.try_recv().is_err(), "nothing registered");
        assert_eq!(f.dispatcher.with_pool(|p| p.groups_in_use()), 0);
    }

    #[test]
    fn test_partial_failure() {
        let mut f = Fixture::new();
        f.accessor.fail_index(1);
        let mut req = f.request(Direction::Read, vec![Element::new(0, ElementFlags::empty()), Element::new(1, ElementFlags::empty())]);
        assert_eq!(f.start(&mut req), Step::Waiting);
        assert_eq!(f.pump(&mut req), Step::Finished);
        assert_eq!(req.state(), RequestState::Successful);
        assert!(req.elements[0].success);
        assert!(!req.elements[1].success);
        assert_eq!(req.elements[1].error.as_deref(), Some("no item 1"));
    }

    #[test]
    fn test_write_bitfield_merges_current_bytes() {
        let mut f = Fixture::new();
        f.sim.poke(PID, 0x1030, &[0xA5]);
        let mut req = f.request(
            Direction::Write,
            vec![Element::new(2, ElementFlags::empty()).with_value(vec![0x3C]), Element::new(0, ElementFlags::empty()).with_value(vec![9, 8, 7, 6])],
        );
        assert_eq!(req.state(), RequestState::ReadMaskReq);
        assert_eq!(f.start(&mut req), Step::Waiting);
        assert_eq!(req.state(), RequestState::ReadMaskAckWriteDataReq);
        assert_eq!(f.pump(&mut req), Step::Waiting);
        assert_eq!(req.state(), RequestState::WriteData);
        assert_eq!(f.pump(&mut req), Step::Finished);
        assert_eq!(req.state(), RequestState::Successful);

        assert_eq!(f.sim.peek(PID, 0x1030, 1).unwrap(), vec![0xAC]);
        assert_eq!(f.sim.peek(PID, 0x1000, 4).unwrap(), vec![9, 8, 7, 6]);
    }

    #[test]
    fn test_write_without_mask_skips_round_trip() {
        let mut f = Fixture::new();
        let mut req = f.request(Direction::Write, vec![Element::new(0, ElementFlags::empty()).with_value(vec![1, 1, 1, 1])]);
        assert_eq!(f.start(&mut req), Step::Waiting);
        assert_eq!(req.state(), RequestState::WriteData);
        assert_eq!(f.pump(&mut req), Step::Finished);
        assert_eq!(req.status().round_trips, 1);
        assert_eq!(f.sim.peek(PID, 0x1000, 4).unwrap(), vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_timeout_is_reported_in_status() {
        let mut f = Fixture::new();
        f.sim.set_running(PID, true);
        let mut req = f.request(Direction::Read, vec![Element::new(0, ElementFlags::empty())]);
        assert_eq!(f.start(&mut req), Step::Waiting);
        assert!(f.rx.try_recv().is_err());
        f.sim.advance(Duration::from_millis(6));
        assert_eq!(f.dispatcher.on_process_quiesced(PID), 1);
        assert_eq!(f.pump(&mut req), Step::Finished);

        // The element was extracted, so the state follows element progress
        let status = req.status();
        assert_eq!(status.state, RequestState::Successful);
        assert!(!status.success);
        assert!(status.timed_out);
        assert!(matches!(status.check(), Err(LinkError::TransportTimeout(_))));
        assert_eq!(f.dispatcher.with_pool(|p| p.groups_in_use()), 0);
    }

    #[test]
    fn test_failed_data_transfer_keeps_element_results() {
        let mut f = Fixture::new();
        f.sim.poke(PID, 0x1000, &[1, 2, 3, 4]);
        let mut req = f.request(Direction::Read, vec![Element::new(0, ElementFlags::empty()), Element::new(3, ElementFlags::empty())]);
        assert_eq!(f.start(&mut req), Step::Waiting);
        assert_eq!(f.pump(&mut req), Step::Finished);

        let status = req.status();
        assert_eq!(status.state, RequestState::Successful);
        assert!(!status.success);
        assert!(!status.timed_out);
        assert!(matches!(status.check(), Err(LinkError::TransportFailure(r)) if r == req.id()));
        assert!(req.elements.iter().all(|e| e.success && e.error.is_none()));
        assert_eq!(req.elements[0].result().unwrap(), &vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_failed_write_transfer_ends_successful() {
        let mut f = Fixture::new();
        let mut req = f.request(Direction::Write, vec![Element::new(3, ElementFlags::empty()).with_value(vec![1, 2, 3, 4])]);
        assert_eq!(f.start(&mut req), Step::Waiting);
        assert_eq!(req.state(), RequestState::WriteData);
        assert_eq!(f.pump(&mut req), Step::Finished);

        let status = req.status();
        assert_eq!(status.state, RequestState::Successful);
        assert!(!status.success);
        assert!(matches!(status.check(), Err(LinkError::TransportFailure(_))));
        assert!(req.elements[0].success);
        assert_eq!(f.dispatcher.with_pool(|p| p.groups_in_use()), 0);
    }

    #[test]
    fn test_stale_ack_is_ignored() {
        let mut f = Fixture::new();
        f.sim.set_running(PID, true);
        let mut req = f.request(Direction::Read, vec![Element::new(0, ElementFlags::empty())]);
        assert_eq!(f.start(&mut req), Step::Waiting);
        let step = req.on_ack(&mut f.accessor, &f.dispatcher, &f.acks, GroupId(99), TransferStatus::Done);
        assert_eq!(step, Step::Waiting);
        assert_eq!(req.state(), RequestState::ReadData);
    }

    #[test]
    fn test_retire_and_cancel() {
        let mut f = Fixture::new();
        f.sim.set_running(PID, true);
        let mut req = f.request(Direction::Read, vec![Element::new(0, ElementFlags::empty())]);
        assert_eq!(f.start(&mut req), Step::Waiting);
        let group = f.dispatcher.in_flight_group(f.channel).unwrap();
        assert_eq!(f.dispatcher.abort(f.channel, group).unwrap(), Some(1));
        assert!(!req.retire(&f.dispatcher, GroupId(99)));
        assert!(req.retire(&f.dispatcher, group));
        assert_eq!(req.state(), RequestState::Error);
        assert_eq!(f.dispatcher.with_pool(|p| p.groups_in_use()), 0);

        let mut req = f.request(Direction::Read, vec![Element::new(0, ElementFlags::empty())]);
        assert_eq!(f.start(&mut req), Step::Waiting);
        req.cancel(&f.dispatcher);
        assert_eq!(req.state(), RequestState::Error);
        assert!(!req.status().success);
        assert_eq!(req.elements[0].error.as_deref(), Some("batch cancelled"));
        assert_eq!(f.dispatcher.in_flight_group(f.channel), None);
        assert_eq!(f.dispatcher.with_pool(|p| p.groups_in_use()), 0);
    }
}
