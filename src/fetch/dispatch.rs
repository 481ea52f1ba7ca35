//-----------------------------------------------------------------------------
// Module dispatch
// Completion dispatcher
// Registers span groups on fetch channels and completes them
// External process transfers run synchronously when the scheduler reports the process paused,
// all other transports are served by polling drivers through take_pending and complete_transfer

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use super::channel::ChannelList;
use super::{ChannelId, Completion, Direction, GroupId, LinkError, PoolConfig, ProcessId, SpanPool, TransferStatus, Transport, TransportKind};

//----------------------------------------------------------------------------------------------
// ProcessAccess

/// Access to the memory of external processes, provided by the scheduler
pub trait ProcessAccess: Send + Sync {
    /// Try to take the exclusive memory lock of a paused process
    fn try_lock_process(&self, pid: ProcessId) -> bool;

    fn unlock_process(&self, pid: ProcessId);

    /// Read process memory, returns the number of bytes read
    fn read_process_bytes(&self, pid: ProcessId, address: u64, dst: &mut [u8]) -> std::io::Result<usize>;

    /// Write process memory, returns the number of bytes written
    fn write_process_bytes(&self, pid: ProcessId, address: u64, src: &[u8]) -> std::io::Result<usize>;

    /// Monotonic time in ns
    fn now_ns(&self) -> u64;
}

//----------------------------------------------------------------------------------------------
// PendingTransfer

/// A span with its bytes, copied out of the span pool for a polling driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSpan {
    pub address: u64,
    pub data: Vec<u8>,
}

/// A transfer claimed by a polling driver
/// For reads the driver fills the span data, for writes it sends it
/// Hand it back with Dispatcher::complete_transfer
#[derive(Debug)]
pub struct PendingTransfer {
    channel: ChannelId,
    group: GroupId,
    transport: Transport,
    direction: Direction,
    spans: Vec<TransferSpan>,
}

impl PendingTransfer {
    pub fn channel(&self) -> ChannelId {
        self.channel
    }
    pub fn group(&self) -> GroupId {
        self.group
    }
    pub fn transport(&self) -> Transport {
        self.transport
    }
    pub fn direction(&self) -> Direction {
        self.direction
    }
    pub fn spans(&self) -> &[TransferSpan] {
        &self.spans
    }
    pub fn spans_mut(&mut self) -> &mut [TransferSpan] {
        &mut self.spans
    }
}

//----------------------------------------------------------------------------------------------
// Dispatcher

#[derive(Debug)]
struct FetchCore {
    pool: SpanPool,
    channels: ChannelList,
}

/// Shared handle to the span pool, the fetch channels and the pending lists
/// Completion callbacks are always called after the internal lock is released
#[derive(Clone)]
pub struct Dispatcher {
    core: Arc<Mutex<FetchCore>>,
    process: Arc<dyn ProcessAccess>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

// Copy all spans of a group from or to a locked process
fn transfer_process(process: &dyn ProcessAccess, pid: ProcessId, pool: &mut SpanPool, group: GroupId) -> bool {
    let direction = match pool.direction(group) {
        Ok(d) => d,
        Err(e) => {
            error!("process transfer: {}", e);
            return false;
        }
    };
    let result = match direction {
        Direction::Read => pool.for_each_span_mut(group, |address, bytes| match process.read_process_bytes(pid, address, bytes) {
            Ok(n) if n == bytes.len() => true,
            Ok(n) => {
                warn!("process {} read {:#x}+{}: only {} bytes", pid, address, bytes.len(), n);
                false
            }
            Err(e) => {
                warn!("process {} read {:#x}+{}: {}", pid, address, bytes.len(), e);
                false
            }
        }),
        Direction::Write => pool.spans(group).map(|mut spans| {
            spans.all(|span| match process.write_process_bytes(pid, span.address, span.bytes) {
                Ok(n) if n == span.bytes.len() => true,
                Ok(n) => {
                    warn!("process {} write {:#x}+{}: only {} bytes", pid, span.address, span.bytes.len(), n);
                    false
                }
                Err(e) => {
                    warn!("process {} write {:#x}+{}: {}", pid, span.address, span.bytes.len(), e);
                    false
                }
            })
        }),
    };
    result.unwrap_or(false)
}

fn duration_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

impl Dispatcher {
    pub fn new(process: Arc<dyn ProcessAccess>, config: PoolConfig) -> Dispatcher {
        Dispatcher {
            core: Arc::new(Mutex::new(FetchCore {
                pool: SpanPool::new(config),
                channels: ChannelList::new(),
            })),
            process,
        }
    }

    //-------------------------------------------------------------------------
    // Channels

    pub fn open_channel(&self, transport: Transport, timeout: Duration) -> Result<ChannelId, LinkError> {
        self.core.lock().channels.open(transport, timeout)
    }

    /// Close a fetch channel
    /// A pending transfer is abandoned, its group released and its completion dropped
    /// Returns the tag and the group of the abandoned registration
    pub fn close_channel(&self, channel: ChannelId) -> Result<Option<(u64, GroupId)>, LinkError> {
        let mut core = self.core.lock();
        let FetchCore { pool, channels } = &mut *core;
        let ch = channels.close(channel)?;
        if let Some(group) = ch.in_flight {
            if let Some(completion) = pool.take_completion(group) {
                pool.release(group)?;
                info!("{} closed with {} in flight", channel, group);
                return Ok(Some((completion.tag, group)));
            }
        }
        Ok(None)
    }

    /// Group of the transfer pending on a channel
    pub fn in_flight_group(&self, channel: ChannelId) -> Option<GroupId> {
        self.core.lock().channels.get(channel).ok()?.in_flight
    }

    /// Deadline of a channel waiting for a busy process
    pub fn channel_deadline(&self, channel: ChannelId) -> Option<u64> {
        self.core.lock().channels.get(channel).ok()?.deadline
    }

    pub fn pending_count(&self, kind: TransportKind) -> usize {
        self.core.lock().channels.pending_count(kind)
    }

    pub fn open_channel_count(&self) -> usize {
        self.core.lock().channels.open_count()
    }

    //-------------------------------------------------------------------------
    // Span groups

    pub fn acquire_group(&self, direction: Direction) -> Result<GroupId, LinkError> {
        self.core.lock().pool.acquire(direction)
    }

    /// Release a group which is not in flight, use abort for a group in flight
    pub fn release_group(&self, group: GroupId) -> Result<(), LinkError> {
        let mut core = self.core.lock();
        debug_assert!(!core.pool.has_completion(group), "{} released while in flight", group);
        core.pool.release(group)
    }

    pub fn insert(&self, group: GroupId, address: u64, size: u32, data: Option<&[u8]>) -> Result<(), LinkError> {
        self.core.lock().pool.insert(group, address, size, data)
    }

    pub fn read_into(&self, group: GroupId, address: u64, dst: &mut [u8]) -> Result<(), LinkError> {
        self.core.lock().pool.read_into(group, address, dst)
    }

    pub fn is_group_empty(&self, group: GroupId) -> Result<bool, LinkError> {
        self.core.lock().pool.is_empty(group)
    }

    /// Run f with exclusive access to the span pool
    /// f must not call back into the dispatcher
    pub fn with_pool<R>(&self, f: impl FnOnce(&mut SpanPool) -> R) -> R {
        f(&mut self.core.lock().pool)
    }

    //-------------------------------------------------------------------------
    // Registration and completion

    /// Register a group for transfer on a channel
    /// The callback is called exactly once with (tag, group, status), unless the transfer is aborted
    /// On an external process channel the transfer is attempted immediately
    pub fn register<F>(&self, channel: ChannelId, group: GroupId, tag: u64, callback: F) -> Result<(), LinkError>
    where
        F: FnOnce(u64, GroupId, TransferStatus) + Send + 'static,
    {
        let transport = {
            let mut core = self.core.lock();
            let FetchCore { pool, channels } = &mut *core;
            let ch = channels.get_mut(channel)?;
            if ch.in_flight.is_some() {
                return Err(LinkError::AlreadyPending(channel));
            }
            if !pool.is_used(group) {
                return Err(group.invalid());
            }
            pool.set_completion(
                group,
                Completion {
                    tag,
                    callback: Box::new(callback),
                },
            )?;
            ch.clear_transfer();
            ch.in_flight = Some(group);
            let transport = ch.transport;
            channels.push_pending(channel, transport.kind());
            debug!("register {} on {} ({}), tag {}", group, channel, transport, tag);
            transport
        };

        if let Transport::ExternalProcess { pid } = transport {
            self.on_process_quiesced(pid);
        }
        Ok(())
    }

    /// Scheduler hook, called when a process is paused
    /// Performs all transfers pending for this process, returns the number of completed transfers
    pub fn on_process_quiesced(&self, pid: ProcessId) -> usize {
        let mut completions = Vec::new();
        {
            let mut core = self.core.lock();
            let FetchCore { pool, channels } = &mut *core;
            let candidates: Vec<ChannelId> = channels.pending(TransportKind::ExternalProcess).collect();
            for id in candidates {
                let Ok(ch) = channels.get_mut(id) else { continue };
                if ch.transport != (Transport::ExternalProcess { pid }) || ch.claimed {
                    continue;
                }
                let Some(group) = ch.in_flight else { continue };

                let status = if self.process.try_lock_process(pid) {
                    let ok = transfer_process(self.process.as_ref(), pid, pool, group);
                    self.process.unlock_process(pid);
                    if ok {
                        TransferStatus::Done
                    } else {
                        TransferStatus::Failed
                    }
                } else {
                    let now = self.process.now_ns();
                    match ch.deadline {
                        None => {
                            ch.deadline = Some(now.saturating_add(duration_ns(ch.timeout)));
                            debug!("process {} busy, {} retries until {:?}", pid, id, ch.timeout);
                            continue;
                        }
                        Some(deadline) if deadline >= now => continue,
                        Some(_) => {
                            warn!("process {} busy, {} timed out after {:?}", pid, id, ch.timeout);
                            TransferStatus::TimedOut
                        }
                    }
                };

                ch.clear_transfer();
                channels.remove_pending(id, TransportKind::ExternalProcess);
                if let Some(completion) = pool.take_completion(group) {
                    trace!("{} on {} complete: {:?}", group, id, status);
                    completions.push((completion, group, status));
                }
            }
        }

        let n = completions.len();
        for (completion, group, status) in completions {
            completion.fire(group, status);
        }
        n
    }

    /// Claim the oldest unclaimed transfer pending on a transport kind
    /// With a property, only channels with this connection number or handle are considered
    pub fn take_pending(&self, kind: TransportKind, property: Option<u32>) -> Option<PendingTransfer> {
        let mut core = self.core.lock();
        let FetchCore { pool, channels } = &mut *core;
        let channel = channels
            .pending(kind)
            .find(|id| channels.get(*id).is_ok_and(|c| !c.claimed && property.map_or(true, |p| c.transport.property() == p)))?;
        let ch = channels.get_mut(channel).ok()?;
        let group = ch.in_flight?;
        let direction = pool.direction(group).ok()?;
        let spans = pool
            .spans(group)
            .ok()?
            .map(|s| TransferSpan {
                address: s.address,
                data: s.bytes.to_vec(),
            })
            .collect();
        ch.claimed = true;
        trace!("claim {} on {}", group, channel);
        Some(PendingTransfer {
            channel,
            group,
            transport: ch.transport,
            direction,
            spans,
        })
    }

    /// Complete a transfer claimed with take_pending
    /// On a successful read the span data is copied back into the group before the completion is called
    pub fn complete_transfer(&self, transfer: PendingTransfer, status: TransferStatus) -> Result<(), LinkError> {
        let completion = {
            let mut core = self.core.lock();
            let FetchCore { pool, channels } = &mut *core;
            let ch = channels.get_mut(transfer.channel)?;
            if ch.in_flight != Some(transfer.group) || !ch.claimed {
                warn!("stale transfer of {} on {}", transfer.group, transfer.channel);
                return Err(transfer.group.invalid());
            }
            ch.clear_transfer();
            let kind = ch.transport.kind();
            channels.remove_pending(transfer.channel, kind);
            if status.is_success() && transfer.direction == Direction::Read {
                for span in &transfer.spans {
                    pool.write_from(transfer.group, span.address, &span.data)?;
                }
            }
            pool.take_completion(transfer.group)
        };
        trace!("{} on {} complete: {:?}", transfer.group, transfer.channel, status);
        if let Some(completion) = completion {
            completion.fire(transfer.group, status);
        }
        Ok(())
    }

    /// Abort the transfer of group on channel
    /// Only acts while the completion has not been called yet, the completion is dropped and the group released
    /// Returns the tag of the aborted registration
    pub fn abort(&self, channel: ChannelId, group: GroupId) -> Result<Option<u64>, LinkError> {
        let mut core = self.core.lock();
        let FetchCore { pool, channels } = &mut *core;
        let ch = channels.get_mut(channel)?;
        if ch.in_flight != Some(group) {
            return Ok(None);
        }
        let Some(completion) = pool.take_completion(group) else {
            return Ok(None);
        };
        ch.clear_transfer();
        let kind = ch.transport.kind();
        channels.remove_pending(channel, kind);
        pool.release(group)?;
        debug!("abort {} on {}", group, channel);
        Ok(Some(completion.tag))
    }
}

//----------------------------------------------------------------------------------------------
// Test module

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimProcess;
    use crossbeam_channel::{unbounded, Receiver};

    type Done = (u64, GroupId, TransferStatus);

    fn sink() -> (impl FnOnce(u64, GroupId, TransferStatus) + Send + 'static, Receiver<Done>) {
        let (tx, rx) = unbounded();
        (move |tag, group, status| tx.send((tag, group, status)).unwrap(), rx)
    }

    fn setup() -> (Arc<SimProcess>, Dispatcher) {
        let sim = Arc::new(SimProcess::new());
        sim.add_process(7, 0x1000, 0x100);
        let dispatcher = Dispatcher::new(sim.clone(), PoolConfig::default());
        (sim, dispatcher)
    }

    #[test]
    fn test_process_read_completes_on_register() {
        let (sim, d) = setup();
        sim.poke(7, 0x1010, &[1, 2, 3, 4]);
        let ch = d.open_channel(Transport::ExternalProcess { pid: 7 }, Duration::from_secs(1)).unwrap();
        let g = d.acquire_group(Direction::Read).unwrap();
        d.insert(g, 0x1010, 4, None).unwrap();
        let (cb, rx) = sink();
        d.register(ch, g, 33, cb).unwrap();

        assert_eq!(rx.try_recv().unwrap(), (33, g, TransferStatus::Done));
        let mut buf = [0u8; 4];
        d.read_into(g, 0x1010, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(d.in_flight_group(ch), None);
        assert_eq!(d.pending_count(TransportKind::ExternalProcess), 0);
    }

    #[test]
    fn test_process_write() {
        let (sim, d) = setup();
        let ch = d.open_channel(Transport::ExternalProcess { pid: 7 }, Duration::from_secs(1)).unwrap();
        let g = d.acquire_group(Direction::Write).unwrap();
        d.insert(g, 0x1020, 2, Some(&[0xAB, 0xCD])).unwrap();
        let (cb, rx) = sink();
        d.register(ch, g, 1, cb).unwrap();
        assert_eq!(rx.try_recv().unwrap().2, TransferStatus::Done);
        assert_eq!(sim.peek(7, 0x1020, 2).unwrap(), vec![0xAB, 0xCD]);
    }

    #[test]
    fn test_process_read_out_of_range_fails() {
        let (_sim, d) = setup();
        let ch = d.open_channel(Transport::ExternalProcess { pid: 7 }, Duration::from_secs(1)).unwrap();
        let g = d.acquire_group(Direction::Read).unwrap();
        d.insert(g, 0x5000, 4, None).unwrap();
        let (cb, rx) = sink();
        d.register(ch, g, 1, cb).unwrap();
        assert_eq!(rx.try_recv().unwrap().2, TransferStatus::Failed);
    }

    #[test]
    fn test_process_busy_until_deadline() {
        let (sim, d) = setup();
        sim.set_running(7, true);
        let ch = d.open_channel(Transport::ExternalProcess { pid: 7 }, Duration::from_millis(10)).unwrap();
        let g = d.acquire_group(Direction::Read).unwrap();
        d.insert(g, 0x1000, 4, None).unwrap();
        let (cb, rx) = sink();
        d.register(ch, g, 5, cb).unwrap();

        // First failed lock sets the deadline and requeues
        assert!(rx.try_recv().is_err());
        assert_eq!(d.channel_deadline(ch), Some(sim.now_ns() + 10_000_000));
        assert_eq!(d.in_flight_group(ch), Some(g));

        // Still before the deadline
        sim.advance(Duration::from_millis(10));
        assert_eq!(d.on_process_quiesced(7), 0);
        assert!(rx.try_recv().is_err());

        // Past the deadline
        sim.advance(Duration::from_millis(1));
        assert_eq!(d.on_process_quiesced(7), 1);
        assert_eq!(rx.try_recv().unwrap(), (5, g, TransferStatus::TimedOut));
        assert_eq!(d.in_flight_group(ch), None);
    }

    #[test]
    fn test_process_paused_later() {
        let (sim, d) = setup();
        sim.set_running(7, true);
        let ch = d.open_channel(Transport::ExternalProcess { pid: 7 }, Duration::from_secs(1)).unwrap();
        let g = d.acquire_group(Direction::Read).unwrap();
        d.insert(g, 0x1000, 4, None).unwrap();
        let (cb, rx) = sink();
        d.register(ch, g, 5, cb).unwrap();
        assert!(rx.try_recv().is_err());

        // Another process pausing does not complete it
        assert_eq!(d.on_process_quiesced(8), 0);

        sim.set_running(7, false);
        assert_eq!(d.on_process_quiesced(7), 1);
        assert_eq!(rx.try_recv().unwrap().2, TransferStatus::Done);
        assert_eq!(d.on_process_quiesced(7), 0, "completion fires only once");
    }

    #[test]
    fn test_register_twice_is_already_pending() {
        let (_sim, d) = setup();
        let ch = d.open_channel(Transport::Xcp { connection: 0 }, Duration::from_secs(1)).unwrap();
        let g1 = d.acquire_group(Direction::Read).unwrap();
        let g2 = d.acquire_group(Direction::Read).unwrap();
        let (cb1, _rx1) = sink();
        let (cb2, _rx2) = sink();
        d.register(ch, g1, 1, cb1).unwrap();
        assert!(matches!(d.register(ch, g2, 2, cb2), Err(LinkError::AlreadyPending(c)) if c == ch));
        assert_eq!(d.pending_count(TransportKind::Xcp), 1);
    }

    #[test]
    fn test_register_invalid_handles() {
        let (_sim, d) = setup();
        let ch = d.open_channel(Transport::Ccp { connection: 0 }, Duration::from_secs(1)).unwrap();
        let (cb, _rx) = sink();
        assert!(matches!(d.register(ch, GroupId::from_raw(9), 0, cb), Err(LinkError::InvalidHandle { kind: "group", .. })));
        let g = d.acquire_group(Direction::Read).unwrap();
        let (cb, _rx) = sink();
        assert!(matches!(d.register(ChannelId::from_raw(9), g, 0, cb), Err(LinkError::InvalidHandle { kind: "channel", .. })));
    }

    #[test]
    fn test_polling_driver() {
        let (_sim, d) = setup();
        let ch0 = d.open_channel(Transport::Xcp { connection: 0 }, Duration::from_secs(1)).unwrap();
        let ch1 = d.open_channel(Transport::Xcp { connection: 1 }, Duration::from_secs(1)).unwrap();
        let g0 = d.acquire_group(Direction::Read).unwrap();
        let g1 = d.acquire_group(Direction::Read).unwrap();
        d.insert(g0, 0x10, 2, None).unwrap();
        d.insert(g1, 0x20, 2, None).unwrap();
        let (cb0, rx0) = sink();
        let (cb1, rx1) = sink();
        d.register(ch0, g0, 10, cb0).unwrap();
        d.register(ch1, g1, 11, cb1).unwrap();

        assert!(d.take_pending(TransportKind::Ccp, None).is_none());
        let mut t = d.take_pending(TransportKind::Xcp, Some(1)).unwrap();
        assert_eq!((t.channel(), t.group(), t.direction()), (ch1, g1, Direction::Read));
        assert!(d.take_pending(TransportKind::Xcp, Some(1)).is_none(), "claimed transfers are not handed out twice");
        t.spans_mut()[0].data.copy_from_slice(&[5, 6]);
        d.complete_transfer(t, TransferStatus::Done).unwrap();
        assert_eq!(rx1.try_recv().unwrap(), (11, g1, TransferStatus::Done));
        let mut buf = [0u8; 2];
        d.read_into(g1, 0x20, &mut buf).unwrap();
        assert_eq!(buf, [5, 6]);

        // Failed reads leave the group untouched
        let mut t = d.take_pending(TransportKind::Xcp, None).unwrap();
        assert_eq!(t.channel(), ch0);
        t.spans_mut()[0].data.copy_from_slice(&[5, 6]);
        d.complete_transfer(t, TransferStatus::Failed).unwrap();
        assert_eq!(rx0.try_recv().unwrap().2, TransferStatus::Failed);
        d.read_into(g0, 0x10, &mut buf).unwrap();
        assert_eq!(buf, [0, 0]);
    }

    #[test]
    fn test_abort() {
        let (_sim, d) = setup();
        let ch = d.open_channel(Transport::Xcp { connection: 0 }, Duration::from_secs(1)).unwrap();
        let g = d.acquire_group(Direction::Read).unwrap();
        let (cb, rx) = sink();
        d.register(ch, g, 77, cb).unwrap();
        let t = d.take_pending(TransportKind::Xcp, None).unwrap();

        assert_eq!(d.abort(ch, g).unwrap(), Some(77));
        assert_eq!(d.abort(ch, g).unwrap(), None, "second abort is a no-op");
        assert!(d.with_pool(|p| !p.is_used(g)), "aborted group is released");
        assert_eq!(d.pending_count(TransportKind::Xcp), 0);

        // The driver completes too late
        assert!(d.complete_transfer(t, TransferStatus::Done).is_err());
        assert!(rx.try_recv().is_err(), "aborted completion never fires");

        // Channel is usable again
        let g = d.acquire_group(Direction::Read).unwrap();
        let (cb, _rx) = sink();
        d.register(ch, g, 78, cb).unwrap();
    }

    #[test]
    fn test_close_channel_in_flight() {
        let (_sim, d) = setup();
        let ch = d.open_channel(Transport::StaticFile { handle: 0 }, Duration::from_secs(1)).unwrap();
        let g = d.acquire_group(Direction::Write).unwrap();
        let (cb, rx) = sink();
        d.register(ch, g, 3, cb).unwrap();
        assert_eq!(d.close_channel(ch).unwrap(), Some((3, g)));
        assert!(rx.try_recv().is_err());
        assert_eq!(d.pending_count(TransportKind::StaticFile), 0);
        assert!(d.close_channel(ch).is_err());
        assert_eq!(d.open_channel_count(), 0);
    }
}
