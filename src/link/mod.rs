//-----------------------------------------------------------------------------
// Module link
// Calibration data link
// Public facade: caller channel handles, batch submission, abort and the worker thread lifecycle

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::fetch::{ChannelId, Direction, Dispatcher, GroupId, LinkChannelId, LinkError, ProcessAccess, ProcessId, RequestId, Slots, Transport};

mod config;
pub use config::LinkConfig;

mod elements;
use elements::ElementPool;

mod request;
pub use request::{AccessPhase, AccessRequest, BatchCallback, BatchStatus, Element, ElementAccessor, ElementFlags, GroupRole, LinkId, PhaseGroups, RequestState};
use request::BatchRequest;

mod worker;
pub use worker::{AckSender, CallbackAck};
use worker::Worker;

//----------------------------------------------------------------------------------------------
// Shared link state

struct LinkChannel<V> {
    link: LinkId,
    fetch_channel: ChannelId,
    callback: BatchCallback<V>,
}

/// Caller channel handles and request ids, shared by the callers and the worker
pub(crate) struct LinkShared<V> {
    channels: Slots<LinkChannel<V>>,
    requests: Slots<()>,
}

impl<V> LinkShared<V> {
    fn new() -> LinkShared<V> {
        LinkShared {
            channels: Slots::new("link channel"),
            requests: Slots::new("request"),
        }
    }
}

//----------------------------------------------------------------------------------------------
// CalLinkBuilder

/// Builder for a CalLink
#[derive(Debug, Clone)]
pub struct CalLinkBuilder {
    name: String,
    config: LinkConfig,
}

impl CalLinkBuilder {
    pub fn new(name: &str) -> CalLinkBuilder {
        CalLinkBuilder {
            name: name.to_string(),
            config: LinkConfig::default(),
        }
    }

    /// Replace the whole configuration
    #[must_use]
    pub fn set_config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    /// Lock timeout of external process channels opened without an explicit timeout
    #[must_use]
    pub fn set_default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn set_min_span_capacity(mut self, capacity: u32) -> Self {
        self.config.min_span_capacity = capacity;
        self
    }

    #[must_use]
    pub fn set_span_growth_slack(mut self, slack: u32) -> Self {
        self.config.span_growth_slack = slack;
        self
    }

    #[must_use]
    pub fn set_min_element_block(mut self, count: usize) -> Self {
        self.config.min_element_block = count;
        self
    }

    /// Start the worker thread
    /// The accessor moves to the worker thread, process gives access to external process memory
    pub fn start<A: ElementAccessor>(self, accessor: A, process: Arc<dyn ProcessAccess>) -> Result<CalLink<A>, LinkError> {
        let dispatcher = Dispatcher::new(process, self.config.pool_config());
        let shared = Arc::new(Mutex::new(LinkShared::new()));
        let elements = Arc::new(ElementPool::new(self.config.min_element_block));
        let (control_tx, control_rx) = unbounded();
        let (submit_tx, submit_rx) = unbounded();
        let acks = AckSender::new(control_tx);

        let worker = Worker::new(accessor, dispatcher.clone(), acks.clone(), control_rx, submit_rx, shared.clone(), elements.clone());
        let handle = std::thread::Builder::new().name(self.config.worker_name.clone()).spawn(move || worker.run())?;
        info!("Start link {} with worker thread {}", self.name, self.config.worker_name);

        Ok(CalLink {
            name: self.name,
            config: self.config,
            dispatcher,
            shared,
            elements,
            acks,
            submit: Some(submit_tx),
            worker: Some(handle),
        })
    }
}

//----------------------------------------------------------------------------------------------
// CalLink

/// Asynchronous calibration data link
/// Batches are executed on a worker thread, their callbacks are called there
pub struct CalLink<A: ElementAccessor> {
    name: String,
    config: LinkConfig,
    dispatcher: Dispatcher,
    shared: Arc<Mutex<LinkShared<A::Value>>>,
    elements: Arc<ElementPool<A::Value>>,
    acks: AckSender,
    submit: Option<Sender<BatchRequest<A::Value>>>,
    worker: Option<JoinHandle<()>>,
}

impl<A: ElementAccessor> std::fmt::Debug for CalLink<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalLink").field("name", &self.name).field("config", &self.config).finish_non_exhaustive()
    }
}

impl<A: ElementAccessor> CalLink<A> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Dispatcher for transport drivers and the scheduler
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Sender for transfer completions from other threads
    pub fn ack_sender(&self) -> AckSender {
        self.acks.clone()
    }

    fn fetch_channel_of(&self, channel: LinkChannelId) -> Result<ChannelId, LinkError> {
        let shared = self.shared.lock();
        shared.channels.get(channel.0).map(|c| c.fetch_channel).ok_or_else(|| channel.invalid())
    }

    /// Open a caller channel on a transport
    /// The callback is called once for every batch submitted on this channel
    pub fn open_channel<F>(&self, link: LinkId, transport: Transport, timeout: Option<Duration>, callback: F) -> Result<LinkChannelId, LinkError>
    where
        F: Fn(&mut [Element<A::Value>], &BatchStatus) + Send + Sync + 'static,
    {
        let fetch_channel = self.dispatcher.open_channel(transport, timeout.unwrap_or_else(|| self.config.default_timeout()))?;
        let id = self.shared.lock().channels.insert(LinkChannel {
            link,
            fetch_channel,
            callback: Arc::new(callback),
        });
        match id {
            Ok(id) => {
                let id = LinkChannelId(id);
                info!("Open {} on {}", id, transport);
                Ok(id)
            }
            Err(e) => {
                error!("open channel on {}: {}", transport, e);
                self.dispatcher.close_channel(fetch_channel)?;
                Err(e)
            }
        }
    }

    /// Close a caller channel
    /// A transfer in flight is abandoned, its batch is called back with state Error
    pub fn close_channel(&self, channel: LinkChannelId) -> Result<(), LinkError> {
        let c = self.shared.lock().channels.remove(channel.0).ok_or_else(|| channel.invalid())?;
        info!("Close {}", channel);
        if let Some((tag, group)) = self.dispatcher.close_channel(c.fetch_channel)? {
            self.acks.retire(request_of(tag)?, group, true)?;
        }
        Ok(())
    }

    /// Empty element block with capacity for at least count elements
    pub fn element_block(&self, count: usize) -> Vec<Element<A::Value>> {
        self.elements.acquire(count)
    }

    /// Submit a batch, the channel callback reports the outcome
    pub fn submit_batch(&self, channel: LinkChannelId, direction: Direction, elements: Vec<Element<A::Value>>) -> Result<RequestId, LinkError> {
        let Some(submit) = self.submit.as_ref() else {
            return Err(LinkError::WorkerStopped);
        };
        let req = {
            let mut shared = self.shared.lock();
            let c = shared.channels.get(channel.0).ok_or_else(|| channel.invalid())?;
            let (link, fetch_channel, callback) = (c.link, c.fetch_channel, c.callback.clone());
            let id = RequestId(shared.requests.insert(())?);
            BatchRequest::new(id, link, channel, fetch_channel, direction, elements, callback)
        };
        let id = req.id();
        debug!("Submit {} {} on {}", id, direction, channel);
        if submit.send(req).is_err() {
            self.shared.lock().requests.remove(id.0);
            return Err(LinkError::WorkerStopped);
        }
        Ok(id)
    }

    /// Group of the transfer in flight on a caller channel
    pub fn in_flight_group(&self, channel: LinkChannelId) -> Result<Option<GroupId>, LinkError> {
        Ok(self.dispatcher.in_flight_group(self.fetch_channel_of(channel)?))
    }

    /// Abort the transfer of group on a caller channel
    /// The batch is retired without a callback, returns false if the transfer had already completed
    pub fn abort(&self, channel: LinkChannelId, group: GroupId) -> Result<bool, LinkError> {
        let fetch_channel = self.fetch_channel_of(channel)?;
        match self.dispatcher.abort(fetch_channel, group)? {
            Some(tag) => {
                self.acks.retire(request_of(tag)?, group, false)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Scheduler hook, see Dispatcher::on_process_quiesced
    pub fn on_process_quiesced(&self, pid: ProcessId) -> usize {
        self.dispatcher.on_process_quiesced(pid)
    }

    /// Post a transfer completion from another thread
    pub fn post_ack(&self, ack: CallbackAck) -> Result<(), LinkError> {
        self.acks.post_ack(ack)
    }

    /// Stop the worker thread and wait for it
    /// Batches still in flight are cancelled and called back with state Error
    pub fn shutdown(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };
        if self.acks.shutdown().is_err() {
            warn!("link {} worker already gone", self.name);
        }
        self.submit = None;
        if handle.join().is_err() {
            error!("link {} worker thread panicked", self.name);
        }
        info!("Link {} stopped", self.name);
    }
}

impl<A: ElementAccessor> Drop for CalLink<A> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn request_of(tag: u64) -> Result<RequestId, LinkError> {
    u32::try_from(tag).map(RequestId).map_err(|_| RequestId(u32::MAX).invalid())
}

//-------------------------------------------------------------------------------------------------
// Test helpers

#[doc(hidden)]
pub mod link_test {
    use std::sync::Once;

    static TEST_INIT: Once = Once::new();

    /// Initialize logging once for all tests of a test binary
    pub fn test_setup(level: log::LevelFilter) {
        TEST_INIT.call_once(|| {
            env_logger::Builder::new()
                .target(env_logger::Target::Stdout)
                .filter_level(level)
                .format_timestamp(None)
                .format_module_path(false)
                .format_target(false)
                .is_test(true)
                .init();
        });
    }
}

//----------------------------------------------------------------------------------------------
// Test module

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimItem, SimProcess, TableAccessor};
    use crossbeam_channel::Receiver;

    type Outcome = (Vec<Element<Vec<u8>>>, BatchStatus);

    fn start(sim: &Arc<SimProcess>) -> CalLink<TableAccessor> {
        link_test::test_setup(log::LevelFilter::Info);
        let accessor = TableAccessor::new(vec![SimItem::scalar(0x100, 2), SimItem::scalar(0x104, 4)]);
        CalLinkBuilder::new("test").set_default_timeout(Duration::from_millis(20)).start(accessor, sim.clone()).unwrap()
    }

    fn open(link: &CalLink<TableAccessor>, transport: Transport) -> (LinkChannelId, Receiver<Outcome>) {
        let (tx, rx) = unbounded();
        let ch = link
            .open_channel(LinkId(0), transport, None, move |elements, status| {
                tx.send((elements.to_vec(), *status)).unwrap();
            })
            .unwrap();
        (ch, rx)
    }

    #[test]
    fn test_read_from_process() {
        let sim = Arc::new(SimProcess::new());
        sim.add_process(11, 0x100, 0x10);
        sim.poke(11, 0x100, &[0x34, 0x12, 0, 0, 0xEF, 0xBE, 0xAD, 0xDE]);
        let link = start(&sim);
        let (ch, rx) = open(&link, Transport::ExternalProcess { pid: 11 });

        let mut block = link.element_block(2);
        block.push(Element::new(0, ElementFlags::empty()));
        block.push(Element::new(1, ElementFlags::PHYSICAL).with_user_tag(5));
        let id = link.submit_batch(ch, Direction::Read, block).unwrap();

        let (elements, status) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(status.request, id);
        assert_eq!(status.channel, ch);
        assert_eq!(status.state, RequestState::Successful);
        assert!(status.success);
        assert_eq!(elements[0].result().unwrap(), &vec![0x34, 0x12]);
        assert_eq!(elements[1].result().unwrap(), &vec![0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(elements[1].user_tag, 5);
    }

    #[test]
    fn test_caller_blocks_do_not_grow_element_pool() {
        let sim = Arc::new(SimProcess::new());
        sim.add_process(12, 0x100, 0x10);
        let link = start(&sim);
        let (ch, rx) = open(&link, Transport::ExternalProcess { pid: 12 });

        for _ in 0..100 {
            link.submit_batch(ch, Direction::Read, vec![Element::new(0, ElementFlags::empty())]).unwrap();
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        let block = link.element_block(1);
        link.submit_batch(ch, Direction::Read, block).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // The callback runs before the block is recycled
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while link.elements.free_count() == 0 {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(link.elements.free_count(), 1);
    }

    #[test]
    fn test_invalid_channel_handle() {
        let sim = Arc::new(SimProcess::new());
        let link = start(&sim);
        let bogus = LinkChannelId::from_raw(3);
        assert!(matches!(link.submit_batch(bogus, Direction::Read, Vec::new()), Err(LinkError::InvalidHandle { .. })));
        assert!(link.close_channel(bogus).is_err());
        assert!(link.abort(bogus, GroupId::from_raw(0)).is_err());
    }

    #[test]
    fn test_submit_after_shutdown() {
        let sim = Arc::new(SimProcess::new());
        let mut link = start(&sim);
        let (ch, _rx) = open(&link, Transport::Xcp { connection: 0 });
        link.shutdown();
        assert!(matches!(link.submit_batch(ch, Direction::Read, Vec::new()), Err(LinkError::WorkerStopped)));
    }

    #[test]
    fn test_shutdown_cancels_pending_batch() {
        let sim = Arc::new(SimProcess::new());
        let mut link = start(&sim);
        let (ch, rx) = open(&link, Transport::Xcp { connection: 0 });
        link.submit_batch(ch, Direction::Read, vec![Element::new(0, ElementFlags::empty())]).unwrap();

        // Wait until the worker registered the transfer
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while link.in_flight_group(ch).unwrap().is_none() {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        link.shutdown();
        let (_, status) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(status.state, RequestState::Error);
        assert_eq!(link.in_flight_group(ch).unwrap(), None);
    }
}
