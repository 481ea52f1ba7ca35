//-----------------------------------------------------------------------------
// Module worker
// Link worker thread
// Owns the element accessor and all batch requests
// Transfer acks and control messages are always served before new batches are started

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crossbeam_channel::{Receiver, Select, Sender, TryRecvError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::elements::ElementPool;
use super::request::{BatchRequest, ElementAccessor, Step};
use super::LinkShared;
use crate::fetch::{ChannelId, Dispatcher, GroupId, LinkError, RequestId, TransferStatus};

//----------------------------------------------------------------------------------------------
// Callback ack

/// Completion of a registered transfer, sent to the worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackAck {
    pub request: RequestId,
    pub group: GroupId,
    pub status: TransferStatus,
}

#[derive(Debug)]
pub(crate) enum Control {
    Ack(CallbackAck),
    /// The awaited transfer of a request was abandoned, notify selects whether the caller still gets the callback
    Retire { request: RequestId, group: GroupId, notify: bool },
    Shutdown,
}

/// Sender side of the worker control queue, may be used from any thread
#[derive(Debug, Clone)]
pub struct AckSender {
    tx: Sender<Control>,
}

impl AckSender {
    pub(crate) fn new(tx: Sender<Control>) -> AckSender {
        AckSender { tx }
    }

    /// Post a transfer completion to the worker
    pub fn post_ack(&self, ack: CallbackAck) -> Result<(), LinkError> {
        self.tx.send(Control::Ack(ack)).map_err(|_| LinkError::WorkerStopped)
    }

    pub(crate) fn retire(&self, request: RequestId, group: GroupId, notify: bool) -> Result<(), LinkError> {
        self.tx.send(Control::Retire { request, group, notify }).map_err(|_| LinkError::WorkerStopped)
    }

    pub(crate) fn shutdown(&self) -> Result<(), LinkError> {
        self.tx.send(Control::Shutdown).map_err(|_| LinkError::WorkerStopped)
    }

    /// Completion callback for a dispatcher registration, the tag is the request id
    pub(crate) fn completion(&self) -> impl FnOnce(u64, GroupId, TransferStatus) + Send + 'static {
        let acks = self.clone();
        move |tag, group, status| {
            let Ok(id) = u32::try_from(tag) else {
                error!("completion with invalid request tag {}", tag);
                return;
            };
            let ack = CallbackAck {
                request: RequestId(id),
                group,
                status,
            };
            if acks.post_ack(ack).is_err() {
                warn!("ack of {} for {} dropped, worker stopped", group, ack.request);
            }
        }
    }
}

//----------------------------------------------------------------------------------------------
// Worker

pub(crate) struct Worker<A: ElementAccessor> {
    accessor: A,
    dispatcher: Dispatcher,
    acks: AckSender,
    control: Receiver<Control>,
    submissions: Receiver<BatchRequest<A::Value>>,
    shared: Arc<Mutex<LinkShared<A::Value>>>,
    elements: Arc<ElementPool<A::Value>>,
    active: HashMap<RequestId, BatchRequest<A::Value>>,
    // Fetch channels with an active request and the requests waiting for them
    busy: HashMap<ChannelId, VecDeque<BatchRequest<A::Value>>>,
}

impl<A: ElementAccessor> Worker<A> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        accessor: A,
        dispatcher: Dispatcher,
        acks: AckSender,
        control: Receiver<Control>,
        submissions: Receiver<BatchRequest<A::Value>>,
        shared: Arc<Mutex<LinkShared<A::Value>>>,
        elements: Arc<ElementPool<A::Value>>,
    ) -> Worker<A> {
        Worker {
            accessor,
            dispatcher,
            acks,
            control,
            submissions,
            shared,
            elements,
            active: HashMap::new(),
            busy: HashMap::new(),
        }
    }

    /// Worker thread main loop
    pub fn run(mut self) {
        info!("link worker started");
        loop {
            // Control messages and acks first
            match self.control.try_recv() {
                Ok(msg) => {
                    if !self.handle(msg) {
                        break;
                    }
                    continue;
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => break,
            }

            match self.submissions.try_recv() {
                Ok(req) => {
                    self.launch(req);
                    continue;
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => break,
            }

            // Wait for either queue
            let mut sel = Select::new();
            sel.recv(&self.control);
            sel.recv(&self.submissions);
            sel.ready();
        }
        self.stop();
    }

    // Returns false on shutdown
    fn handle(&mut self, msg: Control) -> bool {
        match msg {
            Control::Ack(ack) => {
                trace!("ack {:?}", ack);
                let Some(mut req) = self.active.remove(&ack.request) else {
                    warn!("ack for unknown {}", ack.request);
                    return true;
                };
                let step = req.on_ack(&mut self.accessor, &self.dispatcher, &self.acks, ack.group, ack.status);
                self.settle(req, step);
            }
            Control::Retire { request, group, notify } => {
                let Some(mut req) = self.active.remove(&request) else {
                    debug!("retire of unknown {}", request);
                    return true;
                };
                if !req.retire(&self.dispatcher, group) {
                    self.active.insert(request, req);
                    return true;
                }
                let channel = req.fetch_channel();
                if notify {
                    self.deliver(req);
                } else {
                    self.recycle(req);
                }
                if let Some(next) = self.next_waiting(channel) {
                    self.run_channel(next);
                }
            }
            Control::Shutdown => return false,
        }
        true
    }

    // Start a request, or queue it behind the active request of its fetch channel
    fn launch(&mut self, req: BatchRequest<A::Value>) {
        let channel = req.fetch_channel();
        if let Some(waiting) = self.busy.get_mut(&channel) {
            debug!("{} waits for {}", req.id(), channel);
            waiting.push_back(req);
            return;
        }
        self.busy.insert(channel, VecDeque::new());
        self.run_channel(req);
    }

    // Start requests of one fetch channel until one waits for a transfer
    fn run_channel(&mut self, req: BatchRequest<A::Value>) {
        let channel = req.fetch_channel();
        let mut next = Some(req);
        while let Some(mut req) = next.take() {
            match req.start(&mut self.accessor, &self.dispatcher, &self.acks) {
                Step::Waiting => {
                    self.active.insert(req.id(), req);
                }
                Step::Finished => {
                    self.deliver(req);
                    next = self.next_waiting(channel);
                }
            }
        }
    }

    fn settle(&mut self, req: BatchRequest<A::Value>, step: Step) {
        match step {
            Step::Waiting => {
                self.active.insert(req.id(), req);
            }
            Step::Finished => {
                let channel = req.fetch_channel();
                self.deliver(req);
                if let Some(next) = self.next_waiting(channel) {
                    self.run_channel(next);
                }
            }
        }
    }

    // Next request waiting for a fetch channel, the channel becomes idle if there is none
    fn next_waiting(&mut self, channel: ChannelId) -> Option<BatchRequest<A::Value>> {
        if let Some(req) = self.busy.get_mut(&channel).and_then(VecDeque::pop_front) {
            return Some(req);
        }
        self.busy.remove(&channel);
        None
    }

    // Terminal callback, then free the request id and the element block
    fn deliver(&mut self, mut req: BatchRequest<A::Value>) {
        req.notify();
        self.recycle(req);
    }

    fn recycle(&mut self, req: BatchRequest<A::Value>) {
        self.shared.lock().requests.remove(req.id().0);
        self.elements.recycle(req.into_elements());
    }

    // Cancel everything still in flight, every caller still gets its callback
    fn stop(&mut self) {
        let mut cancelled: Vec<BatchRequest<A::Value>> = self.active.drain().map(|(_, req)| req).collect();
        for (_, waiting) in self.busy.drain() {
            cancelled.extend(waiting);
        }
        cancelled.extend(self.submissions.try_iter());
        if !cancelled.is_empty() {
            info!("link worker cancels {} requests", cancelled.len());
        }
        for mut req in cancelled {
            req.cancel(&self.dispatcher);
            self.deliver(req);
        }
        info!("link worker stopped");
    }
}
