//-----------------------------------------------------------------------------
// Module link_harness
// Shared helpers for the link integration tests
// A caller channel with a result queue, and a polling XCP driver thread over a memory image

#![allow(dead_code)]

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;

use cal_link::sim::{SimProcess, TableAccessor};
use cal_link::*;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);
pub const QUIET_TIME: Duration = Duration::from_millis(200);

pub type Outcome = (Vec<Element<Vec<u8>>>, BatchStatus);

pub fn start_link(name: &str, accessor: TableAccessor, sim: &Arc<SimProcess>) -> CalLink<TableAccessor> {
    link_test::test_setup(log::LevelFilter::Info);
    CalLinkBuilder::new(name)
        .set_default_timeout(Duration::from_millis(50))
        .start(accessor, sim.clone())
        .unwrap()
}

/// Open a caller channel whose callback forwards every outcome to the returned queue
pub fn open(link: &CalLink<TableAccessor>, transport: Transport) -> (LinkChannelId, Receiver<Outcome>) {
    let (tx, rx) = unbounded();
    let channel = link
        .open_channel(LinkId(1), transport, None, move |elements, status| {
            tx.send((elements.to_vec(), *status)).unwrap();
        })
        .unwrap();
    (channel, rx)
}

/// Wait until the worker registered a transfer on channel
pub fn wait_in_flight(link: &CalLink<TableAccessor>, channel: LinkChannelId) -> GroupId {
    let deadline = Instant::now() + RECV_TIMEOUT;
    loop {
        if let Some(group) = link.in_flight_group(channel).unwrap() {
            return group;
        }
        assert!(Instant::now() < deadline, "no transfer registered on {}", channel);
        std::thread::sleep(Duration::from_millis(1));
    }
}

pub fn read(index: u32) -> Element<Vec<u8>> {
    Element::new(index, ElementFlags::empty())
}

pub fn write(index: u32, value: &[u8]) -> Element<Vec<u8>> {
    Element::new(index, ElementFlags::empty()).with_value(value.to_vec())
}

//-----------------------------------------------------------------------------
// Polling XCP driver

/// Serves XCP transfers of one connection from a memory image on its own thread
pub struct XcpDriver {
    memory: Arc<Mutex<BinImage>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<usize>>,
}

impl XcpDriver {
    pub fn start(dispatcher: Dispatcher, connection: u32, memory: BinImage) -> XcpDriver {
        let memory = Arc::new(Mutex::new(memory));
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let memory = memory.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut served = 0;
                while !stop.load(Ordering::Relaxed) {
                    let Some(mut transfer) = dispatcher.take_pending(TransportKind::Xcp, Some(connection)) else {
                        std::thread::sleep(Duration::from_micros(200));
                        continue;
                    };
                    assert_eq!(transfer.transport(), Transport::Xcp { connection });
                    let ok = {
                        let mut memory = memory.lock();
                        match transfer.direction() {
                            Direction::Read => transfer.spans_mut().iter_mut().all(|s| memory.read(s.address, &mut s.data)),
                            Direction::Write => transfer.spans().iter().all(|s| memory.write(s.address, &s.data)),
                        }
                    };
                    let status = if ok { TransferStatus::Done } else { TransferStatus::Failed };
                    dispatcher.complete_transfer(transfer, status).unwrap();
                    served += 1;
                }
                served
            })
        };
        XcpDriver {
            memory,
            stop,
            handle: Some(handle),
        }
    }

    pub fn memory(&self) -> parking_lot::MutexGuard<'_, BinImage> {
        self.memory.lock()
    }

    /// Stop the driver thread, returns the number of transfers served
    pub fn stop(&mut self) -> usize {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.take().map_or(0, |h| h.join().unwrap())
    }
}

impl Drop for XcpDriver {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}
