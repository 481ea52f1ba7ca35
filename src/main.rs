// main
// cal_link demo application
//
// Runs a simulated external process with a few calibration items and reads and writes them
// through a CalLink, optionally reads from a static S19 image as well

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::Parser;
use crossbeam_channel::{unbounded, Receiver};

use cal_link::sim::{SimItem, SimProcess, TableAccessor};
use cal_link::*;

//-----------------------------------------------------------------------------
// Parameters

const DEFAULT_LOG_LEVEL: u8 = 3; // Info
const DEFAULT_TIMEOUT_MS: u64 = 1000;
const DEFAULT_CYCLES: u32 = 10;

const DEMO_PID: ProcessId = 1000;
const DEMO_BASE: u64 = 0x1000;

const COUNTER_ADDR: u64 = 0x1000; // u32
const CURVE_DIM_ADDR: u64 = 0x1010; // u16 entry count
const CURVE_ADDR: u64 = 0x1020; // u16 entries
const FLAGS_ADDR: u64 = 0x1040; // u8, low nibble writable

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(2);

//-----------------------------------------------------------------------------
// Command line arguments

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Log level (Off=0, Error=1, Warn=2, Info=3, Debug=4, Trace=5)
    #[arg(short, long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: u8,

    /// Process lock timeout in ms
    #[arg(short, long, default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Number of scheduler cycles to simulate
    #[arg(short, long, default_value_t = DEFAULT_CYCLES)]
    cycles: u32,

    /// S19 file to read from through a static image channel
    #[arg(long)]
    s19: Option<PathBuf>,

    /// Start address of the S19 image window
    #[arg(long, default_value_t = 0)]
    s19_offset: u64,

    /// Size of the S19 image window
    #[arg(long, default_value_t = 0x10000)]
    s19_size: usize,
}

type Outcome = (Vec<Element<Vec<u8>>>, BatchStatus);

fn open_channel(link: &CalLink<TableAccessor>, transport: Transport, timeout: Duration) -> Result<(LinkChannelId, Receiver<Outcome>), LinkError> {
    let (tx, rx) = unbounded();
    let channel = link.open_channel(LinkId(0), transport, Some(timeout), move |elements, status| {
        if tx.send((elements.to_vec(), *status)).is_err() {
            warn!("{} result dropped", status.request);
        }
    })?;
    Ok((channel, rx))
}

fn print_outcome(what: &str, outcome: &Outcome) {
    let (elements, status) = outcome;
    info!("{} {}: {} success={} round_trips={}", what, status.request, status.state, status.success, status.round_trips);
    for e in elements {
        match e.result() {
            Ok(v) => info!("  element {}: {:02X?}", e.index, v),
            Err(err) => warn!("  element {}: {}", e.index, err),
        }
    }
}

//-----------------------------------------------------------------------------
// Simulated process demo

fn process_demo(args: &Args) -> Result<(), LinkError> {
    let sim = Arc::new(SimProcess::new());
    sim.add_process(DEMO_PID, DEMO_BASE, 0x100);
    sim.poke(DEMO_PID, CURVE_DIM_ADDR, &4u16.to_le_bytes());
    for i in 0..4u16 {
        sim.poke(DEMO_PID, CURVE_ADDR + 2 * u64::from(i), &(i * 100).to_le_bytes());
    }
    sim.poke(DEMO_PID, FLAGS_ADDR, &[0xA0]);

    let accessor = TableAccessor::new(vec![
        SimItem::scalar(COUNTER_ADDR, 4),
        SimItem::array(CURVE_DIM_ADDR, CURVE_ADDR, 2),
        SimItem::bitfield(FLAGS_ADDR, 1, 0x0F),
    ]);
    let timeout = Duration::from_millis(args.timeout_ms);
    let mut link = CalLinkBuilder::new("process_demo").set_default_timeout(timeout).start(accessor, sim.clone())?;
    let (channel, results) = open_channel(&link, Transport::ExternalProcess { pid: DEMO_PID }, timeout)?;

    for cycle in 0..args.cycles {
        // The process runs one cycle and updates its counter
        sim.set_running(DEMO_PID, true);
        sim.poke(DEMO_PID, COUNTER_ADDR, &cycle.to_le_bytes());

        let mut block = link.element_block(3);
        block.push(Element::new(0, ElementFlags::empty()));
        block.push(Element::new(1, ElementFlags::PHYSICAL));
        if cycle % 2 == 1 {
            block.push(Element::new(2, ElementFlags::empty()).with_value(vec![(cycle & 0x0F) as u8]));
            link.submit_batch(channel, Direction::Write, block)?;
        } else {
            link.submit_batch(channel, Direction::Read, block)?;
        }

        // The scheduler pauses the process and lets pending transfers run until the batch is done
        std::thread::sleep(Duration::from_millis(1));
        sim.set_running(DEMO_PID, false);
        let outcome = loop {
            link.on_process_quiesced(DEMO_PID);
            match results.recv_timeout(Duration::from_millis(1)) {
                Ok(outcome) => break Some(outcome),
                Err(_) if sim.now_ns() > u64::from(cycle + 1) * 1_000_000_000 => break None,
                Err(_) => sim.advance(Duration::from_millis(1)),
            }
        };
        match outcome {
            Some(outcome) => print_outcome(&format!("cycle {}", cycle), &outcome),
            None => warn!("cycle {}: no result", cycle),
        }
    }

    info!("flags byte is {:02X?}", sim.peek(DEMO_PID, FLAGS_ADDR, 1));
    link.close_channel(channel)?;
    link.shutdown();
    Ok(())
}

//-----------------------------------------------------------------------------
// Static image demo

fn image_demo(args: &Args, path: &Path) -> Result<(), LinkError> {
    let image = BinImage::load_s19(&path, args.s19_offset, args.s19_size)?;
    info!("S19 image {:#x}+{:#x}", image.offset(), image.size());

    let accessor = TableAccessor::new(vec![SimItem::scalar(args.s19_offset, 4), SimItem::scalar(args.s19_offset + 4, 4)]);
    let link = CalLinkBuilder::new("image_demo").start(accessor, Arc::new(SimProcess::new()))?;
    let transport = StaticImageTransport::new(0, image, link.dispatcher().clone());
    let (channel, results) = open_channel(&link, transport.transport(), Duration::from_millis(args.timeout_ms))?;

    link.submit_batch(channel, Direction::Read, vec![Element::new(0, ElementFlags::empty()), Element::new(1, ElementFlags::empty())])?;
    let deadline = std::time::Instant::now() + CALLBACK_TIMEOUT;
    while std::time::Instant::now() < deadline {
        transport.service();
        if let Ok(outcome) = results.recv_timeout(Duration::from_millis(1)) {
            print_outcome("image", &outcome);
            return Ok(());
        }
    }
    warn!("image read: no result");
    Ok(())
}

//-----------------------------------------------------------------------------
// Demo application main

fn main() {
    println!("cal_link demo");

    // Args
    let args = Args::parse();
    let log_level = match args.log_level {
        0 => log::LevelFilter::Off,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        4 => log::LevelFilter::Debug,
        5 => log::LevelFilter::Trace,
        _ => log::LevelFilter::Error,
    };

    // Logging
    env_logger::Builder::new()
        .target(env_logger::Target::Stdout)
        .filter_level(log_level)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    if let Err(e) = process_demo(&args) {
        error!("process demo failed: {}", e);
        std::process::exit(1);
    }

    if let Some(path) = &args.s19 {
        if let Err(e) = image_demo(&args, path) {
            error!("image demo failed: {}", e);
            std::process::exit(1);
        }
    }

    info!("Exit");
}
