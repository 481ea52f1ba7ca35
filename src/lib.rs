//-----------------------------------------------------------------------------
// Crate cal_link
// Path: src/lib.rs

//
// Use cargo test --features=serde -- --nocapture

// This crate is a library
#![crate_type = "lib"]
// The library crate is named "cal_link"
#![crate_name = "cal_link"]
//
//
#![warn(clippy::pedantic)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::struct_field_names)]
#![allow(clippy::unreadable_literal)]
#![allow(clippy::if_not_else)]
#![allow(clippy::wildcard_imports)]
#![allow(clippy::cast_lossless)]
//
#![allow(clippy::cast_possible_truncation)]

//! Asynchronous calibration data link
//!
//! Reads and writes batches of calibration elements from external processes, XCP/CCP connections
//! or static memory images. Each batch runs through at most two transport round trips on a
//! worker thread; address ranges requested by the elements are coalesced into span groups first.
//!
//! ## Example
//!
//! ```no_run
//! use cal_link::*;
//! use cal_link::sim::{SimItem, SimProcess, TableAccessor};
//! use std::sync::Arc;
//!
//! let sim = Arc::new(SimProcess::new());
//! sim.add_process(42, 0x1000, 0x100);
//! let accessor = TableAccessor::new(vec![SimItem::scalar(0x1000, 4)]);
//! let link = CalLinkBuilder::new("demo").start(accessor, sim).unwrap();
//! let channel = link
//!     .open_channel(LinkId(0), Transport::ExternalProcess { pid: 42 }, None, |elements, status| {
//!         println!("{:?}: {:?}", status.state, elements[0].value);
//!     })
//!     .unwrap();
//! link.submit_batch(channel, Direction::Read, vec![Element::new(0, ElementFlags::empty())]).unwrap();
//! ```

// Submodule fetch
mod fetch;
pub use fetch::ChannelId;
pub use fetch::CompletionFn;
pub use fetch::Direction;
pub use fetch::Dispatcher;
pub use fetch::GroupDump;
pub use fetch::GroupId;
pub use fetch::LinkChannelId;
pub use fetch::LinkError;
pub use fetch::PendingTransfer;
pub use fetch::PoolConfig;
pub use fetch::ProcessAccess;
pub use fetch::ProcessId;
pub use fetch::RequestId;
pub use fetch::SpanIter;
pub use fetch::SpanPool;
pub use fetch::SpanRef;
pub use fetch::TransferSpan;
pub use fetch::TransferStatus;
pub use fetch::Transport;
pub use fetch::TransportKind;

// Submodule link
mod link;
pub use link::link_test;
pub use link::AccessPhase;
pub use link::AccessRequest;
pub use link::AckSender;
pub use link::BatchCallback;
pub use link::BatchStatus;
pub use link::CalLink;
pub use link::CalLinkBuilder;
pub use link::CallbackAck;
pub use link::Element;
pub use link::ElementAccessor;
pub use link::ElementFlags;
pub use link::GroupRole;
pub use link::LinkConfig;
pub use link::LinkId;
pub use link::PhaseGroups;
pub use link::RequestState;

// Submodule image
mod image;
pub use image::BinImage;
pub use image::StaticImageTransport;

// Simulated targets
pub mod sim;
