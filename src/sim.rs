//-----------------------------------------------------------------------------
// Module sim
// Simulated targets for the demo and for tests
// SimProcess stands in for the scheduler's process memory access,
// TableAccessor is an element accessor driven by a small table of calibration items

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::fetch::{ProcessAccess, ProcessId};
use crate::link::{AccessPhase, AccessRequest, ElementAccessor, GroupRole, PhaseGroups};

//----------------------------------------------------------------------------------------------
// SimProcess

#[derive(Debug)]
struct SimTarget {
    base: u64,
    memory: Vec<u8>,
    running: bool,
    locked: bool,
}

impl SimTarget {
    fn range(&self, address: u64, len: usize) -> io::Result<std::ops::Range<usize>> {
        let offset = address.checked_sub(self.base).ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "address below process memory"))?;
        let start = usize::try_from(offset).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "address out of range"))?;
        let end = start.checked_add(len).filter(|end| *end <= self.memory.len());
        end.map(|end| start..end)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "address above process memory"))
    }
}

/// Simulated processes with a flat memory window each and a manual clock
/// A running process refuses the memory lock
#[derive(Debug, Default)]
pub struct SimProcess {
    targets: Mutex<HashMap<ProcessId, SimTarget>>,
    now_ns: AtomicU64,
    lock_count: AtomicU64,
}

impl SimProcess {
    pub fn new() -> SimProcess {
        SimProcess::default()
    }

    /// Add a paused process with size bytes of zeroed memory at base
    pub fn add_process(&self, pid: ProcessId, base: u64, size: usize) {
        self.targets.lock().insert(
            pid,
            SimTarget {
                base,
                memory: vec![0; size],
                running: false,
                locked: false,
            },
        );
    }

    pub fn set_running(&self, pid: ProcessId, running: bool) {
        if let Some(t) = self.targets.lock().get_mut(&pid) {
            t.running = running;
        }
    }

    /// Write process memory from outside, returns false if out of range
    pub fn poke(&self, pid: ProcessId, address: u64, bytes: &[u8]) -> bool {
        let mut targets = self.targets.lock();
        let Some(t) = targets.get_mut(&pid) else { return false };
        match t.range(address, bytes.len()) {
            Ok(r) => {
                t.memory[r].copy_from_slice(bytes);
                true
            }
            Err(_) => false,
        }
    }

    /// Read process memory from outside
    pub fn peek(&self, pid: ProcessId, address: u64, len: usize) -> Option<Vec<u8>> {
        let targets = self.targets.lock();
        let t = targets.get(&pid)?;
        let r = t.range(address, len).ok()?;
        Some(t.memory[r].to_vec())
    }

    pub fn advance(&self, d: Duration) {
        self.now_ns.fetch_add(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Number of successful process locks
    pub fn lock_count(&self) -> u64 {
        self.lock_count.load(Ordering::Relaxed)
    }
}

impl ProcessAccess for SimProcess {
    fn try_lock_process(&self, pid: ProcessId) -> bool {
        let mut targets = self.targets.lock();
        match targets.get_mut(&pid) {
            Some(t) if !t.running && !t.locked => {
                t.locked = true;
                self.lock_count.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    fn unlock_process(&self, pid: ProcessId) {
        if let Some(t) = self.targets.lock().get_mut(&pid) {
            t.locked = false;
        }
    }

    fn read_process_bytes(&self, pid: ProcessId, address: u64, dst: &mut [u8]) -> io::Result<usize> {
        let targets = self.targets.lock();
        let t = targets.get(&pid).ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such process"))?;
        if !t.locked {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "process not locked"));
        }
        let r = t.range(address, dst.len())?;
        dst.copy_from_slice(&t.memory[r]);
        Ok(dst.len())
    }

    fn write_process_bytes(&self, pid: ProcessId, address: u64, src: &[u8]) -> io::Result<usize> {
        let mut targets = self.targets.lock();
        let t = targets.get_mut(&pid).ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such process"))?;
        if !t.locked {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "process not locked"));
        }
        let r = t.range(address, src.len())?;
        t.memory[r].copy_from_slice(src);
        Ok(src.len())
    }

    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::Relaxed)
    }
}

//----------------------------------------------------------------------------------------------
// TableAccessor

/// Calibration item of a TableAccessor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimItem {
    /// Address of the item value
    pub address: u64,
    /// Size of the value, or of one array entry
    pub size: u32,
    /// Address of a little endian u16 entry count, for arrays
    pub dimension: Option<u64>,
    /// Bits of a little endian value which a write may change, the others are kept
    pub bit_mask: Option<u32>,
}

impl SimItem {
    pub fn scalar(address: u64, size: u32) -> SimItem {
        SimItem {
            address,
            size,
            dimension: None,
            bit_mask: None,
        }
    }

    pub fn array(dimension: u64, address: u64, entry_size: u32) -> SimItem {
        SimItem {
            address,
            size: entry_size,
            dimension: Some(dimension),
            bit_mask: None,
        }
    }

    pub fn bitfield(address: u64, size: u32, bit_mask: u32) -> SimItem {
        SimItem {
            address,
            size: size.min(4),
            dimension: None,
            bit_mask: Some(bit_mask),
        }
    }
}

/// Element accessor over a table of items, element index is the table index
/// Values are the raw little endian bytes of an item
#[derive(Debug, Default)]
pub struct TableAccessor {
    items: Vec<SimItem>,
    failing: HashSet<u32>,
}

impl TableAccessor {
    pub fn new(items: Vec<SimItem>) -> TableAccessor {
        TableAccessor {
            items,
            failing: HashSet::new(),
        }
    }

    /// Let every access to an element index fail
    pub fn fail_index(&mut self, index: u32) {
        self.failing.insert(index);
    }

    fn data_size(item: &SimItem, groups: &PhaseGroups<'_>) -> u32 {
        match item.dimension {
            Some(dim) => {
                let mut count = [0u8; 2];
                // Unknown dimension reads as zero entries
                if groups.read(GroupRole::Dimension, dim, &mut count).is_err() {
                    return 0;
                }
                u32::from(u16::from_le_bytes(count)) * item.size
            }
            None => item.size,
        }
    }

    fn mask_bytes(item: &SimItem) -> Option<[u8; 4]> {
        item.bit_mask.map(u32::to_le_bytes)
    }
}

impl ElementAccessor for TableAccessor {
    type Value = Vec<u8>;

    fn access(&mut self, request: AccessRequest<'_>, value: Option<Vec<u8>>, groups: &mut PhaseGroups<'_>) -> Option<Vec<u8>> {
        let item = match self.items.get(request.index as usize) {
            Some(item) if !self.failing.contains(&request.index) => item,
            _ => {
                *request.error = Some(format!("no item {}", request.index));
                return None;
            }
        };

        let result = match request.phase {
            // Read path
            AccessPhase::DimensionRequest => match item.dimension {
                Some(dim) => groups.request(GroupRole::Dimension, dim, 2).map(|()| value.unwrap_or_default()),
                None => Ok(value.unwrap_or_default()),
            },
            AccessPhase::DataRequest => {
                let size = Self::data_size(item, groups);
                groups.request(GroupRole::Data, item.address, size).map(|()| value.unwrap_or_default())
            }
            AccessPhase::ExtractValue => {
                let mut bytes = vec![0; Self::data_size(item, groups) as usize];
                groups.read(GroupRole::Data, item.address, &mut bytes).map(|()| bytes)
            }

            // Write path
            AccessPhase::MaskRequest => {
                let Some(value) = value else {
                    *request.error = Some("no value to write".into());
                    return None;
                };
                if value.len() != item.size as usize && item.dimension.is_none() {
                    *request.error = Some(format!("value size {} != {}", value.len(), item.size));
                    return None;
                }
                match item.bit_mask {
                    Some(_) => groups.request(GroupRole::Dimension, item.address, item.size).map(|()| value),
                    None => Ok(value),
                }
            }
            AccessPhase::WriteDataRequest => {
                let mut bytes = value.unwrap_or_default();
                if let Some(mask) = Self::mask_bytes(item) {
                    let mut current = vec![0; bytes.len()];
                    if let Err(e) = groups.read(GroupRole::Dimension, item.address, &mut current) {
                        *request.error = Some(e.to_string());
                        return None;
                    }
                    for (i, b) in bytes.iter_mut().enumerate() {
                        *b = (current[i] & !mask[i]) | (*b & mask[i]);
                    }
                }
                groups.write(GroupRole::Data, item.address, &bytes).map(|()| bytes)
            }
        };

        match result {
            Ok(v) => Some(v),
            Err(e) => {
                *request.error = Some(e.to_string());
                None
            }
        }
    }
}

//----------------------------------------------------------------------------------------------
// Test module

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_process_lock() {
        let sim = SimProcess::new();
        sim.add_process(1, 0x100, 16);
        assert!(sim.poke(1, 0x104, &[1, 2]));
        assert!(!sim.poke(1, 0x10F, &[1, 2]));

        let mut buf = [0u8; 2];
        assert!(sim.read_process_bytes(1, 0x104, &mut buf).is_err(), "unlocked access is refused");
        assert!(sim.try_lock_process(1));
        assert!(!sim.try_lock_process(1), "lock is exclusive");
        assert_eq!(sim.read_process_bytes(1, 0x104, &mut buf).unwrap(), 2);
        assert_eq!(buf, [1, 2]);
        assert!(sim.read_process_bytes(1, 0xFF, &mut buf).is_err());
        sim.unlock_process(1);

        sim.set_running(1, true);
        assert!(!sim.try_lock_process(1));
        assert!(!sim.try_lock_process(2));
        assert_eq!(sim.lock_count(), 1);
    }

    #[test]
    fn test_sim_clock() {
        let sim = SimProcess::new();
        assert_eq!(sim.now_ns(), 0);
        sim.advance(Duration::from_micros(3));
        assert_eq!(sim.now_ns(), 3000);
    }
}
