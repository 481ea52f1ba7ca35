//-----------------------------------------------------------------------------
// Module elements
// Recycled element blocks
// Batches carry their elements in Vec blocks, which return here after the terminal callback

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use parking_lot::Mutex;

use super::request::Element;

#[derive(Debug)]
struct FreeBlocks<V> {
    blocks: Vec<Vec<Element<V>>>,
    // Blocks handed out and not returned yet
    outstanding: usize,
}

/// Free list of element blocks, a block is reused if its capacity fits the requested count
/// The free list never holds more blocks than were handed out, blocks of other origin are dropped
#[derive(Debug)]
pub(crate) struct ElementPool<V> {
    free: Mutex<FreeBlocks<V>>,
    min_block: usize,
}

impl<V> ElementPool<V> {
    pub fn new(min_block: usize) -> ElementPool<V> {
        ElementPool {
            free: Mutex::new(FreeBlocks {
                blocks: Vec::new(),
                outstanding: 0,
            }),
            min_block,
        }
    }

    /// Empty block with capacity for at least count elements
    pub fn acquire(&self, count: usize) -> Vec<Element<V>> {
        let mut free = self.free.lock();
        free.outstanding += 1;
        if let Some(i) = free.blocks.iter().position(|b| b.capacity() >= count) {
            return free.blocks.swap_remove(i);
        }
        drop(free);
        trace!("new element block for {} elements", count);
        Vec::with_capacity(count.max(self.min_block))
    }

    pub fn recycle(&self, mut block: Vec<Element<V>>) {
        let mut free = self.free.lock();
        if free.outstanding == 0 || block.capacity() == 0 {
            return;
        }
        free.outstanding -= 1;
        block.clear();
        free.blocks.push(block);
    }

    #[cfg(test)]
    pub fn free_count(&self) -> usize {
        self.free.lock().blocks.len()
    }
}

//----------------------------------------------------------------------------------------------
// Test module
