//-----------------------------------------------------------------------------
// Module span_pool
// Coalescing store of target address spans
// A span group holds a sorted list of non-touching spans, each with its own byte buffer
// Spans are allocated from an arena and recycled through a free list, groups through a slot array

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::fmt;

use super::{Completion, Direction, GroupId, LinkError, Slots};

//----------------------------------------------------------------------------------------------
// PoolConfig

/// Buffer sizing parameters of the span pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Minimum buffer capacity of a freshly allocated span
    pub min_span_capacity: u32,
    /// Extra capacity added when a span buffer has to grow
    pub span_growth_slack: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_span_capacity: 64,
            span_growth_slack: 64,
        }
    }
}

//----------------------------------------------------------------------------------------------
// Span and SpanGroup

type SpanIndex = u32;

#[derive(Debug)]
struct Span {
    address: u64,
    size: u32,
    buffer: Vec<u8>, // buffer.len() is the capacity
    next: Option<SpanIndex>,
}

impl Span {
    fn end(&self) -> u64 {
        self.address + u64::from(self.size)
    }
}

#[derive(Debug, Default)]
struct SpanGroup {
    direction: Direction,
    head: Option<SpanIndex>,
    tail: Option<SpanIndex>,
    completion: Option<Completion>,
}

/// A span of a group, as seen by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanRef<'a> {
    pub address: u64,
    pub bytes: &'a [u8],
}

// Grow a span buffer to at least needed bytes, new bytes are zero
fn ensure_capacity(buffer: &mut Vec<u8>, needed: usize, slack: usize) -> Result<(), LinkError> {
    if buffer.len() < needed {
        let new_len = needed + slack;
        buffer.try_reserve_exact(new_len - buffer.len()).map_err(|_| LinkError::OutOfMemory("span buffer"))?;
        buffer.resize(new_len, 0);
    }
    Ok(())
}

//----------------------------------------------------------------------------------------------
// SpanPool

/// Arena of spans and span groups
#[derive(Debug)]
pub struct SpanPool {
    config: PoolConfig,
    spans: Vec<Span>,
    free_spans: Option<SpanIndex>,
    groups: Slots<SpanGroup>,
}

impl Default for SpanPool {
    fn default() -> Self {
        SpanPool::new(PoolConfig::default())
    }
}

impl SpanPool {
    pub fn new(config: PoolConfig) -> SpanPool {
        SpanPool {
            config,
            spans: Vec::new(),
            free_spans: None,
            groups: Slots::new("span group"),
        }
    }

    pub fn config(&self) -> PoolConfig {
        self.config
    }

    fn group(&self, group: GroupId) -> Result<&SpanGroup, LinkError> {
        self.groups.get(group.0).ok_or_else(|| group.invalid())
    }

    fn group_mut(&mut self, group: GroupId) -> Result<&mut SpanGroup, LinkError> {
        self.groups.get_mut(group.0).ok_or_else(|| group.invalid())
    }

    /// Acquire an empty span group
    pub fn acquire(&mut self, direction: Direction) -> Result<GroupId, LinkError> {
        let id = self.groups.insert(SpanGroup {
            direction,
            ..Default::default()
        })?;
        trace!("acquire group#{} {}", id, direction);
        Ok(GroupId(id))
    }

    /// Release a span group, all its spans go back to the free list
    /// A completion still owned by the group is dropped without being called
    pub fn release(&mut self, group: GroupId) -> Result<(), LinkError> {
        let g = self.groups.remove(group.0).ok_or_else(|| group.invalid())?;
        if g.completion.is_some() {
            debug!("{} released with a pending completion", group);
        }
        if let (Some(head), Some(tail)) = (g.head, g.tail) {
            self.spans[tail as usize].next = self.free_spans;
            self.free_spans = Some(head);
        }
        trace!("release {}", group);
        Ok(())
    }

    pub fn is_used(&self, group: GroupId) -> bool {
        self.groups.contains(group.0)
    }

    pub fn direction(&self, group: GroupId) -> Result<Direction, LinkError> {
        Ok(self.group(group)?.direction)
    }

    /// True if the group has no spans
    pub fn is_empty(&self, group: GroupId) -> Result<bool, LinkError> {
        Ok(self.group(group)?.head.is_none())
    }

    /// Number of spans in a group
    pub fn span_count(&self, group: GroupId) -> Result<usize, LinkError> {
        Ok(self.iter(self.group(group)?.head).count())
    }

    /// Number of spans in the free list
    pub fn free_span_count(&self) -> usize {
        let mut n = 0;
        let mut cur = self.free_spans;
        while let Some(i) = cur {
            n += 1;
            cur = self.spans[i as usize].next;
        }
        n
    }

    /// Number of spans ever allocated
    pub fn allocated_span_count(&self) -> usize {
        self.spans.len()
    }

    /// Number of groups in use
    pub fn groups_in_use(&self) -> usize {
        self.groups.used()
    }

    // Take a span with at least size bytes capacity from the free list or allocate a new one
    fn alloc_span(&mut self, address: u64, size: u32) -> Result<SpanIndex, LinkError> {
        let mut prev: Option<SpanIndex> = None;
        let mut cur = self.free_spans;
        while let Some(i) = cur {
            let next = self.spans[i as usize].next;
            if self.spans[i as usize].buffer.len() >= size as usize {
                match prev {
                    Some(p) => self.spans[p as usize].next = next,
                    None => self.free_spans = next,
                }
                let span = &mut self.spans[i as usize];
                span.address = address;
                span.size = size;
                span.next = None;
                span.buffer[..size as usize].fill(0);
                return Ok(i);
            }
            prev = cur;
            cur = next;
        }

        let capacity = size.max(self.config.min_span_capacity) as usize;
        let mut buffer = Vec::new();
        buffer.try_reserve_exact(capacity).map_err(|_| LinkError::OutOfMemory("span buffer"))?;
        buffer.resize(capacity, 0);
        self.spans.try_reserve(1).map_err(|_| LinkError::OutOfMemory("span"))?;
        let i = SpanIndex::try_from(self.spans.len()).map_err(|_| LinkError::OutOfMemory("span"))?;
        self.spans.push(Span {
            address,
            size,
            buffer,
            next: None,
        });
        Ok(i)
    }

    fn free_span(&mut self, i: SpanIndex) {
        self.spans[i as usize].next = self.free_spans;
        self.free_spans = Some(i);
    }

    /// Add the range address..address+size to a group
    /// The range is merged with every span it overlaps or touches, the group stays sorted and non-touching
    /// With data, the bytes are copied into the range and win over existing content
    /// Without data, new bytes are zero and existing bytes are kept
    pub fn insert(&mut self, group: GroupId, address: u64, size: u32, data: Option<&[u8]>) -> Result<(), LinkError> {
        let head = self.group(group)?.head;
        let end = address.checked_add(u64::from(size)).ok_or(LinkError::AddressRange { address, size })?;
        if size == 0 {
            return Ok(());
        }

        // Find the first span which does not end before the new range
        let mut prev: Option<SpanIndex> = None;
        let mut cur = head;
        while let Some(i) = cur {
            let span = &self.spans[i as usize];
            if span.end() >= address {
                if span.address <= end {
                    return self.merge(group, i, address, end, data);
                }
                break;
            }
            prev = cur;
            cur = span.next;
        }

        // No overlap, link a new span between prev and cur
        let i = self.alloc_span(address, size)?;
        self.spans[i as usize].next = cur;
        if let Some(p) = prev {
            self.spans[p as usize].next = Some(i);
        }
        if let Some(d) = data {
            let n = d.len().min(size as usize);
            self.spans[i as usize].buffer[..n].copy_from_slice(&d[..n]);
        }
        let g = self.group_mut(group)?;
        if prev.is_none() {
            g.head = Some(i);
        }
        if cur.is_none() {
            g.tail = Some(i);
        }
        trace!("{} new span {:#x}+{}", group, address, size);
        Ok(())
    }

    // Merge address..end into span i and absorb all following spans the merged range reaches
    fn merge(&mut self, group: GroupId, i: SpanIndex, address: u64, end: u64, data: Option<&[u8]>) -> Result<(), LinkError> {
        let (old_start, old_size, old_end) = {
            let span = &self.spans[i as usize];
            (span.address, span.size as usize, span.end())
        };
        let new_start = old_start.min(address);
        let mut new_end = old_end.max(end);

        let first_absorbed = self.spans[i as usize].next;
        let mut after = first_absorbed;
        let mut absorbed = 0;
        while let Some(n) = after {
            let span = &self.spans[n as usize];
            if span.address > new_end {
                break;
            }
            new_end = new_end.max(span.end());
            absorbed += 1;
            after = span.next;
        }

        let new_size = u32::try_from(new_end - new_start).map_err(|_| LinkError::AddressRange {
            address: new_start,
            size: u32::MAX,
        })?;
        let shift = (old_start - new_start) as usize;
        let slack = self.config.span_growth_slack as usize;
        {
            let span = &mut self.spans[i as usize];
            ensure_capacity(&mut span.buffer, new_size as usize, slack)?;
            if shift > 0 {
                span.buffer.copy_within(0..old_size, shift);
                span.buffer[..shift].fill(0);
            }
            span.buffer[shift + old_size..new_size as usize].fill(0);
            span.address = new_start;
            span.size = new_size;
            span.next = after;
        }

        // Copy the absorbed spans and recycle them
        let mut cur = first_absorbed;
        while cur != after {
            let Some(n) = cur else { break };
            let src = std::mem::take(&mut self.spans[n as usize].buffer);
            let (offset, len, next) = {
                let span = &self.spans[n as usize];
                ((span.address - new_start) as usize, span.size as usize, span.next)
            };
            self.spans[i as usize].buffer[offset..offset + len].copy_from_slice(&src[..len]);
            self.spans[n as usize].buffer = src;
            self.free_span(n);
            cur = next;
        }

        // New data wins
        if let Some(d) = data {
            let offset = (address - new_start) as usize;
            let n = d.len().min((end - address) as usize);
            self.spans[i as usize].buffer[offset..offset + n].copy_from_slice(&d[..n]);
        }

        if after.is_none() {
            self.group_mut(group)?.tail = Some(i);
        }
        trace!(
            "{} merge {:#x}..{:#x} into span {:#x}+{}, absorbed {}",
            group,
            address,
            end,
            new_start,
            new_size,
            absorbed
        );
        Ok(())
    }

    fn iter(&self, head: Option<SpanIndex>) -> SpanIter<'_> {
        SpanIter { pool: self, cur: head }
    }

    /// Iterate the spans of a group in ascending address order
    pub fn spans(&self, group: GroupId) -> Result<SpanIter<'_>, LinkError> {
        Ok(self.iter(self.group(group)?.head))
    }

    /// Call f with the address and the mutable bytes of each span in ascending order
    /// Stops at the first span for which f returns false, returns true if all spans were visited
    pub fn for_each_span_mut<F>(&mut self, group: GroupId, mut f: F) -> Result<bool, LinkError>
    where
        F: FnMut(u64, &mut [u8]) -> bool,
    {
        let mut cur = self.group(group)?.head;
        while let Some(i) = cur {
            let span = &mut self.spans[i as usize];
            let size = span.size as usize;
            if !f(span.address, &mut span.buffer[..size]) {
                return Ok(false);
            }
            cur = span.next;
        }
        Ok(true)
    }

    /// Copy the bytes of address..address+dst.len() out of a group
    /// Bytes not covered by any span are zero
    pub fn read_into(&self, group: GroupId, address: u64, dst: &mut [u8]) -> Result<(), LinkError> {
        let head = self.group(group)?.head;
        dst.fill(0);
        let end = address.saturating_add(dst.len() as u64);
        for span in self.iter(head) {
            let span_end = span.address + span.bytes.len() as u64;
            if span.address >= end {
                break;
            }
            let lo = span.address.max(address);
            let hi = span_end.min(end);
            if lo < hi {
                dst[(lo - address) as usize..(hi - address) as usize].copy_from_slice(&span.bytes[(lo - span.address) as usize..(hi - span.address) as usize]);
            }
        }
        Ok(())
    }

    /// Copy src into the spans of a group at address, bytes outside of any span are ignored
    pub fn write_from(&mut self, group: GroupId, address: u64, src: &[u8]) -> Result<(), LinkError> {
        let end = address.saturating_add(src.len() as u64);
        self.for_each_span_mut(group, |span_address, bytes| {
            let span_end = span_address + bytes.len() as u64;
            if span_address >= end {
                return false;
            }
            let lo = span_address.max(address);
            let hi = span_end.min(end);
            if lo < hi {
                bytes[(lo - span_address) as usize..(hi - span_address) as usize].copy_from_slice(&src[(lo - address) as usize..(hi - address) as usize]);
            }
            true
        })?;
        Ok(())
    }

    //-------------------------------------------------------------------------
    // Completion ownership

    pub(crate) fn set_completion(&mut self, group: GroupId, completion: Completion) -> Result<(), LinkError> {
        self.group_mut(group)?.completion = Some(completion);
        Ok(())
    }

    pub(crate) fn take_completion(&mut self, group: GroupId) -> Option<Completion> {
        self.groups.get_mut(group.0)?.completion.take()
    }

    pub(crate) fn has_completion(&self, group: GroupId) -> bool {
        self.groups.get(group.0).is_some_and(|g| g.completion.is_some())
    }

    /// Printable view of a group
    pub fn dump(&self, group: GroupId) -> GroupDump<'_> {
        GroupDump { pool: self, group }
    }
}

//----------------------------------------------------------------------------------------------
// SpanIter

pub struct SpanIter<'a> {
    pool: &'a SpanPool,
    cur: Option<SpanIndex>,
}

impl<'a> Iterator for SpanIter<'a> {
    type Item = SpanRef<'a>;

    fn next(&mut self) -> Option<SpanRef<'a>> {
        let span = &self.pool.spans[self.cur? as usize];
        self.cur = span.next;
        Some(SpanRef {
            address: span.address,
            bytes: &span.buffer[..span.size as usize],
        })
    }
}

//----------------------------------------------------------------------------------------------
// GroupDump

pub struct GroupDump<'a> {
    pool: &'a SpanPool,
    group: GroupId,
}

impl fmt::Display for GroupDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(g) = self.pool.groups.get(self.group.0) else {
            return write!(f, "{} unused", self.group);
        };
        write!(f, "{} {}:", self.group, g.direction)?;
        let mut cur = g.head;
        while let Some(i) = cur {
            let span = &self.pool.spans[i as usize];
            write!(f, "\n  {:#010x}[{}]:", span.address, span.size)?;
            for b in &span.buffer[..span.size as usize] {
                write!(f, " {:02X}", b)?;
            }
            cur = span.next;
        }
        Ok(())
    }
}

//----------------------------------------------------------------------------------------------
// Test module
