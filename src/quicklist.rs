//! Doubly linked list of packed-list nodes with interior compression
//!
//! The list type's backing store. Entries live in fixed-capacity
//! [`PackedList`] segments chained through a slab arena; segments far
//! enough from both ends are held as LZ4 blocks and inflated on demand.
//! Node capacity is bounded by `fill`: positive values cap entries per
//! node, negative values select a byte budget from a fixed ladder.

use crate::packed::PackedList;
use tracing::trace;

/// Byte budgets for fill = -1 .. -5.
const FILL_SIZES: [usize; 5] = [4096, 8192, 16384, 32768, 65536];

/// Hard per-node byte cap applied regardless of a positive fill.
const SIZE_SAFETY_LIMIT: usize = 8192;

/// Per-entry encoding overhead estimate used for capacity checks
/// (worst-case prevlen + encoding header).
const ENTRY_OVERHEAD: usize = 11;

/// Nodes smaller than this never compress profitably.
const MIN_COMPRESS_BYTES: usize = 48;

/// Compression must save at least this many bytes to be kept.
const MIN_COMPRESS_IMPROVE: usize = 8;

#[derive(Debug, Clone)]
enum NodeData {
    Raw(PackedList),
    /// LZ4 block plus the exact inflated size.
    Compressed(Vec<u8>),
}

#[derive(Debug, Clone)]
struct Node {
    prev: Option<u32>,
    next: Option<u32>,
    data: NodeData,
    /// Entries in this node.
    count: u32,
    /// Inflated blob size, kept valid in both states.
    raw_len: u32,
    /// Transiently decompressed; the next compression pass restores it.
    recompress: bool,
    /// Compression was tried and did not pay; skip future attempts until
    /// the node changes again.
    attempted_compress: bool,
}

#[derive(Debug, Clone)]
enum Slot {
    Free(Option<u32>),
    Busy(Box<Node>),
}

/// Position of one entry: node slot + entry index inside the node.
pub type EntryHandle = (u32, u32);

#[derive(Debug, Clone)]
pub struct Quicklist {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    count: usize,
    node_count: usize,
    fill: i32,
    compress_depth: u32,
}

impl Quicklist {
    pub fn new(fill: i32, compress_depth: u32) -> Self {
        let fill = fill.clamp(-5, i32::MAX);
        Self {
            slots: Vec::new(),
            free_head: None,
            head: None,
            tail: None,
            count: 0,
            node_count: 0,
            fill,
            compress_depth,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn fill(&self) -> i32 {
        self.fill
    }

    pub fn compress_depth(&self) -> u32 {
        self.compress_depth
    }

    /// (entry count, compressed?) for every node, head to tail. Drives
    /// introspection and the invariant tests.
    pub fn node_summary(&self) -> Vec<(usize, bool)> {
        let mut out = Vec::with_capacity(self.node_count);
        let mut cur = self.head;
        while let Some(i) = cur {
            let n = self.node(i);
            out.push((n.count as usize, matches!(n.data, NodeData::Compressed(_))));
            cur = n.next;
        }
        out
    }

    /// Raw LZ4 image of a node, when it is currently compressed.
    pub fn node_compressed_blob(&self, index: usize) -> Option<&[u8]> {
        let mut cur = self.head;
        let mut i = 0;
        while let Some(s) = cur {
            let n = self.node(s);
            if i == index {
                return match &n.data {
                    NodeData::Compressed(blob) => Some(blob),
                    NodeData::Raw(_) => None,
                };
            }
            i += 1;
            cur = n.next;
        }
        None
    }

    // ---- arena ----

    fn node(&self, i: u32) -> &Node {
        match &self.slots[i as usize] {
            Slot::Busy(n) => n,
            Slot::Free(_) => unreachable!("free slot dereferenced"),
        }
    }

    fn node_mut(&mut self, i: u32) -> &mut Node {
        match &mut self.slots[i as usize] {
            Slot::Busy(n) => n,
            Slot::Free(_) => unreachable!("free slot dereferenced"),
        }
    }

    fn alloc(&mut self, node: Node) -> u32 {
        match self.free_head {
            Some(i) => {
                self.free_head = match self.slots[i as usize] {
                    Slot::Free(next) => next,
                    Slot::Busy(_) => unreachable!("free list points at busy slot"),
                };
                self.slots[i as usize] = Slot::Busy(Box::new(node));
                i
            }
            None => {
                self.slots.push(Slot::Busy(Box::new(node)));
                (self.slots.len() - 1) as u32
            }
        }
    }

    fn release(&mut self, i: u32) {
        self.slots[i as usize] = Slot::Free(self.free_head);
        self.free_head = Some(i);
    }

    fn new_node(pl: PackedList) -> Node {
        let raw_len = pl.blob_len() as u32;
        let count = pl.len() as u32;
        Node {
            prev: None,
            next: None,
            data: NodeData::Raw(pl),
            count,
            raw_len,
            recompress: false,
            attempted_compress: false,
        }
    }

    fn link_between(&mut self, idx: u32, prev: Option<u32>, next: Option<u32>) {
        {
            let n = self.node_mut(idx);
            n.prev = prev;
            n.next = next;
        }
        match prev {
            Some(p) => self.node_mut(p).next = Some(idx),
            None => self.head = Some(idx),
        }
        match next {
            Some(x) => self.node_mut(x).prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.node_count += 1;
    }

    fn unlink(&mut self, idx: u32) {
        let (prev, next) = {
            let n = self.node(idx);
            (n.prev, n.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(x) => self.node_mut(x).prev = prev,
            None => self.tail = prev,
        }
        self.node_count -= 1;
        self.release(idx);
    }

    // ---- compression ----

    fn compress_node(&mut self, idx: u32) {
        let node = self.node_mut(idx);
        node.recompress = false;
        if node.attempted_compress {
            return;
        }
        let raw = match &node.data {
            NodeData::Raw(pl) => pl,
            NodeData::Compressed(_) => return,
        };
        if raw.blob_len() < MIN_COMPRESS_BYTES {
            return;
        }
        let bytes = raw.as_bytes();
        match lz4::block::compress(bytes, None, false) {
            Ok(blob) if blob.len() + MIN_COMPRESS_IMPROVE < bytes.len() => {
                node.raw_len = bytes.len() as u32;
                node.data = NodeData::Compressed(blob);
            }
            Ok(_) | Err(_) => {
                // Incompressible payload; remember and keep it raw.
                node.attempted_compress = true;
            }
        }
    }

    fn decompress_node(&mut self, idx: u32, transient: bool) {
        let node = self.node_mut(idx);
        let blob = match &node.data {
            NodeData::Compressed(b) => b,
            NodeData::Raw(_) => {
                if transient {
                    // Already raw; nothing to restore later.
                } else {
                    node.recompress = false;
                }
                return;
            }
        };
        let raw = lz4::block::decompress(blob, Some(node.raw_len as i32))
            .expect("lz4 inflate of a node we compressed ourselves");
        node.data = NodeData::Raw(PackedList::from_bytes(raw));
        node.recompress = transient;
    }

    /// Restore the depth invariant around `target`: nodes within
    /// `compress_depth` of either end stay raw, the first node past the
    /// window on each side gets (re)compressed, and `target` itself is
    /// compressed when it sits in the interior. With no target (after a
    /// node deletion shifted the window) only the boundary is repaired.
    fn compress_window(&mut self, target: Option<u32>) {
        if self.compress_depth == 0 {
            return;
        }
        let mut forward = self.head;
        let mut reverse = self.tail;
        let mut in_window = false;
        for _ in 0..self.compress_depth {
            let (f, r) = match (forward, reverse) {
                (Some(f), Some(r)) => (f, r),
                _ => return,
            };
            self.decompress_node(f, false);
            self.decompress_node(r, false);
            if Some(f) == target || Some(r) == target {
                in_window = true;
            }
            if f == r || self.node(f).next == Some(r) {
                return;
            }
            forward = self.node(f).next;
            reverse = self.node(r).prev;
        }
        if let Some(t) = target {
            if !in_window {
                self.compress_node(t);
            }
        }
        if let Some(f) = forward {
            if Some(f) != target {
                self.compress_node(f);
            }
        }
        if let Some(r) = reverse {
            if Some(r) != target {
                self.compress_node(r);
            }
        }
    }

    fn recompress_if_pending(&mut self, idx: u32) {
        if self.node(idx).recompress {
            self.compress_node(idx);
        }
    }

    // ---- capacity ----

    fn node_allows(&self, idx: u32, extra_bytes: usize) -> bool {
        let node = self.node(idx);
        let new_size = node.raw_len as usize + extra_bytes + ENTRY_OVERHEAD;
        if self.fill < 0 {
            new_size <= FILL_SIZES[(-self.fill - 1) as usize]
        } else {
            new_size <= SIZE_SAFETY_LIMIT && (node.count as usize) < self.fill as usize
        }
    }

    fn refresh_node_stats(&mut self, idx: u32) {
        let node = self.node_mut(idx);
        if let NodeData::Raw(pl) = &node.data {
            node.raw_len = pl.blob_len() as u32;
            node.count = pl.len() as u32;
            node.attempted_compress = false;
        }
    }

    // ---- push / pop ----

    pub fn push_tail(&mut self, data: &[u8]) {
        match self.tail {
            Some(t) if self.node_allows(t, data.len()) => {
                self.decompress_node(t, true);
                if let NodeData::Raw(pl) = &mut self.node_mut(t).data {
                    pl.push(data, false);
                }
                self.refresh_node_stats(t);
                self.recompress_if_pending(t);
            }
            _ => {
                let mut pl = PackedList::new();
                pl.push(data, false);
                let idx = self.alloc(Self::new_node(pl));
                let prev = self.tail;
                self.link_between(idx, prev, None);
                self.compress_window(Some(idx));
            }
        }
        self.count += 1;
    }

    pub fn push_head(&mut self, data: &[u8]) {
        match self.head {
            Some(h) if self.node_allows(h, data.len()) => {
                self.decompress_node(h, true);
                if let NodeData::Raw(pl) = &mut self.node_mut(h).data {
                    pl.push(data, true);
                }
                self.refresh_node_stats(h);
                self.recompress_if_pending(h);
            }
            _ => {
                let mut pl = PackedList::new();
                pl.push(data, true);
                let idx = self.alloc(Self::new_node(pl));
                let next = self.head;
                self.link_between(idx, None, next);
                self.compress_window(Some(idx));
            }
        }
        self.count += 1;
    }

    pub fn pop(&mut self, head: bool) -> Option<Vec<u8>> {
        let idx = if head { self.head? } else { self.tail? };
        self.decompress_node(idx, true);
        let value;
        let now_empty;
        {
            let node = self.node_mut(idx);
            let pl = match &mut node.data {
                NodeData::Raw(pl) => pl,
                NodeData::Compressed(_) => unreachable!(),
            };
            let at = if head {
                pl.head_offset()?
            } else {
                pl.tail_offset()?
            };
            value = pl.get(at).to_vec();
            pl.delete(at);
            now_empty = pl.is_empty();
        }
        self.count -= 1;
        if now_empty {
            self.unlink(idx);
            // A node left the compress window; repair the boundary.
            self.compress_window(None);
        } else {
            self.refresh_node_stats(idx);
            self.recompress_if_pending(idx);
        }
        Some(value)
    }

    // ---- indexed access ----

    /// Locate an entry by list index; negative indexes from the tail.
    /// Walks node counts from the nearer end, then offsets inside the
    /// winning node.
    pub fn locate(&self, index: i64) -> Option<EntryHandle> {
        let count = self.count as i64;
        let forward = index >= 0;
        let target = if forward { index } else { -index - 1 };
        if target >= count {
            return None;
        }
        let mut seen = 0i64;
        let mut cur = if forward { self.head } else { self.tail };
        while let Some(i) = cur {
            let n = self.node(i);
            let nc = n.count as i64;
            if seen + nc > target {
                let in_node = target - seen;
                let idx = if forward { in_node } else { nc - 1 - in_node };
                return Some((i, idx as u32));
            }
            seen += nc;
            cur = if forward { n.next } else { n.prev };
        }
        None
    }

    /// Read the entry at `index`.
    pub fn get(&mut self, index: i64) -> Option<Vec<u8>> {
        let (node, idx) = self.locate(index)?;
        self.decompress_node(node, true);
        let value = {
            let pl = self.raw_list(node);
            let p = pl.entry_offset(idx as i64)?;
            pl.get(p).to_vec()
        };
        self.recompress_if_pending(node);
        Some(value)
    }

    /// Compare the entry at `handle` with raw bytes.
    pub fn compare(&mut self, handle: EntryHandle, other: &[u8]) -> bool {
        let (node, idx) = handle;
        self.decompress_node(node, true);
        let res = {
            let pl = self.raw_list(node);
            match pl.entry_offset(idx as i64) {
                Some(p) => pl.compare(p, other),
                None => false,
            }
        };
        self.recompress_if_pending(node);
        res
    }

    fn raw_list(&self, idx: u32) -> &PackedList {
        match &self.node(idx).data {
            NodeData::Raw(pl) => pl,
            NodeData::Compressed(_) => unreachable!("node not inflated"),
        }
    }

    fn raw_list_mut(&mut self, idx: u32) -> &mut PackedList {
        match &mut self.node_mut(idx).data {
            NodeData::Raw(pl) => pl,
            NodeData::Compressed(_) => unreachable!("node not inflated"),
        }
    }

    /// Replace the entry at `index`. Delete plus insert at the same spot.
    pub fn replace_at(&mut self, index: i64, data: &[u8]) -> bool {
        let (node, idx) = match self.locate(index) {
            Some(h) => h,
            None => return false,
        };
        self.decompress_node(node, true);
        {
            let pl = self.raw_list_mut(node);
            let p = match pl.entry_offset(idx as i64) {
                Some(p) => p,
                None => return false,
            };
            pl.replace(p, data);
        }
        self.refresh_node_stats(node);
        self.recompress_if_pending(node);
        true
    }

    // ---- insert / delete around a handle ----

    /// Insert `data` before or after the entry at `handle`, splitting the
    /// node when it is at capacity.
    pub fn insert_at(&mut self, handle: EntryHandle, after: bool, data: &[u8]) {
        let (node, idx) = handle;
        let full = !self.node_allows(node, data.len());
        let node_entries = self.node(node).count;
        let at_head_edge = !after && idx == 0;
        let at_tail_edge = after && idx + 1 == node_entries;

        if !full {
            self.decompress_node(node, true);
            {
                let pl = self.raw_list_mut(node);
                let p = pl.entry_offset(idx as i64).expect("stale entry handle");
                if after {
                    pl.insert_after(p, data);
                } else {
                    pl.insert_before(p, data);
                }
            }
            self.refresh_node_stats(node);
            self.recompress_if_pending(node);
            self.count += 1;
            return;
        }

        if at_tail_edge {
            // Spill into the next node's head, or a fresh node in between.
            let next = self.node(node).next;
            match next {
                Some(nx) if self.node_allows(nx, data.len()) => {
                    self.decompress_node(nx, true);
                    self.raw_list_mut(nx).push(data, true);
                    self.refresh_node_stats(nx);
                    self.recompress_if_pending(nx);
                }
                _ => {
                    let mut pl = PackedList::new();
                    pl.push(data, false);
                    let fresh = self.alloc(Self::new_node(pl));
                    self.link_between(fresh, Some(node), next);
                    self.compress_window(Some(fresh));
                }
            }
            self.count += 1;
            return;
        }
        if at_head_edge {
            let prev = self.node(node).prev;
            match prev {
                Some(pv) if self.node_allows(pv, data.len()) => {
                    self.decompress_node(pv, true);
                    self.raw_list_mut(pv).push(data, false);
                    self.refresh_node_stats(pv);
                    self.recompress_if_pending(pv);
                }
                _ => {
                    let mut pl = PackedList::new();
                    pl.push(data, true);
                    let fresh = self.alloc(Self::new_node(pl));
                    self.link_between(fresh, prev, Some(node));
                    self.compress_window(Some(fresh));
                }
            }
            self.count += 1;
            return;
        }

        // Full node, interior position: split and insert into the side
        // that keeps the target adjacency.
        trace!("quicklist split: node with {} entries", node_entries);
        let split_point = if after { idx + 1 } else { idx };
        let right = self.split_node(node, split_point);
        if after {
            self.decompress_node(right, true);
            self.raw_list_mut(right).push(data, true);
            self.refresh_node_stats(right);
        } else {
            self.decompress_node(node, true);
            self.raw_list_mut(node).push(data, false);
            self.refresh_node_stats(node);
        }
        self.count += 1;
        self.compress_window(Some(right));
    }

    /// Split `node` so entries [split_point..] move to a new node placed
    /// right after it. Returns the new node.
    fn split_node(&mut self, node: u32, split_point: u32) -> u32 {
        self.decompress_node(node, false);
        let right_pl = {
            let pl = self.raw_list_mut(node);
            let total = pl.len();
            let mut right = PackedList::new();
            for v in pl.iter().skip(split_point as usize) {
                right.push(&v.to_vec(), false);
            }
            pl.delete_range(split_point as i64, total - split_point as usize);
            right
        };
        self.refresh_node_stats(node);
        let fresh = self.alloc(Self::new_node(right_pl));
        let next = self.node(node).next;
        self.link_between(fresh, Some(node), next);
        fresh
    }

    /// Remove the entry at `handle`. Returns true when the node itself
    /// disappeared (it became empty). No merging here: callers may hold
    /// cursors with node handles.
    pub fn delete_at(&mut self, handle: EntryHandle) -> bool {
        let (node, idx) = handle;
        self.decompress_node(node, true);
        let now_empty = {
            let pl = self.raw_list_mut(node);
            if let Some(p) = pl.entry_offset(idx as i64) {
                pl.delete(p);
            }
            pl.is_empty()
        };
        self.count -= 1;
        if now_empty {
            self.unlink(node);
            self.compress_window(None);
            return true;
        }
        self.refresh_node_stats(node);
        self.recompress_if_pending(node);
        false
    }

    /// Delete `count` entries starting at `start` (negative start counts
    /// from the tail). Whole nodes inside the range are dropped without
    /// inflating them.
    pub fn delete_range(&mut self, start: i64, count: usize) -> usize {
        if count == 0 {
            return 0;
        }
        let (mut node, mut idx) = match self.locate(start) {
            Some(h) => h,
            None => return 0,
        };
        let mut remaining = count;
        let mut deleted = 0usize;
        loop {
            let node_entries = self.node(node).count as usize;
            let next = self.node(node).next;
            let here = node_entries - idx as usize;
            if idx == 0 && here <= remaining {
                // Node fully covered; drop it compressed or not.
                self.unlink(node);
                self.count -= here;
                deleted += here;
                remaining -= here;
            } else {
                let take = here.min(remaining);
                self.decompress_node(node, true);
                {
                    let pl = self.raw_list_mut(node);
                    pl.delete_range(idx as i64, take);
                }
                self.refresh_node_stats(node);
                self.recompress_if_pending(node);
                self.count -= take;
                deleted += take;
                remaining -= take;
            }
            if remaining == 0 {
                break;
            }
            node = match next {
                Some(n) => n,
                None => break,
            };
            idx = 0;
        }
        if deleted > 0 && !self.is_empty() {
            self.compress_window(None);
            let boundary = start.clamp(-(self.count as i64), self.count as i64 - 1);
            if let Some((n, _)) = self.locate(boundary) {
                self.try_merge_neighbors(n);
            }
        }
        deleted
    }

    /// Conservative merge: a node is folded into a neighbor only when the
    /// combined payload still honors the fill limit with room to spare.
    fn try_merge_neighbors(&mut self, node: u32) {
        let limit = if self.fill < 0 {
            FILL_SIZES[(-self.fill - 1) as usize]
        } else {
            SIZE_SAFETY_LIMIT
        };
        for candidate in [self.node(node).prev, Some(node)] {
            let Some(left) = candidate else { continue };
            let Some(right) = self.node(left).next else { continue };
            let (a, b) = (self.node(left), self.node(right));
            let both_small = (a.raw_len as usize) < limit / 2 && (b.raw_len as usize) < limit / 2;
            let fits_bytes = (a.raw_len as usize + b.raw_len as usize) < limit;
            let fits_count = self.fill < 0
                || (a.count as usize + b.count as usize) <= self.fill as usize;
            if !(both_small && fits_bytes && fits_count) {
                continue;
            }
            self.decompress_node(left, false);
            self.decompress_node(right, false);
            let values: Vec<Vec<u8>> = self
                .raw_list(right)
                .iter()
                .map(|v| v.to_vec())
                .collect();
            {
                let pl = self.raw_list_mut(left);
                for v in &values {
                    pl.push(v, false);
                }
            }
            self.refresh_node_stats(left);
            self.unlink(right);
            self.compress_window(Some(left));
            return;
        }
    }

    /// Move the tail entry to the head.
    pub fn rotate(&mut self) {
        if self.count < 2 {
            return;
        }
        if let Some(v) = self.pop(false) {
            self.push_head(&v);
        }
    }

    /// Cursor over entries; `forward` walks head to tail.
    pub fn cursor(&self, forward: bool) -> QlCursor {
        QlCursor {
            forward,
            pos: None,
            started: false,
            stay: false,
        }
    }
}

/// Detached iteration cursor. Holds no borrow; each step re-borrows the
/// list, so entries can be deleted mid-walk (LREM-style).
#[derive(Debug)]
pub struct QlCursor {
    forward: bool,
    pos: Option<EntryHandle>,
    started: bool,
    stay: bool,
}

impl QlCursor {
    /// Advance and read the next value. None when the walk is done.
    pub fn next(&mut self, ql: &mut Quicklist) -> Option<Vec<u8>> {
        let next = self.advance(ql)?;
        self.pos = Some(next);
        let (node, idx) = next;
        ql.decompress_node(node, true);
        let value = {
            let pl = ql.raw_list(node);
            let p = pl.entry_offset(idx as i64)?;
            pl.get(p).to_vec()
        };
        ql.recompress_if_pending(node);
        Some(value)
    }

    /// Current position handle (valid until the next mutation).
    pub fn handle(&self) -> Option<EntryHandle> {
        self.pos
    }

    fn advance(&mut self, ql: &Quicklist) -> Option<EntryHandle> {
        if !self.started {
            self.started = true;
            let node = if self.forward { ql.head? } else { ql.tail? };
            let idx = if self.forward {
                0
            } else {
                ql.node(node).count - 1
            };
            return Some((node, idx));
        }
        let (node, idx) = self.pos?;
        if self.stay {
            // A forward delete left the next entry at the same index.
            self.stay = false;
            if idx < ql.node(node).count {
                return Some((node, idx));
            }
            return self.enter_neighbor(ql, node);
        }
        if self.forward {
            if idx + 1 < ql.node(node).count {
                Some((node, idx + 1))
            } else {
                self.enter_neighbor(ql, node)
            }
        } else if idx > 0 {
            Some((node, idx - 1))
        } else {
            self.enter_neighbor(ql, node)
        }
    }

    fn enter_neighbor(&self, ql: &Quicklist, node: u32) -> Option<EntryHandle> {
        let next = if self.forward {
            ql.node(node).next?
        } else {
            ql.node(node).prev?
        };
        let idx = if self.forward {
            0
        } else {
            ql.node(next).count - 1
        };
        Some((next, idx))
    }

    /// Delete the entry the cursor is standing on; iteration continues
    /// correctly in either direction.
    pub fn delete_current(&mut self, ql: &mut Quicklist) {
        let Some((node, idx)) = self.pos else { return };
        let (prev, next) = {
            let n = ql.node(node);
            (n.prev, n.next)
        };
        let node_gone = ql.delete_at((node, idx));
        if self.forward {
            // The following entry slid into the deleted slot; revisit the
            // same index on the next step.
            self.pos = if node_gone {
                next.map(|n| (n, 0))
            } else {
                Some((node, idx))
            };
            self.stay = self.pos.is_some();
        } else if node_gone {
            // Resume one past the tail of the previous node so the normal
            // backward step lands on its last entry.
            self.pos = prev.map(|p| (p, ql.node(p).count));
        }
        // Backward with the node intact: entries before idx kept their
        // indexes, the normal idx-1 step is already right.
    }
}
