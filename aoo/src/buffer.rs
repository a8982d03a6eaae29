//! Block storage: encoded blocks, the sink-side jitter buffer and the
//! source-side history buffer.

use std::collections::VecDeque;

/// Frame bitmap limit: 64 frames fit the `u64` bitmap.
pub const MAX_FRAMES_PER_BLOCK: usize = 64;

/// One encoded audio block, possibly partially received.
///
/// A block is split into `num_frames` UDP-sized frames; the `missing`
/// bitmap has one bit per outstanding frame, so
/// `complete ⇔ missing == 0`.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub sequence: i32,
    pub sample_rate: f64,
    pub channel: i32,
    data: Vec<u8>,
    num_frames: i32,
    frame_size: i32,
    missing: u64,
}

impl Block {
    /// A block whose frames are still outstanding.
    pub fn incomplete(sequence: i32, sample_rate: f64, channel: i32, total_size: usize, num_frames: i32) -> Self {
        debug_assert!(num_frames > 0 && num_frames as usize <= MAX_FRAMES_PER_BLOCK);
        let mut missing = 0u64;
        for i in 0..num_frames {
            missing |= 1u64 << i;
        }
        Self {
            sequence,
            sample_rate,
            channel,
            data: vec![0; total_size],
            num_frames,
            frame_size: 0,
            missing,
        }
    }

    /// A fully received block (source side).
    pub fn complete(
        sequence: i32,
        sample_rate: f64,
        channel: i32,
        data: &[u8],
        num_frames: i32,
        frame_size: i32,
    ) -> Self {
        Self {
            sequence,
            sample_rate,
            channel,
            data: data.to_vec(),
            num_frames,
            frame_size,
            missing: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.missing == 0
    }

    pub fn num_frames(&self) -> i32 {
        self.num_frames
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn has_frame(&self, which: i32) -> bool {
        debug_assert!(which >= 0 && which < self.num_frames);
        (self.missing >> which) & 1 == 0
    }

    pub fn missing_frames(&self) -> u32 {
        self.missing.count_ones()
    }

    /// Store a received frame. All frames except the last share one size;
    /// the last frame carries the remainder and is anchored at the back of
    /// the buffer.
    pub fn add_frame(&mut self, which: i32, frame: &[u8]) {
        if which < 0 || which >= self.num_frames || frame.len() > self.data.len() {
            log::warn!("frame {} does not fit block {}", which, self.sequence);
            return;
        }
        if which == self.num_frames - 1 {
            let start = self.data.len() - frame.len();
            self.data[start..].copy_from_slice(frame);
        } else {
            let start = which as usize * frame.len();
            if start + frame.len() > self.data.len() {
                log::warn!("frame {} does not fit block {}", which, self.sequence);
                return;
            }
            self.data[start..start + frame.len()].copy_from_slice(frame);
            self.frame_size = frame.len() as i32;
        }
        self.missing &= !(1u64 << which);
    }

    /// Slice of a stored frame (source side; `frame_size` is known).
    pub fn get_frame(&self, which: i32) -> Option<&[u8]> {
        if which < 0 || which >= self.num_frames || self.frame_size <= 0 {
            return None;
        }
        let onset = which as usize * self.frame_size as usize;
        if which == self.num_frames - 1 {
            Some(&self.data[onset..])
        } else {
            Some(&self.data[onset..onset + self.frame_size as usize])
        }
    }
}

//---------------------------- jitter buffer ---------------------------//

/// Sequence-ordered window of partially received blocks at the sink.
///
/// Capacity equals the configured latency in blocks. Insertion keeps
/// ascending sequence order; blocks usually arrive in order, so the common
/// case is an append.
#[derive(Debug, Default)]
pub struct JitterBuffer {
    blocks: VecDeque<Block>,
    capacity: usize,
}

impl JitterBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        self.blocks.clear();
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.blocks.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn position(&self, sequence: i32) -> Result<usize, usize> {
        self.blocks.binary_search_by(|b| b.sequence.cmp(&sequence))
    }

    pub fn find(&mut self, sequence: i32) -> Option<&mut Block> {
        // the most recent block is the usual target
        if self.blocks.back().map(|b| b.sequence) == Some(sequence) {
            return self.blocks.back_mut();
        }
        match self.position(sequence) {
            Ok(i) => self.blocks.get_mut(i),
            Err(_) => None,
        }
    }

    /// Insert a block, keeping sequence order. The caller checks
    /// [`JitterBuffer::is_full`] first and applies its eviction policy.
    pub fn insert(&mut self, block: Block) -> &mut Block {
        let index = match self.position(block.sequence) {
            Ok(i) => {
                // duplicate insert replaces (should not happen)
                self.blocks[i] = block;
                return &mut self.blocks[i];
            }
            Err(i) => i,
        };
        self.blocks.insert(index, block);
        &mut self.blocks[index]
    }

    pub fn front(&self) -> Option<&Block> {
        self.blocks.front()
    }

    pub fn back(&self) -> Option<&Block> {
        self.blocks.back()
    }

    pub fn pop_front(&mut self) -> Option<Block> {
        self.blocks.pop_front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }
}

//---------------------------- history buffer --------------------------//

/// Fixed-capacity ring of recently sent blocks, indexed by sequence.
///
/// Blocks are pushed in chronological order, so the ranges `[head..]` and
/// `[..head]` stay sorted and lookups are two binary searches.
#[derive(Debug, Default)]
pub struct HistoryBuffer {
    blocks: Vec<Block>,
    head: usize,
    oldest: i32,
}

impl HistoryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resize(&mut self, capacity: usize) {
        self.blocks = vec![
            Block {
                sequence: -1,
                ..Default::default()
            };
            capacity
        ];
        self.head = 0;
        self.oldest = -1;
    }

    pub fn clear(&mut self) {
        for b in &mut self.blocks {
            b.sequence = -1;
        }
        self.head = 0;
        self.oldest = -1;
    }

    pub fn capacity(&self) -> usize {
        self.blocks.len()
    }

    pub fn push(&mut self, block: Block) {
        if self.blocks.is_empty() {
            return;
        }
        if self.blocks[self.head].sequence >= 0 {
            self.oldest = self.blocks[self.head].sequence;
        }
        self.blocks[self.head] = block;
        self.head = (self.head + 1) % self.blocks.len();
    }

    pub fn find(&self, sequence: i32) -> Option<&Block> {
        if sequence < self.oldest || self.blocks.is_empty() {
            return None;
        }
        let search = |slice: &[Block]| -> Option<usize> {
            match slice.binary_search_by(|b| b.sequence.cmp(&sequence)) {
                Ok(i) => Some(i),
                Err(_) => None,
            }
        };
        if let Some(i) = search(&self.blocks[self.head..]) {
            let b = &self.blocks[self.head + i];
            if b.sequence == sequence {
                return Some(b);
            }
        }
        if let Some(i) = search(&self.blocks[..self.head]) {
            let b = &self.blocks[i];
            if b.sequence == sequence && b.sequence >= 0 {
                return Some(b);
            }
        }
        None
    }
}
