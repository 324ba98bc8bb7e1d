use std::{
    collections::{HashSet, VecDeque},
    fmt::Display,
};

use bytes::{Bytes, BytesMut};

/// Blocks are the sub-piece unit exchanged on the wire. Always this long
/// except the terminal block of a piece.
pub const BLOCK_LENGTH: u32 = 16 * 1024;

/// Position and length of one block, the request side of the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Block in piece {} with offset {} and length {}",
            self.piece, self.offset, self.length
        )
    }
}

impl std::hash::Hash for Block {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.piece.hash(state);
        self.offset.hash(state);
    }
}

/// A block that arrived from (or is served to) a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    pub piece: u32,
    pub offset: u32,
    pub block: Bytes,
}

impl DataBlock {
    pub fn new(piece: u32, offset: u32, block: Bytes) -> Self {
        Self {
            piece,
            offset,
            block,
        }
    }

    pub fn len(&self) -> usize {
        self.block.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block.is_empty()
    }
}

impl Display for DataBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Block in piece {} with offset {} and length {}",
            self.piece,
            self.offset,
            self.block.len()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    /// Blocks are still missing.
    Incomplete,
    /// Every block arrived but the hash was not checked yet.
    Complete,
    /// Hash matched the metainfo checksum.
    Verified,
    /// Hash mismatched, the piece was thrown away and will be re-requested.
    ResetPending,
}

/// In-memory assembly buffer for a single piece.
///
/// The request queue recirculates: an unanswered request goes back to the
/// tail, so slow or lost requests are re-issued on the next pass.
#[derive(Debug)]
pub struct Piece {
    index: u32,
    hash: [u8; 20],
    length: u32,
    num_blocks: usize,
    pending_requests: VecDeque<Block>,
    completed_offsets: HashSet<u32>,
    downloaded: Vec<DataBlock>,
    state: PieceState,
}

impl Piece {
    pub fn new(index: u32, hash: [u8; 20], length: u32) -> Self {
        let num_blocks = length.div_ceil(BLOCK_LENGTH) as usize;
        let pending_requests = build_request_queue(index, length);
        debug_assert_eq!(pending_requests.len(), num_blocks);
        Self {
            index,
            hash,
            length,
            num_blocks,
            pending_requests,
            completed_offsets: HashSet::new(),
            downloaded: Vec::new(),
            state: PieceState::Incomplete,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn state(&self) -> PieceState {
        self.state
    }

    /// Next block to ask a peer for, `None` once every block arrived.
    ///
    /// Completed entries are dropped on the way; the returned entry recycles
    /// to the tail so it is re-issued if the answer never comes.
    pub fn next_request(&mut self) -> Option<Block> {
        while let Some(request) = self.pending_requests.pop_front() {
            if self.completed_offsets.contains(&request.offset) {
                continue;
            }
            self.pending_requests.push_back(request);
            return Some(request);
        }
        None
    }

    /// Stage one downloaded block. Duplicates and malformed blocks are
    /// silently dropped.
    pub fn save_block(&mut self, block: DataBlock) {
        if !self.valid_block(&block) {
            tracing::warn!(piece = self.index, "Dropping invalid block: {block}");
            return;
        }
        if !self.completed_offsets.insert(block.offset) {
            tracing::trace!(piece = self.index, "Dropping duplicate block: {block}");
            return;
        }
        self.downloaded.push(block);
        if self.is_complete() {
            self.state = PieceState::Complete;
        }
    }

    /// A block is acceptable when it is aligned and either full sized or the
    /// terminal block of this piece.
    fn valid_block(&self, block: &DataBlock) -> bool {
        if block.offset % BLOCK_LENGTH != 0 || block.offset >= self.length {
            return false;
        }
        let expected = std::cmp::min(BLOCK_LENGTH, self.length - block.offset);
        block.len() == expected as usize
    }

    pub fn is_complete(&self) -> bool {
        self.completed_offsets.len() == self.num_blocks
    }

    /// Hash check over the offset-sorted block data. Updates the piece state.
    pub fn verify(&mut self) -> bool {
        use sha1::{Digest, Sha1};
        let mut hasher = <Sha1 as Digest>::new();
        self.downloaded.sort_unstable_by_key(|b| b.offset);
        for block in &self.downloaded {
            hasher.update(&block.block);
        }
        let digest: [u8; 20] = hasher.finalize().into();
        if digest == self.hash {
            self.state = PieceState::Verified;
            true
        } else {
            self.state = PieceState::ResetPending;
            false
        }
    }

    /// Offset-sorted block data as one contiguous buffer.
    ///
    /// Callers only see this after [Self::verify] sorted the blocks.
    pub fn assemble(&self) -> Bytes {
        let mut bytes = BytesMut::with_capacity(self.length as usize);
        for block in &self.downloaded {
            bytes.extend_from_slice(&block.block);
        }
        bytes.freeze()
    }

    /// Throw away staged blocks and regenerate the request queue.
    pub fn reset(&mut self) {
        self.completed_offsets.clear();
        self.downloaded.clear();
        self.pending_requests = build_request_queue(self.index, self.length);
        self.state = PieceState::Incomplete;
    }
}

fn build_request_queue(index: u32, length: u32) -> VecDeque<Block> {
    let mut queue = VecDeque::with_capacity(length.div_ceil(BLOCK_LENGTH) as usize);
    let tail = length % BLOCK_LENGTH;
    let mut offset = 0;
    while offset < length - tail {
        queue.push_back(Block {
            piece: index,
            offset,
            length: BLOCK_LENGTH,
        });
        offset += BLOCK_LENGTH;
    }
    if tail > 0 {
        queue.push_back(Block {
            piece: index,
            offset: length - tail,
            length: tail,
        });
    }
    queue
}
