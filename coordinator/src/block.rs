use crate::BLOCK_SIZE;

/// A block of piece data received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {
    pub piece_idx: usize,
    pub offset: usize,
    pub data: Vec<u8>,
}

/// Identifies a block without carrying its payload; used as a map/set key.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct BlockInfo {
    pub piece_idx: usize,
    pub offset: usize,
    pub len: usize,
}

/// Bytes to request starting at `offset` within a piece of length `piece_len`: a full
/// block unless `offset` falls in the final block, in which case the exact remainder.
pub fn bytes_to_request(piece_len: usize, offset: usize) -> usize {
    (piece_len - offset).min(BLOCK_SIZE)
}
