//! Chunker: splits an oversized payload into headered GELF chunks.
//!
//! Chunk datagram layout:
//!
//! | offset | bytes | field |
//! |---|---|---|
//! | 0-1 | 2 | magic `0x1e 0x0f` |
//! | 2-9 | 8 | message id |
//! | 10 | 1 | sequence number (0-based) |
//! | 11 | 1 | total chunk count |
//! | 12.. | | payload slice |

use crate::error::GelfError;

/// Magic bytes opening every chunk.
pub const CHUNK_MAGIC: [u8; 2] = [0x1e, 0x0f];

/// Size of the chunk header in bytes.
pub const CHUNK_HEADER_LEN: usize = 12;

/// Most chunks a single message may be split into.
pub const MAX_CHUNKS: usize = 128;

/// Header prepended to every chunk of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub message_id: [u8; 8],
    pub sequence: u8,
    pub total: u8,
}

impl ChunkHeader {
    pub fn to_bytes(&self) -> [u8; CHUNK_HEADER_LEN] {
        let mut buf = [0u8; CHUNK_HEADER_LEN];
        buf[0..2].copy_from_slice(&CHUNK_MAGIC);
        buf[2..10].copy_from_slice(&self.message_id);
        buf[10] = self.sequence;
        buf[11] = self.total;
        buf
    }

    /// Read the header of a chunk datagram.
    ///
    /// Returns `None` if the datagram is too short or lacks the magic bytes.
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        if datagram.len() < CHUNK_HEADER_LEN || datagram[0..2] != CHUNK_MAGIC {
            return None;
        }

        let mut message_id = [0u8; 8];
        message_id.copy_from_slice(&datagram[2..10]);

        Some(Self {
            message_id,
            sequence: datagram[10],
            total: datagram[11],
        })
    }
}

/// Payload bytes carried by each chunk for a given datagram size.
pub fn data_capacity(max_datagram_size: usize) -> usize {
    max_datagram_size.saturating_sub(CHUNK_HEADER_LEN)
}

/// Number of chunks needed for a payload, `ceil(len / capacity)`.
pub fn chunk_count(payload_len: usize, max_datagram_size: usize) -> usize {
    let capacity = data_capacity(max_datagram_size);
    if capacity == 0 {
        return usize::MAX;
    }
    payload_len.div_ceil(capacity)
}

/// Largest payload that can be sent in `MAX_CHUNKS` chunks.
pub fn max_message_len(max_datagram_size: usize) -> usize {
    data_capacity(max_datagram_size) * MAX_CHUNKS
}

/// The chunk sequence for one oversized message.
#[derive(Debug)]
pub struct ChunkPlan<'a> {
    payload: &'a [u8],
    capacity: usize,
    total: usize,
    message_id: [u8; 8],
}

impl<'a> ChunkPlan<'a> {
    /// Plan the chunks for `payload` with a fresh random message id.
    ///
    /// # Errors
    ///
    /// Returns `GelfError::Oversize` if more than `MAX_CHUNKS` chunks would
    /// be needed.
    pub fn new(payload: &'a [u8], max_datagram_size: usize) -> Result<Self, GelfError> {
        Self::with_message_id(payload, max_datagram_size, rand::random())
    }

    pub fn with_message_id(
        payload: &'a [u8],
        max_datagram_size: usize,
        message_id: [u8; 8],
    ) -> Result<Self, GelfError> {
        let total = chunk_count(payload.len(), max_datagram_size);
        if total > MAX_CHUNKS {
            return Err(GelfError::Oversize {
                chunks: total,
                max_bytes: max_message_len(max_datagram_size),
            });
        }

        Ok(Self {
            payload,
            capacity: data_capacity(max_datagram_size),
            total,
            message_id,
        })
    }

    /// Number of chunks in the plan.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn message_id(&self) -> [u8; 8] {
        self.message_id
    }

    /// Datagram for chunk `sequence`, which must be below `total`.
    fn datagram(&self, sequence: usize) -> Vec<u8> {
        let start = sequence * self.capacity;
        let stop = ((sequence + 1) * self.capacity).min(self.payload.len());

        // total <= MAX_CHUNKS, so both fit in one byte
        let header = ChunkHeader {
            message_id: self.message_id,
            sequence: sequence as u8,
            total: self.total as u8,
        };

        let mut datagram = Vec::with_capacity(CHUNK_HEADER_LEN + stop - start);
        datagram.extend_from_slice(&header.to_bytes());
        datagram.extend_from_slice(&self.payload[start..stop]);
        datagram
    }

    /// All chunk datagrams in sequence order.
    pub fn datagrams(&self) -> impl Iterator<Item = Vec<u8>> + '_ {
        (0..self.total).map(move |sequence| self.datagram(sequence))
    }
}
