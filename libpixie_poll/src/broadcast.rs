use std::net::UdpSocket;

use super::constants::{Word, SHM_CHUNK_WORDS, SHM_HEADER_BYTES};
use super::error::BroadcastError;

/// Sent to the subscriber when the dispatcher shuts down.
pub const KILL_SOCKET: &[u8] = b"$KILL_SOCKET\0";
/// Sent to the subscriber when the output file closes.
pub const CLOSE_FILE: &[u8] = b"$CLOSE_FILE\0";
/// Sent to the subscriber when an output file opens.
pub const OPEN_FILE: &[u8] = b"$OPEN_FILE\0";

/// One-way transport to the live-data subscriber.
pub trait Broadcaster: Send {
    fn send(&mut self, payload: &[u8]) -> Result<(), BroadcastError>;
}

/// Datagram transport to a fixed subscriber address.
pub struct UdpBroadcaster {
    socket: UdpSocket,
}

impl UdpBroadcaster {
    pub fn connect(addr: &str) -> Result<Self, BroadcastError> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(addr)?;
        Ok(UdpBroadcaster { socket })
    }
}

impl Broadcaster for UdpBroadcaster {
    fn send(&mut self, payload: &[u8]) -> Result<(), BroadcastError> {
        self.socket.send(payload)?;
        Ok(())
    }
}

/// Transport that records every datagram instead of sending it. Backs the
/// test suites and runs the console without a subscriber.
#[derive(Debug, Default)]
pub struct MemoryBroadcaster {
    pub datagrams: Vec<Vec<u8>>,
}

impl MemoryBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Broadcaster for MemoryBroadcaster {
    fn send(&mut self, payload: &[u8]) -> Result<(), BroadcastError> {
        self.datagrams.push(payload.to_vec());
        Ok(())
    }
}

/// Send one spill as shared-memory chunks.
///
/// Every datagram carries an 8-byte header of (chunk index, total chunks),
/// chunks numbered from 1, followed by up to [SHM_CHUNK_WORDS] words of
/// spill data. Only the final chunk may be short; its transport length is
/// `(remaining_words + 2) * 4` bytes.
pub fn broadcast_spill(
    tx: &mut dyn Broadcaster,
    words: &[Word],
    debug: bool,
) -> Result<(), BroadcastError> {
    let total_chunks = words.len().div_ceil(SHM_CHUNK_WORDS) as u32;
    if debug {
        spdlog::debug!(
            "Splitting {} words into network spill of {} chunks (fragment = {} words)",
            words.len(),
            total_chunks,
            words.len() % SHM_CHUNK_WORDS
        );
    }

    for (index, chunk) in words.chunks(SHM_CHUNK_WORDS).enumerate() {
        let mut datagram = Vec::with_capacity(SHM_HEADER_BYTES + chunk.len() * 4);
        datagram.extend_from_slice(&(index as u32 + 1).to_le_bytes());
        datagram.extend_from_slice(&total_chunks.to_le_bytes());
        for word in chunk {
            datagram.extend_from_slice(&word.to_le_bytes());
        }
        tx.send(&datagram)?;
    }
    Ok(())
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SHM_PACKET_BYTES;

    #[test]
    fn test_full_chunks_are_40008_bytes() {
        let words: Vec<Word> = (0..20000).collect();
        let mut tx = MemoryBroadcaster::new();
        broadcast_spill(&mut tx, &words, false).unwrap();

        assert_eq!(tx.datagrams.len(), 2);
        for datagram in &tx.datagrams {
            assert_eq!(datagram.len(), SHM_PACKET_BYTES);
        }
    }

    #[test]
    fn test_final_chunk_is_short() {
        let words: Vec<Word> = (0..25000).collect();
        let mut tx = MemoryBroadcaster::new();
        broadcast_spill(&mut tx, &words, false).unwrap();

        assert_eq!(tx.datagrams.len(), 3);
        assert_eq!(tx.datagrams[2].len(), (5000 + 2) * 4);
        // chunks are numbered from 1 and carry the total count
        for (i, datagram) in tx.datagrams.iter().enumerate() {
            let index = u32::from_le_bytes(datagram[0..4].try_into().unwrap());
            let total = u32::from_le_bytes(datagram[4..8].try_into().unwrap());
            assert_eq!(index, i as u32 + 1);
            assert_eq!(total, 3);
        }
    }

    #[test]
    fn test_reassembly_matches_input() {
        let words: Vec<Word> = (0..12345).map(|i| i * 7 + 3).collect();
        let mut tx = MemoryBroadcaster::new();
        broadcast_spill(&mut tx, &words, false).unwrap();

        let mut rebuilt = Vec::new();
        for datagram in &tx.datagrams {
            for bytes in datagram[SHM_HEADER_BYTES..].chunks_exact(4) {
                rebuilt.push(u32::from_le_bytes(bytes.try_into().unwrap()));
            }
        }
        assert_eq!(rebuilt, words);
    }
}
