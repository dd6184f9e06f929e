pub mod bencode;
pub mod download;
pub mod error;
pub mod magnet;
pub mod message;
pub mod peer;
pub mod torrent;
pub mod tracker;

/// The canonical request size on the peer wire. 16384 (16kb)
pub const BLOCK_SIZE: usize = 1 << 14;

/// One fixed peer id for every session this client opens.
pub const PEER_ID: &[u8; 20] = b"00112233445566778899";

/// The listening port reported to trackers. Nothing actually listens.
pub const PORT: u16 = 6881;
