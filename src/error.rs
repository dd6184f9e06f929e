use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong between a `.torrent` file and bytes on disk.
///
/// The session-level kinds (`Protocol`, `ConnectionClosed`, `HashMismatch`)
/// are recovered by the scheduler: the session is closed and its piece goes
/// back on the queue. The rest abort the running command.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed bencode: {0}")]
    Bencode(String),

    #[error("invalid metainfo: {0}")]
    Metainfo(String),

    #[error("tracker request failed: {0}")]
    Tracker(String),

    #[error("peer protocol violation: {0}")]
    Protocol(String),

    #[error("peer connection closed")]
    ConnectionClosed,

    #[error("piece {0} failed its hash check")]
    HashMismatch(usize),

    #[error("piece {piece} could not be retrieved")]
    DownloadFailed { piece: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}
