use crate::bencode::Value;
use crate::error::{Error, Result};
use crate::message::{Block, Message, MessageFramer, MessageTag};
use crate::{BLOCK_SIZE, PEER_ID};
use futures_util::{SinkExt, StreamExt};
use std::collections::BTreeMap;
use std::net::SocketAddrV4;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

/// Outstanding `request` frames kept on the wire per session. Matches the
/// mainline client default: deep enough to hide round-trip latency, shallow
/// enough to bound per-peer buffering.
pub const MAX_INFLIGHT: usize = 5;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

// Bit 20 of the reserved field, counted from the high bit of byte 0,
// lands in byte 5 and signals BEP 10 extension support.
const EXTENSION_BIT: u8 = 0x10;

/// The fixed 68-byte frame that opens every peer connection. No length
/// prefix: both sides read exactly 68 bytes.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= EXTENSION_BIT;
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; 68] {
        let mut bytes = [0u8; 68];
        bytes[0] = 19;
        bytes[1..20].copy_from_slice(PROTOCOL);
        bytes[20..28].copy_from_slice(&self.reserved);
        bytes[28..48].copy_from_slice(&self.info_hash);
        bytes[48..68].copy_from_slice(&self.peer_id);
        bytes
    }

    pub fn from_bytes(bytes: &[u8; 68]) -> Result<Self> {
        if bytes[0] != 19 || &bytes[1..20] != PROTOCOL {
            return Err(Error::Protocol("handshake protocol string mismatch".into()));
        }
        Ok(Self {
            reserved: bytes[20..28].try_into().expect("slice is 8 bytes"),
            info_hash: bytes[28..48].try_into().expect("slice is 20 bytes"),
            peer_id: bytes[48..68].try_into().expect("slice is 20 bytes"),
        })
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[5] & EXTENSION_BIT != 0
    }
}

/// Where a session currently stands in the protocol ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Dialing,
    Handshaking,
    AwaitingBitfield,
    Choked,
    Interested,
    Unchoked,
    Downloading,
    Closed,
}

/// One TCP connection to one peer, owned exclusively for the life of the
/// session. `connect` leaves it in `AwaitingBitfield`; `await_bitfield` and
/// `express_interest` walk it to `Unchoked`, after which `fetch_piece` may
/// be called any number of times.
pub struct PeerSession {
    addr: SocketAddrV4,
    stream: Framed<TcpStream, MessageFramer>,
    remote: Handshake,
    state: SessionState,
}

impl PeerSession {
    /// Dials the peer and exchanges 68-byte handshakes. Our side always
    /// advertises extension support; mismatched info hashes are fatal.
    pub async fn connect(addr: SocketAddrV4, info_hash: [u8; 20]) -> Result<Self> {
        let mut stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(connected) => connected.map_err(|_| Error::ConnectionClosed)?,
            Err(_) => return Err(Error::ConnectionClosed),
        };

        let handshake = Handshake::new(info_hash, *PEER_ID);
        stream
            .write_all(&handshake.to_bytes())
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        let mut reply = [0u8; 68];
        match timeout(READ_TIMEOUT, stream.read_exact(&mut reply)).await {
            Ok(read) => read.map_err(|_| Error::ConnectionClosed)?,
            Err(_) => return Err(Error::ConnectionClosed),
        };
        let remote = Handshake::from_bytes(&reply)?;
        if remote.info_hash != info_hash {
            return Err(Error::Protocol("handshake info hash mismatch".into()));
        }
        tracing::debug!(%addr, peer_id = %hex::encode(remote.peer_id), "handshake complete");

        Ok(Self {
            addr,
            stream: Framed::new(stream, MessageFramer),
            remote,
            state: SessionState::AwaitingBitfield,
        })
    }

    pub fn addr(&self) -> SocketAddrV4 {
        self.addr
    }

    /// The peer id the remote sent in its handshake.
    pub fn remote_peer_id(&self) -> [u8; 20] {
        self.remote.peer_id
    }

    pub fn remote_supports_extensions(&self) -> bool {
        self.remote.supports_extensions()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Reads the mandatory bitfield. Its contents are discarded: the
    /// tracker only advertises fully-seeded peers, so every piece may be
    /// requested from every session.
    pub async fn await_bitfield(&mut self) -> Result<()> {
        loop {
            let msg = self.recv().await?;
            match msg.tag {
                MessageTag::Bitfield => {
                    self.state = SessionState::Choked;
                    return Ok(());
                }
                MessageTag::Have => {}
                other => return Err(self.unexpected(other, "bitfield")),
            }
        }
    }

    /// Declares interest and waits for the peer to unchoke us.
    pub async fn express_interest(&mut self) -> Result<()> {
        self.send(Message::interested()).await?;
        self.state = SessionState::Interested;
        self.await_unchoke().await
    }

    async fn await_unchoke(&mut self) -> Result<()> {
        loop {
            let msg = self.recv().await?;
            match msg.tag {
                MessageTag::Unchoke => {
                    self.state = SessionState::Unchoked;
                    return Ok(());
                }
                // A choke while already waiting changes nothing.
                MessageTag::Choke | MessageTag::Have => {}
                other => return Err(self.unexpected(other, "unchoke")),
            }
        }
    }

    /// Downloads one whole piece, pipelining up to `MAX_INFLIGHT` block
    /// requests. Blocks may come back in any order; each is placed by its
    /// `begin` offset. A choke mid-piece drops the outstanding requests,
    /// waits for the next unchoke and re-requests whatever is missing.
    pub async fn fetch_piece(&mut self, piece_i: usize, piece_size: usize) -> Result<Vec<u8>> {
        if self.state != SessionState::Unchoked {
            return Err(Error::Protocol(format!(
                "piece requested in state {:?}",
                self.state
            )));
        }
        self.state = SessionState::Downloading;

        let n_blocks = piece_size.div_ceil(BLOCK_SIZE);
        let mut piece = vec![0u8; piece_size];
        let mut received = vec![false; n_blocks];
        let mut n_received = 0;
        let mut in_flight = 0;
        let mut next_block = 0;

        while n_received < n_blocks {
            while in_flight < MAX_INFLIGHT && next_block < n_blocks {
                if received[next_block] {
                    // already here from before a choke
                    next_block += 1;
                    continue;
                }
                let begin = next_block * BLOCK_SIZE;
                let block_size = (piece_size - begin).min(BLOCK_SIZE);
                self.send(Message::request(
                    piece_i as u32,
                    begin as u32,
                    block_size as u32,
                ))
                .await?;
                in_flight += 1;
                next_block += 1;
            }

            let msg = self.recv().await?;
            match msg.tag {
                MessageTag::Piece => {
                    let block = Block::from_payload(&msg.payload).ok_or_else(|| {
                        Error::Protocol("piece payload shorter than its header".into())
                    })?;
                    in_flight = in_flight.saturating_sub(1);
                    if block.index as usize != piece_i {
                        // a late block from a piece this session no longer owns
                        continue;
                    }
                    let begin = block.begin as usize;
                    if begin % BLOCK_SIZE != 0 || begin + block.data.len() > piece_size {
                        return Err(Error::Protocol(format!(
                            "block at {begin}+{} outside piece of {piece_size} bytes",
                            block.data.len()
                        )));
                    }
                    let block_i = begin / BLOCK_SIZE;
                    if !received[block_i] {
                        piece[begin..begin + block.data.len()].copy_from_slice(block.data);
                        received[block_i] = true;
                        n_received += 1;
                    }
                }
                MessageTag::Choke => {
                    // Everything on the wire is void; start the request
                    // scan over and let `received` skip finished blocks.
                    tracing::debug!(addr = %self.addr, piece_i, "choked mid-piece");
                    self.state = SessionState::Choked;
                    in_flight = 0;
                    next_block = 0;
                    self.await_unchoke().await?;
                    self.state = SessionState::Downloading;
                }
                MessageTag::Have => {}
                other => return Err(self.unexpected(other, "piece")),
            }
        }

        self.state = SessionState::Unchoked;
        Ok(piece)
    }

    /// BEP 10 handshake: extended message id 20 with sub-id 0 and a
    /// bencoded dictionary advertising our `ut_metadata` slot. Returns the
    /// peer's `ut_metadata` id, if it announced one.
    pub async fn extension_handshake(&mut self) -> Result<Option<i64>> {
        let mut slots = BTreeMap::new();
        slots.insert(b"ut_metadata".to_vec(), Value::Int(16));
        let mut body = BTreeMap::new();
        body.insert(b"m".to_vec(), Value::Dict(slots));
        self.send(Message::extended(0, &Value::Dict(body).encode()))
            .await?;

        loop {
            let msg = self.recv().await?;
            match msg.tag {
                MessageTag::Extended => {
                    let (&sub_id, body) = msg
                        .payload
                        .split_first()
                        .ok_or_else(|| Error::Protocol("empty extended message".into()))?;
                    if sub_id != 0 {
                        return Err(Error::Protocol(format!(
                            "expected extension handshake, got sub-id {sub_id}"
                        )));
                    }
                    let dict = Value::decode(body)?;
                    let ut_metadata = dict
                        .get(b"m")
                        .and_then(|m| m.get(b"ut_metadata"))
                        .and_then(Value::as_int);
                    return Ok(ut_metadata);
                }
                MessageTag::Have => {}
                other => return Err(self.unexpected(other, "extension handshake")),
            }
        }
    }

    async fn send(&mut self, msg: Message) -> Result<()> {
        let sent = self.stream.send(msg).await;
        match sent {
            Ok(()) => Ok(()),
            Err(_) => Err(self.close(Error::ConnectionClosed)),
        }
    }

    /// One framed read. EOF and timeout both end the session; framer
    /// errors (bad id, oversized frame) are protocol violations.
    async fn recv(&mut self) -> Result<Message> {
        match timeout(READ_TIMEOUT, self.stream.next()).await {
            Ok(Some(Ok(msg))) => Ok(msg),
            Ok(Some(Err(err))) if err.kind() == std::io::ErrorKind::InvalidData => {
                Err(self.close(Error::Protocol(err.to_string())))
            }
            Ok(Some(Err(_))) | Ok(None) | Err(_) => Err(self.close(Error::ConnectionClosed)),
        }
    }

    fn unexpected(&mut self, tag: MessageTag, waiting_for: &str) -> Error {
        self.close(Error::Protocol(format!(
            "got {tag:?} while waiting for {waiting_for}"
        )))
    }

    fn close(&mut self, err: Error) -> Error {
        self.state = SessionState::Closed;
        err
    }
}

#[test]
fn handshake_layout() {
    let handshake = Handshake::new([0xaa; 20], *PEER_ID);
    let bytes = handshake.to_bytes();
    assert_eq!(bytes.len(), 68);
    assert_eq!(bytes[0], 0x13);
    assert_eq!(&bytes[1..20], b"BitTorrent protocol");
    assert_eq!(&bytes[28..48], &[0xaa; 20]);
    assert_eq!(&bytes[48..68], PEER_ID);
    // bit 20 of the reserved area
    assert_eq!(bytes[25], 0x10);
}

#[test]
fn handshake_round_trip_and_extension_bit() {
    let bytes = Handshake::new([0x01; 20], [0x02; 20]).to_bytes();
    let parsed = Handshake::from_bytes(&bytes).unwrap();
    assert!(parsed.supports_extensions());
    assert_eq!(parsed.info_hash, [0x01; 20]);
    assert_eq!(parsed.peer_id, [0x02; 20]);

    let mut plain = bytes;
    plain[25] = 0;
    let parsed = Handshake::from_bytes(&plain).unwrap();
    assert!(!parsed.supports_extensions());
}

#[test]
fn handshake_rejects_wrong_protocol() {
    let mut bytes = Handshake::new([0x01; 20], [0x02; 20]).to_bytes();
    bytes[1] = b'b';
    assert!(Handshake::from_bytes(&bytes).is_err());
    bytes[1] = b'B';
    bytes[0] = 18;
    assert!(Handshake::from_bytes(&bytes).is_err());
}
