use minibit::download;
use minibit::peer::{PeerSession, SessionState};
use minibit::torrent::pieces::PieceHashes;
use minibit::torrent::{Info, Torrent};
use sha1::{Digest, Sha1};
use std::net::SocketAddrV4;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const MOCK_PEER_ID: &[u8; 20] = b"-XX0001-xxxxxxxxxxxx";

fn make_torrent(data: &[u8], piece_length: usize) -> Torrent {
    let pieces = data
        .chunks(piece_length)
        .map(|piece| {
            let mut hasher = Sha1::new();
            hasher.update(piece);
            hasher.finalize().into()
        })
        .collect();
    Torrent {
        announce: "http://tracker.invalid/announce".to_string(),
        info: Info {
            name: "seeded.bin".to_string(),
            piece_length,
            pieces: PieceHashes(pieces),
            length: data.len(),
        },
    }
}

fn sample_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn bind_mock() -> (TcpListener, SocketAddrV4) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = match listener.local_addr().unwrap() {
        std::net::SocketAddr::V4(addr) => addr,
        other => panic!("unexpected address family: {other}"),
    };
    (listener, addr)
}

async fn write_frame(stream: &mut TcpStream, id: u8, payload: &[u8]) {
    let length = payload.len() as u32 + 1;
    stream.write_all(&length.to_be_bytes()).await.unwrap();
    stream.write_all(&[id]).await.unwrap();
    stream.write_all(payload).await.unwrap();
}

/// A scripted seeder: echoes the handshake, sends a keep-alive and a
/// bitfield, unchokes on interested and answers every request from
/// `data`. With `corrupt` set, every block comes back bit-flipped.
async fn serve_peer(listener: TcpListener, data: Vec<u8>, piece_length: usize, corrupt: bool) {
    let (mut stream, _) = listener.accept().await.unwrap();

    let mut handshake = [0u8; 68];
    stream.read_exact(&mut handshake).await.unwrap();
    assert_eq!(handshake[0], 0x13);
    assert_eq!(&handshake[1..20], b"BitTorrent protocol");
    // the client must advertise extension support
    assert_eq!(handshake[25] & 0x10, 0x10);
    let mut reply = handshake;
    reply[48..68].copy_from_slice(MOCK_PEER_ID);
    stream.write_all(&reply).await.unwrap();

    // keep-alive first; the client must not trip over it
    stream.write_all(&0u32.to_be_bytes()).await.unwrap();
    let n_pieces = data.len().div_ceil(piece_length);
    write_frame(&mut stream, 5, &vec![0xff; n_pieces.div_ceil(8)]).await;

    loop {
        let mut length_bytes = [0u8; 4];
        if stream.read_exact(&mut length_bytes).await.is_err() {
            return;
        }
        let length = u32::from_be_bytes(length_bytes) as usize;
        if length == 0 {
            continue;
        }
        let mut frame = vec![0u8; length];
        stream.read_exact(&mut frame).await.unwrap();
        match frame[0] {
            // interested
            2 => write_frame(&mut stream, 1, &[]).await,
            // request
            6 => {
                let index = u32::from_be_bytes(frame[1..5].try_into().unwrap()) as usize;
                let begin = u32::from_be_bytes(frame[5..9].try_into().unwrap()) as usize;
                let block_size = u32::from_be_bytes(frame[9..13].try_into().unwrap()) as usize;
                let offset = index * piece_length + begin;
                let mut block = data[offset..offset + block_size].to_vec();
                if corrupt {
                    for byte in &mut block {
                        *byte = !*byte;
                    }
                }
                let mut payload = Vec::with_capacity(8 + block.len());
                payload.extend_from_slice(&(index as u32).to_be_bytes());
                payload.extend_from_slice(&(begin as u32).to_be_bytes());
                payload.extend_from_slice(&block);
                write_frame(&mut stream, 7, &payload).await;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn handshake_round_trip() {
    let data = sample_data(1024);
    let torrent = make_torrent(&data, 1024);
    let (listener, addr) = bind_mock().await;
    let seeder = tokio::spawn(serve_peer(listener, data, 1024, false));

    let session = PeerSession::connect(addr, torrent.info_hash().unwrap())
        .await
        .unwrap();
    assert_eq!(
        hex::encode(session.remote_peer_id()),
        hex::encode(MOCK_PEER_ID)
    );
    assert_eq!(session.state(), SessionState::AwaitingBitfield);
    drop(session);
    seeder.await.unwrap();
}

#[tokio::test]
async fn handshake_rejects_wrong_info_hash() {
    let (listener, addr) = bind_mock().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut handshake = [0u8; 68];
        stream.read_exact(&mut handshake).await.unwrap();
        // reply for some other torrent
        handshake[28..48].copy_from_slice(&[0x77; 20]);
        stream.write_all(&handshake).await.unwrap();
    });
    assert!(PeerSession::connect(addr, [0x11; 20]).await.is_err());
}

#[tokio::test]
async fn downloads_a_single_piece() {
    // 2.5 blocks per piece, 3 pieces, short last piece
    let piece_length = 40960;
    let data = sample_data(piece_length * 2 + 5000);
    let torrent = make_torrent(&data, piece_length);
    let (listener, addr) = bind_mock().await;
    tokio::spawn(serve_peer(listener, data.clone(), piece_length, false));

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("piece0.bin");
    download::piece_from_peers(&torrent, &[addr], 0, &output)
        .await
        .unwrap();

    let staged = tokio::fs::read(&output).await.unwrap();
    assert_eq!(staged.len(), piece_length);
    assert_eq!(staged, &data[..piece_length]);
    assert!(!download::part_path(&output, 0).exists());
}

#[tokio::test]
async fn downloads_the_short_last_piece() {
    let piece_length = 40960;
    let data = sample_data(piece_length * 2 + 5000);
    let torrent = make_torrent(&data, piece_length);
    let (listener, addr) = bind_mock().await;
    tokio::spawn(serve_peer(listener, data.clone(), piece_length, false));

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("piece2.bin");
    download::piece_from_peers(&torrent, &[addr], 2, &output)
        .await
        .unwrap();

    let staged = tokio::fs::read(&output).await.unwrap();
    assert_eq!(staged.len(), 5000);
    assert_eq!(staged, &data[piece_length * 2..]);
}

#[tokio::test]
async fn downloads_a_whole_file() {
    let piece_length = 32768;
    let data = sample_data(92064);
    let torrent = make_torrent(&data, piece_length);
    assert_eq!(torrent.n_pieces(), 3);
    let (listener, addr) = bind_mock().await;
    tokio::spawn(serve_peer(listener, data.clone(), piece_length, false));

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.bin");
    download::from_peers(&torrent, &[addr], &output)
        .await
        .unwrap();

    let assembled = tokio::fs::read(&output).await.unwrap();
    assert_eq!(assembled.len(), torrent.info.length);
    assert_eq!(assembled, data);
    for piece_i in 0..torrent.n_pieces() {
        assert!(!download::part_path(&output, piece_i).exists());
    }
}

#[tokio::test]
async fn recovers_from_a_corrupt_peer() {
    let piece_length = 32768;
    let data = sample_data(piece_length * 2 + 12345);
    let torrent = make_torrent(&data, piece_length);
    let (bad_listener, bad_addr) = bind_mock().await;
    let (good_listener, good_addr) = bind_mock().await;
    tokio::spawn(serve_peer(bad_listener, data.clone(), piece_length, true));
    tokio::spawn(serve_peer(good_listener, data.clone(), piece_length, false));

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.bin");
    // the corrupt peer is offered first; every piece it touches fails
    // its hash check and must be completed by the good peer
    download::from_peers(&torrent, &[bad_addr, good_addr], &output)
        .await
        .unwrap();

    let assembled = tokio::fs::read(&output).await.unwrap();
    assert_eq!(assembled, data);
}

#[tokio::test]
async fn gives_up_when_every_peer_is_corrupt() {
    let piece_length = 32768;
    let data = sample_data(piece_length);
    let torrent = make_torrent(&data, piece_length);
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.bin");

    let mut addrs = Vec::new();
    let mut seeders = Vec::new();
    for _ in 0..3 {
        let (listener, addr) = bind_mock().await;
        seeders.push(tokio::spawn(serve_peer(
            listener,
            data.clone(),
            piece_length,
            true,
        )));
        addrs.push(addr);
    }
    let err = download::from_peers(&torrent, &addrs, &output)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        minibit::error::Error::DownloadFailed { piece: 0 }
    ));
    // One piece, three strikes: all three peers must have been dialed,
    // served their bad piece and had their connection dropped. A seeder
    // that was never accepted would keep this join pending forever.
    for seeder in seeders {
        tokio::time::timeout(std::time::Duration::from_secs(5), seeder)
            .await
            .expect("every peer is tried before giving up")
            .unwrap();
    }
}
