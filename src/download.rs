use crate::error::{Error, Result};
use crate::peer::PeerSession;
use crate::torrent::Torrent;
use crate::tracker;
use futures_util::stream::{self, StreamExt};
use kanal::AsyncReceiver;
use sha1::{Digest, Sha1};
use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// A piece is re-queued on session failure; the third failure of the same
/// piece aborts the download.
const MAX_PIECE_ATTEMPTS: usize = 3;

// Concurrent dial attempts while filling the session pool.
const DIAL_CONCURRENCY: usize = 5;

/// What a session reports back for each piece it was handed.
#[derive(Debug)]
enum Outcome {
    Verified(usize),
    Failed { piece_i: usize, error: Error },
}

/// Downloads every piece and concatenates them into `output`.
pub async fn all(torrent: &Torrent, output: &Path) -> Result<()> {
    let info_hash = torrent.info_hash()?;
    let response = tracker::announce(&torrent.announce, info_hash, torrent.info.length).await?;
    from_peers(torrent, &response.peers.0, output).await
}

/// The scheduler proper, split from `all` so tests can inject peers
/// without a tracker round-trip.
pub async fn from_peers(
    torrent: &Torrent,
    peer_addrs: &[SocketAddrV4],
    output: &Path,
) -> Result<()> {
    let info_hash = torrent.info_hash()?;
    let n_pieces = torrent.n_pieces();

    // One session per peer, capped by the piece count: more sessions than
    // pieces could never all hold work at once. Addresses left over once
    // the pool is full stay in `spares` so a dead session can be replaced
    // by a peer we have not tried yet.
    let want = peer_addrs.len().min(n_pieces);
    let mut spares: VecDeque<SocketAddrV4> = peer_addrs.iter().copied().collect();
    let mut sessions = Vec::new();
    while sessions.len() < want && !spares.is_empty() {
        let wave_size = (want - sessions.len())
            .min(DIAL_CONCURRENCY)
            .min(spares.len());
        let wave: Vec<SocketAddrV4> = spares.drain(..wave_size).collect();
        let mut dials = stream::iter(wave)
            .map(|addr| async move { (addr, dial(addr, info_hash).await) })
            .buffer_unordered(DIAL_CONCURRENCY);
        while let Some((addr, session)) = dials.next().await {
            match session {
                Ok(session) => sessions.push(session),
                Err(err) => tracing::warn!(%addr, %err, "failed to establish session"),
            }
        }
    }
    if sessions.is_empty() {
        return Err(Error::DownloadFailed { piece: 0 });
    }
    tracing::debug!(n_sessions = sessions.len(), n_pieces, "session pool ready");

    // The pending queue: a FIFO of piece indices. Sessions pull from it,
    // so "pop next pending piece" is a single channel recv.
    let (job_tx, job_rx) = kanal::bounded_async(n_pieces);
    for piece_i in 0..n_pieces {
        job_tx.send(piece_i).await.expect("queue outlives this loop");
    }

    let torrent = Arc::new(torrent.clone());
    let (done_tx, mut done_rx) = mpsc::channel(n_pieces);
    let mut live = sessions.len();
    for session in sessions {
        tokio::spawn(run_session(
            session,
            Arc::clone(&torrent),
            output.to_path_buf(),
            job_rx.clone(),
            done_tx.clone(),
        ));
    }

    // A piece is pending while its index sits in the queue, in flight
    // while exactly one session holds it, and done once verified. The
    // queue and the sessions own the first two states; only completion
    // and the failure count are tracked here. A worker only ever exits
    // mid-download after reporting a failure, so `live` stays accurate.
    let mut done_pieces = vec![false; n_pieces];
    let mut failures = vec![0usize; n_pieces];
    let mut n_done = 0;
    while n_done < n_pieces {
        let outcome = done_rx.recv().await.expect("this task holds a sender");
        match outcome {
            Outcome::Verified(piece_i) => {
                done_pieces[piece_i] = true;
                n_done += 1;
            }
            Outcome::Failed { piece_i, error } => {
                failures[piece_i] += 1;
                tracing::warn!(
                    piece_i,
                    failure = failures[piece_i],
                    %error,
                    "piece failed, session closed"
                );
                if failures[piece_i] >= MAX_PIECE_ATTEMPTS {
                    return Err(Error::DownloadFailed { piece: piece_i });
                }
                live -= 1;
                // Top the pool back up from peers never tried, so the
                // retry below can land on a different session.
                while live < want {
                    let Some(addr) = spares.pop_front() else { break };
                    match dial(addr, info_hash).await {
                        Ok(session) => {
                            tracing::debug!(%addr, "replacement session ready");
                            tokio::spawn(run_session(
                                session,
                                Arc::clone(&torrent),
                                output.to_path_buf(),
                                job_rx.clone(),
                                done_tx.clone(),
                            ));
                            live += 1;
                        }
                        Err(err) => {
                            tracing::warn!(%addr, %err, "failed to establish session")
                        }
                    }
                }
                if live == 0 {
                    // every session is gone and no peer is left to dial
                    return Err(Error::DownloadFailed { piece: piece_i });
                }
                job_tx
                    .send(piece_i)
                    .await
                    .expect("queue is open while this task runs");
            }
        }
    }
    // Closing the queue sends the idle sessions home.
    drop(job_tx);
    drop(job_rx);

    concatenate(output, n_pieces).await
}

/// Downloads a single piece through the first peer that will serve it,
/// staging at `<output>.part<piece_i>` before the final rename.
pub async fn piece(torrent: &Torrent, piece_i: usize, output: &Path) -> Result<()> {
    if piece_i >= torrent.n_pieces() {
        return Err(Error::Metainfo(format!(
            "piece {piece_i} out of range, torrent has {} pieces",
            torrent.n_pieces()
        )));
    }
    let info_hash = torrent.info_hash()?;
    let response = tracker::announce(&torrent.announce, info_hash, torrent.info.length).await?;
    piece_from_peers(torrent, &response.peers.0, piece_i, output).await
}

pub async fn piece_from_peers(
    torrent: &Torrent,
    peer_addrs: &[SocketAddrV4],
    piece_i: usize,
    output: &Path,
) -> Result<()> {
    let info_hash = torrent.info_hash()?;
    let mut failures = 0;
    for &addr in peer_addrs {
        let mut session = match dial(addr, info_hash).await {
            Ok(session) => session,
            Err(err) => {
                tracing::warn!(%addr, %err, "failed to establish session");
                continue;
            }
        };
        match fetch_and_stage(&mut session, torrent, output, piece_i).await {
            Ok(()) => {
                tokio::fs::rename(part_path(output, piece_i), output).await?;
                return Ok(());
            }
            Err(err) => {
                failures += 1;
                tracing::warn!(%addr, %err, failure = failures, "piece fetch failed");
                if failures >= MAX_PIECE_ATTEMPTS {
                    break;
                }
            }
        }
    }
    Err(Error::DownloadFailed { piece: piece_i })
}

/// Connect, handshake and walk the session up to `Unchoked`.
async fn dial(addr: SocketAddrV4, info_hash: [u8; 20]) -> Result<PeerSession> {
    let mut session = PeerSession::connect(addr, info_hash).await?;
    session.await_bitfield().await?;
    session.express_interest().await?;
    Ok(session)
}

/// One session worker: pull a piece index, fetch, verify, stage, report.
/// Any failure closes the session after the piece has been reported back,
/// so the scheduler can hand it to someone else.
async fn run_session(
    mut session: PeerSession,
    torrent: Arc<Torrent>,
    output: PathBuf,
    jobs: AsyncReceiver<usize>,
    done: mpsc::Sender<Outcome>,
) {
    while let Ok(piece_i) = jobs.recv().await {
        match fetch_and_stage(&mut session, &torrent, &output, piece_i).await {
            Ok(()) => {
                if done.send(Outcome::Verified(piece_i)).await.is_err() {
                    break;
                }
            }
            Err(error) => {
                let _ = done.send(Outcome::Failed { piece_i, error }).await;
                break;
            }
        }
    }
    tracing::debug!(addr = %session.addr(), "session finished");
}

async fn fetch_and_stage(
    session: &mut PeerSession,
    torrent: &Torrent,
    output: &Path,
    piece_i: usize,
) -> Result<()> {
    let piece_size = torrent.piece_size(piece_i);
    let data = session.fetch_piece(piece_i, piece_size).await?;
    verify_piece(&data, torrent.info.pieces.0[piece_i], piece_i)?;
    // One write pass per verified piece; no partial bytes ever land here.
    tokio::fs::write(part_path(output, piece_i), &data).await?;
    tracing::debug!(piece_i, piece_size, "piece verified and staged");
    Ok(())
}

fn verify_piece(data: &[u8], expected: [u8; 20], piece_i: usize) -> Result<()> {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let hash: [u8; 20] = hasher.finalize().into();
    if hash != expected {
        return Err(Error::HashMismatch(piece_i));
    }
    Ok(())
}

/// `<output>.part<piece_i>`, next to the final file.
pub fn part_path(output: &Path, piece_i: usize) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(format!(".part{piece_i}"));
    PathBuf::from(name)
}

/// Stitches the staged pieces together in index order, then removes them.
async fn concatenate(output: &Path, n_pieces: usize) -> Result<()> {
    let mut out = tokio::fs::File::create(output).await?;
    for piece_i in 0..n_pieces {
        let staged = tokio::fs::read(part_path(output, piece_i)).await?;
        out.write_all(&staged).await?;
    }
    out.flush().await?;
    for piece_i in 0..n_pieces {
        tokio::fs::remove_file(part_path(output, piece_i)).await?;
    }
    Ok(())
}

#[test]
fn part_paths_sit_next_to_the_output() {
    assert_eq!(
        part_path(Path::new("/tmp/out.bin"), 3),
        Path::new("/tmp/out.bin.part3")
    );
    assert_eq!(part_path(Path::new("sample"), 0), Path::new("sample.part0"));
}

#[test]
fn verify_piece_flags_corruption() {
    let data = b"some piece bytes";
    let mut hasher = Sha1::new();
    hasher.update(data);
    let good: [u8; 20] = hasher.finalize().into();
    assert!(verify_piece(data, good, 0).is_ok());
    let mut bad = good;
    bad[0] ^= 0xff;
    assert!(matches!(
        verify_piece(data, bad, 7),
        Err(Error::HashMismatch(7))
    ));
}

#[tokio::test]
async fn concatenate_joins_in_index_order() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.bin");
    tokio::fs::write(part_path(&output, 0), b"first-").await.unwrap();
    tokio::fs::write(part_path(&output, 1), b"second-").await.unwrap();
    tokio::fs::write(part_path(&output, 2), b"last").await.unwrap();
    concatenate(&output, 3).await.unwrap();
    assert_eq!(tokio::fs::read(&output).await.unwrap(), b"first-second-last");
    assert!(!part_path(&output, 0).exists());
    assert!(!part_path(&output, 2).exists());
}
