use clap::{Parser, Subcommand};
use minibit::bencode::Value;
use minibit::magnet::Magnet;
use minibit::peer::PeerSession;
use minibit::torrent::Torrent;
use minibit::{download, tracker};
use std::net::SocketAddrV4;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
#[clap(rename_all = "snake_case")]
pub enum Command {
    /// Print a bencoded value as JSON.
    Decode { value: String },
    /// Print the metainfo summary of a torrent file.
    Info { torrent: PathBuf },
    /// Announce to the tracker and print the peer list.
    Peers { torrent: PathBuf },
    /// Handshake with one peer and print its peer id.
    Handshake { torrent: PathBuf, peer: SocketAddrV4 },
    /// Download and verify a single piece.
    DownloadPiece {
        #[arg(short)]
        output: PathBuf,
        torrent: PathBuf,
        piece_i: usize,
    },
    /// Download the whole file.
    Download {
        #[arg(short)]
        output: PathBuf,
        torrent: PathBuf,
    },
    /// Print the tracker URL and info hash of a magnet link.
    MagnetParse { link: String },
    /// Handshake with a peer from a magnet link, extensions included.
    MagnetHandshake { link: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Command::Decode { value } => {
            let decoded = Value::decode(value.as_bytes())?;
            println!("{}", decoded.to_json());
        }
        Command::Info { torrent } => {
            let torrent = Torrent::read(torrent).await?;
            println!("Tracker URL: {}", torrent.announce);
            println!("Length: {}", torrent.info.length);
            println!("Info Hash: {}", hex::encode(torrent.info_hash()?));
            println!("Piece Length: {}", torrent.info.piece_length);
            println!("Piece Hashes:");
            for hash in &torrent.info.pieces.0 {
                println!("{}", hex::encode(hash));
            }
        }
        Command::Peers { torrent } => {
            let torrent = Torrent::read(torrent).await?;
            let response =
                tracker::announce(&torrent.announce, torrent.info_hash()?, torrent.info.length)
                    .await?;
            for peer in &response.peers.0 {
                println!("{peer}");
            }
        }
        Command::Handshake { torrent, peer } => {
            let torrent = Torrent::read(torrent).await?;
            let session = PeerSession::connect(peer, torrent.info_hash()?).await?;
            println!("Peer ID: {}", hex::encode(session.remote_peer_id()));
        }
        Command::DownloadPiece {
            output,
            torrent,
            piece_i,
        } => {
            let parsed = Torrent::read(&torrent).await?;
            download::piece(&parsed, piece_i, &output).await?;
            println!("Piece {} downloaded to {}.", piece_i, output.display());
        }
        Command::Download { output, torrent } => {
            let parsed = Torrent::read(&torrent).await?;
            download::all(&parsed, &output).await?;
            println!("Downloaded {} to {}.", torrent.display(), output.display());
        }
        Command::MagnetParse { link } => {
            let magnet = Magnet::parse(&link)?;
            println!("Tracker URL: {}", magnet.tracker_url);
            println!("Info Hash: {}", hex::encode(magnet.info_hash));
        }
        Command::MagnetHandshake { link } => {
            let magnet = Magnet::parse(&link)?;
            // The content length is unknown until the metadata exchange,
            // so announce with a placeholder.
            let response = tracker::announce(&magnet.tracker_url, magnet.info_hash, 999).await?;
            let mut handshaken = false;
            for &addr in &response.peers.0 {
                let mut session = match PeerSession::connect(addr, magnet.info_hash).await {
                    Ok(session) => session,
                    Err(err) => {
                        tracing::warn!(%addr, %err, "failed to connect");
                        continue;
                    }
                };
                if !session.remote_supports_extensions() {
                    tracing::debug!(%addr, "peer has no extension support, trying the next");
                    continue;
                }
                session.await_bitfield().await?;
                let ut_metadata = session.extension_handshake().await?;
                println!("Peer ID: {}", hex::encode(session.remote_peer_id()));
                if let Some(ut_metadata) = ut_metadata {
                    println!("Peer Metadata Extension ID: {ut_metadata}");
                }
                handshaken = true;
                break;
            }
            anyhow::ensure!(handshaken, "no peer with extension support found");
        }
    }
    Ok(())
}
