use crate::error::{Error, Result};
use pieces::PieceHashes;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::path::Path;

/// A parsed metainfo (`.torrent`) file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Torrent {
    // The URL of the tracker.
    pub announce: String,
    pub info: Info,
}

impl Torrent {
    pub async fn read(path: impl AsRef<Path>) -> Result<Self> {
        let raw = tokio::fs::read(path).await?;
        let torrent: Torrent = serde_bencode::from_bytes(&raw)
            .map_err(|err| Error::Metainfo(err.to_string()))?;
        torrent.validate()?;
        Ok(torrent)
    }

    /// SHA-1 of the bencoded `info` dictionary. serde_bencode emits
    /// dictionary keys sorted, so re-serializing the parsed struct
    /// reproduces the canonical bytes the torrent was hashed from.
    pub fn info_hash(&self) -> Result<[u8; 20]> {
        let bencoded_info = serde_bencode::to_bytes(&self.info)
            .map_err(|err| Error::Metainfo(err.to_string()))?;
        let mut hasher = Sha1::new();
        hasher.update(&bencoded_info);
        Ok(hasher.finalize().into())
    }

    pub fn n_pieces(&self) -> usize {
        self.info.pieces.0.len()
    }

    /// All pieces are `piece length` bytes except possibly the last.
    pub fn piece_size(&self, piece_i: usize) -> usize {
        if piece_i == self.n_pieces() - 1 {
            let modulo = self.info.length % self.info.piece_length;
            if modulo == 0 {
                self.info.piece_length
            } else {
                modulo
            }
        } else {
            self.info.piece_length
        }
    }

    fn validate(&self) -> Result<()> {
        if self.info.length == 0 {
            return Err(Error::Metainfo("file length is zero".into()));
        }
        if self.info.piece_length == 0 {
            return Err(Error::Metainfo("piece length is zero".into()));
        }
        let expected = self.info.length.div_ceil(self.info.piece_length);
        if expected != self.n_pieces() {
            return Err(Error::Metainfo(format!(
                "{} bytes in {}-byte pieces needs {} hashes, found {}",
                self.info.length,
                self.info.piece_length,
                expected,
                self.n_pieces()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Info {
    // The `name` key maps to a UTF-8 encoded string which is
    // the suggested name to save the file as. Purely advisory here:
    // output paths come from the command line.
    pub name: String,

    #[serde(rename = "piece length")]
    // `piece length` maps to the number of bytes in each piece
    // the file is split into. All pieces are the same length except
    // for possibly the last one which may be truncated.
    pub piece_length: usize,

    // `pieces` maps to a string whose length is a multiple of 20.
    // It is to be subdivided into strings of length 20, each of
    // which is the SHA1 hash of the piece at the corresponding index.
    pub pieces: PieceHashes,

    // Single-file torrents only: the length of the file in bytes.
    pub length: usize,
}

/// Serde glue for the `pieces` field, which bencodes as one long byte
/// string of back-to-back 20-byte SHA-1 digests rather than a list.
pub mod pieces {
    use serde::de::{self, Visitor};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::fmt;

    #[derive(Debug, Clone)]
    pub struct PieceHashes(pub Vec<[u8; 20]>);

    impl Serialize for PieceHashes {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            let mut raw = Vec::with_capacity(20 * self.0.len());
            for digest in &self.0 {
                raw.extend_from_slice(digest);
            }
            serializer.serialize_bytes(&raw)
        }
    }

    impl<'de> Deserialize<'de> for PieceHashes {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_bytes(PieceHashesVisitor)
        }
    }

    struct PieceHashesVisitor;

    impl<'de> Visitor<'de> for PieceHashesVisitor {
        type Value = PieceHashes;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("concatenated 20-byte SHA-1 digests")
        }

        fn visit_bytes<E>(self, raw: &[u8]) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if raw.len() % 20 != 0 {
                return Err(E::custom(format!(
                    "pieces field of {} bytes cannot hold whole 20-byte digests",
                    raw.len()
                )));
            }
            let mut digests = Vec::with_capacity(raw.len() / 20);
            let mut rest = raw;
            while !rest.is_empty() {
                let mut digest = [0u8; 20];
                digest.copy_from_slice(&rest[..20]);
                digests.push(digest);
                rest = &rest[20..];
            }
            Ok(PieceHashes(digests))
        }
    }
}

#[cfg(test)]
fn sample_torrent(length: usize, piece_length: usize, n_pieces: usize) -> Torrent {
    Torrent {
        announce: "http://tracker.example/announce".to_string(),
        info: Info {
            name: "sample".to_string(),
            piece_length,
            pieces: PieceHashes(vec![[0xab; 20]; n_pieces]),
            length,
        },
    }
}

#[test]
fn piece_count_and_sizes() {
    let torrent = sample_torrent(92064, 32768, 3);
    torrent.validate().unwrap();
    assert_eq!(torrent.n_pieces(), 3);
    assert_eq!(torrent.piece_size(0), 32768);
    assert_eq!(torrent.piece_size(1), 32768);
    assert_eq!(torrent.piece_size(2), 92064 - 32768 * 2);
    assert_eq!(torrent.piece_size(2), 26528);
}

#[test]
fn last_piece_may_be_full_length() {
    let torrent = sample_torrent(65536, 32768, 2);
    torrent.validate().unwrap();
    assert_eq!(torrent.piece_size(1), 32768);
}

#[test]
fn rejects_inconsistent_piece_count() {
    let torrent = sample_torrent(92064, 32768, 2);
    assert!(torrent.validate().is_err());
}

#[test]
fn parses_metainfo_bytes() {
    let raw = b"d8:announce31:http://tracker.example/announce4:infod6:lengthi40e4:name6:sample12:piece lengthi20e6:pieces40:aaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbbbbbee";
    let torrent: Torrent = serde_bencode::from_bytes(raw).unwrap();
    torrent.validate().unwrap();
    assert_eq!(torrent.announce, "http://tracker.example/announce");
    assert_eq!(torrent.info.length, 40);
    assert_eq!(torrent.info.piece_length, 20);
    assert_eq!(torrent.info.pieces.0, vec![[b'a'; 20], [b'b'; 20]]);
}

#[test]
fn info_hash_matches_reencoded_info() {
    let torrent = sample_torrent(40, 20, 2);
    let bencoded = serde_bencode::to_bytes(&torrent.info).unwrap();
    let mut hasher = Sha1::new();
    hasher.update(&bencoded);
    let expected: [u8; 20] = hasher.finalize().into();
    assert_eq!(torrent.info_hash().unwrap(), expected);
}
