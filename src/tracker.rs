use crate::error::{Error, Result};
use crate::{PEER_ID, PORT};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt::{self, Write};
use std::net::{Ipv4Addr, SocketAddrV4};

// NOTE: `info_hash` and `peer_id` are not fields here. They are raw bytes,
// and query-string serializers re-escape our percent-encoding of them, so
// they are appended to the URL by hand.
#[derive(Debug, Clone, Serialize)]
struct AnnounceQuery {
    // The port number this peer is nominally listening on. This client
    // never accepts connections; the value is reported anyway because
    // the parameter is mandatory.
    port: u16,

    // The total amount uploaded so far, encoded in base ten ASCII.
    uploaded: usize,

    // The total amount downloaded so far, encoded in base ten ASCII.
    downloaded: usize,

    // The number of bytes this peer still has to download,
    // encoded in base ten ASCII.
    left: usize,

    // Setting this to 1 requests the compact response: the peers list
    // is a byte string of 6 bytes per peer, 4 for the IPv4 address and
    // 2 for the port, both in network byte order.
    compact: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerResponse {
    // Interval in seconds that the client should wait between
    // regular requests to the tracker. Unused: this client announces
    // once per run.
    #[serde(default)]
    pub interval: usize,

    pub peers: CompactPeers,
}

// Trackers report errors in-band as a bencoded dictionary with a
// single `failure reason` key.
#[derive(Debug, Clone, Deserialize)]
struct TrackerFailure {
    #[serde(rename = "failure reason")]
    failure_reason: String,
}

/// Announces to the tracker and returns the compact peer list.
pub async fn announce(url: &str, info_hash: [u8; 20], left: usize) -> Result<TrackerResponse> {
    let query = AnnounceQuery {
        port: PORT,
        uploaded: 0,
        downloaded: 0,
        left,
        compact: 1,
    };
    let url_params = serde_urlencoded::to_string(&query)
        .map_err(|err| Error::Tracker(format!("encode announce parameters: {err}")))?;
    let url = format!(
        "{}?{}&info_hash={}&peer_id={}",
        url,
        url_params,
        url_encode(&info_hash),
        url_encode(PEER_ID)
    );
    tracing::debug!(%url, "announcing to tracker");

    let response = reqwest::get(&url)
        .await
        .map_err(|err| Error::Tracker(err.to_string()))?;
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|err| Error::Tracker(err.to_string()))?;
    if !status.is_success() {
        return Err(Error::Tracker(format!("tracker returned {status}")));
    }

    match serde_bencode::from_bytes::<TrackerResponse>(&body) {
        Ok(response) => {
            tracing::debug!(n_peers = response.peers.0.len(), "tracker responded");
            Ok(response)
        }
        Err(err) => match serde_bencode::from_bytes::<TrackerFailure>(&body) {
            Ok(failure) => Err(Error::Tracker(failure.failure_reason)),
            Err(_) => Err(Error::Protocol(format!("malformed tracker response: {err}"))),
        },
    }
}

/// Percent-encodes every byte, the form trackers accept for the raw
/// `info_hash` and `peer_id` values.
pub fn url_encode(v: &[u8]) -> String {
    v.iter().fold(String::with_capacity(3 * v.len()), |mut out, byte| {
        write!(out, "%{byte:02x}").expect("writing to a String cannot fail");
        out
    })
}

/// The `peers` field of a compact announce response: a byte string
/// packing one `ip:port` per 6 bytes, port in network byte order.
#[derive(Debug, Clone)]
pub struct CompactPeers(pub Vec<SocketAddrV4>);

impl<'de> Deserialize<'de> for CompactPeers {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_bytes(CompactPeersVisitor)
    }
}

struct CompactPeersVisitor;

impl<'de> Visitor<'de> for CompactPeersVisitor {
    type Value = CompactPeers;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a compact peer list, 6 bytes per peer")
    }

    fn visit_bytes<E>(self, raw: &[u8]) -> std::result::Result<Self::Value, E>
    where
        E: de::Error,
    {
        if raw.len() % 6 != 0 {
            return Err(E::custom(format!(
                "compact peer list of {} bytes is not a multiple of 6",
                raw.len()
            )));
        }
        let mut peers = Vec::with_capacity(raw.len() / 6);
        let mut rest = raw;
        while !rest.is_empty() {
            let octets: [u8; 4] = rest[..4].try_into().expect("entry is 6 bytes");
            let port = u16::from_be_bytes([rest[4], rest[5]]);
            peers.push(SocketAddrV4::new(Ipv4Addr::from(octets), port));
            rest = &rest[6..];
        }
        Ok(CompactPeers(peers))
    }
}

#[test]
fn parses_compact_peer_list() {
    let body = b"d8:intervali60e5:peers12:\xc0\xa8\x01\x02\x1a\xe1\x0a\x00\x00\x05\x00\x50e";
    let response: TrackerResponse = serde_bencode::from_bytes(body).unwrap();
    assert_eq!(response.interval, 60);
    let rendered: Vec<String> = response.peers.0.iter().map(|p| p.to_string()).collect();
    assert_eq!(rendered, vec!["192.168.1.2:6881", "10.0.0.5:80"]);
}

#[test]
fn rejects_ragged_peer_list() {
    let body = b"d8:intervali60e5:peers5:\x0a\x00\x00\x05\x00e";
    assert!(serde_bencode::from_bytes::<TrackerResponse>(body).is_err());
}

#[test]
fn parses_failure_reason() {
    let body = b"d14:failure reason15:torrent unknowne";
    let failure: TrackerFailure = serde_bencode::from_bytes(body).unwrap();
    assert_eq!(failure.failure_reason, "torrent unknown");
}

#[test]
fn url_encodes_every_byte() {
    assert_eq!(url_encode(&[0x12, 0xab, 0x00]), "%12%ab%00");
    assert_eq!(url_encode(PEER_ID).len(), 60);
}
