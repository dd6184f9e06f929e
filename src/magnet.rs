use crate::error::{Error, Result};

/// The two parameters this client needs from a magnet URI: `xt=urn:btih:<40
/// hex chars>` and `tr=<tracker url>`. Everything else is ignored.
#[derive(Debug, Clone)]
pub struct Magnet {
    pub tracker_url: String,
    pub info_hash: [u8; 20],
}

impl Magnet {
    pub fn parse(link: &str) -> Result<Self> {
        let query = link
            .strip_prefix("magnet:?")
            .ok_or_else(|| Error::Metainfo("not a magnet link".into()))?;

        let mut tracker_url = None;
        let mut info_hash = None;
        for pair in query.split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            match key {
                "xt" => {
                    let hex_digest = value.strip_prefix("urn:btih:").ok_or_else(|| {
                        Error::Metainfo(format!("unsupported exact topic {value:?}"))
                    })?;
                    let digest = hex::decode(hex_digest)
                        .map_err(|_| Error::Metainfo("info hash is not hex".into()))?;
                    let digest: [u8; 20] = digest
                        .try_into()
                        .map_err(|_| Error::Metainfo("info hash is not 20 bytes".into()))?;
                    info_hash = Some(digest);
                }
                "tr" => {
                    let decoded = urlencoding::decode(value)
                        .map_err(|_| Error::Metainfo("tracker URL is not UTF-8".into()))?;
                    tracker_url = Some(decoded.into_owned());
                }
                _ => {}
            }
        }

        Ok(Magnet {
            tracker_url: tracker_url
                .ok_or_else(|| Error::Metainfo("magnet link has no tracker (tr)".into()))?,
            info_hash: info_hash
                .ok_or_else(|| Error::Metainfo("magnet link has no info hash (xt)".into()))?,
        })
    }
}

#[test]
fn parses_magnet_link() {
    let link = "magnet:?xt=urn:btih:ad42ce8109f54c99613ce38f9b4d87e70f24a165&dn=magnet1.gif&tr=http%3A%2F%2Fbittorrent-test-tracker.codecrafters.io%2Fannounce";
    let magnet = Magnet::parse(link).unwrap();
    assert_eq!(
        magnet.tracker_url,
        "http://bittorrent-test-tracker.codecrafters.io/announce"
    );
    assert_eq!(
        hex::encode(magnet.info_hash),
        "ad42ce8109f54c99613ce38f9b4d87e70f24a165"
    );
}

#[test]
fn ignores_unknown_parameters() {
    let link = "magnet:?dn=file.txt&xt=urn:btih:0000000000000000000000000000000000000001&tr=http%3A%2F%2Ft.example%2Fa&x.pe=1.2.3.4";
    let magnet = Magnet::parse(link).unwrap();
    assert_eq!(magnet.tracker_url, "http://t.example/a");
    assert_eq!(magnet.info_hash[19], 0x01);
}

#[test]
fn rejects_incomplete_links() {
    assert!(Magnet::parse("http://example.com").is_err());
    assert!(Magnet::parse("magnet:?tr=http%3A%2F%2Ft.example").is_err());
    assert!(Magnet::parse("magnet:?xt=urn:btih:abcd").is_err());
    assert!(
        Magnet::parse("magnet:?xt=urn:btih:0000000000000000000000000000000000000001").is_err()
    );
}
