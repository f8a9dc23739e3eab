use std::net::{IpAddr, Ipv4Addr};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use log::debug;
use reqwest::Client;

use crate::bencode::{self, Bencode};
use crate::error::{Result, TorrentError};
use crate::metainfo::TorrentMetadata;

pub const TRACKER_PORT: u16 = 6881;

/// A peer endpoint from the announce response. The peer id is absent in
/// the compact response format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: Option<[u8; 20]>,
    pub ip: IpAddr,
    pub port: u16,
}

impl PeerInfo {
    pub fn addr(&self) -> String {
        if self.ip.is_ipv6() {
            format!("[{}]:{}", self.ip, self.port)
        } else {
            format!("{}:{}", self.ip, self.port)
        }
    }
}

/// Result of announcing to the tracker: our identity for the swarm plus
/// the peer set to dial.
#[derive(Debug, Clone)]
pub struct Announce {
    pub local_id: [u8; 20],
    pub local_port: u16,
    pub interval: u64,
    pub peers: Vec<PeerInfo>,
}

/// Abstraction over the announce round-trip so peer discovery can be
/// tested without HTTP.
#[async_trait]
pub trait TrackerClient: Send + Sync {
    async fn announce(&self, metadata: &TorrentMetadata) -> Result<Announce>;
}

pub struct HttpTrackerClient {
    http: Client,
}

impl HttpTrackerClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl TrackerClient for HttpTrackerClient {
    async fn announce(&self, metadata: &TorrentMetadata) -> Result<Announce> {
        let local_id: [u8; 20] = rand::random();

        // info_hash and peer_id are raw bytes; percent-encode them
        // rather than letting a query builder mangle them as UTF-8.
        let query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&event=started&compact=1",
            percent_encode(&metadata.info_hash),
            percent_encode(&local_id),
            TRACKER_PORT,
            metadata.total_length,
        );
        let url = format!("{}?{}", metadata.announcers[0], query);
        debug!("announcing to {}", metadata.announcers[0]);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("tracker request failed")?;
        if !response.status().is_success() {
            return Err(
                TorrentError::tracker(format!("tracker returned status {}", response.status()))
                    .into(),
            );
        }
        let body = response.bytes().await.context("tracker response read")?;

        let (interval, peers) = parse_announce_response(&body)?;
        Ok(Announce {
            local_id,
            local_port: TRACKER_PORT,
            interval,
            peers,
        })
    }
}

fn percent_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("%{:02X}", b)).collect()
}

fn parse_announce_response(body: &[u8]) -> Result<(u64, Vec<PeerInfo>)> {
    let (_, root) = bencode::decode(body)?;
    let root = root
        .as_dict()
        .ok_or_else(|| anyhow!("tracker response is not a dictionary"))?;

    if let Some(reason) = root.get("failure reason") {
        let reason = reason
            .as_str()
            .unwrap_or_else(|| "unknown failure reason".to_string());
        return Err(TorrentError::tracker(reason).into());
    }

    let interval = root
        .get("interval")
        .and_then(Bencode::as_int)
        .filter(|i| *i >= 0)
        .ok_or_else(|| anyhow!("tracker response is missing the interval"))?
        as u64;

    let peers = match root.get("peers") {
        Some(Bencode::Bytes(compact)) => parse_compact_peers(compact)?,
        Some(Bencode::List(entries)) => parse_full_peers(entries)?,
        _ => return Err(anyhow!("tracker response is missing the peer list")),
    };

    Ok((interval, peers))
}

/// Compact form: 6 bytes per peer, 4-byte IPv4 address then a big-endian
/// port.
fn parse_compact_peers(compact: &[u8]) -> Result<Vec<PeerInfo>> {
    if compact.len() % 6 != 0 {
        return Err(anyhow!(
            "compact peer list of {} bytes is not a multiple of 6",
            compact.len()
        ));
    }
    Ok(compact
        .chunks_exact(6)
        .map(|chunk| PeerInfo {
            id: None,
            ip: IpAddr::V4(Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3])),
            port: u16::from_be_bytes([chunk[4], chunk[5]]),
        })
        .collect())
}

fn parse_full_peers(entries: &[Bencode]) -> Result<Vec<PeerInfo>> {
    let mut peers = Vec::with_capacity(entries.len());
    for entry in entries {
        let entry = entry
            .as_dict()
            .ok_or_else(|| anyhow!("peer entry is not a dictionary"))?;

        let ip: IpAddr = entry
            .get("ip")
            .and_then(Bencode::as_str)
            .ok_or_else(|| anyhow!("peer entry is missing its ip"))?
            .parse()
            .context("peer ip is not an address")?;

        let port = entry
            .get("port")
            .and_then(Bencode::as_int)
            .filter(|p| (0..=u16::MAX as i64).contains(p))
            .ok_or_else(|| anyhow!("peer entry is missing a valid port"))?
            as u16;

        let id = entry
            .get("peer id")
            .and_then(Bencode::as_bytes)
            .and_then(|bytes| <[u8; 20]>::try_from(bytes).ok());

        peers.push(PeerInfo { id, ip, port });
    }
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compact_peers() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali1800e5:peers12:");
        body.extend_from_slice(&[192, 168, 1, 1, 0x1A, 0xE1]); // 192.168.1.1:6881
        body.extend_from_slice(&[10, 0, 0, 5, 0x1A, 0xE2]); // 10.0.0.5:6882
        body.push(b'e');

        let (interval, peers) = parse_announce_response(&body).unwrap();
        assert_eq!(interval, 1800);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].addr(), "192.168.1.1:6881");
        assert_eq!(peers[0].id, None);
        assert_eq!(peers[1].addr(), "10.0.0.5:6882");
    }

    #[test]
    fn test_parse_full_peers() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali900e5:peersl");
        body.extend_from_slice(b"d2:ip9:127.0.0.17:peer id20:");
        body.extend_from_slice(&[7u8; 20]);
        body.extend_from_slice(b"4:porti6881ee");
        body.extend_from_slice(b"ee");

        let (interval, peers) = parse_announce_response(&body).unwrap();
        assert_eq!(interval, 900);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].addr(), "127.0.0.1:6881");
        assert_eq!(peers[0].id, Some([7u8; 20]));
    }

    #[test]
    fn test_failure_reason_is_an_error() {
        let body = b"d14:failure reason13:not supportede";
        let err = parse_announce_response(body).unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn test_missing_interval_is_an_error() {
        let body = b"d5:peers0:e";
        assert!(parse_announce_response(body).is_err());
    }

    #[test]
    fn test_compact_length_not_multiple_of_six() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali60e5:peers7:");
        body.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7]);
        body.push(b'e');
        assert!(parse_announce_response(&body).is_err());
    }

    #[test]
    fn test_percent_encode_raw_bytes() {
        assert_eq!(percent_encode(&[0x00, 0x1A, 0xFF]), "%00%1A%FF");
    }

    #[test]
    fn test_ipv6_addr_is_bracketed() {
        let peer = PeerInfo {
            id: None,
            ip: "2001:db8::1".parse().unwrap(),
            port: 6881,
        };
        assert_eq!(peer.addr(), "[2001:db8::1]:6881");
    }
}
