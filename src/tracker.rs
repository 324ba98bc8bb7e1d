use std::{
    future::Future,
    net::{Ipv4Addr, SocketAddrV4},
    str::FromStr,
};

use anyhow::{bail, Context};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Peer endpoint as handed out by a peer source. The id is only present in
/// the non-compact tracker response form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerInfo {
    pub id: Option<Bytes>,
    pub addr: SocketAddrV4,
}

/// Source of peer endpoints for one torrent.
pub trait PeerFinder {
    fn get_peers(&self) -> impl Future<Output = anyhow::Result<Vec<PeerInfo>>> + Send;
}

/// Fixed endpoint list, used to sidestep the tracker entirely.
#[derive(Debug, Clone)]
pub struct DirectPeers(pub Vec<SocketAddrV4>);

impl PeerFinder for DirectPeers {
    async fn get_peers(&self) -> anyhow::Result<Vec<PeerInfo>> {
        Ok(self
            .0
            .iter()
            .map(|addr| PeerInfo {
                id: None,
                addr: *addr,
            })
            .collect())
    }
}

/// HTTP(S) announce against the metainfo's tracker.
#[derive(Debug, Clone)]
pub struct HttpTracker {
    pub announce: String,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub left: u64,
}

impl PeerFinder for HttpTracker {
    async fn get_peers(&self) -> anyhow::Result<Vec<PeerInfo>> {
        tracing::debug!("Announcing to tracker {}", self.announce);
        let url_params = HttpAnnounceUrlParams::from_tracker(self);
        let tracker_url = format!(
            "{}?{}&info_hash={}",
            self.announce,
            serde_urlencoded::to_string(&url_params)?,
            &urlencode(&self.info_hash)
        );
        let response = reqwest::get(tracker_url)
            .await
            .context("announce request")?;
        let announce_bytes = response.bytes().await.context("announce body")?;
        let response: HttpAnnounceResponse =
            serde_bencode::from_bytes(&announce_bytes).context("decode announce response")?;
        response.into_peers()
    }
}

fn urlencode(t: &[u8; 20]) -> String {
    let mut encoded = String::with_capacity(3 * t.len());
    for &byte in t {
        encoded.push('%');
        encoded.push_str(&hex::encode([byte]));
    }
    encoded
}

#[derive(Serialize, Debug, Clone)]
struct HttpAnnounceUrlParams {
    /// A string of length 20 which this downloader uses as its id.
    peer_id: String,
    /// The port number this peer is listening on.
    port: u16,
    uploaded: u64,
    downloaded: u64,
    /// The number of bytes this peer still has to download.
    left: u64,
    compact: u8,
    event: &'static str,
}

impl HttpAnnounceUrlParams {
    fn from_tracker(tracker: &HttpTracker) -> Self {
        Self {
            peer_id: String::from_utf8_lossy(&tracker.peer_id).into_owned(),
            port: tracker.port,
            uploaded: 0,
            downloaded: 0,
            left: tracker.left,
            compact: 1,
            event: "started",
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
struct HttpAnnounceFullPeer {
    #[serde(rename = "peer id")]
    peer_id: Option<Bytes>,
    ip: String,
    port: u16,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
enum HttpPeerList {
    Full(Vec<HttpAnnounceFullPeer>),
    Compact(Bytes),
}

#[derive(Deserialize, Debug, Clone)]
struct HttpAnnounceResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default)]
    #[allow(unused)]
    interval: Option<u32>,
    peers: Option<HttpPeerList>,
}

impl HttpAnnounceResponse {
    fn into_peers(self) -> anyhow::Result<Vec<PeerInfo>> {
        if let Some(reason) = self.failure_reason {
            bail!("tracker failure: {reason}");
        }
        match self.peers {
            Some(HttpPeerList::Full(peers)) => {
                let mut result = Vec::with_capacity(peers.len());
                for peer in peers {
                    let Ok(ip) = Ipv4Addr::from_str(&peer.ip) else {
                        tracing::warn!("Skipping peer with unsupported address {}", peer.ip);
                        continue;
                    };
                    result.push(PeerInfo {
                        id: peer.peer_id,
                        addr: SocketAddrV4::new(ip, peer.port),
                    });
                }
                Ok(result)
            }
            Some(HttpPeerList::Compact(bytes)) => decode_compact_peers(&bytes),
            None => bail!("tracker response carries no peers"),
        }
    }
}

/// Compact tracker form: 6 byte chunks of IPv4 + big-endian port.
pub fn decode_compact_peers(bytes: &[u8]) -> anyhow::Result<Vec<PeerInfo>> {
    if bytes.len() % 6 != 0 {
        bail!(
            "compact peers payload of {} bytes cannot be split into 6 byte chunks",
            bytes.len()
        );
    }
    let mut result = Vec::with_capacity(bytes.len() / 6);
    for chunk in bytes.chunks_exact(6) {
        let ip = Ipv4Addr::from(u32::from_be_bytes(chunk[0..4].try_into().unwrap()));
        let port = u16::from_be_bytes(chunk[4..6].try_into().unwrap());
        result.push(PeerInfo {
            id: None,
            addr: SocketAddrV4::new(ip, port),
        });
    }
    Ok(result)
}
