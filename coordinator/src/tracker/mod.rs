use std::{net::SocketAddr, time::Instant};

use url::Url;

mod http;
mod udp;
pub use http::HttpTracker;
pub use udp::UdpTracker;

type Result<T> = std::result::Result<T, TrackerError>;

// In cases where the tracker doesn't give us a min interval.
const DEFAULT_MIN_ANNOUNCE_INTERVAL: u64 = 60; // seconds

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {
    #[error("request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("error deserializing response: {0}")]
    BencodeError(#[from] bencode::Error),

    #[error("timeout")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("invalid url")]
    InvalidUrl,

    #[error("unsupported tracker scheme: {0}")]
    UnsupportedScheme(String),

    #[error("response error: {0}")]
    ResponseError(String),

    #[error("all trackers in every tier failed")]
    Exhausted,
}

/// One announce URL, as carried by a torrent's (possibly tiered) announce list.
#[derive(Debug, Clone)]
pub struct TrackerDescriptor {
    pub url: Url,
}

impl TrackerDescriptor {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

#[async_trait::async_trait]
pub trait Tracker: Send + Sync {
    async fn announce(&mut self, params: AnnounceParams) -> Result<Vec<SocketAddr>>;

    fn can_announce(&self, time: Instant) -> bool;

    fn should_announce(&self, time: Instant) -> bool;
}

async fn make_tracker(descriptor: &TrackerDescriptor) -> Result<Box<dyn Tracker>> {
    match descriptor.url.scheme() {
        "http" | "https" => Ok(Box::new(HttpTracker::new(descriptor.url.clone()))),
        "udp" => Ok(Box::new(UdpTracker::new(descriptor.url.clone()).await)),
        other => Err(TrackerError::UnsupportedScheme(other.to_string())),
    }
}

/// Coordinator-facing tracker collaborator: `start()` announces the
/// torrent once, `get_peers(n)` asks for up to `n` more peers. Both walk the
/// announce-list tiers, trying every tracker in a tier before falling
/// through to the next, as BEP-12 specifies.
#[async_trait::async_trait]
pub trait TrackerClient: Send + Sync {
    async fn start(&mut self) -> Result<Vec<SocketAddr>>;

    async fn get_peers(&mut self, n: usize) -> Result<Vec<SocketAddr>>;
}

pub struct TieredTrackerClient {
    tiers: Vec<Vec<Box<dyn Tracker>>>,
    base_params: AnnounceParams,
}

impl TieredTrackerClient {
    pub async fn new(tiers: Vec<Vec<TrackerDescriptor>>, base_params: AnnounceParams) -> Self {
        let mut built = Vec::with_capacity(tiers.len());
        for tier in tiers {
            let mut built_tier = Vec::with_capacity(tier.len());
            for descriptor in &tier {
                match make_tracker(descriptor).await {
                    Ok(tracker) => built_tier.push(tracker),
                    Err(e) => tracing::warn!(url = %descriptor.url, error = %e, "skipping tracker"),
                }
            }
            if !built_tier.is_empty() {
                built.push(built_tier);
            }
        }
        Self { tiers: built, base_params }
    }

    async fn announce_all_tiers(&mut self, params: AnnounceParams) -> Result<Vec<SocketAddr>> {
        for tier in self.tiers.iter_mut() {
            for tracker in tier.iter_mut() {
                match tracker.announce(params).await {
                    Ok(peers) => return Ok(peers),
                    Err(e) => tracing::warn!(error = %e, "tracker announce failed, trying next"),
                }
            }
        }
        Err(TrackerError::Exhausted)
    }
}

#[async_trait::async_trait]
impl TrackerClient for TieredTrackerClient {
    async fn start(&mut self) -> Result<Vec<SocketAddr>> {
        let params = AnnounceParams { event: Some(Event::Started), ..self.base_params };
        self.announce_all_tiers(params).await
    }

    async fn get_peers(&mut self, n: usize) -> Result<Vec<SocketAddr>> {
        let params = AnnounceParams { event: None, num_want: Some(n), ..self.base_params };
        self.announce_all_tiers(params).await
    }
}

#[derive(Debug, Copy, Clone, Default)]
pub struct AnnounceParams {
    pub info_hash: [u8; 20],
    pub client_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<Event>,
    pub num_want: Option<usize>,
}

#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub enum Event {
    Completed,

    #[default]
    Started,

    Stopped,
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Completed => write!(f, "completed"),
            Event::Started => write!(f, "started"),
            Event::Stopped => write!(f, "stopped"),
        }
    }
}
