use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

/// Typed, in-code configuration for a single torrent's coordinator.
///
/// Built directly by the caller; there is no file/env/CLI loading layer here.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub client_id: [u8; 20],

    pub listen_address: SocketAddr,

    pub output_dir: PathBuf,

    /// Number of peer connections the pool tries to keep open.
    pub peer_pool_size: usize,

    /// Interval between timer sweeps.
    pub tick_interval: Duration,

    /// Ticks of no unchoke after which an `interested` reservation is released.
    pub stale_interest_ticks: u64,

    /// Ticks of no block after which an outstanding request is retried or released.
    pub stale_request_ticks: u64,

    /// Retries attempted on a stale request before giving up on the peer.
    pub max_request_retries: u32,
}

const DEFAULT_CLIENT_ID: [u8; 20] = *b"-RS0001-000000000000";

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID,
            listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 6881),
            output_dir: PathBuf::from("downloads"),
            peer_pool_size: 20,
            tick_interval: Duration::from_secs(10),
            stale_interest_ticks: 4,
            stale_request_ticks: 5,
            max_request_retries: 2,
        }
    }
}
