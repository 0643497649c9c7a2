use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use coordinator::{
    fs::DiskFileManager,
    tracker::{AnnounceParams, TieredTrackerClient},
    BencodeMetainfo, CoordinatorActor, CoordinatorConfig, Metainfo,
};

type DynMetainfo = std::sync::Arc<dyn Metainfo>;

const DEFAULT_PORT: u16 = 6881;
const DEFAULT_CLIENT_ID: [u8; 20] = *b"-RS0001-000000000000";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    let torrent_path = std::env::args().nth(1).unwrap_or_else(|| {
        eprintln!("usage: coordinator <path-to-torrent> [output-dir]");
        std::process::exit(1);
    });
    let output_dir = std::env::args().nth(2).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("downloads"));

    let metainfo: DynMetainfo = match BencodeMetainfo::from_path(&torrent_path) {
        Ok(m) => Arc::new(m),
        Err(e) => {
            tracing::error!(error = %e, "failed to load torrent");
            std::process::exit(1);
        }
    };
    tracing::info!(name = metainfo.name(), pieces = metainfo.num_pieces(), "loaded torrent");

    let config = CoordinatorConfig {
        client_id: DEFAULT_CLIENT_ID,
        listen_address: SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), DEFAULT_PORT),
        output_dir: output_dir.clone(),
        ..CoordinatorConfig::default()
    };

    let file_manager: Arc<dyn coordinator::fs::FileManager> =
        match DiskFileManager::new(metainfo.as_ref(), &output_dir) {
            Ok(fm) => Arc::new(fm),
            Err(e) => {
                tracing::error!(error = %e, "failed to set up output files");
                std::process::exit(1);
            }
        };

    let announce_params = AnnounceParams {
        info_hash: metainfo.info_hash(),
        client_id: config.client_id,
        port: config.listen_address.port(),
        uploaded: 0,
        downloaded: 0,
        left: metainfo.total_length(),
        event: None,
        num_want: None,
    };
    let tracker = TieredTrackerClient::new(metainfo.announce_tiers(), announce_params).await;

    let actor = CoordinatorActor::new(metainfo, file_manager, Box::new(tracker), &config);

    if let Err(e) = actor.run().await {
        tracing::error!(error = %e, "coordinator exited with error");
        std::process::exit(1);
    }
}
