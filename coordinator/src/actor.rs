use std::{net::SocketAddr, sync::Arc};

use tokio::{net::TcpListener, sync::mpsc, time};

use crate::{
    coordinator::{Coordinator, CoordinatorError, Effect},
    fs::FileManager,
    metainfo::Metainfo,
    p2p::{PeerEvent, PeerEventKind, PeerEventRx, PeerEventTx, TcpPeerConnector},
    tracker::TrackerClient,
    CoordinatorConfig,
};

#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Drives a `Coordinator` to completion. Owns the tick timer, the peer-event
/// channel every session reports to, and the inbound listener; the
/// coordinator itself never touches a socket.
pub struct CoordinatorActor {
    coordinator: Coordinator,
    event_tx: PeerEventTx,
    event_rx: PeerEventRx,
    listen_address: SocketAddr,
    tick_interval: std::time::Duration,
}

impl CoordinatorActor {
    /// Wires up the event channel, builds the real outbound `TcpPeerConnector`
    /// around it, and hands both to a fresh `Coordinator`.
    pub fn new(
        metainfo: Arc<dyn Metainfo>,
        file_manager: Arc<dyn FileManager>,
        tracker: Box<dyn TrackerClient>,
        config: &CoordinatorConfig,
    ) -> Self {
        let (event_tx, event_rx): (PeerEventTx, PeerEventRx) = mpsc::unbounded_channel();
        let connector = Box::new(TcpPeerConnector::new(metainfo.info_hash(), config.client_id, event_tx.clone()));
        let coordinator = Coordinator::new(metainfo, file_manager, tracker, connector, config);
        Self {
            coordinator,
            event_tx,
            event_rx,
            listen_address: config.listen_address,
            tick_interval: config.tick_interval,
        }
    }

    #[tracing::instrument(skip_all, name = "coordinator")]
    pub async fn run(mut self) -> Result<(), ActorError> {
        self.coordinator.initialize().await?;
        let mut completion = self.coordinator.start().await?;

        let listener = TcpListener::bind(self.listen_address).await?;
        tracing::info!(address = %self.listen_address, "listening");

        let mut ticker = time::interval(self.tick_interval);
        ticker.tick().await; // first tick fires immediately; consume it here

        loop {
            tokio::select! {
                _ = &mut completion => {
                    tracing::info!("download complete");
                    return Ok(());
                }

                _ = ticker.tick() => {
                    let effects = self.coordinator.tick();
                    self.apply(effects).await;
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((_stream, addr)) => {
                            tracing::debug!(%addr, "inbound connection ignored, this coordinator is outbound-only");
                        }
                        Err(e) => tracing::warn!(error = %e, "inbound accept failed"),
                    }
                }

                event = self.event_rx.recv() => {
                    let Some(event) = event else { return Ok(()) };
                    self.handle_event(event).await;
                }
            }
        }
    }

    async fn handle_event(&mut self, event: PeerEvent) {
        let PeerEvent { addr, kind } = event;
        let effects = match kind {
            PeerEventKind::Unconnected => self.coordinator.remove_peer(addr),
            PeerEventKind::Bitfield(bf) => self.coordinator.peer_bitfield(addr, bf),
            PeerEventKind::Has(idx) => self.coordinator.peer_has(addr, idx as usize),
            PeerEventKind::Choked => self.coordinator.peer_choked(addr),
            PeerEventKind::Unchoked => self.coordinator.peer_unchoked(addr),
            PeerEventKind::Block { index, begin, data } => self.coordinator.peer_sent_block(addr, index, begin, data),
            // This coordinator never serves uploads (see `p2p::run_session`).
            PeerEventKind::Interested | PeerEventKind::NotInterested => Vec::new(),
        };
        self.apply(effects).await;
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::ConnectPeers(k) => self.coordinator.connect_to_peers(k).await,
            }
        }
    }
}
