use std::future::Future;
use std::sync::Arc;

use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::monitor::latency_store::LatencyStore;
use crate::monitor::monitor_config::{MonitorConfig, NodeLatencyConfig};
use crate::monitor::node_events::NodeEvent;
use crate::monitor::ping_engine::PingEngine;
use crate::monitor::report_client::ReportClientProvider;
use crate::net::ip_family::IpFamily;
use crate::net::packet_conn::{PacketConn, SocketFactory};
use crate::stats::node_summary::NodeSummary;

/// The per-node agent loop: owns the ticker and the sockets, and switches between 'disabled' and
///  'enabled' as configuration snapshots arrive.
///
/// All sends happen on the scheduler's own task. Each open socket has a receive loop running on a
///  separate task; closing the socket is what ends it, and the scheduler waits for that to happen
///  before it forgets the socket.
pub struct ProbeScheduler {
    config: Arc<NodeLatencyConfig>,
    store: Arc<LatencyStore>,
    engine: Arc<PingEngine>,
    socket_factory: Arc<dyn SocketFactory>,
    client_provider: Arc<dyn ReportClientProvider>,
    ticker: Option<Interval>,
    ipv4_socket: Option<ActiveSocket>,
    ipv6_socket: Option<ActiveSocket>,
}

struct ActiveSocket {
    conn: Arc<dyn PacketConn>,
    receiver: JoinHandle<()>,
}

impl ProbeScheduler {
    pub fn new(
        config: Arc<NodeLatencyConfig>,
        store: Arc<LatencyStore>,
        socket_factory: Arc<dyn SocketFactory>,
        client_provider: Arc<dyn ReportClientProvider>,
    ) -> ProbeScheduler {
        ProbeScheduler {
            config,
            engine: Arc::new(PingEngine::new(store.clone())),
            store,
            socket_factory,
            client_provider,
            ticker: None,
            ipv4_socket: None,
            ipv6_socket: None,
        }
    }

    /// Runs until `shutdown` completes, then closes all sockets and waits for the receive loops to
    ///  finish.
    ///
    /// Configuration snapshots arrive through a `watch` channel, so a snapshot that was not picked
    ///  up yet is replaced by a newer one rather than queued. If either channel's sending side goes
    ///  away, the scheduler keeps running with what it has.
    pub async fn run(
        mut self,
        mut config_changes: watch::Receiver<MonitorConfig>,
        mut node_events: mpsc::Receiver<NodeEvent>,
        shutdown: impl Future<Output = ()>,
    ) {
        info!("starting latency monitor for node {}", self.config.node_name);

        let initial_config = *config_changes.borrow_and_update();
        self.on_config_changed(initial_config).await;

        tokio::pin!(shutdown);
        let mut config_open = true;
        let mut node_events_open = true;

        loop {
            select! {
                _ = next_tick(&mut self.ticker) => {
                    self.on_tick().await;
                }
                changed = config_changes.changed(), if config_open => {
                    match changed {
                        Ok(()) => {
                            let config = *config_changes.borrow_and_update();
                            self.on_config_changed(config).await;
                        }
                        Err(_) => {
                            debug!("configuration source is gone - keeping the current configuration");
                            config_open = false;
                        }
                    }
                }
                evt = node_events.recv(), if node_events_open => {
                    match evt {
                        Some(evt) => self.on_node_event(evt).await,
                        None => {
                            debug!("node event source is gone - keeping the current set of nodes");
                            node_events_open = false;
                        }
                    }
                }
                _ = &mut shutdown => break,
            }
        }

        self.stop_probing().await;
        info!("latency monitor for node {} stopped", self.config.node_name);
    }

    async fn on_config_changed(&mut self, config: MonitorConfig) {
        if config.enabled {
            let interval = config.effective_interval();
            info!("latency monitoring enabled, probing every {:?}", interval);

            // (re)starting the ticker means the first pass happens one full interval from now
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.ticker = Some(ticker);

            for family in IpFamily::ALL {
                if self.config.is_family_enabled(family) {
                    self.ensure_socket(family).await;
                }
            }
        }
        else {
            if self.ticker.is_some() {
                info!("latency monitoring disabled");
            }
            self.stop_probing().await;
        }
    }

    async fn ensure_socket(&mut self, family: IpFamily) {
        if let Some(socket) = self.socket_slot(family).take() {
            if !socket.receiver.is_finished() {
                *self.socket_slot(family) = Some(socket);
                return;
            }
            warn!("{} receive loop has ended, reopening the socket", family);
            close_socket(socket).await;
        }

        match self.socket_factory.open(family).await {
            Ok(conn) => {
                let receiver = {
                    let engine = self.engine.clone();
                    let conn = conn.clone();
                    let buffer_size = self.config.effective_receive_buffer_size();
                    tokio::spawn(async move {
                        engine.receive_loop(conn, family, buffer_size).await
                    })
                };
                *self.socket_slot(family) = Some(ActiveSocket {
                    conn,
                    receiver,
                });
            }
            Err(e) => {
                error!("failed to open {} socket, {} peers are not probed until the next configuration change: {:#}", family, family, e);
            }
        }
    }

    fn socket_slot(&mut self, family: IpFamily) -> &mut Option<ActiveSocket> {
        match family {
            IpFamily::V4 => &mut self.ipv4_socket,
            IpFamily::V6 => &mut self.ipv6_socket,
        }
    }

    fn socket(&self, family: IpFamily) -> Option<&Arc<dyn PacketConn>> {
        let slot = match family {
            IpFamily::V4 => &self.ipv4_socket,
            IpFamily::V6 => &self.ipv6_socket,
        };
        slot.as_ref().map(|s| &s.conn)
    }

    /// Stops the ticker, closes all sockets and waits for their receive loops to end. Only then
    ///  are the sockets dropped, so no receive loop outlives its socket handle.
    async fn stop_probing(&mut self) {
        self.ticker = None;

        for socket in [&self.ipv4_socket, &self.ipv6_socket].into_iter().flatten() {
            socket.conn.close();
        }
        for socket in [&mut self.ipv4_socket, &mut self.ipv6_socket].into_iter().flatten() {
            await_receiver(&mut socket.receiver).await;
        }

        let had_sockets = self.ipv4_socket.is_some() || self.ipv6_socket.is_some();
        self.ipv4_socket = None;
        self.ipv6_socket = None;
        if had_sockets {
            debug!("all sockets closed");
        }
    }

    async fn on_tick(&self) {
        self.ping_all().await;
        self.report().await;
    }

    async fn ping_all(&self) {
        let peers = self.store.list_peer_ips().await;
        debug!("probing {} peer IPs", peers.len());

        for ip in peers {
            let family = IpFamily::of(&ip);
            match self.socket(family) {
                Some(conn) => {
                    if let Err(e) = self.engine.send_ping(conn.as_ref(), ip).await {
                        error!("failed to ping {}: {:#}", ip, e);
                    }
                }
                None => error!("cannot ping {}: no {} socket is open", ip, family),
            }
        }
    }

    async fn report(&self) {
        let summary = NodeSummary {
            source_node: self.config.node_name.clone(),
            entries: self.store.peer_latencies().await,
        };

        let client = match self.client_provider.get_client().await {
            Ok(client) => client,
            Err(e) => {
                error!("no report client available, skipping this report: {:#}", e);
                return;
            }
        };

        let num_entries = summary.entries.len();
        match client.push(summary).await {
            Ok(()) => debug!("reported {} latency entries", num_entries),
            Err(e) => error!("failed to report latency summary: {:#}", e),
        }
    }

    async fn on_node_event(&self, evt: NodeEvent) {
        if evt.node_name() == self.config.node_name {
            trace!("ignoring event for the local node: {:?}", evt);
            return;
        }

        match evt {
            NodeEvent::NodeAdded(data) => self.store.add_node(&data.name, &data.ips).await,
            NodeEvent::NodeUpdated(data) => self.store.update_node(&data.name, &data.ips).await,
            NodeEvent::NodeDeleted(data) => self.store.delete_node(&data.name).await,
        }
    }

    #[cfg(test)]
    fn num_running_receivers(&self) -> usize {
        [&self.ipv4_socket, &self.ipv6_socket].into_iter()
            .flatten()
            .filter(|s| !s.receiver.is_finished())
            .count()
    }
}

async fn close_socket(mut socket: ActiveSocket) {
    socket.conn.close();
    await_receiver(&mut socket.receiver).await;
}

async fn await_receiver(receiver: &mut JoinHandle<()>) {
    if let Err(e) = receiver.await {
        warn!("receive loop terminated abnormally: {}", e);
    }
}

/// pending forever while there is no ticker, i.e. while monitoring is disabled
async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
