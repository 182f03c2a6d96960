//! UDP Proxy (component B, §4.1).
//!
//! One listen socket, one upstream socket per client, idle eviction, PROXY
//! protocol v2 chain stripping on ingress.
//!
//! Grounded on the teacher's RakNet proxy server: a listen socket driving a
//! `recv_from` loop, a `HashMap<SocketAddr, Arc<Client>>` table mutated
//! under an `RwLock`, one upstream socket bound per accepted client, and a
//! task spawned per client to pump upstream datagrams back to the listen
//! socket. We drop the RakNet handshake/MOTD interception the teacher
//! layers on top since this proxy never interprets Bedrock application
//! data, only the PROXY-v2 envelope, if any, that precedes it.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::net::UdpSocket;
use tokio::sync::{Notify, RwLock};

use crate::proxy_protocol::parse_proxy_protocol_chain;

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const EVICTION_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const MAX_DATAGRAM: usize = 2048;

/// Activity callback: `(clientIP, clientPort, payload byte count)`.
pub type ActivityCallback = Arc<dyn Fn(IpAddr, u16, usize) + Send + Sync>;

/// Player-action callback slot (§4.1's second callback slot). Reserved:
/// the proxy relays opaque datagrams and never decodes Bedrock application
/// data, so it has no player identity to report here. Player join/leave is
/// sourced from the supervisor's log-pattern detection instead (see
/// DESIGN.md's Open Question resolution).
pub type PlayerActionCallback = Arc<dyn Fn(IpAddr, u16, &str) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct UdpProxyOptions {
    pub listen_address: SocketAddr,
    pub destination_address: SocketAddr,
    pub proxy_protocol_v2_enabled: bool,
    pub idle_timeout: Duration,
}

impl UdpProxyOptions {
    pub fn new(listen_address: SocketAddr, destination_address: SocketAddr) -> Self {
        Self {
            listen_address,
            destination_address,
            proxy_protocol_v2_enabled: false,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// A single client-key's worth of proxy state. Key = `clientAddress:clientPort`.
struct ProxyConnection {
    /// Fresh ephemeral-port socket used for Proxy <-> Target traffic.
    upstream_sock: UdpSocket,
    last_activity: RwLock<Instant>,
    /// Resolved original client tuple: PROXY-v2 result, else a memoised
    /// probe, else the raw listen-socket peer.
    original: RwLock<(IpAddr, u16)>,
    /// Signals the pump task spawned in `get_or_create_connection` to stop
    /// reading from `upstream_sock` and exit, mirroring the teacher's
    /// `close_tx`/`close_lock` shutdown signal for `RaknetClient` (removing
    /// a connection from the table alone does not stop its pump task, since
    /// the task holds its own `Arc` clone).
    close_notify: Notify,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionStat {
    pub key: String,
    pub last_activity_ms_ago: u128,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProxyStats {
    pub running: bool,
    pub active_connections: usize,
    pub per_connection: Vec<ConnectionStat>,
}

/// UDP relay for a single server record's listen/destination pair.
pub struct UdpProxy {
    options: RwLock<UdpProxyOptions>,
    listen_sock: RwLock<Option<Arc<UdpSocket>>>,
    connections: RwLock<HashMap<String, Arc<ProxyConnection>>>,
    /// Memoised original tuple from header-only probe packets (§4.1 step 3).
    real_client_info: RwLock<HashMap<String, (IpAddr, u16)>>,
    running: AtomicBool,
    stop_notify: Notify,
    activity_cb: RwLock<Option<ActivityCallback>>,
    #[allow(dead_code)]
    player_action_cb: RwLock<Option<PlayerActionCallback>>,
}

impl UdpProxy {
    pub fn new(options: UdpProxyOptions) -> Arc<Self> {
        Arc::new(Self {
            options: RwLock::new(options),
            listen_sock: RwLock::new(None),
            connections: RwLock::new(HashMap::new()),
            real_client_info: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            stop_notify: Notify::new(),
            activity_cb: RwLock::new(None),
            player_action_cb: RwLock::new(None),
        })
    }

    pub async fn set_activity_callback(&self, cb: ActivityCallback) {
        *self.activity_cb.write().await = Some(cb);
    }

    /// Installs the reserved player-action callback. Never invoked by this
    /// proxy (see [`PlayerActionCallback`]); kept so the public contract
    /// matches §4.1's two callback slots.
    pub async fn set_player_action_callback(&self, cb: PlayerActionCallback) {
        *self.player_action_cb.write().await = Some(cb);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Binds the listen socket and spawns the recv loop + idle sweeper as
    /// background tasks. Returns once the bind succeeds (not once the
    /// tasks exit) — a bind failure is the only fatal error per §4.1.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let listen_address = self.options.read().await.listen_address;
        let sock = UdpSocket::bind(listen_address)
            .await
            .with_context(|| format!("failed to bind UDP listen socket on {}", listen_address))?;
        *self.listen_sock.write().await = Some(Arc::new(sock));
        self.running.store(true, Ordering::SeqCst);

        tokio::spawn({
            let this = self.clone();
            async move {
                if let Err(err) = this.run_recv_loop().await {
                    log::error!("UDP proxy on {} stopped: {:?}", listen_address, err);
                }
            }
        });
        tokio::spawn({
            let this = self.clone();
            async move {
                this.run_eviction_sweeper().await;
            }
        });
        Ok(())
    }

    /// Closes every upstream socket, then the listen socket. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop_notify.notify_waiters();
        let removed: Vec<Arc<ProxyConnection>> =
            self.connections.write().await.drain().map(|(_, conn)| conn).collect();
        for connection in removed {
            connection.close_notify.notify_waiters();
        }
        *self.listen_sock.write().await = None;
    }

    /// Forcibly closes all upstream sockets whose client-key matches the
    /// given address.
    pub async fn block_client(&self, address: IpAddr) {
        let prefix = format!("{}:", address);
        let removed: Vec<Arc<ProxyConnection>> = {
            let mut connections = self.connections.write().await;
            let keys: Vec<String> = connections
                .keys()
                .filter(|key| key.starts_with(&prefix))
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| connections.remove(&key))
                .collect()
        };
        for connection in removed {
            connection.close_notify.notify_waiters();
        }
    }

    pub async fn stats(&self) -> ProxyStats {
        let connections = self.connections.read().await;
        let mut per_connection = Vec::with_capacity(connections.len());
        for (key, conn) in connections.iter() {
            let last_activity = *conn.last_activity.read().await;
            per_connection.push(ConnectionStat {
                key: key.clone(),
                last_activity_ms_ago: last_activity.elapsed().as_millis(),
            });
        }
        ProxyStats {
            running: self.is_running(),
            active_connections: connections.len(),
            per_connection,
        }
    }

    pub async fn update_destination(&self, destination_address: SocketAddr) {
        self.options.write().await.destination_address = destination_address;
    }

    pub async fn set_proxy_protocol_v2_enabled(&self, enabled: bool) {
        self.options.write().await.proxy_protocol_v2_enabled = enabled;
    }

    async fn run_recv_loop(self: Arc<Self>) -> anyhow::Result<()> {
        let listen_sock = {
            let guard = self.listen_sock.read().await;
            guard.clone().context("listen socket not bound")?
        };
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = self.stop_notify.notified() => return Ok(()),
                res = listen_sock.recv_from(&mut buf) => {
                    let (len, addr) = res.context("UDP listen socket recv_from failed")?;
                    let data = bytes::Bytes::copy_from_slice(&buf[..len]);
                    let this = self.clone();
                    let listen_sock = listen_sock.clone();
                    tokio::spawn(async move {
                        if let Err(err) = this.handle_datagram(listen_sock, addr, data).await {
                            log::debug!("Failed to handle datagram from {}: {:?}", addr, err);
                        }
                    });
                }
            }
        }
    }

    async fn handle_datagram(
        self: Arc<Self>,
        listen_sock: Arc<UdpSocket>,
        addr: SocketAddr,
        data: bytes::Bytes,
    ) -> anyhow::Result<()> {
        let client_key = addr.to_string();
        let options = self.options.read().await.clone();

        let (original, payload): (Option<(IpAddr, u16)>, bytes::Bytes) =
            if options.proxy_protocol_v2_enabled {
                let chain = parse_proxy_protocol_chain(&data);
                (chain.original, chain.payload)
            } else {
                (None, data)
            };

        if let Some(original) = original {
            if payload.is_empty() {
                // Header-only probe: memoise and do not forward.
                self.real_client_info
                    .write()
                    .await
                    .insert(client_key, original);
                return Ok(());
            }
            self.real_client_info
                .write()
                .await
                .insert(client_key.clone(), original);
        }

        let resolved_original = match original {
            Some(original) => original,
            None => match self.real_client_info.read().await.get(&client_key).copied() {
                Some(memoised) => memoised,
                None => (addr.ip(), addr.port()),
            },
        };

        if payload.is_empty() {
            return Ok(());
        }

        let connection = self.get_or_create_connection(&client_key, addr, listen_sock).await?;
        *connection.original.write().await = resolved_original;
        *connection.last_activity.write().await = Instant::now();

        if let Some(cb) = self.activity_cb.read().await.as_ref() {
            cb(resolved_original.0, resolved_original.1, payload.len());
        }

        if let Err(err) = connection
            .upstream_sock
            .send_to(&payload, options.destination_address)
            .await
        {
            log_send_error("target", &err);
        }
        Ok(())
    }

    async fn get_or_create_connection(
        self: &Arc<Self>,
        client_key: &str,
        client_addr: SocketAddr,
        listen_sock: Arc<UdpSocket>,
    ) -> anyhow::Result<Arc<ProxyConnection>> {
        if let Some(existing) = self.connections.read().await.get(client_key) {
            return Ok(existing.clone());
        }
        let mut connections = self.connections.write().await;
        if let Some(existing) = connections.get(client_key) {
            return Ok(existing.clone());
        }
        let bind_addr: SocketAddr = if client_addr.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let upstream_sock = UdpSocket::bind(bind_addr)
            .await
            .context("failed to bind upstream UDP socket")?;
        let connection = Arc::new(ProxyConnection {
            upstream_sock,
            last_activity: RwLock::new(Instant::now()),
            original: RwLock::new((client_addr.ip(), client_addr.port())),
            close_notify: Notify::new(),
        });
        connections.insert(client_key.to_owned(), connection.clone());
        drop(connections);

        tokio::spawn({
            let connection = connection.clone();
            let listen_sock = listen_sock.clone();
            async move {
                let mut buf = [0u8; MAX_DATAGRAM];
                loop {
                    tokio::select! {
                        _ = connection.close_notify.notified() => return,
                        res = connection.upstream_sock.recv(&mut buf) => {
                            match res {
                                Ok(len) => {
                                    if let Err(err) = listen_sock.send_to(&buf[..len], client_addr).await {
                                        log_send_error("client", &err);
                                    }
                                }
                                Err(_) => return,
                            }
                        }
                    }
                }
            }
        });
        Ok(connection)
    }

    async fn run_eviction_sweeper(self: Arc<Self>) {
        let mut interval = tokio::time::interval(EVICTION_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = self.stop_notify.notified() => return,
                _ = interval.tick() => {
                    let idle_timeout = self.options.read().await.idle_timeout;
                    let removed: Vec<Arc<ProxyConnection>> = {
                        let mut connections = self.connections.write().await;
                        let stale: Vec<String> = connections
                            .iter()
                            .filter(|(_, conn)| {
                                // last_activity is behind an async RwLock but the
                                // sweeper only ever needs a point-in-time read, so
                                // `try_read` is sufficient; a connection mid-send
                                // just survives to the next sweep.
                                match conn.last_activity.try_read() {
                                    Ok(last_activity) => last_activity.elapsed() > idle_timeout,
                                    Err(_) => false,
                                }
                            })
                            .map(|(key, _)| key.clone())
                            .collect();
                        stale.into_iter().filter_map(|key| connections.remove(&key)).collect()
                    };
                    for connection in removed {
                        connection.close_notify.notify_waiters();
                    }
                }
            }
        }
    }
}

/// Send errors whose message contains "closed" are demoted to debug; all
/// others are logged at error level (§4.1 error policy). Either way the
/// proxy keeps running.
fn log_send_error(direction: &str, err: &std::io::Error) {
    let message = err.to_string();
    if message.to_lowercase().contains("closed") {
        log::debug!("Send to {} failed (socket closed): {}", direction, message);
    } else {
        log::error!("Send to {} failed: {}", direction, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    #[tokio::test]
    async fn binds_and_stops_idempotently() {
        let listen = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let dest = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 19132);
        let proxy = UdpProxy::new(UdpProxyOptions::new(listen, dest));
        proxy.start().await.unwrap();
        assert!(proxy.is_running());
        proxy.stop().await;
        proxy.stop().await; // idempotent
        assert!(!proxy.is_running());
    }

    #[tokio::test]
    async fn relays_plain_datagram_round_trip() {
        let target_sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let target_addr = target_sock.local_addr().unwrap();

        let listen = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let proxy = UdpProxy::new(UdpProxyOptions::new(listen, target_addr));
        proxy.start().await.unwrap();
        let proxy_addr = {
            let guard = proxy.listen_sock.read().await;
            guard.as_ref().unwrap().local_addr().unwrap()
        };

        let client_sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        client_sock.send_to(b"hello", proxy_addr).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), target_sock.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"hello");

        proxy.stop().await;
    }
}
