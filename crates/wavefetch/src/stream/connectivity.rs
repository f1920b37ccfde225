//! Network reachability reporting
//!
//! Monitors publish every observation to their subscribers, duplicates
//! included. Consumers that only care about transitions compare against the
//! last status they saw.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use tracing::debug;

use crate::config::SourceConfig;

/// Kind of network the host is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NetworkKind {
    Cellular,
    Wifi,
    Other,
    Undetermined,
}

/// A single reachability observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NetworkStatus {
    pub kind: NetworkKind,
    pub connected: bool,
}

impl NetworkStatus {
    pub const fn online(kind: NetworkKind) -> Self {
        Self {
            kind,
            connected: true,
        }
    }

    pub const fn offline() -> Self {
        Self {
            kind: NetworkKind::Undetermined,
            connected: false,
        }
    }
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::online(NetworkKind::Undetermined)
    }
}

/// Source of reachability updates
pub trait ConnectivityMonitor: Send + Sync {
    /// Last known status
    fn current(&self) -> NetworkStatus;

    /// Receive every future observation.
    fn subscribe(&self) -> Receiver<NetworkStatus>;
}

/// Fan-out of statuses to subscribers; drops disconnected ones.
#[derive(Default)]
struct Subscribers {
    senders: Mutex<Vec<Sender<NetworkStatus>>>,
}

impl Subscribers {
    fn subscribe(&self) -> Receiver<NetworkStatus> {
        let (tx, rx) = unbounded();
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn emit(&self, status: NetworkStatus) {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(status).is_ok());
    }
}

/// Monitor driven by the embedder (e.g. forwarding platform callbacks).
#[derive(Default)]
pub struct ManualConnectivity {
    status: Mutex<NetworkStatus>,
    subscribers: Subscribers,
}

impl ManualConnectivity {
    pub fn new(initial: NetworkStatus) -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(initial),
            subscribers: Subscribers::default(),
        })
    }

    /// Record and broadcast an observation.
    pub fn set(&self, status: NetworkStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
        self.subscribers.emit(status);
    }
}

impl ConnectivityMonitor for ManualConnectivity {
    fn current(&self) -> NetworkStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(&self) -> Receiver<NetworkStatus> {
        self.subscribers.subscribe()
    }
}

struct ProbeShared {
    status: Mutex<NetworkStatus>,
    subscribers: Subscribers,
    stop_flag: AtomicBool,
}

/// Monitor that periodically opens a TCP connection to a well-known host.
///
/// Reports `Other × connected` when the connect succeeds and
/// `Undetermined × disconnected` when it fails.
pub struct TcpProbeConnectivity {
    shared: Arc<ProbeShared>,
    handle: Option<JoinHandle<()>>,
}

impl TcpProbeConnectivity {
    /// Start probing `host:port` every `interval`.
    pub fn spawn(target: impl Into<String>, interval: Duration) -> Arc<Self> {
        let target = target.into();
        let shared = Arc::new(ProbeShared {
            status: Mutex::new(NetworkStatus::default()),
            subscribers: Subscribers::default(),
            stop_flag: AtomicBool::new(false),
        });

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("connectivity-probe".to_string())
            .spawn(move || Self::probe_loop(&target, interval, &thread_shared))
            .ok();

        Arc::new(Self { shared, handle })
    }

    fn probe_loop(target: &str, interval: Duration, shared: &ProbeShared) {
        let timeout = interval.min(Duration::from_secs(5));
        while !shared.stop_flag.load(Ordering::Relaxed) {
            let status = if probe_once(target, timeout) {
                NetworkStatus::online(NetworkKind::Other)
            } else {
                NetworkStatus::offline()
            };
            debug!(probe = target, connected = status.connected, "connectivity probe");
            *shared.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
            shared.subscribers.emit(status);

            // Sleep in short slices so drop is prompt.
            let slice = Duration::from_millis(100);
            let mut slept = Duration::ZERO;
            while slept < interval && !shared.stop_flag.load(Ordering::Relaxed) {
                thread::sleep(slice.min(interval - slept));
                slept += slice;
            }
        }
    }
}

fn probe_once(target: &str, timeout: Duration) -> bool {
    let addrs: Vec<SocketAddr> = match target.to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(_) => return false,
    };
    addrs
        .iter()
        .any(|addr| TcpStream::connect_timeout(addr, timeout).is_ok())
}

impl ConnectivityMonitor for TcpProbeConnectivity {
    fn current(&self) -> NetworkStatus {
        *self
            .shared
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(&self) -> Receiver<NetworkStatus> {
        self.shared.subscribers.subscribe()
    }
}

impl Drop for TcpProbeConnectivity {
    fn drop(&mut self) {
        self.shared.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Monitor selected by `config`: a TCP check against
/// `connectivity_target` when set, otherwise an always-online manual one.
pub fn monitor_for(config: &SourceConfig) -> Arc<dyn ConnectivityMonitor> {
    match config.connectivity_target {
        Some(ref target) => {
            debug!(addr = %target, interval = ?config.connectivity_interval, "watching reachability");
            TcpProbeConnectivity::spawn(target.as_str(), config.connectivity_interval)
        }
        None => ManualConnectivity::new(NetworkStatus::default()),
    }
}

/// `host:port` of the server behind `url`, for `with_connectivity_check`.
pub fn reachability_target(url: &str) -> Option<String> {
    let url = reqwest::Url::parse(url).ok()?;
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    Some(format!("{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn default_status_is_online() {
        let s = NetworkStatus::default();
        assert!(s.connected);
        assert_eq!(s.kind, NetworkKind::Undetermined);
    }

    #[test]
    fn manual_monitor_delivers_duplicates() {
        let m = ManualConnectivity::new(NetworkStatus::default());
        let rx = m.subscribe();
        m.set(NetworkStatus::offline());
        m.set(NetworkStatus::offline());
        m.set(NetworkStatus::online(NetworkKind::Wifi));
        let got: Vec<_> = rx.try_iter().collect();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0], got[1]);
        assert_eq!(m.current(), NetworkStatus::online(NetworkKind::Wifi));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let m = ManualConnectivity::new(NetworkStatus::default());
        let rx = m.subscribe();
        drop(rx);
        let live = m.subscribe();
        m.set(NetworkStatus::offline());
        assert_eq!(live.try_recv().unwrap(), NetworkStatus::offline());
        assert_eq!(m.subscribers.senders.lock().unwrap().len(), 1);
    }

    #[test]
    fn tcp_check_reports_reachable_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let monitor = TcpProbeConnectivity::spawn(addr.to_string(), Duration::from_millis(50));
        let rx = monitor.subscribe();
        let status = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(status.connected);
        assert_eq!(status.kind, NetworkKind::Other);
    }

    #[test]
    fn check_fails_for_unresolvable_target() {
        assert!(!probe_once("not a host", Duration::from_millis(50)));
    }

    #[test]
    fn configured_target_is_watched() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = SourceConfig::new().with_connectivity_check(
            listener.local_addr().unwrap().to_string(),
            Duration::from_millis(50),
        );
        let monitor = monitor_for(&config);
        let status = monitor
            .subscribe()
            .recv_timeout(Duration::from_secs(2))
            .unwrap();
        assert_eq!(status, NetworkStatus::online(NetworkKind::Other));
    }

    #[test]
    fn unreachable_target_reports_offline() {
        // Bind then drop to get a port nobody listens on.
        let addr = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let config =
            SourceConfig::new().with_connectivity_check(addr.to_string(), Duration::from_millis(50));
        let monitor = monitor_for(&config);
        let status = monitor
            .subscribe()
            .recv_timeout(Duration::from_secs(2))
            .unwrap();
        assert!(!status.connected);
    }

    #[test]
    fn no_target_means_always_online() {
        let monitor = monitor_for(&SourceConfig::new());
        assert_eq!(monitor.current(), NetworkStatus::default());
        assert!(monitor.subscribe().try_recv().is_err());
    }

    #[test]
    fn target_follows_url_host_and_port() {
        assert_eq!(
            reachability_target("http://radio.test/stream").as_deref(),
            Some("radio.test:80")
        );
        assert_eq!(
            reachability_target("https://cdn.test:8443/a.m4a").as_deref(),
            Some("cdn.test:8443")
        );
        assert_eq!(
            reachability_target("http://[::1]:8000/").as_deref(),
            Some("[::1]:8000")
        );
        assert!(reachability_target("not a url").is_none());
    }
}
