use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::icmp::{self, SocketKind};

/// 1アドレスに対するネットワーク検査
///
/// どちらの検査も失敗はエラーではなく `false` として返す。
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    /// ICMP Echo で到達可能か確認
    async fn probe_reachability(&self, addr: Ipv4Addr, timeout: Duration) -> bool;

    /// TCPハンドシェイクが timeout 内に完了するか確認
    async fn probe_service_port(&self, addr: Ipv4Addr, port: u16, timeout: Duration) -> bool;
}

/// 実ネットワークに対するプローバー
#[derive(Debug, Clone)]
pub struct NetworkProber {
    icmp: Option<SocketKind>,
}

impl NetworkProber {
    pub fn new() -> Self {
        let icmp = icmp::detect_socket_kind();
        match icmp {
            Some(kind) => debug!("Using {:?} ICMP socket for reachability probes", kind),
            None => warn!(
                "Cannot open an ICMP socket, every address will be reported unreachable. \
                 Run with CAP_NET_RAW or disable ping"
            ),
        }
        Self { icmp }
    }

    /// ICMPソケットを開かないプローバー（ping を無効にした場合）
    pub fn without_ping() -> Self {
        Self { icmp: None }
    }
}

impl Default for NetworkProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for NetworkProber {
    async fn probe_reachability(&self, addr: Ipv4Addr, limit: Duration) -> bool {
        let kind = match self.icmp {
            Some(kind) => kind,
            None => return false,
        };

        // ブロッキングスレッドの空き待ちも含めて limit 内に収める
        let ping = tokio::task::spawn_blocking(move || icmp::ping(kind, addr, limit));
        match timeout(limit, ping).await {
            Ok(Ok(Ok(reachable))) => reachable,
            Ok(Ok(Err(e))) => {
                debug!("Ping {} failed: {:#}", addr, e);
                false
            }
            Ok(Err(e)) => {
                debug!("Ping task for {} failed: {}", addr, e);
                false
            }
            Err(_) => {
                debug!("Ping {} timed out", addr);
                false
            }
        }
    }

    async fn probe_service_port(&self, addr: Ipv4Addr, port: u16, limit: Duration) -> bool {
        let target = SocketAddr::from((addr, port));
        match timeout(limit, TcpStream::connect(target)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Port {} closed: {}", target, e);
                false
            }
            Err(_) => {
                debug!("Port {} timed out", target);
                false
            }
        }
    }
}
