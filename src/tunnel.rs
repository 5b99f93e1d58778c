use anyhow::Result;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::port_allocator::PortAllocator;
use crate::relay::{RelaySession, SessionOutcome, SessionState};
use crate::scanner::DiscoveredDevices;

/// 1デバイス分の割り当て
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
}

/// 確立されたトンネル
pub struct Tunnel {
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    state_rx: watch::Receiver<SessionState>,
    handle: JoinHandle<Option<SessionOutcome>>,
}

impl Tunnel {
    /// 待ち受けているローカルアドレスを取得
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 転送先アドレスを取得
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// セッションの現在の状態
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// 状態の変化を監視する
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// セッションの終了を待つ。シャットダウンで中断された場合は None
    pub async fn wait(self) -> Result<Option<SessionOutcome>> {
        Ok(self.handle.await?)
    }
}

/// 検出したデバイスごとにローカルポートを割り当ててトンネルを張る
pub struct TunnelManager {
    bind_addr: IpAddr,
    remote_port: u16,
    allocator: PortAllocator,
}

impl TunnelManager {
    pub fn new(bind_addr: IpAddr, base_port: u16, remote_port: u16) -> Self {
        Self {
            bind_addr,
            remote_port,
            allocator: PortAllocator::new(base_port),
        }
    }

    /// デバイス1台にポートを割り当てる。ポートが尽きていれば None
    pub fn assign(&mut self, device: Ipv4Addr) -> Option<Assignment> {
        let local_port = self.allocator.allocate()?;
        Some(Assignment {
            local_addr: SocketAddr::new(self.bind_addr, local_port),
            remote_addr: SocketAddr::new(IpAddr::V4(device), self.remote_port),
        })
    }

    /// 全デバイスの割り当てを計画する（バインドはしない）
    ///
    /// ポートが尽きた以降のデバイスは黙って除外する。
    pub fn plan(&mut self, devices: DiscoveredDevices) -> Vec<Assignment> {
        devices
            .into_iter()
            .map_while(|device| self.assign(device))
            .collect()
    }

    /// 全デバイスのトンネルを開始
    ///
    /// バインドに失敗したデバイスはそのセッションだけを諦める（ポートは消費済み）。
    /// 各セッションは shutdown を受け取ると待ち受け・転送を中断して資源を解放する。
    pub async fn start(
        &mut self,
        devices: DiscoveredDevices,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> Vec<Tunnel> {
        let mut tunnels = Vec::new();

        for assignment in self.plan(devices) {
            match start_tunnel(assignment, shutdown_tx.subscribe()).await {
                Ok(tunnel) => {
                    info!(
                        "Forwarding {} to {}",
                        tunnel.remote_addr(),
                        tunnel.local_addr()
                    );
                    tunnels.push(tunnel);
                }
                Err(e) => {
                    error!(
                        "Failed to start tunnel {} -> {}: {:#}",
                        assignment.local_addr, assignment.remote_addr, e
                    );
                }
            }
        }

        tunnels
    }
}

/// トンネルを1本開始
pub async fn start_tunnel(
    assignment: Assignment,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<Tunnel> {
    let session = RelaySession::bind(assignment.local_addr, assignment.remote_addr).await?;
    let local_addr = session.local_addr();
    let remote_addr = session.remote_addr();
    let state_rx = session.subscribe();
    let state_tx = session.state_sender();

    // バックグラウンドでセッションを実行
    let handle = tokio::spawn(async move {
        tokio::select! {
            outcome = session.run() => {
                if let SessionOutcome::ConnectFailed(e) | SessionOutcome::AcceptFailed(e) = &outcome {
                    debug!("Tunnel {} -> {} ended early: {}", local_addr, remote_addr, e);
                }
                Some(outcome)
            }
            _ = shutdown_rx.recv() => {
                debug!("Tunnel {} -> {} shutdown requested", local_addr, remote_addr);
                state_tx.send_replace(SessionState::Closed);
                None
            }
        }
    });

    Ok(Tunnel {
        local_addr,
        remote_addr,
        state_rx,
        handle,
    })
}
