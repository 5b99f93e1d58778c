use anyhow::{Context, Result};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// セッションの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// 接続待ち
    Listening,
    /// 転送中
    Bridging,
    /// 終了（再び接続を受け付けることはない）
    Closed,
}

/// セッションの終了理由
#[derive(Debug)]
pub enum SessionOutcome {
    /// 双方向のコピーが両方とも終わった
    Relayed {
        inbound_to_outbound: io::Result<u64>,
        outbound_to_inbound: io::Result<u64>,
    },
    /// リモートへの接続に失敗。受け付けた接続はそのまま閉じる
    ConnectFailed(io::Error),
    AcceptFailed(io::Error),
}

/// 1つのリモートエンドポイントに対する1回限りの転送セッション
///
/// リスナーが受け付けるのは最初の1接続だけで、受け付けた時点でリスナーは閉じる。
pub struct RelaySession {
    listener: TcpListener,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    state_tx: Arc<watch::Sender<SessionState>>,
}

impl RelaySession {
    /// ローカルアドレスにバインドして接続待ちを開始
    pub async fn bind(local_addr: SocketAddr, remote_addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(local_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", local_addr))?;
        let local_addr = listener.local_addr()?;
        let (state_tx, _) = watch::channel(SessionState::Listening);

        Ok(Self {
            listener,
            local_addr,
            remote_addr,
            state_tx: Arc::new(state_tx),
        })
    }

    /// 実際にバインドされたアドレス（ポート0を指定した場合もここで分かる）
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// 状態の変化を監視する
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// 状態の送信側。run が途中で破棄された場合に Closed を通知するために使う
    pub(crate) fn state_sender(&self) -> Arc<watch::Sender<SessionState>> {
        self.state_tx.clone()
    }

    /// 1接続を受け付けて、終わるまで転送する
    pub async fn run(self) -> SessionOutcome {
        let Self {
            listener,
            local_addr,
            remote_addr,
            state_tx,
        } = self;

        let accepted = listener.accept().await;
        // 2つ目以降の接続は受け付けない
        drop(listener);

        let (inbound, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept on {}: {}", local_addr, e);
                state_tx.send_replace(SessionState::Closed);
                return SessionOutcome::AcceptFailed(e);
            }
        };
        info!("Accepted {} on {}, connecting to {}", peer, local_addr, remote_addr);

        let outbound = match TcpStream::connect(remote_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to connect to {}: {}", remote_addr, e);
                drop(inbound);
                state_tx.send_replace(SessionState::Closed);
                return SessionOutcome::ConnectFailed(e);
            }
        };

        state_tx.send_replace(SessionState::Bridging);
        let (inbound_to_outbound, outbound_to_inbound) = bridge(inbound, outbound).await;
        state_tx.send_replace(SessionState::Closed);

        match &inbound_to_outbound {
            Ok(bytes) => debug!("{} -> {}: {} bytes", peer, remote_addr, bytes),
            Err(e) => debug!("{} -> {} error: {}", peer, remote_addr, e),
        }
        match &outbound_to_inbound {
            Ok(bytes) => debug!("{} -> {}: {} bytes", remote_addr, peer, bytes),
            Err(e) => debug!("{} -> {} error: {}", remote_addr, peer, e),
        }
        info!("Session {} <-> {} closed", local_addr, remote_addr);

        SessionOutcome::Relayed {
            inbound_to_outbound,
            outbound_to_inbound,
        }
    }
}

/// 双方向にコピーし、両方向が終わるまで待つ
///
/// 片方向が終わっても、もう片方はそのまま流し続ける。
/// 終わった方向は書き込み側をシャットダウンして相手にEOFを伝える。
async fn bridge(inbound: TcpStream, outbound: TcpStream) -> (io::Result<u64>, io::Result<u64>) {
    let (inbound_read, inbound_write) = inbound.into_split();
    let (outbound_read, outbound_write) = outbound.into_split();

    tokio::join!(
        copy_then_shutdown(inbound_read, outbound_write),
        copy_then_shutdown(outbound_read, inbound_write),
    )
}

async fn copy_then_shutdown<R, W>(mut reader: R, mut writer: W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut reader, &mut writer).await;
    let _ = writer.shutdown().await;
    copied
}
