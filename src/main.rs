use anyhow::Result;
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::sync::broadcast;

use lanrelay::{AddressRange, Config};

#[derive(Parser)]
#[clap(name = "lanrelay")]
#[clap(about = "Discover LAN devices exposing a TCP port and tunnel a local port to each", long_about = None)]
struct Cli {
    /// 設定ファイル (TOML)
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// スキャンするアドレス範囲 (例: 192.168.25.1-192.168.25.254, 192.168.25.0/24)
    #[clap(short, long)]
    range: Option<AddressRange>,

    /// 検出・転送するTCPポート
    #[clap(short, long)]
    port: Option<u16>,

    /// リスナーのバインドアドレス
    #[clap(short, long)]
    bind: Option<IpAddr>,

    /// ローカルポート割り当ての開始値
    #[clap(long)]
    base_port: Option<u16>,

    /// ICMPプローブのタイムアウト (ms)
    #[clap(long)]
    ping_timeout: Option<u64>,

    /// TCP接続プローブのタイムアウト (ms)
    #[clap(long)]
    connect_timeout: Option<u64>,

    /// 同時に実行するプローブ数の上限
    #[clap(long)]
    max_concurrency: Option<usize>,

    /// ICMPプローブを省略して全アドレスのポートを確認
    #[clap(long)]
    no_ping: bool,

    /// 検出結果と割り当て予定を表示して終了
    #[clap(long)]
    dry_run: bool,
}

impl Cli {
    /// 設定ファイルを読み込み、CLIで指定された値で上書き
    async fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path).await?,
            None => Config::default(),
        };

        if let Some(range) = self.range {
            config.range = range;
        }
        if let Some(port) = self.port {
            config.service_port = port;
        }
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(base_port) = self.base_port {
            config.base_port = base_port;
        }
        if let Some(ms) = self.ping_timeout {
            config.ping_timeout_ms = ms;
        }
        if let Some(ms) = self.connect_timeout {
            config.connect_timeout_ms = ms;
        }
        if let Some(n) = self.max_concurrency {
            config.max_concurrency = n;
        }
        if self.no_ping {
            config.ping = false;
        }
        if self.dry_run {
            config.dry_run = true;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ロギング設定
    #[cfg(feature = "console")]
    {
        console_subscriber::init();
    }
    #[cfg(not(feature = "console"))]
    {
        use tracing_subscriber::EnvFilter;

        let is_atty = atty::is(atty::Stream::Stdout);
        let level = "info";
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::from(level)),
            )
            .with_ansi(is_atty)
            .init();
    }

    let config = Cli::parse().into_config().await?;

    // スキャンで大量のソケットを開くため
    #[cfg(not(target_os = "windows"))]
    {
        fdlimit::raise_fd_limit();
    }

    // Ctrl+Cハンドラー
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            panic!("Failed to listen for ctrl-c signal: {:?}", e);
        }
        let _ = shutdown_tx.send(());
    });

    lanrelay::run(config, shutdown_rx).await
}
