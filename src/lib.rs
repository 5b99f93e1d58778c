// LAN内のデバイスを探し、各デバイスのサービスポートへローカルポートからトンネルを張る

mod address_range;
mod config;
mod icmp;
mod port_allocator;
mod probe;
mod relay;
mod scanner;
mod tunnel;

// パブリックAPI
pub use address_range::AddressRange;
pub use config::Config;
pub use port_allocator::PortAllocator;
pub use probe::{NetworkProber, Prober};
pub use relay::{RelaySession, SessionOutcome, SessionState};
pub use scanner::{DiscoveredDevices, ProbeResult, ScanOptions, Scanner};
pub use tunnel::{start_tunnel, Assignment, Tunnel, TunnelManager};

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::info;

/// 検出からトンネル開始まで実行し、shutdown を受け取るまで待つ
pub async fn run(config: Config, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
    let prober = if config.ping {
        NetworkProber::new()
    } else {
        NetworkProber::without_ping()
    };
    run_with_prober(config, prober, shutdown_rx).await
}

/// プローバーを指定して実行
pub async fn run_with_prober<P: Prober>(
    config: Config,
    prober: P,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    config.validate()?;

    let scanner = Scanner::new(prober, ScanOptions::from(&config));
    let devices = tokio::select! {
        devices = scanner.scan(config.range) => devices?,
        _ = shutdown_rx.recv() => {
            info!("Shutdown requested during scan");
            return Ok(());
        }
    };

    let mut manager = TunnelManager::new(config.bind_addr, config.base_port, config.service_port);

    if config.dry_run {
        for assignment in manager.plan(devices) {
            info!(
                "Would forward {} to {}",
                assignment.remote_addr, assignment.local_addr
            );
        }
        return Ok(());
    }

    // セッションごとの中断用。各トンネルがこれを購読する
    let (tunnel_shutdown_tx, _) = broadcast::channel::<()>(1);
    let tunnels = manager.start(devices, &tunnel_shutdown_tx).await;
    info!(
        "Port forwarding setup complete, {} tunnel(s). Press Ctrl+C to exit.",
        tunnels.len()
    );

    let _ = shutdown_rx.recv().await;
    info!("Shutting down...");

    let _ = tunnel_shutdown_tx.send(());
    for tunnel in tunnels {
        let local_addr = tunnel.local_addr();
        if let Err(e) = tunnel.wait().await {
            info!("Tunnel {} did not stop cleanly: {:#}", local_addr, e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::tests::{options, MockProber};
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn test_discovery_to_assignment() {
        let prober = MockProber::new(&[
            (Ipv4Addr::new(10, 0, 0, 1), true, true),
            (Ipv4Addr::new(10, 0, 0, 2), true, false),
            (Ipv4Addr::new(10, 0, 0, 3), false, true),
        ]);
        let scanner = Scanner::new(prober, options(9000));
        let devices = scanner
            .scan("10.0.0.1-10.0.0.3".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(
            devices.iter().copied().collect::<Vec<_>>(),
            vec![Ipv4Addr::new(10, 0, 0, 1)]
        );

        let mut manager = TunnelManager::new(IpAddr::from([0, 0, 0, 0]), 30, 9000);
        let plan = manager.plan(devices);
        assert_eq!(
            plan,
            vec![Assignment {
                local_addr: "0.0.0.0:30".parse().unwrap(),
                remote_addr: "10.0.0.1:9000".parse().unwrap(),
            }]
        );
    }

    #[tokio::test]
    async fn test_run_forwards_discovered_device() {
        use std::time::Duration;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::{TcpListener, TcpStream};
        use tokio::time::{sleep, timeout};

        // デバイス役のエコーサーバー
        let device = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let service_port = device.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = device.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let free = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_port = free.local_addr().unwrap().port();
        drop(free);

        let config = Config {
            service_port,
            range: "127.0.0.1".parse().unwrap(),
            bind_addr: IpAddr::from([127, 0, 0, 1]),
            base_port,
            ..Config::default()
        };
        let prober = MockProber::new(&[(Ipv4Addr::LOCALHOST, true, true)]);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(run_with_prober(config, prober, shutdown_rx));

        // トンネルが待ち受けを始めるまで待つ
        let mut client = timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(stream) = TcpStream::connect(("127.0.0.1", base_port)).await {
                    break stream;
                }
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        timeout(Duration::from_secs(5), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"ping");
        server.await.unwrap();

        shutdown_tx.send(()).unwrap();
        timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let config = Config {
            range: "10.0.0.1-10.0.0.2".parse().unwrap(),
            bind_addr: IpAddr::from([127, 0, 0, 1]),
            ..Config::default()
        };
        let prober = MockProber::new(&[]);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(run_with_prober(config, prober, shutdown_rx));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_dry_run_returns_after_scan() {
        let config = Config {
            range: "10.0.0.1".parse().unwrap(),
            dry_run: true,
            ..Config::default()
        };
        let prober = MockProber::new(&[(Ipv4Addr::new(10, 0, 0, 1), true, true)]);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        run_with_prober(config, prober, shutdown_rx).await.unwrap();
    }
}
