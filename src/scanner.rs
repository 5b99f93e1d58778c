use anyhow::{Context, Result};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::address_range::AddressRange;
use crate::config::Config;
use crate::probe::Prober;

/// スキャンのパラメータ
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub service_port: u16,
    pub ping_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_concurrency: usize,
    /// falseならICMPプローブを省略
    pub ping: bool,
}

impl From<&Config> for ScanOptions {
    fn from(config: &Config) -> Self {
        Self {
            service_port: config.service_port,
            ping_timeout: config.ping_timeout(),
            connect_timeout: config.connect_timeout(),
            max_concurrency: config.max_concurrency,
            ping: config.ping,
        }
    }
}

/// 1アドレスの検査結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub addr: Ipv4Addr,
    pub open: bool,
}

/// 検出されたデバイスの集合（検出順、重複なし）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredDevices {
    order: Vec<Ipv4Addr>,
    seen: HashSet<Ipv4Addr>,
}

impl DiscoveredDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加。既に含まれていれば false
    pub fn insert(&mut self, addr: Ipv4Addr) -> bool {
        if !self.seen.insert(addr) {
            return false;
        }
        self.order.push(addr);
        true
    }

    pub fn contains(&self, addr: &Ipv4Addr) -> bool {
        self.seen.contains(addr)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ipv4Addr> {
        self.order.iter()
    }
}

impl IntoIterator for DiscoveredDevices {
    type Item = Ipv4Addr;
    type IntoIter = std::vec::IntoIter<Ipv4Addr>;

    fn into_iter(self) -> Self::IntoIter {
        self.order.into_iter()
    }
}

impl FromIterator<Ipv4Addr> for DiscoveredDevices {
    fn from_iter<I: IntoIterator<Item = Ipv4Addr>>(iter: I) -> Self {
        let mut devices = Self::new();
        for addr in iter {
            devices.insert(addr);
        }
        devices
    }
}

/// アドレス範囲を並行して検査し、サービスポートが開いているデバイスを集める
pub struct Scanner<P> {
    prober: Arc<P>,
    options: ScanOptions,
}

impl<P: Prober> Scanner<P> {
    pub fn new(prober: P, options: ScanOptions) -> Self {
        Self {
            prober: Arc::new(prober),
            options,
        }
    }

    /// 範囲内の全アドレスを検査
    ///
    /// アドレスごとに1タスクを起動し、全タスクの終了を待つ。
    /// 個々のプローブの失敗は結果から除外されるだけで、エラーになるのはタスク自体が失敗した場合のみ。
    pub async fn scan(&self, range: AddressRange) -> Result<DiscoveredDevices> {
        info!(
            "Scanning {} ({} addresses) for port {}",
            range,
            range.len(),
            self.options.service_port
        );

        let permits = Arc::new(Semaphore::new(self.options.max_concurrency));
        let mut tasks = JoinSet::new();

        // 起動前に許可を取るので、同時に存在するタスク数も上限以内に収まる
        for addr in range.iter() {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .context("Probe semaphore closed")?;
            let prober = self.prober.clone();
            let options = self.options.clone();
            tasks.spawn(async move {
                let result = evaluate(prober.as_ref(), &options, addr).await;
                drop(permit);
                result
            });
        }

        // 完了したタスクから順に集約する
        let mut devices = DiscoveredDevices::new();
        while let Some(joined) = tasks.join_next().await {
            let result = joined.context("Probe task failed")?;
            if result.open && devices.insert(result.addr) {
                info!("Device found: {}", result.addr);
            }
        }

        info!("Scan finished, {} device(s) found", devices.len());
        Ok(devices)
    }

    /// 1アドレスを検査
    pub async fn evaluate(&self, addr: Ipv4Addr) -> ProbeResult {
        evaluate(self.prober.as_ref(), &self.options, addr).await
    }
}

/// 到達性とポートの両方が成功したアドレスだけを open とする
///
/// 到達できなければポート検査は行わない。
async fn evaluate<P: Prober>(prober: &P, options: &ScanOptions, addr: Ipv4Addr) -> ProbeResult {
    if options.ping && !prober.probe_reachability(addr, options.ping_timeout).await {
        debug!("{} is unreachable", addr);
        return ProbeResult { addr, open: false };
    }

    let open = prober
        .probe_service_port(addr, options.service_port, options.connect_timeout)
        .await;
    ProbeResult { addr, open }
}
