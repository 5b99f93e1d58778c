use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::address_range::AddressRange;

/// 実行時設定
///
/// TOMLファイルから読み込み、CLIの値で上書きする。全項目にデフォルト値がある。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// 検出・転送するTCPポート
    pub service_port: u16,
    /// スキャンするアドレス範囲
    pub range: AddressRange,
    /// 全リスナーのバインドアドレス
    pub bind_addr: IpAddr,
    /// ローカルポート割り当ての開始値
    pub base_port: u16,
    pub ping_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// 同時に実行するプローブ数の上限。tokioのブロッキングスレッド数 (512) を超えないこと
    pub max_concurrency: usize,
    /// falseならICMPプローブを省略し、全アドレスを到達可能とみなす
    pub ping: bool,
    /// 検出のみ行い、トンネルは作成しない
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_port: 34567,
            range: AddressRange::default(),
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            base_port: 30,
            ping_timeout_ms: 5000,
            connect_timeout_ms: 500,
            max_concurrency: 512,
            ping: true,
            dry_run: false,
        }
    }
}

impl Config {
    /// TOML文字列から設定を作成
    pub fn from_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).context("Failed to parse the config")?;
        config.validate()?;
        Ok(config)
    }

    /// 設定ファイルを読み込む
    pub async fn from_file(path: &Path) -> Result<Self> {
        let s = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read the config {}", path.display()))?;
        Self::from_str(&s).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_port == 0 {
            anyhow::bail!("base_port must be greater than 0");
        }
        if self.max_concurrency == 0 {
            anyhow::bail!("max_concurrency must be greater than 0");
        }
        if self.max_concurrency > Semaphore::MAX_PERMITS {
            anyhow::bail!(
                "max_concurrency must be at most {}",
                Semaphore::MAX_PERMITS
            );
        }
        if self.ping_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            anyhow::bail!("Probe timeouts must be greater than 0");
        }
        Ok(())
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
