use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// スキャン対象のアドレス範囲（両端を含む）
///
/// `"192.168.25.1-192.168.25.254"`、`"192.168.25.0/24"`、単一アドレスのいずれかで表記できる。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AddressRange {
    start: u32,
    end: u32,
}

impl AddressRange {
    /// 範囲を作成。`start > end` はエラー
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self> {
        let (start, end) = (u32::from(start), u32::from(end));
        if start > end {
            anyhow::bail!(
                "Invalid address range: {} is after {}",
                Ipv4Addr::from(start),
                Ipv4Addr::from(end)
            );
        }
        Ok(Self { start, end })
    }

    /// CIDRブロックから範囲を作成
    ///
    /// /31 と /32 以外はネットワークアドレスとブロードキャストアドレスを除く。
    pub fn from_cidr(network: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            anyhow::bail!("Invalid prefix length: /{}", prefix);
        }
        let mask = if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix))
        };
        let first = u32::from(network) & mask;
        let last = first | !mask;

        let (start, end) = if prefix >= 31 {
            (first, last)
        } else {
            (first + 1, last - 1)
        };
        Ok(Self { start, end })
    }

    pub fn start(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.start)
    }

    pub fn end(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.end)
    }

    /// 範囲内のアドレス数
    pub fn len(&self) -> u64 {
        u64::from(self.end - self.start) + 1
    }

    /// 常に1つ以上のアドレスを含む
    pub fn is_empty(&self) -> bool {
        false
    }

    /// 範囲内のアドレスを順番に列挙（何度でも呼べる）
    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> {
        (self.start..=self.end).map(Ipv4Addr::from)
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        (self.start..=self.end).contains(&u32::from(addr))
    }
}

impl Default for AddressRange {
    fn default() -> Self {
        Self {
            start: u32::from(Ipv4Addr::new(192, 168, 25, 1)),
            end: u32::from(Ipv4Addr::new(192, 168, 25, 254)),
        }
    }
}

impl FromStr for AddressRange {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();

        if let Some((network, prefix)) = s.split_once('/') {
            let network: Ipv4Addr = network
                .trim()
                .parse()
                .with_context(|| format!("Invalid network address in {}", s))?;
            let prefix: u8 = prefix
                .trim()
                .parse()
                .with_context(|| format!("Invalid prefix length in {}", s))?;
            return Self::from_cidr(network, prefix);
        }

        if let Some((start, end)) = s.split_once('-') {
            let start: Ipv4Addr = start
                .trim()
                .parse()
                .with_context(|| format!("Invalid start address in {}", s))?;
            let end: Ipv4Addr = end
                .trim()
                .parse()
                .with_context(|| format!("Invalid end address in {}", s))?;
            return Self::new(start, end);
        }

        let addr: Ipv4Addr = s
            .parse()
            .with_context(|| format!("Invalid address range: {}", s))?;
        Self::new(addr, addr)
    }
}

impl TryFrom<String> for AddressRange {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<AddressRange> for String {
    fn from(range: AddressRange) -> Self {
        range.to_string()
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start(), self.end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inclusive_iteration() {
        let range: AddressRange = "10.0.0.1-10.0.0.3".parse().unwrap();
        let addrs: Vec<_> = range.iter().collect();
        assert_eq!(
            addrs,
            vec![
                Ipv4Addr::new(10, 0, 0, 1),
                Ipv4Addr::new(10, 0, 0, 2),
                Ipv4Addr::new(10, 0, 0, 3),
            ]
        );
        assert_eq!(range.len(), 3);

        // 再度列挙しても同じ結果
        assert_eq!(range.iter().count(), 3);
    }

    #[test]
    fn test_crosses_octet_boundary() {
        let range: AddressRange = "10.0.0.254-10.0.1.1".parse().unwrap();
        let addrs: Vec<_> = range.iter().collect();
        assert_eq!(addrs.len(), 4);
        assert_eq!(addrs[2], Ipv4Addr::new(10, 0, 1, 0));
    }

    #[test]
    fn test_reversed_range_rejected() {
        assert!("10.0.0.5-10.0.0.1".parse::<AddressRange>().is_err());
        assert!(AddressRange::new(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1)).is_err());
    }

    #[test]
    fn test_cidr() {
        let range: AddressRange = "192.168.25.77/24".parse().unwrap();
        assert_eq!(range.start(), Ipv4Addr::new(192, 168, 25, 1));
        assert_eq!(range.end(), Ipv4Addr::new(192, 168, 25, 254));
        assert_eq!(range, AddressRange::default());

        let single: AddressRange = "10.1.2.3/32".parse().unwrap();
        assert_eq!(single.len(), 1);

        let pair: AddressRange = "10.1.2.2/31".parse().unwrap();
        assert_eq!(pair.start(), Ipv4Addr::new(10, 1, 2, 2));
        assert_eq!(pair.end(), Ipv4Addr::new(10, 1, 2, 3));

        assert!("10.0.0.0/33".parse::<AddressRange>().is_err());
    }

    #[test]
    fn test_single_address() {
        let range: AddressRange = "10.0.0.9".parse().unwrap();
        assert_eq!(range.len(), 1);
        assert!(range.contains(Ipv4Addr::new(10, 0, 0, 9)));
        assert!(!range.contains(Ipv4Addr::new(10, 0, 0, 10)));
    }

    #[test]
    fn test_full_address_space_len() {
        let range: AddressRange = "0.0.0.0-255.255.255.255".parse().unwrap();
        assert_eq!(range.len(), 1 << 32);
    }

    #[test]
    fn test_display_parses_back() {
        let range = AddressRange::default();
        let parsed: AddressRange = range.to_string().parse().unwrap();
        assert_eq!(range, parsed);
    }
}
