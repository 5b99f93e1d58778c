use anyhow::{Context, Result};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

const ECHO_REQUEST: u8 = 8;
const ECHO_REPLY: u8 = 0;
const HEADER_LEN: usize = 8;
const PAYLOAD: &[u8] = b"lanrelay-probe";

/// ICMPソケットの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// 非特権のpingソケット（Linuxでは net.ipv4.ping_group_range が必要）
    Datagram,
    /// rawソケット（root または CAP_NET_RAW が必要）
    Raw,
}

/// 利用可能なICMPソケットの種類を調べる
pub fn detect_socket_kind() -> Option<SocketKind> {
    [SocketKind::Datagram, SocketKind::Raw]
        .into_iter()
        .find(|kind| open_socket(*kind).is_ok())
}

fn open_socket(kind: SocketKind) -> io::Result<Socket> {
    let ty = match kind {
        SocketKind::Datagram => Type::DGRAM,
        SocketKind::Raw => Type::RAW,
    };
    Socket::new(Domain::IPV4, ty, Some(Protocol::ICMPV4))
}

/// Echo Request を送り、timeout 内に Echo Reply が返れば true
///
/// ブロッキングI/Oなので `spawn_blocking` から呼ぶこと。
pub fn ping(kind: SocketKind, addr: Ipv4Addr, timeout: Duration) -> Result<bool> {
    let socket = open_socket(kind).context("Failed to open ICMP socket")?;
    socket
        .connect(&SockAddr::from(SocketAddr::V4(SocketAddrV4::new(addr, 0))))
        .with_context(|| format!("Failed to connect ICMP socket to {}", addr))?;

    let ident: u16 = rand::random();
    let seq: u16 = rand::random();
    let request = echo_request(ident, seq, PAYLOAD);
    socket
        .send(&request)
        .with_context(|| format!("Failed to send echo request to {}", addr))?;

    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 1500];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        socket.set_read_timeout(Some(remaining))?;

        let n = match (&socket).read(&mut buf) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Ok(false)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).with_context(|| format!("Failed to read echo reply from {}", addr)),
        };

        // pingソケットではカーネルが identifier を書き換えるので照合しない
        let expected_ident = match kind {
            SocketKind::Datagram => None,
            SocketKind::Raw => Some(ident),
        };
        if is_echo_reply(&buf[..n], expected_ident, seq) {
            return Ok(true);
        }
    }
}

/// Echo Request パケットを組み立てる
pub fn echo_request(ident: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
    packet.extend_from_slice(&[ECHO_REQUEST, 0, 0, 0]);
    packet.extend_from_slice(&ident.to_be_bytes());
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(payload);

    let sum = checksum(&packet);
    packet[2..4].copy_from_slice(&sum.to_be_bytes());
    packet
}

/// 受信データが対応する Echo Reply か判定
///
/// rawソケットの受信データにはIPv4ヘッダが付いている。
pub fn is_echo_reply(packet: &[u8], ident: Option<u16>, seq: u16) -> bool {
    let icmp = match strip_ipv4_header(packet) {
        Some(icmp) => icmp,
        None => return false,
    };
    if icmp.len() < HEADER_LEN || icmp[0] != ECHO_REPLY {
        return false;
    }
    let reply_ident = u16::from_be_bytes([icmp[4], icmp[5]]);
    let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);

    reply_seq == seq && ident.map_or(true, |ident| ident == reply_ident)
}

fn strip_ipv4_header(packet: &[u8]) -> Option<&[u8]> {
    match packet.first() {
        Some(b) if b >> 4 == 4 => {
            let ihl = usize::from(b & 0x0f) * 4;
            packet.get(ihl..)
        }
        Some(_) => Some(packet),
        None => None,
    }
}

/// インターネットチェックサム (RFC 1071)
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|chunk| match chunk {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(u16::from_be_bytes([*hi, 0])),
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_request_checksum() {
        let packet = echo_request(0x1234, 7, b"abc");
        assert_eq!(packet[0], ECHO_REQUEST);
        assert_eq!(&packet[4..6], &[0x12, 0x34]);
        assert_eq!(&packet[6..8], &[0, 7]);
        assert_eq!(&packet[8..], b"abc");

        // チェックサム込みで再計算すると0になる
        assert_eq!(checksum(&packet), 0);
    }

    #[test]
    fn test_checksum_known_value() {
        // RFC 1071 の例
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data), !0xddf2);
    }

    #[test]
    fn test_reply_matching_datagram() {
        let mut reply = echo_request(1, 42, PAYLOAD);
        reply[0] = ECHO_REPLY;

        assert!(is_echo_reply(&reply, None, 42));
        assert!(!is_echo_reply(&reply, None, 43));

        // Echo Request 自体は応答ではない
        let request = echo_request(1, 42, PAYLOAD);
        assert!(!is_echo_reply(&request, None, 42));
    }

    #[test]
    fn test_reply_matching_raw() {
        let mut icmp = echo_request(0xbeef, 9, PAYLOAD);
        icmp[0] = ECHO_REPLY;

        let mut packet = vec![0u8; 20];
        packet[0] = 0x45;
        packet.extend_from_slice(&icmp);

        assert!(is_echo_reply(&packet, Some(0xbeef), 9));
        assert!(!is_echo_reply(&packet, Some(0xdead), 9));
    }

    #[test]
    fn test_ping_localhost_and_unroutable() {
        // ICMPソケットを開けない環境では確認できない
        let kind = match detect_socket_kind() {
            Some(kind) => kind,
            None => return,
        };

        assert!(ping(kind, Ipv4Addr::LOCALHOST, Duration::from_millis(1000)).unwrap());

        // TEST-NET-1 (RFC 5737) は応答しない。送信自体が失敗してもよい
        let started = Instant::now();
        let result = ping(kind, Ipv4Addr::new(192, 0, 2, 1), Duration::from_millis(300));
        assert!(!matches!(result, Ok(true)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_truncated_reply() {
        assert!(!is_echo_reply(&[], None, 0));
        assert!(!is_echo_reply(&[ECHO_REPLY, 0, 0], None, 0));
        assert!(!is_echo_reply(&[0x45, 0, 0], None, 0));
    }
}
