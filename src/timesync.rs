//! Trustworthy time from network time servers
//!
//! Scheduling correctness depends on agreement with the remote service's
//! clock, so "now" is taken from a prioritized list of NTP servers. Every
//! query is bounded by a per-server timeout and any failure moves on to the
//! next server; if all servers fail the local system clock is used instead.
//! Resolution never fails and never blocks past `servers * timeout`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::config::NtpConfig;

/// Size of an SNTP packet
const NTP_PACKET_LEN: usize = 48;

/// Byte offset of the transmit timestamp in a server reply
const NTP_TRANSMIT_OFFSET: usize = 40;

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch
const NTP_UNIX_EPOCH_DELTA: u64 = 2_208_988_800;

/// Default NTP port
const NTP_PORT: u16 = 123;

/// Where a time reading came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeProvenance {
    /// Transmitted by a network time server
    Network,
    /// Local system clock, used only after every server failed
    LocalFallback,
}

/// An instant in UTC tagged with its provenance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeReading {
    pub instant: DateTime<Utc>,
    pub provenance: TimeProvenance,
}

/// Failure querying a single time server
#[derive(Debug, Error)]
pub enum NtpError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no reply within budget")]
    Timeout,

    #[error("short or unsynchronized reply")]
    MalformedReply,
}

/// Resolves current trustworthy time
#[async_trait]
pub trait TimeSource: Send + Sync {
    /// Current time; guaranteed to produce a reading
    async fn now(&self) -> TimeReading;
}

/// Time source backed by an ordered list of NTP servers
pub struct NtpTimeSource {
    servers: Vec<String>,
    timeout: Duration,
}

impl NtpTimeSource {
    /// Create a time source from configuration
    pub fn new(config: &NtpConfig) -> Self {
        Self::with_timeout(config.servers.clone(), config.timeout())
    }

    /// Create a time source with an explicit per-server budget
    pub fn with_timeout(servers: Vec<String>, timeout: Duration) -> Self {
        Self { servers, timeout }
    }

    /// Query one server; the whole exchange (resolve, send, receive) shares
    /// the per-server budget.
    async fn query(&self, server: &str) -> Result<DateTime<Utc>, NtpError> {
        let addr = if server.contains(':') {
            server.to_string()
        } else {
            format!("{server}:{NTP_PORT}")
        };

        let exchange = async {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect(addr.as_str()).await?;
            socket.send(&client_packet()).await?;

            let mut buf = [0u8; NTP_PACKET_LEN];
            let len = socket.recv(&mut buf).await?;
            parse_transmit_time(&buf[..len]).ok_or(NtpError::MalformedReply)
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| NtpError::Timeout)?
    }
}

#[async_trait]
impl TimeSource for NtpTimeSource {
    async fn now(&self) -> TimeReading {
        for server in &self.servers {
            match self.query(server).await {
                Ok(instant) => {
                    debug!(%server, %instant, "time server reply");
                    return TimeReading {
                        instant,
                        provenance: TimeProvenance::Network,
                    };
                }
                Err(e) => {
                    debug!(%server, error = %e, "time server query failed");
                }
            }
        }

        warn!("all time servers failed, falling back to system clock");
        TimeReading {
            instant: Utc::now(),
            provenance: TimeProvenance::LocalFallback,
        }
    }
}

/// SNTP v3 client request: LI=0, VN=3, Mode=3 (client), rest zeroed
fn client_packet() -> [u8; NTP_PACKET_LEN] {
    let mut packet = [0u8; NTP_PACKET_LEN];
    packet[0] = 0x1B;
    packet
}

/// Extract the transmit timestamp from a server reply and convert it to UTC.
///
/// Returns `None` for short packets and for a zero seconds field, which an
/// unsynchronized server (or a kiss-of-death reply) sends.
fn parse_transmit_time(buf: &[u8]) -> Option<DateTime<Utc>> {
    if buf.len() < NTP_PACKET_LEN {
        return None;
    }

    let secs = u32::from_be_bytes(buf[NTP_TRANSMIT_OFFSET..NTP_TRANSMIT_OFFSET + 4].try_into().ok()?) as u64;
    let frac = u32::from_be_bytes(buf[NTP_TRANSMIT_OFFSET + 4..NTP_TRANSMIT_OFFSET + 8].try_into().ok()?) as u64;

    if secs == 0 {
        return None;
    }

    let unix_secs = secs.checked_sub(NTP_UNIX_EPOCH_DELTA)?;
    let nanos = (frac * 1_000_000_000) >> 32;

    DateTime::from_timestamp(unix_secs as i64, nanos as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_with_transmit(unix_secs: u64, frac: u32) -> [u8; NTP_PACKET_LEN] {
        let mut buf = [0u8; NTP_PACKET_LEN];
        buf[0] = 0x1C; // LI=0 VN=3 Mode=4 (server)
        let ntp_secs = (unix_secs + NTP_UNIX_EPOCH_DELTA) as u32;
        buf[NTP_TRANSMIT_OFFSET..NTP_TRANSMIT_OFFSET + 4].copy_from_slice(&ntp_secs.to_be_bytes());
        buf[NTP_TRANSMIT_OFFSET + 4..NTP_TRANSMIT_OFFSET + 8].copy_from_slice(&frac.to_be_bytes());
        buf
    }

    #[test]
    fn test_client_packet_header() {
        let packet = client_packet();
        assert_eq!(packet.len(), NTP_PACKET_LEN);
        assert_eq!(packet[0], 0x1B);
        assert!(packet[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_parse_transmit_time() {
        let buf = reply_with_transmit(1_700_000_000, 0x8000_0000);
        let parsed = parse_transmit_time(&buf).unwrap();
        assert_eq!(parsed, DateTime::from_timestamp(1_700_000_000, 500_000_000).unwrap());
    }

    #[test]
    fn test_parse_rejects_short_reply() {
        let buf = reply_with_transmit(1_700_000_000, 0);
        assert!(parse_transmit_time(&buf[..20]).is_none());
        assert!(parse_transmit_time(&[]).is_none());
    }

    #[test]
    fn test_parse_rejects_unsynchronized_reply() {
        // zeroed transmit timestamp
        let buf = [0u8; NTP_PACKET_LEN];
        assert!(parse_transmit_time(&buf).is_none());
    }

    #[tokio::test]
    async fn test_empty_server_list_falls_back_to_local() {
        let source = NtpTimeSource::with_timeout(vec![], Duration::from_millis(10));
        let before = Utc::now();
        let reading = source.now().await;
        assert_eq!(reading.provenance, TimeProvenance::LocalFallback);
        assert!(reading.instant >= before);
    }

    #[tokio::test]
    async fn test_unreachable_servers_fall_back_to_local() {
        // discard-ish port on loopback: reply never comes, budget expires
        let source = NtpTimeSource::with_timeout(
            vec!["127.0.0.1:9".to_string(), "127.0.0.1:9".to_string()],
            Duration::from_millis(50),
        );
        let reading = source.now().await;
        assert_eq!(reading.provenance, TimeProvenance::LocalFallback);
    }
}
