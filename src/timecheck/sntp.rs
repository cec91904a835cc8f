// Minimal SNTPv4 client (RFC 4330): one request, one reply, clock offset in seconds.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;

pub const NTP_PORT: u16 = 123;

const PACKET_LEN: usize = 48;
/// Seconds between 1900-01-01 (NTP era 0) and 1970-01-01.
const NTP_UNIX_DELTA: u64 = 2_208_988_800;
/// LI = 0, VN = 4, Mode = 3 (client).
const CLIENT_HEADER: u8 = 0b00_100_011;
const MODE_SERVER: u8 = 4;
const MODE_BROADCAST: u8 = 5;
/// Leap indicator 3: server clock not synchronized.
const LI_ALARM: u8 = 3;
/// Strata 16 and above mean unsynchronized or reserved.
const STRATUM_UNSYNCED: u8 = 16;

#[derive(Debug, thiserror::Error)]
pub enum SntpError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("short reply: {0} bytes")]
    Short(usize),
    #[error("unexpected mode {0}")]
    BadMode(u8),
    #[error("kiss-of-death reply (stratum 0)")]
    KissOfDeath,
    #[error("server clock unsynchronized (leap indicator {leap}, stratum {stratum})")]
    Unsynchronized { leap: u8, stratum: u8 },
    #[error("reply does not answer our request")]
    OriginMismatch,
    #[error("local clock before 1970")]
    Clock,
}

/// 64-bit NTP timestamp: seconds since 1900 + 32-bit fraction.
fn to_ntp(unix_secs: f64) -> [u8; 8] {
    let secs = unix_secs.trunc();
    let frac = ((unix_secs - secs) * 4_294_967_296.0) as u32;
    let ntp_secs = (secs as u64 + NTP_UNIX_DELTA) as u32;
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&ntp_secs.to_be_bytes());
    out[4..].copy_from_slice(&frac.to_be_bytes());
    out
}

fn from_ntp(raw: &[u8]) -> f64 {
    let secs = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as f64;
    let frac = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]) as f64;
    secs - NTP_UNIX_DELTA as f64 + frac / 4_294_967_296.0
}

fn unix_now() -> Result<f64, SntpError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .map_err(|_| SntpError::Clock)
}

/// Client request carrying `transmit` (unix seconds) as the transmit timestamp.
pub fn encode_request(transmit: f64) -> [u8; PACKET_LEN] {
    let mut pkt = [0u8; PACKET_LEN];
    pkt[0] = CLIENT_HEADER;
    pkt[40..48].copy_from_slice(&to_ntp(transmit));
    pkt
}

/// Clock offset ((T2 - T1) + (T3 - T4)) / 2 of a server reply.
/// `request` is the packet we sent; its transmit stamp must come back as the originate stamp.
pub fn decode_reply(
    reply: &[u8],
    request: &[u8; PACKET_LEN],
    received: f64,
) -> Result<f64, SntpError> {
    if reply.len() < PACKET_LEN {
        return Err(SntpError::Short(reply.len()));
    }
    let mode = reply[0] & 0x07;
    if mode != MODE_SERVER && mode != MODE_BROADCAST {
        return Err(SntpError::BadMode(mode));
    }
    let (leap, stratum) = (reply[0] >> 6, reply[1]);
    if stratum == 0 {
        return Err(SntpError::KissOfDeath);
    }
    if leap == LI_ALARM || stratum >= STRATUM_UNSYNCED {
        return Err(SntpError::Unsynchronized { leap, stratum });
    }
    if reply[24..32] != request[40..48] {
        return Err(SntpError::OriginMismatch);
    }
    let t1 = from_ntp(&request[40..48]);
    let t2 = from_ntp(&reply[32..40]);
    let t3 = from_ntp(&reply[40..48]);
    Ok(((t2 - t1) + (t3 - received)) / 2.0)
}

/// One SNTP exchange with `addr`; fails on timeout rather than waiting.
pub async fn query(addr: SocketAddr, timeout: Duration) -> Result<f64, SntpError> {
    let bind: SocketAddr = if addr.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(addr).await?;

    let request = encode_request(unix_now()?);
    socket.send(&request).await?;

    let mut buf = [0u8; 128];
    let n = tokio::time::timeout(timeout, socket.recv(&mut buf))
        .await
        .map_err(|_| SntpError::Timeout(timeout))??;
    let received = unix_now()?;
    decode_reply(&buf[..n], &request, received)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_for(request: &[u8; PACKET_LEN], server_recv: f64, server_xmit: f64) -> [u8; 48] {
        let mut r = [0u8; 48];
        r[0] = 0b00_100_100;
        r[1] = 2;
        r[24..32].copy_from_slice(&request[40..48]);
        r[32..40].copy_from_slice(&to_ntp(server_recv));
        r[40..48].copy_from_slice(&to_ntp(server_xmit));
        r
    }

    #[test]
    fn offset_of_server_ahead_by_three_seconds() {
        let t1 = 1_700_000_000.0;
        let request = encode_request(t1);
        let reply = reply_for(&request, t1 + 3.05, t1 + 3.06);
        let offset = decode_reply(&reply, &request, t1 + 0.11).unwrap();
        assert!((offset - 3.0).abs() < 1e-3, "offset {offset}");
    }

    #[test]
    fn rejects_foreign_reply() {
        let request = encode_request(1_700_000_000.0);
        let other = encode_request(1_600_000_000.0);
        let reply = reply_for(&other, 1_700_000_000.0, 1_700_000_000.0);
        assert!(matches!(
            decode_reply(&reply, &request, 1_700_000_000.0),
            Err(SntpError::OriginMismatch)
        ));
    }

    #[test]
    fn rejects_kiss_of_death_and_short() {
        let request = encode_request(1_700_000_000.0);
        let mut reply = reply_for(&request, 1_700_000_000.0, 1_700_000_000.0);
        reply[1] = 0;
        assert!(matches!(
            decode_reply(&reply, &request, 1_700_000_000.0),
            Err(SntpError::KissOfDeath)
        ));
        assert!(matches!(
            decode_reply(&reply[..20], &request, 1_700_000_000.0),
            Err(SntpError::Short(20))
        ));
    }

    #[test]
    fn rejects_unsynchronized_server() {
        let request = encode_request(1_700_000_000.0);
        let mut alarm = reply_for(&request, 1_700_000_000.0, 1_700_000_000.0);
        alarm[0] = 0b11_100_100;
        assert!(matches!(
            decode_reply(&alarm, &request, 1_700_000_000.0),
            Err(SntpError::Unsynchronized { leap: 3, stratum: 2 })
        ));

        let mut unsynced = reply_for(&request, 1_700_000_000.0, 1_700_000_000.0);
        unsynced[1] = 16;
        assert!(matches!(
            decode_reply(&unsynced, &request, 1_700_000_000.0),
            Err(SntpError::Unsynchronized { leap: 0, stratum: 16 })
        ));

        // leap second pending is still a good answer
        let mut pending = reply_for(&request, 1_700_000_000.0, 1_700_000_000.0);
        pending[0] = 0b01_100_100;
        pending[1] = 15;
        assert!(decode_reply(&pending, &request, 1_700_000_000.0).is_ok());
    }
}
