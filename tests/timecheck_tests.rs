// Consensus checker tests: representative offset, thresholds, dedup, demotion, early stop, SNTP

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use vpnstat::timecheck::{
    Consensus, ConsensusChecker, ConsensusParams, NtpServerPool, TimeSource, sntp,
};

/// How a fake server behaves.
#[derive(Clone, Copy)]
enum Fake {
    Offset(f64),
    Slow(f64),
    /// Fails after a short wait.
    Late,
    Down,
}

struct FakeSource {
    hosts: HashMap<String, (IpAddr, Fake)>,
    offset_calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeSource {
    fn new(hosts: &[(&str, u8, Fake)]) -> Self {
        Self {
            hosts: hosts
                .iter()
                .map(|(h, ip, f)| (h.to_string(), (IpAddr::V4(Ipv4Addr::new(10, 0, 0, *ip)), *f)))
                .collect(),
            offset_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    fn behaviour(&self, addr: IpAddr) -> Fake {
        self.hosts
            .values()
            .find(|(ip, _)| *ip == addr)
            .map(|(_, f)| *f)
            .unwrap_or(Fake::Down)
    }
}

impl TimeSource for &FakeSource {
    async fn resolve(&self, hostname: &str) -> anyhow::Result<IpAddr> {
        self.hosts
            .get(hostname)
            .map(|(ip, _)| *ip)
            .ok_or_else(|| anyhow::anyhow!("unknown host {}", hostname))
    }

    async fn offset(&self, addr: IpAddr, _timeout: Duration) -> anyhow::Result<f64> {
        self.offset_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);
        match self.behaviour(addr) {
            Fake::Offset(o) => Ok(o),
            Fake::Slow(o) => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(o)
            }
            Fake::Late => {
                tokio::time::sleep(Duration::from_millis(20)).await;
                anyhow::bail!("late answer from {}", addr)
            }
            Fake::Down => anyhow::bail!("no answer from {}", addr),
        }
    }
}

fn params(required: usize) -> ConsensusParams {
    ConsensusParams {
        required,
        fatal_drift_secs: 10.0,
        warn_drift_secs: 1.0,
        request_timeout: Duration::from_secs(120),
    }
}

fn pool_of(source: &FakeSource) -> Arc<NtpServerPool> {
    let mut names: Vec<String> = source.hosts.keys().cloned().collect();
    names.sort();
    Arc::new(NtpServerPool::new(names))
}

#[tokio::test]
async fn selects_second_smallest_offset() {
    let source = FakeSource::new(&[
        ("a", 1, Fake::Offset(0.2)),
        ("b", 2, Fake::Offset(-0.05)),
        ("c", 3, Fake::Offset(0.9)),
        ("d", 4, Fake::Offset(0.3)),
        ("e", 5, Fake::Offset(0.1)),
    ]);
    let checker = ConsensusChecker::new(&source, pool_of(&source), params(5));
    assert_eq!(
        checker.check().await,
        Consensus::Synced {
            offset: 0.1,
            warning: false
        }
    );
}

#[tokio::test]
async fn drift_between_thresholds_warns() {
    let source = FakeSource::new(&[
        ("a", 1, Fake::Offset(1.5)),
        ("b", 2, Fake::Offset(2.0)),
        ("c", 3, Fake::Offset(3.0)),
    ]);
    let checker = ConsensusChecker::new(&source, pool_of(&source), params(3));
    assert_eq!(
        checker.check().await,
        Consensus::Synced {
            offset: 2.0,
            warning: true
        }
    );
}

#[tokio::test]
async fn drift_above_fatal_threshold() {
    let source = FakeSource::new(&[
        ("a", 1, Fake::Offset(-12.0)),
        ("b", 2, Fake::Offset(11.0)),
        ("c", 3, Fake::Offset(30.0)),
    ]);
    let checker = ConsensusChecker::new(&source, pool_of(&source), params(3));
    assert_eq!(checker.check().await, Consensus::FatalDrift { offset: 12.0 });
}

#[tokio::test]
async fn too_few_answers_is_indeterminate_and_demotes_silent_hosts() {
    let source = FakeSource::new(&[
        ("a", 1, Fake::Down),
        ("b", 2, Fake::Offset(0.1)),
        ("c", 3, Fake::Down),
        ("d", 4, Fake::Offset(0.2)),
        ("e", 5, Fake::Offset(0.3)),
    ]);
    let pool = pool_of(&source);
    let checker = ConsensusChecker::new(&source, pool.clone(), params(5));

    assert_eq!(checker.check().await, Consensus::Indeterminate { measured: 3 });
    assert_eq!(pool.snapshot(), vec!["b", "d", "e", "a", "c"]);
}

#[tokio::test]
async fn verify_gives_up_after_attempts() {
    let source = FakeSource::new(&[("a", 1, Fake::Down), ("b", 2, Fake::Offset(0.1))]);
    let checker = ConsensusChecker::new(&source, pool_of(&source), params(2));
    assert_eq!(checker.verify(3).await, Consensus::Indeterminate { measured: 1 });
    assert_eq!(source.offset_calls.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn same_address_is_measured_once() {
    let source = FakeSource::new(&[
        ("a", 1, Fake::Offset(0.4)),
        ("b", 1, Fake::Offset(0.4)),
        ("c", 1, Fake::Offset(0.4)),
        ("d", 2, Fake::Offset(0.2)),
    ]);
    let checker = ConsensusChecker::new(&source, pool_of(&source), params(2));
    assert_eq!(
        checker.check().await,
        Consensus::Synced {
            offset: 0.4,
            warning: false
        }
    );
    assert_eq!(source.offset_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn stops_once_enough_answers_arrived() {
    let mut hosts: Vec<(String, u8, Fake)> = (0..6)
        .map(|i| (format!("fast{i}"), 10 + i, Fake::Offset(0.01 * f64::from(i + 1))))
        .collect();
    hosts.extend((0..4).map(|i| (format!("slow{i}"), 20 + i, Fake::Slow(0.5))));
    let refs: Vec<(&str, u8, Fake)> = hosts.iter().map(|(h, ip, f)| (h.as_str(), *ip, *f)).collect();
    let source = FakeSource::new(&refs);
    let pool = pool_of(&source);
    let before = pool.snapshot();
    let checker = ConsensusChecker::new(&source, pool.clone(), params(3));

    let outcome = tokio::time::timeout(Duration::from_secs(10), checker.check())
        .await
        .expect("pending requests must not be awaited");
    assert!(matches!(outcome, Consensus::Synced { warning: false, .. }));
    // cancelled requests are not failures
    assert_eq!(pool.snapshot(), before);
}

#[tokio::test]
async fn at_most_required_plus_two_requests_in_flight() {
    let hosts: Vec<(String, u8, Fake)> = (0..12).map(|i| (format!("late{i}"), 30 + i, Fake::Late)).collect();
    let refs: Vec<(&str, u8, Fake)> = hosts.iter().map(|(h, ip, f)| (h.as_str(), *ip, *f)).collect();
    let source = FakeSource::new(&refs);
    let checker = ConsensusChecker::new(&source, pool_of(&source), params(3));

    assert_eq!(checker.check().await, Consensus::Indeterminate { measured: 0 });
    assert_eq!(source.offset_calls.load(Ordering::SeqCst), 12);
    assert_eq!(source.peak_in_flight.load(Ordering::SeqCst), 5);
    assert_eq!(source.in_flight.load(Ordering::SeqCst), 0);
}

fn ntp_stamp(unix: f64) -> [u8; 8] {
    let secs = unix.trunc();
    let frac = ((unix - secs) * 4_294_967_296.0) as u32;
    let ntp = (secs as u64 + 2_208_988_800) as u32;
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&ntp.to_be_bytes());
    out[4..].copy_from_slice(&frac.to_be_bytes());
    out
}

/// Answers one SNTP request as a server whose clock is `ahead` seconds in front.
async fn spawn_responder(ahead: f64) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 128];
        let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 48);
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs_f64() + ahead;
        let mut reply = [0u8; 48];
        reply[0] = 0b00_100_100;
        reply[1] = 2;
        reply[24..32].copy_from_slice(&buf[40..48]);
        reply[32..40].copy_from_slice(&ntp_stamp(now));
        reply[40..48].copy_from_slice(&ntp_stamp(now));
        socket.send_to(&reply, peer).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn sntp_query_measures_server_offset() {
    let addr = spawn_responder(5.0).await;
    let offset = sntp::query(addr, Duration::from_secs(2)).await.unwrap();
    assert!((offset - 5.0).abs() < 0.5, "offset {offset}");
}

#[tokio::test]
async fn sntp_query_times_out() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = silent.local_addr().unwrap();
    let err = sntp::query(addr, Duration::from_millis(200)).await.unwrap_err();
    assert!(matches!(err, sntp::SntpError::Timeout(_)));
}
