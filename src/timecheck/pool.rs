// Shared ordering of candidate NTP hostnames. Unresponsive hosts sink to the back.

use std::collections::HashSet;
use std::sync::Mutex;

use rand::seq::SliceRandom;

const POOL_SUFFIX: &str = "pool.ntp.org";
const COUNTRY_PARTS: [&str; 20] = [
    "", "europe.", "at.", "be.", "bg.", "by.", "ch.", "de.", "dk.", "ee.", "es.", "fr.", "gr.",
    "it.", "lv.", "nl.", "pl.", "ru.", "se.", "uk.",
];

/// `{0..3}.{zone.}pool.ntp.org`, digit-major.
pub fn default_hostnames() -> Vec<String> {
    (0..4)
        .flat_map(|n| {
            COUNTRY_PARTS
                .iter()
                .map(move |zone| format!("{n}.{zone}{POOL_SUFFIX}"))
        })
        .collect()
}

/// Registry of time-server hostnames shared by every checker round.
/// All reads and reorderings happen under one lock.
pub struct NtpServerPool {
    servers: Mutex<Vec<String>>,
}

impl Default for NtpServerPool {
    fn default() -> Self {
        Self::new(default_hostnames())
    }
}

impl NtpServerPool {
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers: Mutex::new(servers),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Current order, unshuffled.
    pub fn snapshot(&self) -> Vec<String> {
        self.lock().clone()
    }

    /// Query order for one round: first half shuffled, then second half shuffled.
    pub fn candidates(&self) -> Vec<String> {
        let servers = self.snapshot();
        let mid = servers.len() / 2;
        let (priority, reserve) = servers.split_at(mid);
        let mut rng = rand::thread_rng();
        let mut priority = priority.to_vec();
        let mut reserve = reserve.to_vec();
        priority.shuffle(&mut rng);
        reserve.shuffle(&mut rng);
        priority.extend(reserve);
        priority
    }

    /// Moves `failed` hostnames to the end, keeping relative order on both sides.
    pub fn demote(&self, failed: &HashSet<String>) {
        if failed.is_empty() {
            return;
        }
        let mut servers = self.lock();
        let (mut kept, sunk): (Vec<String>, Vec<String>) =
            servers.drain(..).partition(|h| !failed.contains(h));
        kept.extend(sunk);
        *servers = kept;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.servers.lock().unwrap_or_else(|e| e.into_inner())
    }
}
