// Package identity, logged at startup by both binaries

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// "vpnstat 0.3.0" style banner.
pub fn banner() -> String {
    format!("{} {}", NAME, VERSION)
}
