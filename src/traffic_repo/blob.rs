// BLOB version prefix helpers. [version: u8][wincode payload].
// last_snapshot.counters: version 1 = Vec<UserCounters>.

pub(super) const BLOB_VERSION_COUNTERS: u8 = 1;

pub(super) fn with_version_prefix(version: u8, payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(version);
    out.extend_from_slice(&payload);
    out
}

/// Payload after the version byte; errors on an empty blob or another version.
pub(super) fn blob_payload(bytes: &[u8], expected_version: u8) -> anyhow::Result<&[u8]> {
    match bytes.split_first() {
        Some((&v, rest)) if v == expected_version => Ok(rest),
        Some((&v, _)) => anyhow::bail!(
            "unsupported blob version {}, expected {}",
            v,
            expected_version
        ),
        None => anyhow::bail!("empty blob"),
    }
}
