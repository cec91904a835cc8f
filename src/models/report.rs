// Report document written as report.json

use serde::Serialize;

/// (base user id, total gigabytes). Serializes as a two-element JSON array.
pub type GroupTotal = (String, f64);

/// `{"stats": [[uid, gb], ...], "issues": [[iso, message], ...]}`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Report {
    pub stats: Vec<GroupTotal>,
    pub issues: Vec<(String, String)>,
}
