/// Parses the newline-delimited JSON status records a worker writes to
/// stdout (`{"type": "ready" | "heartbeat" | "metrics", ...}`).
///
/// Mirrors `agent_stream_parser.rs`'s per-line, parse-failure-is-a-warning
/// posture: a line that isn't valid JSON, or is valid JSON but not one of
/// the known record shapes, is logged and skipped rather than killing the
/// reader task. One bad line from a misbehaving worker should never take
/// down the supervisor's read loop.
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerRecord {
    Ready,
    Heartbeat,
    Metrics(MetricsRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct MetricsRecord {
    pub rss_bytes: i64,
    #[serde(default)]
    pub heap_total_bytes: i64,
    #[serde(default)]
    pub heap_used_bytes: i64,
    #[serde(default)]
    pub cpu_user: f64,
    #[serde(default)]
    pub cpu_system: f64,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    rest: serde_json::Value,
}

/// Parses a single stdout line. Returns `None` for blank lines, unknown
/// record types, or malformed JSON — callers should log at `warn` on `None`
/// for a non-blank line and otherwise move on.
pub fn parse_line(line: &str) -> Option<WorkerRecord> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let raw: RawRecord = serde_json::from_str(trimmed).ok()?;
    match raw.kind.as_str() {
        "ready" => Some(WorkerRecord::Ready),
        "heartbeat" => Some(WorkerRecord::Heartbeat),
        "metrics" => serde_json::from_value::<MetricsRecord>(raw.rest)
            .ok()
            .map(WorkerRecord::Metrics),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ready() {
        assert_eq!(parse_line(r#"{"type":"ready"}"#), Some(WorkerRecord::Ready));
    }

    #[test]
    fn parses_heartbeat() {
        assert_eq!(
            parse_line(r#"{"type":"heartbeat"}"#),
            Some(WorkerRecord::Heartbeat)
        );
    }

    #[test]
    fn parses_metrics() {
        let line = r#"{"type":"metrics","rss_bytes":1024,"cpu_user":0.1,"cpu_system":0.05}"#;
        match parse_line(line) {
            Some(WorkerRecord::Metrics(m)) => {
                assert_eq!(m.rss_bytes, 1024);
                assert_eq!(m.cpu_user, 0.1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn blank_line_is_none() {
        assert_eq!(parse_line("   "), None);
    }

    #[test]
    fn malformed_json_is_none() {
        assert_eq!(parse_line("not json"), None);
    }

    #[test]
    fn unknown_type_is_none() {
        assert_eq!(parse_line(r#"{"type":"debug","x":1}"#), None);
    }
}
