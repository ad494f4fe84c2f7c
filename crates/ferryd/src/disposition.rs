//! Append-only disposition log: one JSON record per delivery
//! outcome, for the operator and for downstream bounce processing.

use crate::dispatch::Reply;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::io::Write;
use std::path::Path;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Recipient was delivered
    Delivery,
    /// Recipient permanently failed
    Bounce,
    /// Recipient delivery will be retried later
    Defer,
    /// The whole queue file reached its final disposition
    Finalized,
}

#[derive(Serialize, Debug)]
pub struct LogDisposition<'a> {
    #[serde(rename = "type")]
    pub kind: RecordType,
    pub queue_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<&'a Reply>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'a str>,
}

#[derive(Serialize)]
struct Stamped<'a> {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    record: &'a LogDisposition<'a>,
}

pub struct DispositionLog {
    out: Mutex<Box<dyn Write + Send>>,
}

impl DispositionLog {
    pub fn to_file(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            out: Mutex::new(Box::new(file)),
        })
    }

    pub fn to_stdout() -> Self {
        Self {
            out: Mutex::new(Box::new(std::io::stdout())),
        }
    }

    pub fn log(&self, record: LogDisposition) {
        let stamped = Stamped {
            timestamp: Utc::now(),
            record: &record,
        };
        let mut line = match serde_json::to_string(&stamped) {
            Ok(line) => line,
            Err(err) => {
                tracing::error!("failed to serialize disposition record: {err:#}");
                return;
            }
        };
        line.push('\n');
        let mut out = self.out.lock();
        if let Err(err) = out.write_all(line.as_bytes()).and_then(|_| out.flush()) {
            tracing::error!("failed to append disposition record: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_land_in_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disposition.log");
        let log = DispositionLog::to_file(&path).unwrap();

        log.log(LogDisposition {
            kind: RecordType::Defer,
            queue_id: "deadbeef",
            recipient: Some("user@dest.example"),
            reply: Some(&Reply::new(451, "try later")),
            destination: Some("dest.example"),
            transport: Some("smtp"),
            reason: None,
        });
        log.log(LogDisposition {
            kind: RecordType::Finalized,
            queue_id: "deadbeef",
            recipient: None,
            reply: None,
            destination: None,
            transport: None,
            reason: Some("deferred"),
        });

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["type"], "Defer");
        assert_eq!(first["recipient"], "user@dest.example");
        assert_eq!(first["reply"]["code"], 451);
        assert!(first.get("reason").is_none());

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["type"], "Finalized");
        assert_eq!(second["reason"], "deferred");
        assert!(second.get("recipient").is_none());
    }
}
