//! The dispatch contract between the scheduler and its delivery
//! workers: ship a selected entry, get back one disposition per
//! recipient plus an optional destination-wide verdict.

use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::UnboundedSender;

/// Opaque handle correlating a dispatch with its completion.
pub type DispatchToken = u64;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{} {}", self.code, self.text)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status", content = "reply")]
pub enum RecipientDisposition {
    Delivered,
    Defer(Reply),
    Bounce(Reply),
}

/// A worker's opinion of the destination as a whole, beyond the
/// per-recipient outcomes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "site", content = "reason")]
pub enum SiteVerdict {
    Alive,
    Dead(String),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DeliveryRequest {
    pub queue_id: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub transport: String,
    pub nexthop: String,
    pub time_limit_secs: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DeliveryReport {
    /// Positionally matched to the request's recipients; a short
    /// vector means the worker died before acknowledging the tail,
    /// and the scheduler defers the remainder.
    pub dispositions: Vec<RecipientDisposition>,
    #[serde(default)]
    pub verdict: Option<SiteVerdict>,
}

impl DeliveryReport {
    /// The report the scheduler synthesizes when a worker crashed or
    /// timed out before answering: everything deferred, site verdict
    /// left open.
    pub fn worker_failure(reason: &str, recipients: usize) -> Self {
        Self {
            dispositions: vec![
                RecipientDisposition::Defer(Reply::new(
                    451,
                    format!("delivery worker failed: {reason}")
                ));
                recipients
            ],
            verdict: None,
        }
    }
}

#[derive(Debug)]
pub struct Completion {
    pub token: DispatchToken,
    pub report: DeliveryReport,
}

/// Ships a request to a worker. Implementations return immediately;
/// the completion arrives on the channel the agent was built with.
/// An `Err` means no worker ever saw the request and the entry may
/// be unselected.
pub trait DeliveryAgent: Send + Sync {
    fn dispatch(&self, token: DispatchToken, request: DeliveryRequest) -> anyhow::Result<()>;
}

/// Accepts every recipient without doing anything. Used by tests and
/// by `ferryd --sink` smoke runs.
pub struct SinkAgent {
    completions: UnboundedSender<Completion>,
}

impl SinkAgent {
    pub fn new(completions: UnboundedSender<Completion>) -> Self {
        Self { completions }
    }
}

impl DeliveryAgent for SinkAgent {
    fn dispatch(&self, token: DispatchToken, request: DeliveryRequest) -> anyhow::Result<()> {
        self.completions
            .send(Completion {
                token,
                report: DeliveryReport {
                    dispositions: vec![
                        RecipientDisposition::Delivered;
                        request.recipients.len()
                    ],
                    verdict: Some(SiteVerdict::Alive),
                },
            })
            .map_err(|_| anyhow::anyhow!("completion channel is closed"))
    }
}

/// Spawns one worker subprocess per dispatch. The request goes to
/// the child as a single JSON line on stdin; the child answers with
/// a single JSON report line on stdout. A child that exceeds the
/// request's time limit is killed and its recipients deferred; the
/// same happens when it exits without answering or answers garbage.
pub struct PipeAgent {
    command: Arc<Vec<String>>,
    completions: UnboundedSender<Completion>,
}

impl PipeAgent {
    pub fn new(command: Vec<String>, completions: UnboundedSender<Completion>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !command.is_empty(),
            "worker_command must name the program to run"
        );
        Ok(Self {
            command: Arc::new(command),
            completions,
        })
    }

    async fn run_worker(
        command: &[String],
        request: &DeliveryRequest,
    ) -> anyhow::Result<DeliveryReport> {
        let mut child = tokio::process::Command::new(&command[0])
            .args(&command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");

        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        drop(stdin);

        let mut reply = String::new();
        let mut reader = BufReader::new(stdout);
        let n = reader.read_line(&mut reply).await?;
        anyhow::ensure!(n > 0, "worker closed stdout without a report");

        let report: DeliveryReport = serde_json::from_str(reply.trim_end())?;
        anyhow::ensure!(
            report.dispositions.len() <= request.recipients.len(),
            "worker reported {} dispositions for {} recipients",
            report.dispositions.len(),
            request.recipients.len()
        );

        child.wait().await?;
        Ok(report)
    }
}

impl DeliveryAgent for PipeAgent {
    fn dispatch(&self, token: DispatchToken, request: DeliveryRequest) -> anyhow::Result<()> {
        let command = self.command.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let time_limit = std::time::Duration::from_secs(request.time_limit_secs);
            let nrcpt = request.recipients.len();
            let mut report = match tokio::time::timeout(
                time_limit,
                Self::run_worker(&command, &request),
            )
            .await
            {
                Ok(Ok(report)) => report,
                Ok(Err(err)) => {
                    tracing::warn!(
                        "delivery worker for {}/{} failed: {err:#}",
                        request.transport,
                        request.nexthop
                    );
                    DeliveryReport::worker_failure(&format!("{err:#}"), nrcpt)
                }
                Err(_) => {
                    tracing::warn!(
                        "delivery worker for {}/{} exceeded {:?}, killed",
                        request.transport,
                        request.nexthop,
                        time_limit
                    );
                    DeliveryReport::worker_failure("time limit exceeded", nrcpt)
                }
            };
            // An unacknowledged tail is a worker crash mid-batch:
            // treat those recipients as deferred.
            while report.dispositions.len() < nrcpt {
                report.dispositions.push(RecipientDisposition::Defer(Reply::new(
                    451,
                    "worker lost before acknowledgment",
                )));
            }
            completions.send(Completion { token, report }).ok();
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_wire_format_round_trips() {
        let report = DeliveryReport {
            dispositions: vec![
                RecipientDisposition::Delivered,
                RecipientDisposition::Defer(Reply::new(451, "greylisted")),
                RecipientDisposition::Bounce(Reply::new(550, "no such user")),
            ],
            verdict: Some(SiteVerdict::Dead("connection refused".to_string())),
        };
        let line = serde_json::to_string(&report).unwrap();
        let parsed: DeliveryReport = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.dispositions, report.dispositions);
        assert_eq!(parsed.verdict, report.verdict);
    }

    #[test]
    fn verdict_is_optional_on_the_wire() {
        let parsed: DeliveryReport =
            serde_json::from_str(r#"{"dispositions":[{"status":"Delivered"}]}"#).unwrap();
        assert_eq!(parsed.dispositions, vec![RecipientDisposition::Delivered]);
        assert_eq!(parsed.verdict, None);
    }

    #[test]
    fn worker_failure_defers_everyone() {
        let report = DeliveryReport::worker_failure("killed", 3);
        assert_eq!(report.dispositions.len(), 3);
        assert!(report
            .dispositions
            .iter()
            .all(|d| matches!(d, RecipientDisposition::Defer(r) if r.code == 451)));
    }

    #[tokio::test]
    async fn sink_agent_delivers_everything() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let agent = SinkAgent::new(tx);
        agent
            .dispatch(
                7,
                DeliveryRequest {
                    queue_id: "abc".to_string(),
                    sender: "from@here".to_string(),
                    recipients: vec!["a@dest".to_string(), "b@dest".to_string()],
                    transport: "smtp".to_string(),
                    nexthop: "dest".to_string(),
                    time_limit_secs: 600,
                },
            )
            .unwrap();
        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.token, 7);
        assert_eq!(completion.report.dispositions.len(), 2);
        assert_eq!(completion.report.verdict, Some(SiteVerdict::Alive));
    }
}
