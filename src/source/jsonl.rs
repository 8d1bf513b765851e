//! Health source backed by JSONL session transcripts.
//!
//! Layout: `<root>/<project_id>/<session_id>.jsonl`, one JSON object per
//! line as written by agent CLIs. Activity is the file's modification
//! time; token usage, message counts and error counts are summed from
//! the transcript lines. Control actions are intent-only for this source
//! (the default [`HealthSource::apply_control`]).

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use super::HealthSource;
use crate::models::health::{
    SessionFacts, SessionHealth, SessionMetadata, SessionProgress, TokenUsage,
};
use crate::{AppError, Result};

/// Extension of transcript files.
const TRANSCRIPT_EXTENSION: &str = "jsonl";

/// One transcript line; unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranscriptLine {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    is_api_error_message: bool,
    #[serde(default)]
    message: Option<TranscriptMessage>,
}

#[derive(Debug, Default, Deserialize)]
struct TranscriptMessage {
    #[serde(default)]
    usage: Option<TranscriptUsage>,
    #[serde(default)]
    content: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct TranscriptUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Figures extracted from a transcript body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscriptSummary {
    /// Summed input tokens.
    pub input_tokens: u64,
    /// Summed output tokens.
    pub output_tokens: u64,
    /// User and assistant lines.
    pub message_count: u64,
    /// Lines flagged as API errors or typed `error`.
    pub error_count: u64,
    /// Lines that were not valid JSON objects.
    pub malformed_lines: u64,
    /// Most recent tool-use name, else the most recent line type.
    pub current_activity: Option<String>,
    /// Earliest timestamp seen.
    pub started_at: Option<DateTime<Utc>>,
    /// Latest timestamp seen.
    pub last_timestamp: Option<DateTime<Utc>>,
    /// Latest agent version tag.
    pub version: Option<String>,
    /// Latest working directory.
    pub cwd: Option<String>,
    /// Mean user → assistant latency in milliseconds.
    pub mean_response_ms: Option<f64>,
}

/// Summarize a transcript body.
#[must_use]
#[allow(clippy::cast_precision_loss)] // Latency sums stay well below 2^52 ms.
pub fn summarize_transcript(raw: &str) -> TranscriptSummary {
    let mut summary = TranscriptSummary::default();
    let mut pending_user: Option<DateTime<Utc>> = None;
    let mut latencies: Vec<i64> = Vec::new();

    for line in raw.lines().filter(|line| !line.trim().is_empty()) {
        let Ok(entry) = serde_json::from_str::<TranscriptLine>(line) else {
            summary.malformed_lines += 1;
            continue;
        };

        if let Some(ts) = entry.timestamp {
            summary.started_at = Some(summary.started_at.map_or(ts, |s| s.min(ts)));
            summary.last_timestamp = Some(summary.last_timestamp.map_or(ts, |l| l.max(ts)));
        }
        if entry.version.is_some() {
            summary.version = entry.version;
        }
        if entry.cwd.is_some() {
            summary.cwd = entry.cwd;
        }

        let kind = entry.kind.as_deref().unwrap_or_default();
        if entry.is_api_error_message || kind == "error" {
            summary.error_count += 1;
        }

        match kind {
            "user" => {
                summary.message_count += 1;
                if pending_user.is_none() {
                    pending_user = entry.timestamp;
                }
            }
            "assistant" => {
                summary.message_count += 1;
                if let (Some(asked), Some(answered)) = (pending_user.take(), entry.timestamp) {
                    latencies.push((answered - asked).num_milliseconds().max(0));
                }
            }
            _ => {}
        }

        if let Some(message) = entry.message {
            if let Some(usage) = message.usage {
                summary.input_tokens += usage.input_tokens;
                summary.output_tokens += usage.output_tokens;
            }
            if let Some(tool) = message.content.as_ref().and_then(last_tool_use) {
                summary.current_activity = Some(tool);
                continue;
            }
        }
        if !kind.is_empty() {
            summary.current_activity = Some(kind.to_owned());
        }
    }

    if !latencies.is_empty() {
        let total: i64 = latencies.iter().sum();
        summary.mean_response_ms = Some(total as f64 / latencies.len() as f64);
    }

    summary
}

/// Name of the last `tool_use` block in a message's content array.
fn last_tool_use(content: &serde_json::Value) -> Option<String> {
    content
        .as_array()?
        .iter()
        .rev()
        .find(|block| block.get("type").and_then(serde_json::Value::as_str) == Some("tool_use"))
        .and_then(|block| block.get("name"))
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
}

/// Reject ids that would escape the projects root.
fn ensure_plain_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
        return Err(AppError::InvalidRequest(format!("invalid {kind} id '{id}'")));
    }
    Ok(())
}

/// Health source reading `<root>/<project>/<session>.jsonl` transcripts.
#[derive(Debug, Clone)]
pub struct JsonlHealthSource {
    root: PathBuf,
}

impl JsonlHealthSource {
    /// Create a source rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory that holds a project's transcripts.
    #[must_use]
    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.root.join(project_id)
    }

    fn transcript_path(&self, project_id: &str, session_id: &str) -> PathBuf {
        self.project_dir(project_id)
            .join(format!("{session_id}.{TRANSCRIPT_EXTENSION}"))
    }
}

/// Glob the transcript files of one project directory.
fn discover_sessions(dir: &Path) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Err(AppError::DetectionFailure(format!(
            "project directory {} is not readable",
            dir.display()
        )));
    }

    let pattern = format!(
        "{}/*.{TRANSCRIPT_EXTENSION}",
        glob::Pattern::escape(&dir.to_string_lossy())
    );
    let paths = glob::glob(&pattern)
        .map_err(|err| AppError::DetectionFailure(format!("bad discovery pattern: {err}")))?;

    let mut sessions: Vec<String> = paths
        .filter_map(std::result::Result::ok)
        .filter(|path| path.is_file())
        .filter_map(|path| {
            path.file_stem()
                .and_then(|stem| stem.to_str())
                .map(str::to_owned)
        })
        .collect();
    sessions.sort();
    Ok(sessions)
}

impl HealthSource for JsonlHealthSource {
    fn list_sessions(
        &self,
        project_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + '_>> {
        let project_id = project_id.to_owned();
        Box::pin(async move {
            ensure_plain_id("project", &project_id)?;
            let dir = self.project_dir(&project_id);
            tokio::task::spawn_blocking(move || discover_sessions(&dir))
                .await
                .map_err(|err| AppError::Internal(format!("discovery task panicked: {err}")))?
        })
    }

    fn fetch_facts(
        &self,
        project_id: &str,
        session_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<SessionFacts>> + Send + '_>> {
        let project_id = project_id.to_owned();
        let session_id = session_id.to_owned();
        Box::pin(async move {
            ensure_plain_id("project", &project_id)?;
            ensure_plain_id("session", &session_id)?;
            let path = self.transcript_path(&project_id, &session_id);

            let modified = tokio::fs::metadata(&path)
                .await
                .and_then(|meta| meta.modified())
                .map_err(|err| {
                    AppError::DetectionFailure(format!("stat {}: {err}", path.display()))
                })?;
            let raw = tokio::fs::read_to_string(&path).await.map_err(|err| {
                AppError::DetectionFailure(format!("read {}: {err}", path.display()))
            })?;

            let summary = summarize_transcript(&raw);
            debug!(
                %project_id,
                %session_id,
                messages = summary.message_count,
                "transcript summarized"
            );
            Ok(facts_from_summary(summary, DateTime::<Utc>::from(modified)))
        })
    }
}

/// Turn a transcript summary plus the file's mtime into session facts.
#[must_use]
pub fn facts_from_summary(summary: TranscriptSummary, modified: DateTime<Utc>) -> SessionFacts {
    let last_activity_at = summary
        .last_timestamp
        .map_or(modified, |ts| ts.max(modified));

    let mut warnings = Vec::new();
    if summary.malformed_lines > 0 {
        warnings.push(format!(
            "{} malformed transcript line(s) skipped",
            summary.malformed_lines
        ));
    }

    let elapsed_ms = summary.started_at.map_or(0, |started| {
        u64::try_from((last_activity_at - started).num_milliseconds()).unwrap_or(0)
    });

    SessionFacts {
        health: SessionHealth {
            last_activity_at,
            response_time: summary.mean_response_ms,
            memory_usage: None,
            cpu_usage: None,
            error_count: summary.error_count,
            warnings,
        },
        progress: SessionProgress {
            current_activity: summary.current_activity,
            token_usage: TokenUsage::new(summary.input_tokens, summary.output_tokens),
            message_count: summary.message_count,
            elapsed_ms,
        },
        metadata: SessionMetadata {
            pid: None,
            started_at: summary.started_at,
            last_update_at: modified,
            version: summary.version,
            environment: summary.cwd,
        },
    }
}
