//! Claude Code CLI launcher.
//!
//! Runs `claude -p <prompt> --output-format stream-json --verbose` in the
//! project directory and turns the line-delimited JSON it prints into
//! activity entries while it works. Completion is not read from the output:
//! the agent reports back by running `loupe task update`, and the dispatcher
//! checks the task afterwards.

use crate::launcher::{ActivitySink, AgentLauncher};
use crate::subprocess::{AgentError, AgentExit, RunLimits, run_streaming};
use async_trait::async_trait;
use loupe_core::config::AgentConfig;
use loupe_core::event::{ActivityEntry, ActivityKind};
use loupe_core::prompt::truncate;
use loupe_core::task::TaskId;
use serde_json::Value;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

const TEXT_LIMIT: usize = 200;
const COMMAND_LIMIT: usize = 80;
const RESULT_LIMIT: usize = 120;

pub struct ClaudeCli {
    config: AgentConfig,
    env: Vec<(String, String)>,
}

impl ClaudeCli {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            env: Vec::new(),
        }
    }

    /// Set an environment variable for the agent and the tools it runs.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Command-line arguments for one run.
    pub fn args(&self, prompt: &str) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".into(),
            "stream-json".into(),
            "--verbose".into(),
            "--max-turns".into(),
            self.config.max_turns.to_string(),
        ];
        if !self.config.allowed_tools.is_empty() {
            args.push("--allowedTools".into());
            args.push(self.config.allowed_tools.join(","));
        }
        args.extend(self.config.extra_args.iter().cloned());
        args
    }

    fn command(&self, prompt: &str) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(self.args(prompt))
            .current_dir(&self.config.project_dir)
            // Allow the CLI to start when loupe itself runs inside a Claude session.
            .env_remove("CLAUDECODE")
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd
    }
}

#[async_trait]
impl AgentLauncher for ClaudeCli {
    fn name(&self) -> &str {
        &self.config.command
    }

    async fn run(
        &self,
        task_id: &TaskId,
        prompt: String,
        cancel: CancellationToken,
        sink: ActivitySink,
    ) -> Result<AgentExit, AgentError> {
        tracing::info!(
            task = %task_id,
            command = %self.config.command,
            cwd = %self.config.project_dir.display(),
            prompt_len = prompt.len(),
            max_turns = self.config.max_turns,
            "invoking claude CLI"
        );
        let limits = RunLimits {
            timeout: self.config.timeout(),
            kill_grace: self.config.kill_grace(),
        };
        run_streaming(self.command(&prompt), limits, &cancel, |line| {
            for entry in parse_stream_record(line) {
                sink.send(entry);
            }
        })
        .await
    }
}

/// Translate one stream-json record into activity entries.
///
/// Unknown record types and non-JSON lines yield nothing.
pub fn parse_stream_record(line: &str) -> Vec<ActivityEntry> {
    let Ok(record) = serde_json::from_str::<Value>(line) else {
        tracing::trace!(line, "skipping non-JSON agent output");
        return Vec::new();
    };

    match record.get("type").and_then(Value::as_str) {
        Some("assistant") => content_blocks(&record)
            .iter()
            .filter_map(|block| match block.get("type").and_then(Value::as_str) {
                Some("tool_use") => Some(ActivityEntry::new(
                    ActivityKind::ToolStart,
                    tool_summary(block),
                )),
                Some("text") => {
                    let text = block.get("text").and_then(Value::as_str)?.trim();
                    (!text.is_empty())
                        .then(|| ActivityEntry::new(ActivityKind::Text, truncate(text, TEXT_LIMIT)))
                }
                _ => None,
            })
            .collect(),
        Some("user") => content_blocks(&record)
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
            .map(|block| {
                let output = result_text(block.get("content"));
                if block.get("is_error").and_then(Value::as_bool).unwrap_or(false) {
                    ActivityEntry::new(ActivityKind::Error, truncate(&output, RESULT_LIMIT))
                } else if output.is_empty() {
                    ActivityEntry::new(ActivityKind::ToolEnd, "done")
                } else {
                    ActivityEntry::new(ActivityKind::ToolEnd, truncate(&output, RESULT_LIMIT))
                }
            })
            .collect(),
        Some("result") => vec![result_entry(&record)],
        _ => Vec::new(),
    }
}

fn content_blocks(record: &Value) -> &[Value] {
    record
        .pointer("/message/content")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// "Tool: salient-argument", e.g. `Edit: src/App.tsx`.
fn tool_summary(block: &Value) -> String {
    let name = block.get("name").and_then(Value::as_str).unwrap_or("tool");
    let input = block.get("input");
    let arg = |key: &str| input.and_then(|i| i.get(key)).and_then(Value::as_str);

    let detail = match name {
        "Read" | "Edit" | "Write" | "MultiEdit" => arg("file_path").map(str::to_string),
        "NotebookEdit" => arg("notebook_path").map(str::to_string),
        "Grep" | "Glob" => arg("pattern").map(str::to_string),
        "Bash" => arg("command").map(|c| truncate(c, COMMAND_LIMIT)),
        "WebFetch" => arg("url").map(str::to_string),
        "WebSearch" => arg("query").map(str::to_string),
        _ => None,
    };
    match detail {
        Some(detail) => format!("{name}: {detail}"),
        None => name.to_string(),
    }
}

/// First line of a tool result, which is either a string or text blocks.
fn result_text(content: Option<&Value>) -> String {
    let text = match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    };
    text.lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn result_entry(record: &Value) -> ActivityEntry {
    let turns = record.get("num_turns").and_then(Value::as_u64);
    let cost = record.get("total_cost_usd").and_then(Value::as_f64);
    let mut summary = match record.get("subtype").and_then(Value::as_str) {
        Some("success") | None => "finished".to_string(),
        Some(other) => other.replace('_', " "),
    };
    if let Some(turns) = turns {
        summary.push_str(&format!(" after {turns} turns"));
    }
    if let Some(cost) = cost {
        summary.push_str(&format!(" (${cost:.2})"));
    }

    let kind = if record.get("is_error").and_then(Value::as_bool).unwrap_or(false) {
        ActivityKind::Error
    } else {
        ActivityKind::Result
    };
    ActivityEntry::new(kind, summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_use_names_salient_argument() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"text","text":"Looking at the header."},
            {"type":"tool_use","id":"t1","name":"Read","input":{"file_path":"src/Header.tsx"}},
            {"type":"tool_use","id":"t2","name":"Grep","input":{"pattern":"sticky"}}
        ]}}"#
            .replace('\n', "");
        let entries = parse_stream_record(&line);
        let summaries: Vec<_> = entries.iter().map(|e| (e.kind, e.summary.as_str())).collect();
        assert_eq!(
            summaries,
            vec![
                (ActivityKind::Text, "Looking at the header."),
                (ActivityKind::ToolStart, "Read: src/Header.tsx"),
                (ActivityKind::ToolStart, "Grep: sticky"),
            ]
        );
    }

    #[test]
    fn bash_command_is_truncated() {
        let long = "x".repeat(200);
        let line = format!(
            r#"{{"type":"assistant","message":{{"content":[{{"type":"tool_use","name":"Bash","input":{{"command":"{long}"}}}}]}}}}"#
        );
        let entries = parse_stream_record(&line);
        assert_eq!(entries[0].summary, format!("Bash: {}...", "x".repeat(80)));
    }

    #[test]
    fn tool_results_map_to_end_or_error() {
        let ok = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"\n  42 lines\nmore"}]}}"#;
        let entries = parse_stream_record(ok);
        assert_eq!(entries[0].kind, ActivityKind::ToolEnd);
        assert_eq!(entries[0].summary, "42 lines");

        let err = r#"{"type":"user","message":{"content":[{"type":"tool_result","is_error":true,"content":[{"type":"text","text":"file not found"}]}]}}"#;
        let entries = parse_stream_record(err);
        assert_eq!(entries[0].kind, ActivityKind::Error);
        assert_eq!(entries[0].summary, "file not found");
    }

    #[test]
    fn result_record_reports_turns_and_cost() {
        let line = r#"{"type":"result","subtype":"success","is_error":false,"num_turns":7,"total_cost_usd":0.1234}"#;
        let entries = parse_stream_record(line);
        assert_eq!(entries[0].kind, ActivityKind::Result);
        assert_eq!(entries[0].summary, "finished after 7 turns ($0.12)");

        let line = r#"{"type":"result","subtype":"error_max_turns","is_error":true,"num_turns":40}"#;
        let entries = parse_stream_record(line);
        assert_eq!(entries[0].kind, ActivityKind::Error);
        assert_eq!(entries[0].summary, "error max turns after 40 turns");
    }

    #[test]
    fn noise_is_ignored() {
        assert!(parse_stream_record("not json at all").is_empty());
        assert!(parse_stream_record(r#"{"type":"system","subtype":"init"}"#).is_empty());
        assert!(parse_stream_record(r#"{"type":"assistant","message":{}}"#).is_empty());
    }

    #[test]
    fn args_carry_budget_and_allow_list() {
        let cli = ClaudeCli::new(AgentConfig {
            extra_args: vec!["--model".into(), "sonnet".into()],
            ..AgentConfig::default()
        });
        let args = cli.args("do the thing");
        assert_eq!(&args[..2], &["-p".to_string(), "do the thing".to_string()]);
        let joined = args.join(" ");
        assert!(joined.contains("--output-format stream-json --verbose"));
        assert!(joined.contains("--max-turns 40"));
        assert!(joined.contains("--allowedTools Read,Edit,Write,Glob,Grep,Bash(loupe task update:*)"));
        assert!(joined.ends_with("--model sonnet"));
    }
}
