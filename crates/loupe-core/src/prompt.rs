//! Builds the instructions handed to the coding agent for one task.

use crate::task::{Task, TaskKind};
use std::fmt::Write as _;
use std::path::PathBuf;

/// Maximum characters of captured element text quoted in a prompt.
const ELEMENT_TEXT_LIMIT: usize = 200;

/// Environment the prompt refers to.
#[derive(Debug, Clone)]
pub struct PromptContext {
    /// Data directory; screenshot paths in tasks are relative to it.
    pub data_dir: PathBuf,
    /// Command the agent runs to report completion, e.g. `loupe task update`.
    pub update_command: String,
}

impl PromptContext {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            update_command: "loupe task update".into(),
        }
    }

    fn artifact(&self, relative: &str) -> String {
        self.data_dir.join(relative).display().to_string()
    }
}

/// Assemble the agent prompt for `task`.
///
/// Embeds the location context, every rejected attempt with its reason, the
/// full record as JSON, and the completion protocol.
pub fn build_prompt(task: &Task, ctx: &PromptContext) -> String {
    let mut out = String::new();

    let _ = writeln!(
        out,
        "You are fixing a UI issue a developer annotated in the running application."
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "## Task {}", task.id);
    let _ = writeln!(out, "- Kind: {}", task.kind);
    let _ = writeln!(out, "- Category: {}", task.category);
    let _ = writeln!(out, "- Priority: {}", task.priority);
    let _ = writeln!(out);
    let _ = writeln!(out, "### Request");
    if task.note.trim().is_empty() {
        let _ = writeln!(out, "(no note given; infer the issue from the screenshot)");
    } else {
        let _ = writeln!(out, "{}", task.note.trim());
    }
    let _ = writeln!(out);

    write_location(&mut out, task);

    let _ = writeln!(out, "### Screenshot");
    let _ = writeln!(
        out,
        "Captured when the issue was annotated: {}",
        ctx.artifact(&task.screenshot)
    );
    let _ = writeln!(out, "Open it with the Read tool before changing anything.");
    let _ = writeln!(out);

    write_attempts(&mut out, task, ctx);

    let _ = writeln!(out, "### Task record");
    let _ = writeln!(out, "```json");
    let record = serde_json::to_string_pretty(task).unwrap_or_else(|_| "{}".into());
    let _ = writeln!(out, "{record}");
    let _ = writeln!(out, "```");
    let _ = writeln!(out);

    let _ = writeln!(out, "### When you are done");
    let _ = writeln!(
        out,
        "Make the smallest change that resolves the request, then run exactly:"
    );
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "    {} {} --status review --notes \"<what you changed and why>\" --files <comma-separated paths>",
        ctx.update_command, task.id
    );
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "Do not mark the task done yourself; a human reviews the result. \
         If you exit without running the command the task is treated as failed."
    );

    out
}

fn write_location(out: &mut String, task: &Task) {
    let _ = writeln!(out, "### Location");
    let _ = writeln!(out, "- Page: {}", task.page.url);
    if !task.page.title.is_empty() {
        let _ = writeln!(out, "- Title: {}", task.page.title);
    }
    if let Some(viewport) = task.page.viewport {
        let _ = writeln!(out, "- Viewport: {}x{}", viewport.width, viewport.height);
    }

    match task.kind {
        TaskKind::Element => match &task.element {
            Some(element) => {
                match (&element.source_file, element.source_line) {
                    (Some(file), Some(line)) => {
                        let _ = writeln!(out, "- Source: {file}:{line}  <- start here");
                    }
                    (Some(file), None) => {
                        let _ = writeln!(out, "- Source: {file}  <- start here");
                    }
                    _ => {
                        let _ = writeln!(
                            out,
                            "- Source: unknown; locate the element via the selector"
                        );
                    }
                }
                if let Some(component) = &element.component {
                    let _ = writeln!(out, "- Component: {component}");
                }
                let _ = writeln!(out, "- Selector: `{}`", element.selector);
                if let Some(rect) = element.rect {
                    let _ = writeln!(out, "- Bounds: {rect}");
                }
                if let Some(text) = &element.text {
                    let _ = writeln!(out, "- Text: \"{}\"", truncate(text, ELEMENT_TEXT_LIMIT));
                }
                if !element.styles.is_empty() {
                    let _ = writeln!(out, "- Computed styles at capture time:");
                    for (property, value) in &element.styles {
                        let _ = writeln!(out, "    {property}: {value};");
                    }
                }
            }
            None => {
                let _ = writeln!(out, "- Element details were not captured");
            }
        },
        TaskKind::Region => match task.region {
            Some(rect) => {
                let _ = writeln!(out, "- Region: {rect} (page pixels)");
                let _ = writeln!(
                    out,
                    "  Only the area inside this rectangle of the screenshot is in scope."
                );
            }
            None => {
                let _ = writeln!(out, "- Region bounds were not captured");
            }
        },
        TaskKind::Page => {
            let _ = writeln!(out, "- Scope: the whole page");
        }
    }
    let _ = writeln!(out);
}

fn write_attempts(out: &mut String, task: &Task, ctx: &PromptContext) {
    if task.attempts.is_empty() {
        return;
    }

    let _ = writeln!(out, "### Previous attempts (rejected)");
    let _ = writeln!(
        out,
        "This task was attempted {} time(s) and a reviewer rejected each result. \
         Do not repeat a rejected approach.",
        task.attempts.len()
    );
    for (n, attempt) in task.attempts.iter().enumerate() {
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "#### Attempt {} ({})",
            n + 1,
            attempt.timestamp.format("%Y-%m-%d %H:%M UTC")
        );
        let _ = writeln!(out, "- Rejected because: {}", attempt.rejection_reason);
        if let Some(notes) = &attempt.agent_notes {
            let _ = writeln!(out, "- Agent notes: {notes}");
        }
        if !attempt.files_modified.is_empty() {
            let _ = writeln!(out, "- Files touched: {}", attempt.files_modified.join(", "));
        }
        if let Some(after) = &attempt.after_screenshot {
            let _ = writeln!(out, "- Result screenshot: {}", ctx.artifact(after));
        }
    }
    let _ = writeln!(out);
}

/// Truncate to `max` characters, appending an ellipsis when cut.
pub fn truncate(s: &str, max: usize) -> String {
    let s = s.trim();
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Attempt, ElementInfo, Priority, Rect, test_task};
    use chrono::Utc;

    fn ctx() -> PromptContext {
        PromptContext::new(PathBuf::from("/work/.loupe"))
    }

    #[test]
    fn element_prompt_points_at_source() {
        let mut task = test_task(Priority::High, Utc::now());
        task.kind = TaskKind::Element;
        task.note = "Button label is cut off".into();
        task.element = Some(ElementInfo {
            selector: "main > button.primary".into(),
            component: Some("SubmitButton".into()),
            source_file: Some("src/components/SubmitButton.tsx".into()),
            source_line: Some(42),
            styles: [("padding".to_string(), "2px".to_string())].into(),
            ..ElementInfo::default()
        });

        let prompt = build_prompt(&task, &ctx());
        assert!(prompt.contains("src/components/SubmitButton.tsx:42"));
        assert!(prompt.contains("`main > button.primary`"));
        assert!(prompt.contains("padding: 2px;"));
        assert!(prompt.contains("Button label is cut off"));
        assert!(prompt.contains("/work/.loupe/screenshots/x.png"));
        assert!(prompt.contains(&format!("loupe task update {} --status review", task.id)));
        assert!(!prompt.contains("Previous attempts"));
    }

    #[test]
    fn region_prompt_includes_bounds() {
        let mut task = test_task(Priority::Low, Utc::now());
        task.kind = TaskKind::Region;
        task.region = Some(Rect {
            x: 10.0,
            y: 20.0,
            width: 300.0,
            height: 120.0,
        });
        let prompt = build_prompt(&task, &ctx());
        assert!(prompt.contains("Region: 300x120 at (10, 20)"));
    }

    #[test]
    fn rejected_attempts_are_embedded_with_reasons() {
        let mut task = test_task(Priority::Medium, Utc::now());
        task.attempts = vec![Attempt {
            agent_notes: Some("made the header sticky".into()),
            files_modified: vec!["src/Header.tsx".into()],
            rejection_reason: "header now overlaps the banner".into(),
            after_screenshot: Some("screenshots/t_after.png".into()),
            timestamp: Utc::now(),
        }];

        let prompt = build_prompt(&task, &ctx());
        assert!(prompt.contains("Previous attempts (rejected)"));
        assert!(prompt.contains("header now overlaps the banner"));
        assert!(prompt.contains("made the header sticky"));
        assert!(prompt.contains("/work/.loupe/screenshots/t_after.png"));
        assert!(prompt.contains("Do not repeat a rejected approach"));
    }

    #[test]
    fn prompt_embeds_full_record() {
        let task = test_task(Priority::Medium, Utc::now());
        let prompt = build_prompt(&task, &ctx());
        assert!(prompt.contains("\"createdAt\""));
        assert!(prompt.contains(&format!("\"id\": \"{}\"", task.id)));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo wörld", 5), "héllo...");
        assert_eq!(truncate("short", 10), "short");
    }
}
