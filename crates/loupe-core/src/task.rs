use crate::error::QueueError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Unique task identifier (hyphenated UUID v4).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(TaskId(s.trim().to_string()))
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        TaskId(s.to_string())
    }
}

/// What the developer annotated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// A single DOM element picked by click.
    Element,
    /// The page as a whole.
    Page,
    /// A rectangle dragged over the page.
    Region,
}

impl TaskKind {
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::Element => "element",
            TaskKind::Page => "page",
            TaskKind::Region => "region",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for TaskKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "element" => Ok(TaskKind::Element),
            "page" => Ok(TaskKind::Page),
            "region" => Ok(TaskKind::Region),
            other => Err(QueueError::InvalidField {
                field: "kind".into(),
                reason: format!("unknown kind '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[default]
    Tweak,
    Bug,
    Feature,
}

impl Category {
    pub fn label(&self) -> &'static str {
        match self {
            Category::Tweak => "tweak",
            Category::Bug => "bug",
            Category::Feature => "feature",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Category {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tweak" => Ok(Category::Tweak),
            "bug" => Ok(Category::Bug),
            "feature" => Ok(Category::Feature),
            other => Err(QueueError::InvalidField {
                field: "category".into(),
                reason: format!("unknown category '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Selection tier: lower runs first.
    pub fn tier(&self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Priority {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(QueueError::InvalidField {
                field: "priority".into(),
                reason: format!("unknown priority '{other}'"),
            }),
        }
    }
}

/// Task status as a state machine.
///
/// Transitions:
///   Pending -> InProgress            (dispatcher claims the task)
///   InProgress -> Review             (agent reports completion)
///   InProgress -> Pending            (agent crashed, timed out, or shutdown)
///   InProgress -> Done               (cancelled)
///   Review -> Done                   (accepted by a human)
///   Review -> Pending                (human retry, appends an Attempt)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Review,
    Done,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Review,
        TaskStatus::Done,
    ];

    /// Short label, identical to the wire representation.
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Review => "review",
            TaskStatus::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done)
    }

    pub fn needs_human(&self) -> bool {
        matches!(self, TaskStatus::Review)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for TaskStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.label() == s)
            .ok_or_else(|| QueueError::InvalidStatus(s.to_string()))
    }
}

/// Pixel rectangle in page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} at ({}, {})",
            self.width, self.height, self.x, self.y
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Where the annotation was made. Present on every task.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub viewport: Option<Viewport>,
}

/// Structured location of an element annotation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementInfo {
    /// CSS-like selector resolving to the element.
    pub selector: String,
    /// Framework component name, when the page exposes it.
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub source_file: Option<String>,
    #[serde(default)]
    pub source_line: Option<u32>,
    #[serde(default)]
    pub rect: Option<Rect>,
    /// Computed-style snapshot captured at annotation time.
    #[serde(default)]
    pub styles: BTreeMap<String, String>,
    #[serde(default)]
    pub text: Option<String>,
}

/// Snapshot of one rejected cycle of agent work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
    #[serde(default)]
    pub agent_notes: Option<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    pub rejection_reason: String,
    #[serde(default)]
    pub after_screenshot: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// An annotation moving through the pending -> in_progress -> review -> done lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub kind: TaskKind,
    pub category: Category,
    pub priority: Priority,
    #[serde(default)]
    pub note: String,
    pub status: TaskStatus,
    /// Screenshot path relative to the data directory.
    pub screenshot: String,
    #[serde(default)]
    pub element: Option<ElementInfo>,
    pub page: PageInfo,
    #[serde(default)]
    pub region: Option<Rect>,
    #[serde(default)]
    pub agent_notes: Option<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub after_screenshot: Option<String>,
    #[serde(default)]
    pub attempts: Vec<Attempt>,
}

impl Task {
    /// Build a new pending task from creation input.
    ///
    /// The encoded screenshot in `input` is not kept; `screenshot` is the
    /// path of the already-persisted artifact.
    pub fn from_new(id: TaskId, input: NewTask, screenshot: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            updated_at: now,
            kind: input.kind,
            category: input.category,
            priority: input.priority,
            note: input.note,
            status: TaskStatus::Pending,
            screenshot,
            element: input.element,
            page: input.page,
            region: input.region,
            agent_notes: None,
            files_modified: Vec::new(),
            after_screenshot: None,
            attempts: Vec::new(),
        }
    }

    /// Whether the dispatcher may still run this task under the retry limit.
    pub fn within_retry_limit(&self, max_retries: usize) -> bool {
        self.attempts.len() < max_retries
    }

    /// Merge an allow-listed update and refresh `updated_at`.
    pub fn apply(&mut self, update: TaskUpdate) {
        let TaskUpdate {
            status,
            agent_notes,
            files_modified,
            after_screenshot,
            attempts,
            note,
            category,
            priority,
        } = update;

        if let Some(status) = status {
            self.status = status;
        }
        if let Some(notes) = agent_notes {
            self.agent_notes = Some(notes);
        }
        if let Some(files) = files_modified {
            self.files_modified = files;
        }
        if let Some(path) = after_screenshot {
            self.after_screenshot = Some(path);
        }
        if let Some(attempts) = attempts {
            self.attempts = attempts;
        }
        if let Some(note) = note {
            self.note = note;
        }
        if let Some(category) = category {
            self.category = category;
        }
        if let Some(priority) = priority {
            self.priority = priority;
        }
        self.updated_at = Utc::now();
    }
}

/// Creation input for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub kind: TaskKind,
    #[serde(default)]
    pub category: Category,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub note: String,
    /// Base64 PNG, optionally wrapped as a `data:image/png;base64,` URL.
    pub screenshot: String,
    pub page: PageInfo,
    #[serde(default)]
    pub element: Option<ElementInfo>,
    #[serde(default)]
    pub region: Option<Rect>,
}

impl NewTask {
    pub fn new(kind: TaskKind, note: impl Into<String>, screenshot: String, page: PageInfo) -> Self {
        Self {
            kind,
            category: Category::default(),
            priority: Priority::default(),
            note: note.into(),
            screenshot,
            page,
            element: None,
            region: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }
}

/// Fields an update is allowed to touch, in wire (camelCase) form.
pub const UPDATABLE_FIELDS: [&str; 8] = [
    "status",
    "agentNotes",
    "filesModified",
    "afterScreenshot",
    "attempts",
    "note",
    "category",
    "priority",
];

/// Partial update restricted to [`UPDATABLE_FIELDS`].
///
/// Identity and creation time have no slot here, so they cannot be changed
/// through an update no matter what a caller sends.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_modified: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_screenshot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<Vec<Attempt>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

impl TaskUpdate {
    /// An update that only changes the status.
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Build an update from an untyped JSON payload.
    ///
    /// Keys outside [`UPDATABLE_FIELDS`] are dropped. A `status` that is not
    /// one of the four states fails with [`QueueError::InvalidStatus`].
    pub fn from_json(payload: serde_json::Value) -> Result<Self, QueueError> {
        let serde_json::Value::Object(map) = payload else {
            return Err(QueueError::InvalidField {
                field: "body".into(),
                reason: "expected a JSON object".into(),
            });
        };

        let mut update = TaskUpdate::default();
        for (key, value) in map {
            match key.as_str() {
                "status" => {
                    let raw = value
                        .as_str()
                        .ok_or_else(|| QueueError::InvalidStatus(value.to_string()))?;
                    update.status = Some(raw.parse()?);
                }
                "agentNotes" => update.agent_notes = field(&key, value)?,
                "filesModified" => update.files_modified = field(&key, value)?,
                "afterScreenshot" => update.after_screenshot = field(&key, value)?,
                "attempts" => update.attempts = field(&key, value)?,
                "note" => update.note = field(&key, value)?,
                "category" => update.category = field(&key, value)?,
                "priority" => update.priority = field(&key, value)?,
                _ => tracing::debug!(field = %key, "dropping non-updatable field"),
            }
        }
        Ok(update)
    }

    pub fn is_empty(&self) -> bool {
        *self == TaskUpdate::default()
    }
}

fn field<T: DeserializeOwned>(key: &str, value: serde_json::Value) -> Result<T, QueueError> {
    serde_json::from_value(value).map_err(|e| QueueError::InvalidField {
        field: key.to_string(),
        reason: e.to_string(),
    })
}

/// Pick the next task to run.
///
/// Among `pending` tasks accepted by `eligible`: lowest priority tier first,
/// then earliest `created_at`, then earliest position in the document.
pub fn select_next_pending<'a, I, F>(tasks: I, mut eligible: F) -> Option<&'a Task>
where
    I: IntoIterator<Item = &'a Task>,
    F: FnMut(&Task) -> bool,
{
    tasks
        .into_iter()
        .enumerate()
        .filter(|(_, task)| task.status == TaskStatus::Pending && eligible(task))
        .min_by_key(|(position, task)| (task.priority.tier(), task.created_at, *position))
        .map(|(_, task)| task)
}

/// Task counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub review: usize,
    pub done: usize,
    pub total: usize,
}

impl StatusCounts {
    pub fn tally<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut counts = StatusCounts::default();
        for task in tasks {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Review => counts.review += 1,
                TaskStatus::Done => counts.done += 1,
            }
            counts.total += 1;
        }
        counts
    }
}

#[cfg(test)]
pub(crate) fn test_task(priority: Priority, created_at: DateTime<Utc>) -> Task {
    let input = NewTask::new(
        TaskKind::Page,
        "note",
        String::new(),
        PageInfo {
            url: "http://localhost:3000/".into(),
            ..PageInfo::default()
        },
    )
    .with_priority(priority);
    let mut task = Task::from_new(TaskId::generate(), input, "screenshots/x.png".into());
    task.created_at = created_at;
    task.updated_at = created_at;
    task
}

#[cfg(test)]
mod proptests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn arb_priority() -> impl Strategy<Value = Priority> {
        prop_oneof![Just(Priority::High), Just(Priority::Medium), Just(Priority::Low)]
    }

    fn arb_status() -> impl Strategy<Value = TaskStatus> {
        prop_oneof![
            Just(TaskStatus::Pending),
            Just(TaskStatus::InProgress),
            Just(TaskStatus::Review),
            Just(TaskStatus::Done),
        ]
    }

    fn arb_tasks() -> impl Strategy<Value = Vec<Task>> {
        prop::collection::vec((arb_priority(), arb_status(), 0i64..1_000), 0..24).prop_map(
            |specs| {
                let base = Utc::now();
                specs
                    .into_iter()
                    .map(|(priority, status, offset)| {
                        let mut task = test_task(priority, base + Duration::seconds(offset));
                        task.status = status;
                        task
                    })
                    .collect()
            },
        )
    }

    proptest! {
        /// The selected task is pending and no pending task outranks it.
        #[test]
        fn selection_picks_lowest_tier_then_oldest(tasks in arb_tasks()) {
            match select_next_pending(&tasks, |_| true) {
                Some(chosen) => {
                    prop_assert_eq!(chosen.status, TaskStatus::Pending);
                    for other in tasks.iter().filter(|t| t.status == TaskStatus::Pending) {
                        let chosen_key = (chosen.priority.tier(), chosen.created_at);
                        let other_key = (other.priority.tier(), other.created_at);
                        prop_assert!(chosen_key <= other_key);
                    }
                }
                None => {
                    prop_assert!(tasks.iter().all(|t| t.status != TaskStatus::Pending));
                }
            }
        }

        /// Status labels round-trip through FromStr.
        #[test]
        fn status_label_roundtrip(status in arb_status()) {
            let parsed: TaskStatus = status.label().parse().unwrap();
            prop_assert_eq!(parsed, status);
        }
    }
}
