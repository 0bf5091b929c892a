use crate::artifact_store::{Artifact, ArtifactStore};
use chrono::{DateTime, Utc};
use loupe_core::error::QueueError;
use loupe_core::task::{
    Attempt, NewTask, StatusCounts, Task, TaskId, TaskStatus, TaskUpdate, select_next_pending,
};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Primary queue file name inside the data directory.
pub const QUEUE_FILE: &str = "queue.json";

/// Backup holding the generation before the newest write.
pub const BACKUP_FILE: &str = "queue.json.bak";

pub const DOCUMENT_VERSION: &str = "1.0";

/// The whole queue. Every mutation reads it, changes it in memory and writes
/// it back as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDocument {
    pub version: String,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl QueueDocument {
    pub fn empty() -> Self {
        Self {
            version: DOCUMENT_VERSION.into(),
            last_modified: Utc::now(),
            tasks: Vec::new(),
        }
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    fn task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| &t.id == id)
    }
}

/// Where a loaded document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentSource {
    Primary,
    /// Primary was unreadable; the backup was used and copied over it.
    RecoveredFromBackup,
    /// Nothing readable on disk; a fresh document.
    Empty,
}

#[derive(Debug)]
pub struct Loaded {
    pub document: QueueDocument,
    pub source: DocumentSource,
}

/// Outcome of a read-modify-write closure.
enum Change<R> {
    /// Persist the document, then return the value.
    Commit(R),
    /// Nothing changed; skip the write.
    Unchanged(R),
}

/// Durable task queue backed by a single JSON document.
///
/// Writes go to a temp file in the same directory and are renamed over the
/// primary, so readers never see a partial file. The previous generation is
/// kept as a backup and used when the primary fails to parse. Mutations within
/// one process are serialized; there is no cross-process lock.
pub struct QueueStore {
    data_dir: PathBuf,
    primary: PathBuf,
    backup: PathBuf,
    artifacts: ArtifactStore,
    write_lock: Mutex<()>,
}

impl QueueStore {
    /// Open (or create) the store rooted at `data_dir`.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let data_dir = data_dir.into();
        let artifacts = ArtifactStore::new(&data_dir);
        std::fs::create_dir_all(artifacts.dir())?;
        Ok(Self {
            primary: data_dir.join(QUEUE_FILE),
            backup: data_dir.join(BACKUP_FILE),
            artifacts,
            data_dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Read the queue, never failing.
    pub fn read(&self) -> QueueDocument {
        self.load().document
    }

    /// Read the queue and report which file it came from.
    ///
    /// Falls back to the backup when the primary does not parse (repairing
    /// the primary from it), and to an empty document when neither does.
    pub fn load(&self) -> Loaded {
        let primary_failed = match parse_file(&self.primary) {
            Ok(Some(document)) => {
                return Loaded {
                    document,
                    source: DocumentSource::Primary,
                };
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(error = %e, "queue file unreadable, trying backup");
                true
            }
        };

        match parse_file(&self.backup) {
            Ok(Some(document)) => {
                tracing::warn!(
                    path = %self.backup.display(),
                    tasks = document.tasks.len(),
                    "recovered queue from backup"
                );
                if let Err(e) = self.restore_primary(&document) {
                    tracing::warn!(error = %e, "failed to repair queue file from backup");
                }
                Loaded {
                    document,
                    source: DocumentSource::RecoveredFromBackup,
                }
            }
            Ok(None) => {
                if primary_failed {
                    tracing::warn!("no backup available, starting with an empty queue");
                }
                Loaded {
                    document: QueueDocument::empty(),
                    source: DocumentSource::Empty,
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "backup unreadable too, starting with an empty queue");
                Loaded {
                    document: QueueDocument::empty(),
                    source: DocumentSource::Empty,
                }
            }
        }
    }

    /// Persist a document: back up the current primary, then atomically
    /// replace it.
    ///
    /// A primary that does not parse is never copied over the backup, which
    /// may be the only good generation left.
    fn write(&self, document: &mut QueueDocument) -> Result<(), QueueError> {
        match std::fs::read(&self.primary) {
            Ok(current) if serde_json::from_slice::<QueueDocument>(&current).is_err() => {
                tracing::warn!("queue file does not parse, keeping the existing backup");
            }
            Ok(current) => {
                if let Err(e) = atomic_write(&self.backup, &current) {
                    tracing::warn!(error = %e, "failed to back up queue file, writing anyway");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(error = %e, "failed to read queue file for backup"),
        }

        document.last_modified = Utc::now();
        let json = serde_json::to_vec_pretty(document)?;
        atomic_write(&self.primary, &json)?;
        tracing::debug!(tasks = document.tasks.len(), "queue written");
        Ok(())
    }

    fn restore_primary(&self, document: &QueueDocument) -> Result<(), QueueError> {
        let json = serde_json::to_vec_pretty(document)?;
        atomic_write(&self.primary, &json)
    }

    /// Run a read-modify-write cycle under the in-process write lock.
    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut QueueDocument) -> Result<Change<R>, QueueError>,
    ) -> Result<R, QueueError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut document = self.read();
        match f(&mut document)? {
            Change::Commit(value) => {
                self.write(&mut document)?;
                Ok(value)
            }
            Change::Unchanged(value) => Ok(value),
        }
    }

    /// Validate the screenshot, persist it, and append a new pending task.
    pub fn add(&self, input: NewTask) -> Result<Task, QueueError> {
        let bytes = ArtifactStore::decode(&input.screenshot)?;
        let id = TaskId::generate();
        let screenshot = self.artifacts.save(&id, Artifact::Before, &bytes)?;
        let task = Task::from_new(id, input, screenshot);

        let result = self.mutate(|doc| {
            doc.tasks.push(task.clone());
            Ok(Change::Commit(task.clone()))
        });
        if result.is_err() {
            self.artifacts.remove_detached(&task.id);
        } else {
            tracing::info!(
                task = %task.id,
                kind = %task.kind,
                priority = %task.priority,
                "task created"
            );
        }
        result
    }

    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.read().task(id).cloned()
    }

    /// All tasks in document (insertion) order.
    pub fn list(&self) -> Vec<Task> {
        self.read().tasks
    }

    /// Merge an allow-listed update. `None` if the id is unknown.
    pub fn update(&self, id: &TaskId, update: TaskUpdate) -> Result<Option<Task>, QueueError> {
        self.mutate(|doc| match doc.task_mut(id) {
            Some(task) => {
                let from = task.status;
                task.apply(update);
                if from != task.status {
                    tracing::info!(task = %id, %from, to = %task.status, "status changed");
                }
                Ok(Change::Commit(Some(task.clone())))
            }
            None => Ok(Change::Unchanged(None)),
        })
    }

    /// Remove a task. Its screenshots are deleted in the background.
    pub fn delete(&self, id: &TaskId) -> Result<bool, QueueError> {
        let removed = self.mutate(|doc| {
            let before = doc.tasks.len();
            doc.tasks.retain(|t| &t.id != id);
            if doc.tasks.len() == before {
                Ok(Change::Unchanged(false))
            } else {
                Ok(Change::Commit(true))
            }
        })?;
        if removed {
            tracing::info!(task = %id, "task deleted");
            self.artifacts.remove_detached(id);
        }
        Ok(removed)
    }

    /// The pending task that should run next, by priority tier then age.
    pub fn next_pending(&self) -> Option<Task> {
        let document = self.read();
        select_next_pending(&document.tasks, |_| true).cloned()
    }

    /// Store the post-change screenshot. `None` if the id is unknown.
    pub fn save_after_screenshot(
        &self,
        id: &TaskId,
        bytes: &[u8],
    ) -> Result<Option<Task>, QueueError> {
        ArtifactStore::validate(bytes)?;
        if self.get(id).is_none() {
            return Ok(None);
        }
        let path = self.artifacts.save(id, Artifact::After, bytes)?;
        self.update(
            id,
            TaskUpdate {
                after_screenshot: Some(path),
                ..TaskUpdate::default()
            },
        )
    }

    /// Send a reviewed task back to the queue, archiving the rejected result
    /// as an [`Attempt`].
    ///
    /// The after-screenshot is moved back if the document cannot be written.
    pub fn retry(&self, id: &TaskId, reason: &str) -> Result<Option<Task>, QueueError> {
        let mut archived = None;
        let result = self.mutate(|doc| {
            let Some(task) = doc.task_mut(id) else {
                return Ok(Change::Unchanged(None));
            };
            if task.status != TaskStatus::Review {
                return Err(QueueError::InvalidTransition {
                    id: id.clone(),
                    status: task.status,
                    expected: TaskStatus::Review,
                });
            }

            let number = task.attempts.len() + 1;
            let after_screenshot = match task.after_screenshot.take() {
                Some(current) => match self.artifacts.archive_after(id, number)? {
                    Some(moved) => {
                        archived = Some(number);
                        Some(moved)
                    }
                    None => Some(current),
                },
                None => None,
            };
            let now = Utc::now();
            task.attempts.push(Attempt {
                agent_notes: task.agent_notes.take(),
                files_modified: std::mem::take(&mut task.files_modified),
                rejection_reason: reason.to_string(),
                after_screenshot,
                timestamp: now,
            });
            task.status = TaskStatus::Pending;
            task.updated_at = now;
            tracing::info!(task = %id, attempt = number, "task returned to queue");
            Ok(Change::Commit(Some(task.clone())))
        });

        if result.is_err()
            && let Some(number) = archived
            && let Err(e) = self.artifacts.restore_after(id, number)
        {
            tracing::warn!(task = %id, error = %e, "failed to restore after-screenshot");
        }
        result
    }

    /// Count tasks by status from a fresh read.
    pub fn status_counts(&self) -> StatusCounts {
        StatusCounts::tally(&self.read().tasks)
    }
}

/// Parse a queue file. `Ok(None)` when it does not exist.
fn parse_file(path: &Path) -> Result<Option<QueueDocument>, QueueError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(QueueError::QueueCorrupted {
                path: path.to_path_buf(),
                reason: e.to_string(),
            });
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| QueueError::QueueCorrupted {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Write via a temp file in the target's directory and rename over it.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), QueueError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| QueueError::Persist {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}
