//! Screenshot artifacts, one PNG file per task and phase.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use loupe_core::error::QueueError;
use loupe_core::task::TaskId;
use std::io;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

/// Leading bytes of every PNG file.
pub const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Directory under the data dir holding all screenshots.
pub const SCREENSHOTS_DIR: &str = "screenshots";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    /// Captured when the task was annotated.
    Before,
    /// Captured after the agent's change, for review.
    After,
}

pub struct ArtifactStore {
    data_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn dir(&self) -> PathBuf {
        self.data_dir.join(SCREENSHOTS_DIR)
    }

    /// Path relative to the data directory, as stored on the task.
    pub fn relative_path(id: &TaskId, which: Artifact) -> String {
        match which {
            Artifact::Before => format!("{SCREENSHOTS_DIR}/{id}.png"),
            Artifact::After => format!("{SCREENSHOTS_DIR}/{id}_after.png"),
        }
    }

    pub fn path(&self, id: &TaskId, which: Artifact) -> PathBuf {
        self.data_dir.join(Self::relative_path(id, which))
    }

    /// Decode a base64 image (plain or `data:` URL) and check its signature.
    pub fn decode(encoded: &str) -> Result<Vec<u8>, QueueError> {
        let payload = match encoded.trim().strip_prefix("data:") {
            Some(rest) => rest
                .split_once(',')
                .map(|(_, data)| data)
                .ok_or_else(|| QueueError::InvalidArtifact("malformed data URL".into()))?,
            None => encoded.trim(),
        };
        let compact: String = payload
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        let bytes = STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| QueueError::InvalidArtifact(format!("not valid base64: {e}")))?;
        Self::validate(&bytes)?;
        Ok(bytes)
    }

    /// Check the PNG signature.
    pub fn validate(bytes: &[u8]) -> Result<(), QueueError> {
        if bytes.len() < PNG_SIGNATURE.len() || bytes[..PNG_SIGNATURE.len()] != PNG_SIGNATURE {
            return Err(QueueError::InvalidArtifact(
                "expected a PNG image (signature mismatch)".into(),
            ));
        }
        Ok(())
    }

    /// Validate and write an artifact. Returns the relative path.
    pub fn save(&self, id: &TaskId, which: Artifact, bytes: &[u8]) -> Result<String, QueueError> {
        check_id(id)?;
        Self::validate(bytes)?;
        std::fs::create_dir_all(self.dir())?;
        std::fs::write(self.path(id, which), bytes)?;
        Ok(Self::relative_path(id, which))
    }

    pub fn read(&self, id: &TaskId, which: Artifact) -> Result<Option<Vec<u8>>, QueueError> {
        check_id(id)?;
        match std::fs::read(self.path(id, which)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Move the current "after" screenshot aside so a rejected attempt keeps
    /// pointing at the image it was judged on. Returns the archived path.
    pub fn archive_after(&self, id: &TaskId, attempt: usize) -> Result<Option<String>, QueueError> {
        check_id(id)?;
        let current = self.path(id, Artifact::After);
        if !current.exists() {
            return Ok(None);
        }
        let relative = format!("{SCREENSHOTS_DIR}/{id}_after_{attempt}.png");
        std::fs::rename(&current, self.data_dir.join(&relative))?;
        Ok(Some(relative))
    }

    /// Undo [`archive_after`](Self::archive_after) for `attempt`.
    pub fn restore_after(&self, id: &TaskId, attempt: usize) -> Result<(), QueueError> {
        check_id(id)?;
        let archived = self
            .data_dir
            .join(format!("{SCREENSHOTS_DIR}/{id}_after_{attempt}.png"));
        std::fs::rename(archived, self.path(id, Artifact::After))?;
        Ok(())
    }

    /// Delete every artifact of a task on a background thread.
    ///
    /// Best effort: failures are logged and never reach the caller.
    pub fn remove_detached(&self, id: &TaskId) -> Option<JoinHandle<()>> {
        let dir = self.dir();
        let id = id.clone();
        let spawned = std::thread::Builder::new()
            .name("artifact-cleanup".into())
            .spawn(move || {
                if let Err(e) = remove_task_artifacts(&dir, &id) {
                    tracing::warn!(task = %id, error = %e, "failed to remove screenshots");
                }
            });
        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "failed to spawn artifact cleanup");
                None
            }
        }
    }
}

fn remove_task_artifacts(dir: &Path, id: &TaskId) -> io::Result<()> {
    let before = format!("{id}.png");
    let after_prefix = format!("{id}_after");
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == before || (name.starts_with(&after_prefix) && name.ends_with(".png")) {
            std::fs::remove_file(entry.path())?;
            tracing::debug!(task = %id, file = %name, "removed screenshot");
        }
    }
    Ok(())
}

/// Task ids become file names; refuse anything that could escape the directory.
fn check_id(id: &TaskId) -> Result<(), QueueError> {
    let raw = id.as_str();
    if raw.is_empty() || raw.contains(['/', '\\']) || raw.contains("..") {
        return Err(QueueError::InvalidField {
            field: "id".into(),
            reason: format!("'{raw}' is not a valid task id"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png(extra: &[u8]) -> Vec<u8> {
        let mut bytes = PNG_SIGNATURE.to_vec();
        bytes.extend_from_slice(extra);
        bytes
    }

    #[test]
    fn decode_accepts_plain_and_data_url() {
        let bytes = png(b"IHDR");
        let plain = STANDARD.encode(&bytes);
        assert_eq!(ArtifactStore::decode(&plain).unwrap(), bytes);

        let url = format!("data:image/png;base64,{plain}");
        assert_eq!(ArtifactStore::decode(&url).unwrap(), bytes);
    }

    #[test]
    fn decode_rejects_non_png() {
        let jpeg = STANDARD.encode([0xFF, 0xD8, 0xFF, 0xE0, 0, 0, 0, 0, 0]);
        assert!(matches!(
            ArtifactStore::decode(&jpeg),
            Err(QueueError::InvalidArtifact(_))
        ));
        assert!(matches!(
            ArtifactStore::decode("%%% not base64"),
            Err(QueueError::InvalidArtifact(_))
        ));
        assert!(matches!(
            ArtifactStore::decode(""),
            Err(QueueError::InvalidArtifact(_))
        ));
    }

    #[test]
    fn save_read_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let id = TaskId::generate();

        let rel = store.save(&id, Artifact::Before, &png(b"one")).unwrap();
        assert_eq!(rel, format!("screenshots/{id}.png"));
        store.save(&id, Artifact::After, &png(b"two")).unwrap();
        assert_eq!(store.read(&id, Artifact::Before).unwrap().unwrap(), png(b"one"));

        store.remove_detached(&id).unwrap().join().unwrap();
        assert!(store.read(&id, Artifact::Before).unwrap().is_none());
        assert!(store.read(&id, Artifact::After).unwrap().is_none());
    }

    #[test]
    fn archive_after_moves_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let id = TaskId::generate();
        assert!(store.archive_after(&id, 1).unwrap().is_none());

        store.save(&id, Artifact::After, &png(b"v1")).unwrap();
        let archived = store.archive_after(&id, 1).unwrap().unwrap();
        assert_eq!(archived, format!("screenshots/{id}_after_1.png"));
        assert!(store.read(&id, Artifact::After).unwrap().is_none());
        assert_eq!(std::fs::read(dir.path().join(archived)).unwrap(), png(b"v1"));
    }

    #[test]
    fn restore_after_undoes_archive() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let id = TaskId::generate();
        store.save(&id, Artifact::After, &png(b"v1")).unwrap();

        store.archive_after(&id, 2).unwrap().unwrap();
        store.restore_after(&id, 2).unwrap();
        assert_eq!(store.read(&id, Artifact::After).unwrap().unwrap(), png(b"v1"));
        assert!(!dir.path().join(format!("screenshots/{id}_after_2.png")).exists());
    }

    #[test]
    fn traversal_ids_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let evil = TaskId::from("../../etc/passwd");
        assert!(store.read(&evil, Artifact::Before).is_err());
        assert!(store.save(&evil, Artifact::Before, &png(b"")).is_err());
    }
}
