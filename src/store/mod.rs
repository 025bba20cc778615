use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::config::StoreSettings;
use crate::models::essay::{now_rfc3339, EssayPhase, EssayRecord, PipelineStep, SubmissionKind};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    saved_at: String,
    essays: Vec<EssayRecord>,
}

/// Durable mirror of the essay list: one versioned JSON file standing in for
/// the browser's local storage blob. Binary image payloads are skipped by the
/// record's serialization, so only derived/display data lands on disk.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_settings(settings: &StoreSettings) -> Self {
        Self::new(settings.snapshot_path.clone())
    }

    /// Load and normalize the stored essays. Essays caught mid-processing by
    /// the previous session are reset to a resumable pending state; image
    /// essays whose bytes are gone and whose transcript never arrived are
    /// flagged as needing a re-upload.
    pub async fn load(&self) -> anyhow::Result<Vec<EssayRecord>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read snapshot {}", self.path.display()))
            }
        };

        let snapshot: Snapshot = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse snapshot {}", self.path.display()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            tracing::warn!(
                found = snapshot.version,
                expected = SNAPSHOT_VERSION,
                "Snapshot version mismatch; loading anyway"
            );
        }

        Ok(snapshot.essays.into_iter().map(normalize_loaded).collect())
    }

    /// Persist the essays atomically. An empty collection removes the file
    /// instead of storing an empty structure.
    pub async fn save(&self, essays: &[EssayRecord]) -> anyhow::Result<()> {
        if essays.is_empty() {
            return match tokio::fs::remove_file(&self.path).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err).with_context(|| {
                    format!("Failed to remove snapshot {}", self.path.display())
                }),
            };
        }

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at: now_rfc3339(),
            essays: essays.to_vec(),
        };
        let serialized =
            serde_json::to_string_pretty(&snapshot).context("Failed to serialize snapshot")?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("Failed to create snapshot directory {}", parent.display())
                })?;
            }
        }

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, serialized)
            .await
            .with_context(|| format!("Failed to write snapshot {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("Failed to replace snapshot {}", self.path.display()))?;

        Ok(())
    }
}

fn normalize_loaded(mut essay: EssayRecord) -> EssayRecord {
    if essay.phase.is_running() {
        // The session that ran this essay is gone. A grading run whose
        // transcript is already captured resumes from ocr_complete; anything
        // else goes back to the queue.
        let reset = match essay.phase {
            EssayPhase::GradingRunning { via_ocr: true } => EssayPhase::OcrComplete,
            _ => EssayPhase::Queued,
        };
        essay.set_phase(reset, "上次处理被中断，已重置为待处理");
    }

    if essay.kind == SubmissionKind::Image && essay.resolved_text().is_none() {
        // Image bytes are never persisted; without a transcript there is
        // nothing left to process.
        essay.set_phase(
            EssayPhase::Failed { step: PipelineStep::Ocr, via_ocr: false },
            "原始图片未保存，请重新上传",
        );
        essay.last_error = Some("图片内容无法恢复，需要重新上传".to_string());
    }

    essay
}

/// Coalesces rapid successive saves: the snapshot is written once, a quiet
/// interval after the last scheduled change. Dropping the saver flushes any
/// pending snapshot before the background task exits.
#[derive(Debug, Clone)]
pub struct DebouncedSaver {
    tx: mpsc::UnboundedSender<Vec<EssayRecord>>,
}

impl DebouncedSaver {
    pub fn spawn(store: SnapshotStore, debounce: Duration) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<EssayRecord>>();

        tokio::spawn(async move {
            let mut pending: Option<Vec<EssayRecord>> = None;
            loop {
                tokio::select! {
                    message = rx.recv() => match message {
                        Some(essays) => pending = Some(essays),
                        None => break,
                    },
                    _ = tokio::time::sleep(debounce), if pending.is_some() => {
                        if let Some(essays) = pending.take() {
                            if let Err(err) = store.save(&essays).await {
                                tracing::warn!(error = %err, "Debounced snapshot save failed");
                            }
                        }
                    }
                }
            }
            if let Some(essays) = pending.take() {
                if let Err(err) = store.save(&essays).await {
                    tracing::warn!(error = %err, "Final snapshot save failed");
                }
            }
        });

        Self { tx }
    }

    pub fn schedule(&self, essays: Vec<EssayRecord>) {
        if self.tx.send(essays).is_err() {
            tracing::warn!("Snapshot saver task is gone; update dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::essay::{EssayStatus, ImagePayload, PhaseStatus};

    fn image_essay() -> EssayRecord {
        EssayRecord::new_image(ImagePayload {
            bytes: vec![0xFF],
            mime: "image/jpeg".to_string(),
            filename: "scan.jpg".to_string(),
            source_path: None,
        })
    }

    fn store_in(dir: &tempfile::TempDir) -> SnapshotStore {
        SnapshotStore::new(dir.path().join("essays.json"))
    }

    #[tokio::test]
    async fn load_of_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let essays = store_in(&dir).load().await.unwrap();
        assert!(essays.is_empty());
    }

    #[tokio::test]
    async fn roundtrip_preserves_completed_essays() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let mut essay = EssayRecord::new_typed("My essay text");
        essay.phase = EssayPhase::Done { via_ocr: false, graded: false };
        store.save(std::slice::from_ref(&essay)).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, essay.id);
        assert_eq!(loaded[0].raw_text.as_deref(), Some("My essay text"));
        assert_eq!(loaded[0].status(), EssayStatus::Completed);
    }

    #[tokio::test]
    async fn interrupted_processing_resets_to_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let mut ocr_running = image_essay();
        ocr_running.ocr_text = Some("partial transcript".to_string());
        ocr_running.phase = EssayPhase::OcrRunning;

        let mut grading_running = image_essay();
        grading_running.ocr_text = Some("captured transcript".to_string());
        grading_running.phase = EssayPhase::GradingRunning { via_ocr: true };

        store.save(&[ocr_running, grading_running]).await.unwrap();
        let loaded = store.load().await.unwrap();

        assert_eq!(loaded[0].status(), EssayStatus::Pending);
        assert_ne!(loaded[0].ocr_status(), PhaseStatus::Processing);
        assert_ne!(loaded[0].grading_status(), PhaseStatus::Processing);

        // The grading run keeps its captured transcript and resumes at
        // ocr_complete rather than re-entering OCR.
        assert_eq!(loaded[1].status(), EssayStatus::Pending);
        assert_eq!(loaded[1].phase, EssayPhase::OcrComplete);
        assert_eq!(loaded[1].ocr_text.as_deref(), Some("captured transcript"));
    }

    #[tokio::test]
    async fn image_essay_without_text_needs_reupload() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.save(&[image_essay()]).await.unwrap();
        let loaded = store.load().await.unwrap();

        assert_eq!(loaded[0].status(), EssayStatus::Error);
        assert!(loaded[0].progress_message.contains("重新上传"));
        assert!(loaded[0].last_error.is_some());
    }

    #[tokio::test]
    async fn saving_empty_collection_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.save(&[EssayRecord::new_typed("text")]).await.unwrap();
        assert!(dir.path().join("essays.json").exists());

        store.save(&[]).await.unwrap();
        assert!(!dir.path().join("essays.json").exists());

        // Removing an already-absent snapshot stays quiet.
        store.save(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn debounced_saver_coalesces_updates() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let saver = DebouncedSaver::spawn(store.clone(), Duration::from_millis(50));

        let first = EssayRecord::new_typed("first");
        let second = EssayRecord::new_typed("second");
        saver.schedule(vec![first]);
        saver.schedule(vec![second.clone()]);

        tokio::time::sleep(Duration::from_millis(200)).await;

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, second.id);
    }
}
