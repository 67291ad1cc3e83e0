use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ide_core::model::{
    CodeSnapshot, CourseId, LessonId, MirrorKey, Owner, ProgressId, ProgressRecord,
};
use ide_core::time::whole_minutes_between;
use ide_core::{Clock, detect};
use storage::repository::{
    CompleteLessonRecord, LocalStore, ProgressRepository, SaveCodeRecord, StorageError,
};
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::progress::ProgressRecordResolver;

/// Why a save stopped at the local mirror.
#[derive(Debug)]
pub enum LocalOnlyReason {
    Guest,
    Network(SyncError),
}

/// Result of one save attempt.
#[derive(Debug)]
pub enum SaveOutcome {
    /// Mirrored locally and persisted remotely.
    Synced,
    /// Mirrored locally only.
    LocalOnly(LocalOnlyReason),
    /// Not even the local mirror was written.
    Failed(SyncError),
}

impl SaveOutcome {
    #[must_use]
    pub fn is_synced(&self) -> bool {
        matches!(self, SaveOutcome::Synced)
    }

    /// The user-facing message for this outcome.
    #[must_use]
    pub fn notice(&self) -> Notice {
        match self {
            SaveOutcome::Synced => Notice::new(NoticeLevel::Success, "Code saved"),
            SaveOutcome::LocalOnly(LocalOnlyReason::Guest) => {
                Notice::new(NoticeLevel::Info, "Code saved on this device")
            }
            SaveOutcome::LocalOnly(LocalOnlyReason::Network(_)) => {
                Notice::new(NoticeLevel::Warning, "Saved locally, sync failed")
            }
            SaveOutcome::Failed(_) => Notice::new(NoticeLevel::Error, "Code could not be saved"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoticeLevel {
    Success,
    Info,
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    #[must_use]
    pub fn new(level: NoticeLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Receives notices from a mounted session.
pub trait SessionObserver: Send + Sync {
    fn on_notice(&self, notice: &Notice);
}

/// Everything one save needs, captured from the session up front.
#[derive(Clone, Debug)]
pub struct SaveRequest {
    pub course_id: CourseId,
    pub lesson_id: LessonId,
    pub first_lesson: Option<LessonId>,
    pub owner: Owner,
    pub code: String,
    pub mounted_at: DateTime<Utc>,
}

/// Outcome plus the record changes a save confirmed.
#[derive(Debug)]
pub struct SaveReport {
    pub outcome: SaveOutcome,
    pub resolved: Option<ProgressRecord>,
    pub completion: Option<(u32, DateTime<Utc>)>,
    pub snapshot: Option<CodeSnapshot>,
}

impl SaveReport {
    fn local(outcome: SaveOutcome) -> Self {
        Self {
            outcome,
            resolved: None,
            completion: None,
            snapshot: None,
        }
    }
}

/// The save pipeline: local mirror first, then the remote record.
#[derive(Clone)]
pub struct CodeSnapshotSaver {
    clock: Clock,
    resolver: ProgressRecordResolver,
    progress: Arc<dyn ProgressRepository>,
    local: Arc<dyn LocalStore>,
}

impl CodeSnapshotSaver {
    #[must_use]
    pub fn new(
        clock: Clock,
        resolver: ProgressRecordResolver,
        progress: Arc<dyn ProgressRepository>,
        local: Arc<dyn LocalStore>,
    ) -> Self {
        Self {
            clock,
            resolver,
            progress,
            local,
        }
    }

    /// Run the pipeline. Never errors; failures are folded into the outcome.
    pub async fn save(&self, request: SaveRequest) -> SaveReport {
        let key = MirrorKey::new(
            request.course_id.clone(),
            request.lesson_id.clone(),
            request.owner.clone(),
        );
        if let Err(err) = self.local.set(&key.to_string(), &request.code).await {
            warn!(%err, key = %key, "local mirror write failed");
            return SaveReport::local(SaveOutcome::Failed(SyncError::LocalStorageFailed(err)));
        }

        let Owner::Student(student_id) = &request.owner else {
            debug!(key = %key, "guest save kept local");
            return SaveReport::local(SaveOutcome::LocalOnly(LocalOnlyReason::Guest));
        };

        let record = match self
            .resolver
            .resolve(student_id, &request.course_id, request.first_lesson.as_ref())
            .await
        {
            Ok(record) => record,
            Err(err) => {
                warn!(%err, student = %student_id, "save kept local");
                return SaveReport::local(SaveOutcome::LocalOnly(LocalOnlyReason::Network(err)));
            }
        };
        let Some(record_id) = record.id().cloned() else {
            return SaveReport::local(SaveOutcome::LocalOnly(LocalOnlyReason::Network(
                SyncError::ResolutionFailed(StorageError::NotFound),
            )));
        };

        let language = detect(&request.code);
        let now = self.clock.now();
        let minutes = whole_minutes_between(request.mounted_at, now);
        let completion = self
            .complete_lesson(&record_id, &request.lesson_id, minutes)
            .await
            .then_some((minutes, now));

        let persisted = self
            .progress
            .save_code(
                &record_id,
                &SaveCodeRecord {
                    lesson_id: request.lesson_id.clone(),
                    language,
                    code: request.code.clone(),
                },
            )
            .await;

        match persisted {
            Ok(()) => {
                debug!(record = %record_id, lesson = %request.lesson_id, %language, "code saved");
                SaveReport {
                    outcome: SaveOutcome::Synced,
                    resolved: Some(record),
                    completion,
                    snapshot: Some(CodeSnapshot {
                        language,
                        code: request.code,
                        saved_at: now,
                    }),
                }
            }
            Err(err) => {
                warn!(%err, record = %record_id, "code persist failed");
                SaveReport {
                    outcome: SaveOutcome::LocalOnly(LocalOnlyReason::Network(
                        SyncError::PersistFailed(err),
                    )),
                    resolved: Some(record),
                    completion,
                    snapshot: None,
                }
            }
        }
    }

    async fn complete_lesson(
        &self,
        record_id: &ProgressId,
        lesson_id: &LessonId,
        minutes: u32,
    ) -> bool {
        let completion = CompleteLessonRecord {
            lesson_id: lesson_id.clone(),
            time_spent_minutes: minutes,
        };
        match self.progress.complete_lesson(record_id, &completion).await {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, record = %record_id, lesson = %lesson_id, "lesson completion failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ide_core::Language;
    use ide_core::model::StudentId;
    use ide_core::time::fixed_now;
    use storage::repository::{InMemoryBackend, InMemoryLocalStore};

    fn build_saver(
        backend: &InMemoryBackend,
        local: &InMemoryLocalStore,
        clock: Clock,
    ) -> CodeSnapshotSaver {
        let progress: Arc<dyn ProgressRepository> = Arc::new(backend.clone());
        CodeSnapshotSaver::new(
            clock,
            ProgressRecordResolver::new(Arc::clone(&progress)),
            progress,
            Arc::new(local.clone()),
        )
    }

    fn request(owner: Owner, code: &str) -> SaveRequest {
        SaveRequest {
            course_id: CourseId::new("c1"),
            lesson_id: LessonId::new("l1"),
            first_lesson: Some(LessonId::new("l1")),
            owner,
            code: code.into(),
            mounted_at: fixed_now(),
        }
    }

    #[tokio::test]
    async fn guest_save_stays_local() {
        let backend = InMemoryBackend::new();
        let local = InMemoryLocalStore::new();
        let saver = build_saver(&backend, &local, Clock::fixed(fixed_now()));

        let report = saver.save(request(Owner::Guest, "x = 1")).await;

        assert!(matches!(
            report.outcome,
            SaveOutcome::LocalOnly(LocalOnlyReason::Guest)
        ));
        assert_eq!(local.get("code-c1-l1").await.unwrap().as_deref(), Some("x = 1"));
        assert!(backend.progress_records().unwrap().is_empty());
    }

    #[tokio::test]
    async fn student_save_completes_lesson_and_stores_code() {
        let backend = InMemoryBackend::new();
        let local = InMemoryLocalStore::new();
        let mut clock = Clock::manual(fixed_now());
        let saver = build_saver(&backend, &local, clock.clone());
        clock.advance(Duration::seconds(7 * 60 + 59));

        let source = "#include <stdio.h>\nint main() { printf(\"hi\"); }";
        let report = saver
            .save(request(Owner::Student(StudentId::new("s1")), source))
            .await;

        assert!(report.outcome.is_synced());
        assert_eq!(report.completion.map(|(m, _)| m), Some(7));
        assert_eq!(report.snapshot.as_ref().map(|s| s.language), Some(Language::Cpp));
        assert_eq!(
            local.get("code-c1-l1-s1").await.unwrap().as_deref(),
            Some(source)
        );

        let records = backend.progress_records().unwrap();
        assert_eq!(records.len(), 1);
        let lesson = records[0].lesson(&LessonId::new("l1")).unwrap();
        assert!(lesson.is_completed());
        assert_eq!(lesson.time_spent_minutes, 7);
        assert_eq!(
            records[0].code_for(&LessonId::new("l1")).unwrap().code,
            source
        );
    }

    #[test]
    fn notices_match_outcomes() {
        assert_eq!(SaveOutcome::Synced.notice().level, NoticeLevel::Success);
        assert_eq!(
            SaveOutcome::LocalOnly(LocalOnlyReason::Network(SyncError::PersistFailed(
                StorageError::Status(500)
            )))
            .notice()
            .message,
            "Saved locally, sync failed"
        );
        assert_eq!(
            SaveOutcome::Failed(SyncError::LocalStorageFailed(
                StorageError::Connection("disk full".into())
            ))
            .notice()
            .level,
            NoticeLevel::Error
        );
    }
}
