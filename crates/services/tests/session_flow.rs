use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ide_core::model::{
    CourseId, LessonId, ProgressId, ProgressRecord, Role, SlideId, StudentId, UserId,
    encode_user_token,
};
use ide_core::{Clock, Language};
use services::{
    LocalOnlyReason, MountError, Notice, NoticeLevel, ProgressRecordResolver, SaveOutcome,
    SessionController, SessionError, SessionObserver, SyncError, TrackerConfig, TrackerStatus,
};
use storage::repository::{
    CompleteLessonRecord, CourseRecord, InMemoryBackend, InMemoryLocalStore, LessonRecord,
    LocalStore, NewProgressRecord, ProgressRepository, SaveCodeRecord, SlideRecord, Storage,
    StorageError, StudentRecord, TimeSpentPatch, UserRecord,
};
use tokio::sync::Notify;

// ─── Fakes ─────────────────────────────────────────────────────────────────────

/// Progress service wrapper with switchable failure modes.
#[derive(Clone, Default)]
struct ScriptedProgress {
    inner: InMemoryBackend,
    calls: Arc<AtomicUsize>,
    creates: Arc<AtomicUsize>,
    failing_flushes: Arc<AtomicUsize>,
    failing_first_visits: Arc<AtomicUsize>,
    saves: Arc<AtomicUsize>,
    patches: Arc<Mutex<Vec<TimeSpentPatch>>>,
    unreachable: bool,
    fail_save_code: bool,
    hang_time_spent: bool,
    save_gate: Option<Arc<Notify>>,
    first_save_gate: Option<Arc<Notify>>,
}

impl ScriptedProgress {
    fn over(inner: InMemoryBackend) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    fn check(&self) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable {
            return Err(StorageError::Connection("connection refused".into()));
        }
        Ok(())
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn patches_for(&self, lesson_id: &LessonId) -> Vec<TimeSpentPatch> {
        self.patches
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.lesson_id.as_ref() == Some(lesson_id))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ProgressRepository for ScriptedProgress {
    async fn get_by_student_and_course(
        &self,
        student_id: &StudentId,
        course_id: &CourseId,
    ) -> Result<ProgressRecord, StorageError> {
        self.check()?;
        self.inner
            .get_by_student_and_course(student_id, course_id)
            .await
    }

    async fn create(&self, record: &NewProgressRecord) -> Result<(), StorageError> {
        self.check()?;
        self.creates.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.inner.create(record).await
    }

    async fn complete_lesson(
        &self,
        id: &ProgressId,
        completion: &CompleteLessonRecord,
    ) -> Result<(), StorageError> {
        self.check()?;
        self.inner.complete_lesson(id, completion).await
    }

    async fn save_code(&self, id: &ProgressId, code: &SaveCodeRecord) -> Result<(), StorageError> {
        self.check()?;
        let nth = self.saves.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.save_gate {
            gate.notified().await;
        }
        if let (0, Some(gate)) = (nth, &self.first_save_gate) {
            gate.notified().await;
        }
        if self.fail_save_code {
            return Err(StorageError::Status(500));
        }
        self.inner.save_code(id, code).await
    }

    async fn update_time_spent(
        &self,
        id: &ProgressId,
        patch: &TimeSpentPatch,
    ) -> Result<(), StorageError> {
        self.check()?;
        if self.hang_time_spent {
            std::future::pending::<()>().await;
        }
        self.patches.lock().unwrap().push(patch.clone());
        if patch.minutes == Some(0)
            && self
                .failing_first_visits
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(StorageError::Status(502));
        }
        let is_flush = patch.minutes.is_some_and(|m| m > 0);
        if is_flush
            && self
                .failing_flushes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(StorageError::Status(503));
        }
        self.inner.update_time_spent(id, patch).await
    }
}

#[derive(Clone, Default)]
struct BrokenLocalStore;

#[async_trait]
impl LocalStore for BrokenLocalStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
        Err(StorageError::Connection("quota exceeded".into()))
    }

    async fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
        Err(StorageError::Connection("quota exceeded".into()))
    }
}

#[derive(Default)]
struct RecordingObserver {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingObserver {
    fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }
}

impl SessionObserver for RecordingObserver {
    fn on_notice(&self, notice: &Notice) {
        self.notices.lock().unwrap().push(notice.clone());
    }
}

// ─── Fixtures ──────────────────────────────────────────────────────────────────

const ADA: &str = "ada@example.com";

fn course_id() -> CourseId {
    CourseId::new("c1")
}

fn slide(id: &str, order: i64, code: &str) -> SlideRecord {
    SlideRecord {
        id: SlideId::new(id),
        title: id.to_uppercase(),
        order,
        starting_code: Some(code.into()),
    }
}

fn build_backend() -> InMemoryBackend {
    let backend = InMemoryBackend::new();
    backend
        .insert_course(
            CourseRecord {
                id: course_id(),
                title: "Intro to the web".into(),
            },
            vec![
                (
                    LessonRecord {
                        id: LessonId::new("l1"),
                        title: "Tags".into(),
                        order: Some(1),
                    },
                    vec![
                        slide("l1-s0", 0, "<div></div>"),
                        slide("l1-s1", 1, "<p></p>"),
                    ],
                ),
                (
                    LessonRecord {
                        id: LessonId::new("l2"),
                        title: "Scripts".into(),
                        order: Some(2),
                    },
                    vec![slide("l2-s0", 0, "console.log(1)")],
                ),
            ],
        )
        .unwrap();
    backend
        .insert_user(UserRecord {
            id: UserId::new("u1"),
            email: ADA.into(),
            name: Some("Ada Lovelace".into()),
            role: Some(Role::Student),
        })
        .unwrap();
    backend
        .insert_student(StudentRecord {
            id: StudentId::new("s1"),
            user_id: Some(UserId::new("u1")),
            email: ADA.into(),
        })
        .unwrap();
    backend
}

fn build_storage(
    backend: &InMemoryBackend,
    progress: ScriptedProgress,
    local: Arc<dyn LocalStore>,
) -> Storage {
    Storage {
        content: Arc::new(backend.clone()),
        identity: Arc::new(backend.clone()),
        progress: Arc::new(progress),
        local,
    }
}

fn build_controller(storage: Storage) -> SessionController {
    SessionController::new(storage, Clock::default(), TrackerConfig::default())
}

// ─── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn guest_never_touches_progress_service() {
    let backend = build_backend();
    let progress = ScriptedProgress::over(backend.clone());
    let local = InMemoryLocalStore::new();
    let controller = build_controller(build_storage(
        &backend,
        progress.clone(),
        Arc::new(local.clone()),
    ));

    let handle = controller.mount_session(&course_id(), "guest").await.unwrap();
    handle.select_lesson(&LessonId::new("l2")).unwrap();
    handle.update_code("alert('hi')").unwrap();
    let outcome = handle.save().await.unwrap();

    assert!(matches!(
        outcome,
        SaveOutcome::LocalOnly(LocalOnlyReason::Guest)
    ));
    assert_eq!(
        local.get("code-c1-l2").await.unwrap().as_deref(),
        Some("alert('hi')")
    );
    tokio::task::yield_now().await;
    assert_eq!(progress.calls(), 0);
    assert!(backend.progress_records().unwrap().is_empty());
}

#[tokio::test]
async fn unreachable_progress_service_still_mirrors_code() {
    let backend = build_backend();
    let progress = ScriptedProgress {
        unreachable: true,
        ..ScriptedProgress::over(backend.clone())
    };
    let local = InMemoryLocalStore::new();
    let controller = build_controller(build_storage(&backend, progress, Arc::new(local.clone())));

    let handle = controller
        .mount_session(&course_id(), &encode_user_token(ADA))
        .await
        .unwrap();
    assert!(handle.identity().tracks_progress());
    assert!(handle.record().is_none());

    let source = "def main():\n    import os\n";
    handle.update_code(source).unwrap();
    let outcome = handle.save().await.unwrap();

    assert!(matches!(
        outcome,
        SaveOutcome::LocalOnly(LocalOnlyReason::Network(SyncError::ResolutionFailed(_)))
    ));
    assert_eq!(
        local.get("code-c1-l1-s1").await.unwrap().as_deref(),
        Some(source)
    );
}

#[tokio::test]
async fn persist_failure_is_local_only_with_warning() {
    let backend = build_backend();
    let progress = ScriptedProgress {
        fail_save_code: true,
        ..ScriptedProgress::over(backend.clone())
    };
    let observer = Arc::new(RecordingObserver::default());
    let controller = build_controller(build_storage(
        &backend,
        progress,
        Arc::new(InMemoryLocalStore::new()),
    ))
    .with_observer(observer.clone());

    let handle = controller.mount_session(&course_id(), ADA).await.unwrap();
    let outcome = handle.save().await.unwrap();

    assert!(matches!(
        outcome,
        SaveOutcome::LocalOnly(LocalOnlyReason::Network(SyncError::PersistFailed(_)))
    ));
    let notices = observer.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].level, NoticeLevel::Warning);
}

#[tokio::test]
async fn local_storage_failure_is_a_hard_error() {
    let backend = build_backend();
    let progress = ScriptedProgress::over(backend.clone());
    let controller = build_controller(build_storage(
        &backend,
        progress,
        Arc::new(BrokenLocalStore),
    ));

    let handle = controller.mount_session(&course_id(), ADA).await.unwrap();
    let outcome = handle.save().await.unwrap();

    assert!(matches!(
        outcome,
        SaveOutcome::Failed(SyncError::LocalStorageFailed(_))
    ));
    let record = handle.record().unwrap();
    assert!(record.code_for(&LessonId::new("l1")).is_none());
}

#[tokio::test]
async fn student_save_syncs_and_updates_snapshot() {
    let backend = build_backend();
    let progress = ScriptedProgress::over(backend.clone());
    let controller = build_controller(build_storage(
        &backend,
        progress,
        Arc::new(InMemoryLocalStore::new()),
    ));

    let handle = controller.mount_session(&course_id(), ADA).await.unwrap();
    handle.update_code("<html><body></body></html>").unwrap();
    let outcome = handle.save().await.unwrap();

    assert!(outcome.is_synced());
    let snapshot = handle.record().unwrap();
    let saved = snapshot.code_for(&LessonId::new("l1")).unwrap();
    assert_eq!(saved.language, Language::Html);
    assert!(snapshot.lesson(&LessonId::new("l1")).unwrap().is_completed());

    let remote = backend.progress_records().unwrap();
    assert_eq!(remote.len(), 1);
    assert_eq!(
        remote[0].code_for(&LessonId::new("l1")).unwrap().code,
        "<html><body></body></html>"
    );
}

#[tokio::test]
async fn select_lesson_is_not_blocked_by_hanging_patch() {
    let backend = build_backend();
    let progress = ScriptedProgress {
        hang_time_spent: true,
        ..ScriptedProgress::over(backend.clone())
    };
    let controller = build_controller(build_storage(
        &backend,
        progress,
        Arc::new(InMemoryLocalStore::new()),
    ));
    let handle = controller.mount_session(&course_id(), ADA).await.unwrap();

    handle.select_lesson(&LessonId::new("l2")).unwrap();
    tokio::task::yield_now().await;

    let cursor = handle.cursor();
    assert_eq!(cursor.lesson_id(), &LessonId::new("l2"));
    assert_eq!(cursor.slide_index(), 0);
    assert_eq!(cursor.code(), "console.log(1)");

    handle.select_slide(5).unwrap();
    assert_eq!(handle.cursor().slide_index(), 0);
}

#[tokio::test]
async fn navigation_patches_position_remotely() {
    let backend = build_backend();
    let progress = ScriptedProgress::over(backend.clone());
    let controller = build_controller(build_storage(
        &backend,
        progress,
        Arc::new(InMemoryLocalStore::new()),
    ));
    let handle = controller.mount_session(&course_id(), ADA).await.unwrap();

    handle.select_lesson(&LessonId::new("l2")).unwrap();
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }

    let remote = backend.progress_records().unwrap();
    assert_eq!(remote[0].current_lesson(), Some(&LessonId::new("l2")));
    assert_eq!(remote[0].current_slide(), Some(&SlideId::new("l2-s0")));
    assert!(remote[0].lesson(&LessonId::new("l2")).is_some());
}

#[tokio::test]
async fn failed_first_visit_is_sent_again_on_return() {
    let backend = build_backend();
    let progress = ScriptedProgress {
        failing_first_visits: Arc::new(AtomicUsize::new(1)),
        ..ScriptedProgress::over(backend.clone())
    };
    let controller = build_controller(build_storage(
        &backend,
        progress.clone(),
        Arc::new(InMemoryLocalStore::new()),
    ));
    let handle = controller.mount_session(&course_id(), ADA).await.unwrap();
    let l2 = LessonId::new("l2");

    handle.select_lesson(&l2).unwrap();
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
    handle.select_lesson(&LessonId::new("l1")).unwrap();
    handle.select_lesson(&l2).unwrap();
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }

    let sent = progress.patches_for(&l2);
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|p| p.minutes == Some(0)));

    handle.select_slide(0).unwrap();
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
    let sent = progress.patches_for(&l2);
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[2].minutes, None);
}

#[tokio::test]
async fn older_save_finishing_last_keeps_newer_code() {
    let backend = build_backend();
    let gate = Arc::new(Notify::new());
    let progress = ScriptedProgress {
        first_save_gate: Some(Arc::clone(&gate)),
        ..ScriptedProgress::over(backend.clone())
    };
    let local = InMemoryLocalStore::new();
    let controller = build_controller(build_storage(
        &backend,
        progress.clone(),
        Arc::new(local.clone()),
    ));
    let handle = controller.mount_session(&course_id(), ADA).await.unwrap();
    let l1 = LessonId::new("l1");

    handle.update_code("<p>old</p>").unwrap();
    let saving = handle.clone();
    let older = tokio::spawn(async move { saving.save().await });
    while progress.saves.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }

    handle.update_code("<p>new</p>").unwrap();
    assert!(handle.save().await.unwrap().is_synced());
    gate.notify_one();
    assert!(older.await.unwrap().unwrap().is_synced());

    assert_eq!(
        local.get("code-c1-l1-s1").await.unwrap().as_deref(),
        Some("<p>new</p>")
    );
    let record = handle.record().unwrap();
    assert_eq!(record.code_for(&l1).unwrap().code, "<p>new</p>");

    handle.select_lesson(&LessonId::new("l2")).unwrap();
    handle.select_lesson(&l1).unwrap();
    assert_eq!(handle.cursor().code(), "<p>new</p>");
}

#[tokio::test]
async fn mount_resumes_position_and_prefers_local_mirror() {
    let backend = build_backend();
    backend
        .create(&NewProgressRecord {
            student_id: StudentId::new("s1"),
            course_id: course_id(),
            current_lesson: Some(LessonId::new("l1")),
        })
        .await
        .unwrap();
    let id = backend
        .get_by_student_and_course(&StudentId::new("s1"), &course_id())
        .await
        .unwrap()
        .id()
        .cloned()
        .unwrap();
    backend
        .update_time_spent(
            &id,
            &TimeSpentPatch::first_visit(
                LessonId::new("l1"),
                Some(SlideId::new("l1-s1")),
                chrono::Utc::now(),
            ),
        )
        .await
        .unwrap();
    backend
        .save_code(
            &id,
            &SaveCodeRecord {
                lesson_id: LessonId::new("l1"),
                language: Language::Html,
                code: "<p>remote</p>".into(),
            },
        )
        .await
        .unwrap();

    let local = InMemoryLocalStore::new();
    let progress = ScriptedProgress::over(backend.clone());
    let controller = build_controller(build_storage(
        &backend,
        progress,
        Arc::new(local.clone()),
    ));

    let handle = controller.mount_session(&course_id(), ADA).await.unwrap();
    let cursor = handle.cursor();
    assert_eq!(cursor.lesson_id(), &LessonId::new("l1"));
    assert_eq!(cursor.slide_index(), 1);
    assert_eq!(cursor.code(), "<p>remote</p>");
    handle.unmount();

    local.set("code-c1-l1-s1", "<p>local</p>").await.unwrap();
    let handle = controller.mount_session(&course_id(), ADA).await.unwrap();
    assert_eq!(handle.cursor().code(), "<p>local</p>");
}

#[tokio::test]
async fn concurrent_resolves_create_once() {
    let backend = build_backend();
    let progress = ScriptedProgress::over(backend.clone());
    let resolver = ProgressRecordResolver::new(Arc::new(progress.clone()));
    let student = StudentId::new("s1");
    let lesson = LessonId::new("l1");
    let course = course_id();

    let (a, b) = tokio::join!(
        resolver.resolve(&student, &course, Some(&lesson)),
        resolver.resolve(&student, &course, Some(&lesson)),
    );

    assert_eq!(a.unwrap().id(), b.unwrap().id());
    assert_eq!(progress.creates.load(Ordering::SeqCst), 1);
    assert_eq!(backend.progress_records().unwrap().len(), 1);
}

#[tokio::test]
async fn conflict_on_create_reads_back_existing_record() {
    let backend = build_backend();
    let progress = ScriptedProgress::over(backend.clone());
    let student = StudentId::new("s1");
    let first = ProgressRecordResolver::new(Arc::new(progress.clone()));
    let second = ProgressRecordResolver::new(Arc::new(progress.clone()));
    let course = course_id();

    let (a, b) = tokio::join!(
        first.resolve(&student, &course, None),
        second.resolve(&student, &course, None),
    );

    assert_eq!(a.unwrap().id(), b.unwrap().id());
    assert_eq!(backend.progress_records().unwrap().len(), 1);
}

#[tokio::test]
async fn unmount_closes_handle_and_drops_late_notices() {
    let backend = build_backend();
    let gate = Arc::new(Notify::new());
    let progress = ScriptedProgress {
        save_gate: Some(Arc::clone(&gate)),
        ..ScriptedProgress::over(backend.clone())
    };
    let observer = Arc::new(RecordingObserver::default());
    let controller = build_controller(build_storage(
        &backend,
        progress,
        Arc::new(InMemoryLocalStore::new()),
    ))
    .with_observer(observer.clone());
    let handle = controller.mount_session(&course_id(), ADA).await.unwrap();

    let saving = handle.clone();
    let pending = tokio::spawn(async move { saving.save().await });
    tokio::task::yield_now().await;

    handle.unmount();
    gate.notify_one();
    let outcome = pending.await.unwrap().unwrap();

    assert!(outcome.is_synced());
    assert!(observer.notices().is_empty());
    assert_eq!(handle.tracker().status(), TrackerStatus::Stopped);
    assert_eq!(handle.select_slide(1), Err(SessionError::Closed));
    assert_eq!(handle.update_code("late"), Err(SessionError::Closed));
    assert!(matches!(handle.save().await, Err(SessionError::Closed)));
}

#[tokio::test]
async fn mount_fails_without_content() {
    let backend = build_backend();
    backend
        .insert_course(
            CourseRecord {
                id: CourseId::new("empty"),
                title: "Empty".into(),
            },
            Vec::new(),
        )
        .unwrap();
    let controller = build_controller(build_storage(
        &backend,
        ScriptedProgress::over(backend.clone()),
        Arc::new(InMemoryLocalStore::new()),
    ));

    assert!(matches!(
        controller.mount_session(&CourseId::new("empty"), ADA).await,
        Err(MountError::EmptyCourse)
    ));
    assert!(matches!(
        controller.mount_session(&CourseId::new("missing"), ADA).await,
        Err(MountError::Content(StorageError::NotFound))
    ));
}

#[tokio::test(start_paused = true)]
async fn tracker_converges_after_failed_flush() {
    let backend = build_backend();
    let progress = ScriptedProgress {
        failing_flushes: Arc::new(AtomicUsize::new(1)),
        ..ScriptedProgress::over(backend.clone())
    };
    let controller = build_controller(build_storage(
        &backend,
        progress,
        Arc::new(InMemoryLocalStore::new()),
    ));
    let handle = controller.mount_session(&course_id(), ADA).await.unwrap();
    let tracker = handle.tracker().clone();

    tokio::time::sleep(Duration::from_millis(60_500)).await;
    assert_eq!(tracker.ticks(), 60);
    assert_eq!(tracker.remote_minutes(), 0);
    assert_eq!(backend.progress_records().unwrap()[0].time_spent_minutes(), 0);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(tracker.ticks(), 120);
    assert_eq!(tracker.remote_minutes(), 2);
    assert_eq!(backend.progress_records().unwrap()[0].time_spent_minutes(), 2);

    handle.unmount();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(tracker.ticks(), 120);
}
