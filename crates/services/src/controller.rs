use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ide_core::Clock;
use ide_core::model::{
    CourseId, CourseTree, Identity, LessonId, MirrorKey, Owner, ProgressRecord, SessionCursor,
    initial_code, resume_point,
};
use storage::repository::{LocalStore, Storage};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::config::TrackerConfig;
use crate::content::CourseLoader;
use crate::error::{MountError, SessionError};
use crate::identity::IdentityResolver;
use crate::navigation::{LessonNavigationCoordinator, SessionState, lock};
use crate::progress::ProgressRecordResolver;
use crate::saver::{CodeSnapshotSaver, SaveOutcome, SaveReport, SaveRequest, SessionObserver};
use crate::tracker::TimeTracker;

/// Builds one `SessionHandle` per mount from shared collaborators.
#[derive(Clone)]
pub struct SessionController {
    clock: Clock,
    tracker_config: TrackerConfig,
    storage: Storage,
    courses: CourseLoader,
    identities: IdentityResolver,
    records: ProgressRecordResolver,
    observer: Option<Arc<dyn SessionObserver>>,
}

impl SessionController {
    #[must_use]
    pub fn new(storage: Storage, clock: Clock, tracker_config: TrackerConfig) -> Self {
        Self {
            courses: CourseLoader::new(Arc::clone(&storage.content)),
            identities: IdentityResolver::new(Arc::clone(&storage.identity)),
            records: ProgressRecordResolver::new(Arc::clone(&storage.progress)),
            clock,
            tracker_config,
            storage,
            observer: None,
        }
    }

    /// Route save notices of every mounted session to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Mount a session for `course_id` as the user behind `token`.
    ///
    /// # Errors
    ///
    /// Returns `MountError` if the course cannot be loaded, has no lessons,
    /// or no tokio runtime is running.
    pub async fn mount_session(
        &self,
        course_id: &CourseId,
        token: &str,
    ) -> Result<SessionHandle, MountError> {
        let runtime = Handle::try_current().map_err(|_| MountError::NoRuntime)?;

        let course = Arc::new(self.courses.load(course_id).await?);
        let Some(first_lesson) = course.first_lesson().map(|l| l.id.clone()) else {
            return Err(MountError::EmptyCourse);
        };

        let identity = self.identities.resolve(token).await;
        let record = match identity.owner() {
            Owner::Guest => Some(ProgressRecord::guest(
                course_id.clone(),
                Some(first_lesson.clone()),
            )),
            Owner::Student(student_id) => match self
                .records
                .resolve(student_id, course_id, Some(&first_lesson))
                .await
            {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(
                        %err,
                        student = %student_id,
                        course = %course_id,
                        "continuing local-only"
                    );
                    None
                }
            },
        };

        let mirror = self.load_mirror(&course, identity.owner()).await;
        let (lesson_id, slide_index) =
            resume_point(&course, record.as_ref()).unwrap_or((first_lesson.clone(), 0));
        let code = initial_code(
            &course,
            record.as_ref(),
            &lesson_id,
            slide_index,
            mirror.get(&lesson_id).cloned(),
        );

        let tracker = TimeTracker::new(
            self.tracker_config,
            Arc::clone(&self.storage.progress),
            record
                .as_ref()
                .filter(|_| identity.tracks_progress())
                .and_then(|r| r.id().cloned()),
            record.as_ref().map_or(0, ProgressRecord::time_spent_minutes),
        );
        tracker.start(&runtime);

        info!(
            course = %course_id,
            lesson = %lesson_id,
            slide = slide_index,
            tracked = identity.tracks_progress(),
            "session mounted"
        );

        let state = SessionState::new(
            course,
            identity,
            SessionCursor::new(lesson_id, slide_index, code),
            record,
            mirror,
            self.clock.now(),
        );
        let saver = CodeSnapshotSaver::new(
            self.clock.clone(),
            self.records.clone(),
            Arc::clone(&self.storage.progress),
            Arc::clone(&self.storage.local),
        );
        let navigator = LessonNavigationCoordinator::new(
            self.clock.clone(),
            Arc::clone(&self.storage.progress),
            runtime,
        );

        Ok(SessionHandle {
            inner: Arc::new(HandleInner {
                state: Mutex::new(state),
                first_lesson,
                tracker,
                saver,
                navigator,
                observer: self.observer.clone(),
            }),
        })
    }

    async fn load_mirror(&self, course: &CourseTree, owner: &Owner) -> HashMap<LessonId, String> {
        let mut mirror = HashMap::new();
        for lesson in course.lessons() {
            let key = MirrorKey::new(course.id().clone(), lesson.id.clone(), owner.clone());
            match self.storage.local.get(&key.to_string()).await {
                Ok(Some(code)) => {
                    mirror.insert(lesson.id.clone(), code);
                }
                Ok(None) => {}
                Err(err) => warn!(%err, key = %key, "local mirror read failed"),
            }
        }
        mirror
    }
}

struct HandleInner {
    state: Mutex<SessionState>,
    first_lesson: LessonId,
    tracker: TimeTracker,
    saver: CodeSnapshotSaver,
    navigator: LessonNavigationCoordinator,
    observer: Option<Arc<dyn SessionObserver>>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.tracker.stop();
    }
}

/// The view layer's grip on a mounted session.
///
/// Clones share one session. Navigation and edits apply before the call
/// returns; only `save` suspends.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<HandleInner>,
}

impl SessionHandle {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// # Errors
    ///
    /// Returns `SessionError::UnknownLesson` for a lesson outside the course
    /// and `SessionError::Closed` after unmount.
    pub fn select_lesson(&self, lesson_id: &LessonId) -> Result<(), SessionError> {
        let mut state = self.state();
        self.inner.navigator.select_lesson(&mut state, lesson_id)
    }

    /// # Errors
    ///
    /// Returns `SessionError::Closed` after unmount.
    pub fn select_slide(&self, index: usize) -> Result<(), SessionError> {
        let mut state = self.state();
        self.inner.navigator.select_slide(&mut state, index)
    }

    /// # Errors
    ///
    /// Returns `SessionError::Closed` after unmount.
    pub fn update_code(&self, code: impl Into<String>) -> Result<(), SessionError> {
        let mut state = self.state();
        if state.closed {
            return Err(SessionError::Closed);
        }
        state.cursor.set_code(code);
        Ok(())
    }

    /// Save the current buffer and notify the observer.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Closed` after unmount. Save failures are part
    /// of the returned `SaveOutcome`.
    pub async fn save(&self) -> Result<SaveOutcome, SessionError> {
        let (request, seq) = {
            let mut state = self.state();
            if state.closed {
                return Err(SessionError::Closed);
            }
            let lesson_id = state.cursor.lesson_id().clone();
            let code = state.cursor.code().to_owned();
            // The mirror write is the first step of every save, so the
            // cache takes the buffer now rather than when the save returns.
            state.mirror.insert(lesson_id.clone(), code.clone());
            state.save_seq += 1;
            let request = SaveRequest {
                course_id: state.course.id().clone(),
                lesson_id,
                first_lesson: Some(self.inner.first_lesson.clone()),
                owner: state.identity.owner().clone(),
                code,
                mounted_at: state.mounted_at,
            };
            (request, state.save_seq)
        };
        let lesson_id = request.lesson_id.clone();

        let report = self.inner.saver.save(request).await;
        let notice = report.outcome.notice();

        let closed = {
            let mut state = self.state();
            self.apply_report(&mut state, &lesson_id, seq, &report);
            state.closed
        };

        if closed {
            debug!(lesson = %lesson_id, "save finished after unmount; notice dropped");
        } else if let Some(observer) = &self.inner.observer {
            observer.on_notice(&notice);
        }
        Ok(report.outcome)
    }

    fn apply_report(
        &self,
        state: &mut SessionState,
        lesson_id: &LessonId,
        seq: u64,
        report: &SaveReport,
    ) {
        if let Some(resolved) = &report.resolved {
            let has_remote = state.record.as_ref().is_some_and(|r| r.id().is_some());
            if !has_remote {
                state.record = Some(resolved.clone());
                if let Some(id) = resolved.id() {
                    self.inner.tracker.attach_record(id.clone());
                }
            }
        }
        if report.completion.is_none() && report.snapshot.is_none() {
            return;
        }
        let applied = state.applied_saves.entry(lesson_id.clone()).or_default();
        if seq < *applied {
            debug!(lesson = %lesson_id, seq, "older save finished last; result not applied");
            return;
        }
        *applied = seq;
        if report.completion.is_some() {
            lock(&*state.pending_entries).remove(lesson_id);
        }

        let Some(record) = state.record.as_mut() else {
            return;
        };
        if let Some((minutes, at)) = report.completion {
            record.mark_completed(lesson_id, minutes, at);
        }
        if let Some(snapshot) = &report.snapshot {
            record.store_code(lesson_id, snapshot.clone());
        }
    }

    /// Stop the tracker and close the handle. In-flight saves still finish.
    pub fn unmount(&self) {
        let mut state = self.state();
        if state.closed {
            return;
        }
        state.closed = true;
        self.inner.tracker.stop();
        info!(course = %state.course.id(), "session unmounted");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    #[must_use]
    pub fn cursor(&self) -> SessionCursor {
        self.state().cursor.clone()
    }

    #[must_use]
    pub fn identity(&self) -> Identity {
        self.state().identity.clone()
    }

    #[must_use]
    pub fn course(&self) -> Arc<CourseTree> {
        Arc::clone(&self.state().course)
    }

    /// Snapshot of the session's progress record, if one is known.
    #[must_use]
    pub fn record(&self) -> Option<ProgressRecord> {
        self.state().record.clone()
    }

    #[must_use]
    pub fn tracker(&self) -> &TimeTracker {
        &self.inner.tracker
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("SessionHandle")
            .field("course", state.course.id())
            .field("lesson", state.cursor.lesson_id())
            .field("slide", &state.cursor.slide_index())
            .field("closed", &state.closed)
            .finish_non_exhaustive()
    }
}
