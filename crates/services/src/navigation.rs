use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use ide_core::Clock;
use ide_core::model::{
    CourseTree, Identity, LessonId, ProgressRecord, SessionCursor, initial_code,
};
use storage::repository::{ProgressRepository, TimeSpentPatch};
use tokio::runtime::Handle;
use tracing::warn;

use crate::error::SessionError;

/// Mutable state of one mounted session.
pub(crate) struct SessionState {
    pub(crate) course: Arc<CourseTree>,
    pub(crate) identity: Identity,
    pub(crate) cursor: SessionCursor,
    pub(crate) record: Option<ProgressRecord>,
    pub(crate) mirror: HashMap<LessonId, String>,
    /// Lessons whose zero-progress entry the service has not acknowledged.
    pub(crate) pending_entries: Arc<Mutex<HashSet<LessonId>>>,
    /// Sequence number handed to the most recent save.
    pub(crate) save_seq: u64,
    /// Highest save sequence whose result was applied, per lesson.
    pub(crate) applied_saves: HashMap<LessonId, u64>,
    pub(crate) mounted_at: DateTime<Utc>,
    pub(crate) closed: bool,
}

impl SessionState {
    pub(crate) fn new(
        course: Arc<CourseTree>,
        identity: Identity,
        cursor: SessionCursor,
        record: Option<ProgressRecord>,
        mirror: HashMap<LessonId, String>,
        mounted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            course,
            identity,
            cursor,
            record,
            mirror,
            pending_entries: Arc::default(),
            save_seq: 0,
            applied_saves: HashMap::new(),
            mounted_at,
            closed: false,
        }
    }
}

/// Moves the session cursor and records the new position remotely.
///
/// Cursor changes happen before the call returns. The remote patch runs on
/// the runtime and is never awaited.
#[derive(Clone)]
pub struct LessonNavigationCoordinator {
    clock: Clock,
    progress: Arc<dyn ProgressRepository>,
    runtime: Handle,
}

impl LessonNavigationCoordinator {
    #[must_use]
    pub fn new(clock: Clock, progress: Arc<dyn ProgressRepository>, runtime: Handle) -> Self {
        Self {
            clock,
            progress,
            runtime,
        }
    }

    /// Open the first slide of `lesson_id` with its best available code.
    pub(crate) fn select_lesson(
        &self,
        state: &mut SessionState,
        lesson_id: &LessonId,
    ) -> Result<(), SessionError> {
        if state.closed {
            return Err(SessionError::Closed);
        }
        if state.course.lesson(lesson_id).is_none() {
            return Err(SessionError::UnknownLesson(lesson_id.clone()));
        }

        let code = initial_code(
            &state.course,
            state.record.as_ref(),
            lesson_id,
            0,
            state.mirror.get(lesson_id).cloned(),
        );
        state.cursor.enter_lesson(lesson_id.clone(), 0, code);
        self.record_position(state);
        Ok(())
    }

    /// Move to a slide of the current lesson, clamped into range.
    pub(crate) fn select_slide(
        &self,
        state: &mut SessionState,
        index: usize,
    ) -> Result<(), SessionError> {
        if state.closed {
            return Err(SessionError::Closed);
        }
        let slide_count = state
            .course
            .lesson(state.cursor.lesson_id())
            .map_or(0, |lesson| lesson.slides.len());
        state.cursor.set_slide(index.min(slide_count.saturating_sub(1)));
        self.record_position(state);
        Ok(())
    }

    fn record_position(&self, state: &mut SessionState) {
        let at = self.clock.now();
        let lesson_id = state.cursor.lesson_id().clone();
        let slide_id = state
            .course
            .slide(&lesson_id, state.cursor.slide_index())
            .map(|slide| slide.id.clone());

        let Some(record) = state.record.as_mut() else {
            return;
        };
        let seen_before = record.record_visit(&lesson_id, slide_id.clone(), at);
        if !state.identity.tracks_progress() {
            return;
        }
        let Some(record_id) = record.id().cloned() else {
            return;
        };

        // A lesson stays pending until its first-visit patch succeeds.
        let first_visit = {
            let mut pending = lock(&*state.pending_entries);
            if seen_before && !pending.contains(&lesson_id) {
                false
            } else {
                pending.insert(lesson_id.clone());
                true
            }
        };
        let patch = if first_visit {
            TimeSpentPatch::first_visit(lesson_id.clone(), slide_id, at)
        } else {
            TimeSpentPatch::visit(lesson_id.clone(), slide_id, at)
        };
        let progress = Arc::clone(&self.progress);
        let pending = Arc::clone(&state.pending_entries);
        self.runtime.spawn(async move {
            match progress.update_time_spent(&record_id, &patch).await {
                Ok(()) if first_visit => {
                    lock(&*pending).remove(&lesson_id);
                }
                Ok(()) => {}
                Err(err) => {
                    warn!(%err, record = %record_id, lesson = %lesson_id, "position update failed");
                }
            }
        });
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ide_core::model::{
        CourseId, Lesson, ProgressId, Slide, SlideId, StudentId, UserId, Role,
    };
    use ide_core::time::fixed_now;
    use std::collections::BTreeMap;
    use storage::repository::InMemoryBackend;

    fn build_course() -> Arc<CourseTree> {
        let lesson = |id: &str, slides: usize| Lesson {
            id: LessonId::new(id),
            title: id.to_uppercase(),
            order: None,
            slides: (0..slides)
                .map(|i| Slide {
                    id: SlideId::new(format!("{id}-s{i}")),
                    title: String::new(),
                    order: i64::try_from(i).unwrap(),
                    starting_code: format!("// {id} slide {i}"),
                })
                .collect(),
        };
        Arc::new(CourseTree::new(
            CourseId::new("c1"),
            "Course",
            vec![lesson("l1", 3), lesson("l2", 2)],
        ))
    }

    fn build_state(identity: Identity, record: Option<ProgressRecord>) -> SessionState {
        SessionState::new(
            build_course(),
            identity,
            SessionCursor::new(LessonId::new("l1"), 0, "// l1 slide 0"),
            record,
            HashMap::new(),
            fixed_now(),
        )
    }

    fn coordinator() -> LessonNavigationCoordinator {
        LessonNavigationCoordinator::new(
            Clock::fixed(fixed_now()),
            Arc::new(InMemoryBackend::new()),
            Handle::current(),
        )
    }

    #[tokio::test]
    async fn select_lesson_prefers_mirrored_code() {
        let mut state = build_state(Identity::guest("guest"), None);
        state
            .mirror
            .insert(LessonId::new("l2"), "console.log('mine')".into());

        coordinator()
            .select_lesson(&mut state, &LessonId::new("l2"))
            .unwrap();

        assert_eq!(state.cursor.lesson_id(), &LessonId::new("l2"));
        assert_eq!(state.cursor.slide_index(), 0);
        assert_eq!(state.cursor.code(), "console.log('mine')");
    }

    #[tokio::test]
    async fn unknown_lesson_leaves_cursor_alone() {
        let mut state = build_state(Identity::guest("guest"), None);
        let err = coordinator()
            .select_lesson(&mut state, &LessonId::new("missing"))
            .unwrap_err();
        assert_eq!(err, SessionError::UnknownLesson(LessonId::new("missing")));
        assert_eq!(state.cursor.lesson_id(), &LessonId::new("l1"));
    }

    #[tokio::test]
    async fn slide_index_is_clamped_and_code_kept() {
        let mut state = build_state(Identity::guest("guest"), None);
        state.cursor.set_code("edited");
        coordinator().select_slide(&mut state, 99).unwrap();
        assert_eq!(state.cursor.slide_index(), 2);
        assert_eq!(state.cursor.code(), "edited");
    }

    #[tokio::test]
    async fn first_visit_opens_lesson_entry_locally() {
        let identity = Identity::account(
            "ada@example.com",
            UserId::new("u1"),
            Some("Ada"),
            Role::Student,
            Some(StudentId::new("s1")),
        );
        let record = ProgressRecord::from_persisted(
            ProgressId::new("p1"),
            StudentId::new("s1"),
            CourseId::new("c1"),
            Some(LessonId::new("l1")),
            None,
            0,
            BTreeMap::new(),
            BTreeMap::new(),
            None,
        );
        let mut state = build_state(identity, Some(record));

        coordinator()
            .select_lesson(&mut state, &LessonId::new("l2"))
            .unwrap();

        let record = state.record.as_ref().unwrap();
        assert_eq!(record.current_lesson(), Some(&LessonId::new("l2")));
        assert_eq!(record.current_slide(), Some(&SlideId::new("l2-s0")));
        assert_eq!(record.lesson(&LessonId::new("l2")).unwrap().time_spent_minutes, 0);
    }

    #[tokio::test]
    async fn closed_session_rejects_navigation() {
        let mut state = build_state(Identity::guest("guest"), None);
        state.closed = true;
        assert_eq!(
            coordinator().select_slide(&mut state, 1),
            Err(SessionError::Closed)
        );
    }
}
