use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use ide_core::model::{CourseId, LessonId, ProgressRecord, StudentId};
use storage::repository::{NewProgressRecord, ProgressRepository, StorageError};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::error::SyncError;

type PairKey = (StudentId, CourseId);

/// Returns the one progress record of a (student, course) pair, creating it
/// when the backend has none.
///
/// Resolutions for the same pair are serialised, so concurrent callers in
/// this process issue at most one create. A `Conflict` from the backend is
/// read as "created elsewhere" and answered with a re-fetch.
#[derive(Clone)]
pub struct ProgressRecordResolver {
    progress: Arc<dyn ProgressRepository>,
    in_flight: Arc<Mutex<HashMap<PairKey, Arc<AsyncMutex<()>>>>>,
}

impl ProgressRecordResolver {
    #[must_use]
    pub fn new(progress: Arc<dyn ProgressRepository>) -> Self {
        Self {
            progress,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fetch or create the record for the pair.
    ///
    /// `first_lesson` becomes the current lesson of a newly created record.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::ResolutionFailed` for any backend failure other
    /// than "absent", and when the record is still absent after a create.
    pub async fn resolve(
        &self,
        student_id: &StudentId,
        course_id: &CourseId,
        first_lesson: Option<&LessonId>,
    ) -> Result<ProgressRecord, SyncError> {
        let key = (student_id.clone(), course_id.clone());
        let gate = self.gate(&key);
        let result = {
            let _held = gate.lock().await;
            self.resolve_unguarded(student_id, course_id, first_lesson)
                .await
        };
        drop(gate);
        self.release(&key);
        result
    }

    async fn resolve_unguarded(
        &self,
        student_id: &StudentId,
        course_id: &CourseId,
        first_lesson: Option<&LessonId>,
    ) -> Result<ProgressRecord, SyncError> {
        match self
            .progress
            .get_by_student_and_course(student_id, course_id)
            .await
        {
            Ok(record) => return with_id(record),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(SyncError::ResolutionFailed(err)),
        }

        let new_record = NewProgressRecord {
            student_id: student_id.clone(),
            course_id: course_id.clone(),
            current_lesson: first_lesson.cloned(),
        };
        match self.progress.create(&new_record).await {
            Ok(()) => {
                debug!(student = %student_id, course = %course_id, "progress record created");
            }
            Err(StorageError::Conflict) => {
                debug!(
                    student = %student_id,
                    course = %course_id,
                    "progress record created elsewhere"
                );
            }
            Err(err) => return Err(SyncError::ResolutionFailed(err)),
        }

        let record = self
            .progress
            .get_by_student_and_course(student_id, course_id)
            .await
            .map_err(SyncError::ResolutionFailed)?;
        with_id(record)
    }

    fn gate(&self, key: &PairKey) -> Arc<AsyncMutex<()>> {
        let mut map = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(map.entry(key.clone()).or_default())
    }

    fn release(&self, key: &PairKey) {
        let mut map = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if map.get(key).is_some_and(|gate| Arc::strong_count(gate) == 1) {
            map.remove(key);
        }
    }
}

fn with_id(record: ProgressRecord) -> Result<ProgressRecord, SyncError> {
    if record.id().is_some() {
        Ok(record)
    } else {
        Err(SyncError::ResolutionFailed(StorageError::Serialization(
            "progress record without id".into(),
        )))
    }
}
