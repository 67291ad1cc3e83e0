use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ide_core::Clock;
use ide_core::Language;
use ide_core::model::{
    CodeSnapshot, CourseId, LessonId, ProgressId, ProgressRecord, Role, SlideId, StudentId, UserId,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("conflict")]
    Conflict,

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// True for the 404-class outcome that means "does not exist".
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound)
    }
}

// ─── Records ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseRecord {
    pub id: CourseId,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LessonRecord {
    pub id: LessonId,
    pub title: String,
    pub order: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlideRecord {
    pub id: SlideId,
    pub title: String,
    pub order: i64,
    pub starting_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    pub email: String,
    pub name: Option<String>,
    pub role: Option<Role>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentRecord {
    pub id: StudentId,
    pub user_id: Option<UserId>,
    pub email: String,
}

/// Payload for creating the progress record of a (student, course) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProgressRecord {
    pub student_id: StudentId,
    pub course_id: CourseId,
    pub current_lesson: Option<LessonId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteLessonRecord {
    pub lesson_id: LessonId,
    pub time_spent_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveCodeRecord {
    pub lesson_id: LessonId,
    pub language: Language,
    pub code: String,
}

/// Partial update sent to the time-spent endpoint.
///
/// Carries either a minutes delta, a lesson/slide visit, or both.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TimeSpentPatch {
    pub minutes: Option<u32>,
    pub lesson_id: Option<LessonId>,
    pub slide_id: Option<SlideId>,
    pub last_accessed: Option<DateTime<Utc>>,
}

impl TimeSpentPatch {
    #[must_use]
    pub fn minutes(minutes: u32) -> Self {
        Self {
            minutes: Some(minutes),
            ..Self::default()
        }
    }

    /// Stamp a visit to an already tracked lesson.
    #[must_use]
    pub fn visit(lesson_id: LessonId, slide_id: Option<SlideId>, at: DateTime<Utc>) -> Self {
        Self {
            minutes: None,
            lesson_id: Some(lesson_id),
            slide_id,
            last_accessed: Some(at),
        }
    }

    /// Open a zero-progress entry for a lesson seen for the first time.
    #[must_use]
    pub fn first_visit(lesson_id: LessonId, slide_id: Option<SlideId>, at: DateTime<Utc>) -> Self {
        Self {
            minutes: Some(0),
            ..Self::visit(lesson_id, slide_id, at)
        }
    }
}

// ─── Contracts ─────────────────────────────────────────────────────────────────

/// Read-only course content.
#[async_trait]
pub trait ContentRepository: Send + Sync {
    /// Fetch a course by ID.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if missing, or other storage errors.
    async fn get_course(&self, id: &CourseId) -> Result<CourseRecord, StorageError>;

    /// List lessons of a course in service order.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the lessons cannot be fetched.
    async fn list_lessons(&self, course_id: &CourseId) -> Result<Vec<LessonRecord>, StorageError>;

    /// List slides of a lesson in service order.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the slides cannot be fetched.
    async fn list_slides(&self, lesson_id: &LessonId) -> Result<Vec<SlideRecord>, StorageError>;
}

/// User and student lookups.
#[async_trait]
pub trait IdentityRepository: Send + Sync {
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if no user has this email.
    async fn get_user_by_email(&self, email: &str) -> Result<UserRecord, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if no student has this email.
    async fn get_student_by_email(&self, email: &str) -> Result<StudentRecord, StorageError>;

    /// Record that a student is active right now.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the ping is rejected.
    async fn ping_activity(&self, student_id: &StudentId) -> Result<(), StorageError>;
}

/// Remote progress records, one per (student, course).
#[async_trait]
pub trait ProgressRepository: Send + Sync {
    /// Fetch the record for a (student, course) pair.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the pair has no record yet.
    async fn get_by_student_and_course(
        &self,
        student_id: &StudentId,
        course_id: &CourseId,
    ) -> Result<ProgressRecord, StorageError>;

    /// Create the record for a pair.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Conflict` if the backend already holds one.
    async fn create(&self, record: &NewProgressRecord) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` if the update is rejected.
    async fn complete_lesson(
        &self,
        id: &ProgressId,
        completion: &CompleteLessonRecord,
    ) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` if the update is rejected.
    async fn save_code(&self, id: &ProgressId, code: &SaveCodeRecord) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` if the update is rejected.
    async fn update_time_spent(
        &self,
        id: &ProgressId,
        patch: &TimeSpentPatch,
    ) -> Result<(), StorageError>;
}

/// Durable key → string store local to the device.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// # Errors
    ///
    /// Returns `StorageError` if the store is unavailable.
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` if the value cannot be written.
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

// ─── In-memory backend ─────────────────────────────────────────────────────────

#[derive(Default)]
struct BackendState {
    courses: HashMap<CourseId, CourseRecord>,
    lessons: HashMap<CourseId, Vec<LessonRecord>>,
    slides: HashMap<LessonId, Vec<SlideRecord>>,
    users: HashMap<String, UserRecord>,
    students: HashMap<String, StudentRecord>,
    progress: HashMap<(StudentId, CourseId), ProgressRecord>,
    pings: Vec<StudentId>,
}

/// In-memory stand-in for the remote services, for tests and offline demos.
///
/// `create` rejects a second record for the same pair with `Conflict`, the
/// way a backend with a unique index would.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    clock: Clock,
    state: Arc<Mutex<BackendState>>,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BackendState>, StorageError> {
        self.state
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    /// Seed a course with its lessons and slides.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Connection` if the state lock is poisoned.
    pub fn insert_course(
        &self,
        course: CourseRecord,
        lessons: Vec<(LessonRecord, Vec<SlideRecord>)>,
    ) -> Result<(), StorageError> {
        let mut guard = self.lock()?;
        let mut lesson_rows = Vec::with_capacity(lessons.len());
        for (lesson, slides) in lessons {
            guard.slides.insert(lesson.id.clone(), slides);
            lesson_rows.push(lesson);
        }
        guard.lessons.insert(course.id.clone(), lesson_rows);
        guard.courses.insert(course.id.clone(), course);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `StorageError::Connection` if the state lock is poisoned.
    pub fn insert_user(&self, user: UserRecord) -> Result<(), StorageError> {
        self.lock()?.users.insert(user.email.clone(), user);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `StorageError::Connection` if the state lock is poisoned.
    pub fn insert_student(&self, student: StudentRecord) -> Result<(), StorageError> {
        self.lock()?.students.insert(student.email.clone(), student);
        Ok(())
    }

    /// All stored progress records.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Connection` if the state lock is poisoned.
    pub fn progress_records(&self) -> Result<Vec<ProgressRecord>, StorageError> {
        Ok(self.lock()?.progress.values().cloned().collect())
    }

    /// Students that pinged activity, in call order.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Connection` if the state lock is poisoned.
    pub fn pings(&self) -> Result<Vec<StudentId>, StorageError> {
        Ok(self.lock()?.pings.clone())
    }

    fn with_record<F>(&self, id: &ProgressId, f: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut ProgressRecord),
    {
        let mut guard = self.lock()?;
        let record = guard
            .progress
            .values_mut()
            .find(|r| r.id() == Some(id))
            .ok_or(StorageError::NotFound)?;
        f(record);
        Ok(())
    }
}

#[async_trait]
impl ContentRepository for InMemoryBackend {
    async fn get_course(&self, id: &CourseId) -> Result<CourseRecord, StorageError> {
        self.lock()?.courses.get(id).cloned().ok_or(StorageError::NotFound)
    }

    async fn list_lessons(&self, course_id: &CourseId) -> Result<Vec<LessonRecord>, StorageError> {
        Ok(self.lock()?.lessons.get(course_id).cloned().unwrap_or_default())
    }

    async fn list_slides(&self, lesson_id: &LessonId) -> Result<Vec<SlideRecord>, StorageError> {
        Ok(self.lock()?.slides.get(lesson_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl IdentityRepository for InMemoryBackend {
    async fn get_user_by_email(&self, email: &str) -> Result<UserRecord, StorageError> {
        self.lock()?.users.get(email).cloned().ok_or(StorageError::NotFound)
    }

    async fn get_student_by_email(&self, email: &str) -> Result<StudentRecord, StorageError> {
        self.lock()?
            .students
            .get(email)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn ping_activity(&self, student_id: &StudentId) -> Result<(), StorageError> {
        self.lock()?.pings.push(student_id.clone());
        Ok(())
    }
}

#[async_trait]
impl ProgressRepository for InMemoryBackend {
    async fn get_by_student_and_course(
        &self,
        student_id: &StudentId,
        course_id: &CourseId,
    ) -> Result<ProgressRecord, StorageError> {
        self.lock()?
            .progress
            .get(&(student_id.clone(), course_id.clone()))
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn create(&self, record: &NewProgressRecord) -> Result<(), StorageError> {
        let mut guard = self.lock()?;
        let key = (record.student_id.clone(), record.course_id.clone());
        if guard.progress.contains_key(&key) {
            return Err(StorageError::Conflict);
        }
        let created = ProgressRecord::from_persisted(
            ProgressId::new(uuid::Uuid::new_v4().to_string()),
            record.student_id.clone(),
            record.course_id.clone(),
            record.current_lesson.clone(),
            None,
            0,
            Default::default(),
            Default::default(),
            Some(self.clock.now()),
        );
        guard.progress.insert(key, created);
        Ok(())
    }

    async fn complete_lesson(
        &self,
        id: &ProgressId,
        completion: &CompleteLessonRecord,
    ) -> Result<(), StorageError> {
        let now = self.clock.now();
        self.with_record(id, |record| {
            record.mark_completed(&completion.lesson_id, completion.time_spent_minutes, now);
        })
    }

    async fn save_code(&self, id: &ProgressId, code: &SaveCodeRecord) -> Result<(), StorageError> {
        let snapshot = CodeSnapshot {
            language: code.language,
            code: code.code.clone(),
            saved_at: self.clock.now(),
        };
        self.with_record(id, |record| record.store_code(&code.lesson_id, snapshot))
    }

    async fn update_time_spent(
        &self,
        id: &ProgressId,
        patch: &TimeSpentPatch,
    ) -> Result<(), StorageError> {
        let at = patch.last_accessed.unwrap_or_else(|| self.clock.now());
        self.with_record(id, |record| {
            if let Some(lesson_id) = &patch.lesson_id {
                record.record_visit(lesson_id, patch.slide_id.clone(), at);
            }
            if let Some(minutes) = patch.minutes {
                record.add_minutes(minutes);
            }
        })
    }
}

/// In-memory local store.
#[derive(Clone, Default)]
pub struct InMemoryLocalStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl InMemoryLocalStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalStore for InMemoryLocalStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let guard = self
            .entries
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(guard.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        guard.insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

/// Aggregates the collaborators behind trait objects for easy backend swapping.
#[derive(Clone)]
pub struct Storage {
    pub content: Arc<dyn ContentRepository>,
    pub identity: Arc<dyn IdentityRepository>,
    pub progress: Arc<dyn ProgressRepository>,
    pub local: Arc<dyn LocalStore>,
}

impl Storage {
    #[must_use]
    pub fn in_memory() -> Self {
        Self::from_backend(InMemoryBackend::new(), InMemoryLocalStore::new())
    }

    /// Wire every remote contract to one in-memory backend.
    #[must_use]
    pub fn from_backend(backend: InMemoryBackend, local: InMemoryLocalStore) -> Self {
        let content: Arc<dyn ContentRepository> = Arc::new(backend.clone());
        let identity: Arc<dyn IdentityRepository> = Arc::new(backend.clone());
        let progress: Arc<dyn ProgressRepository> = Arc::new(backend);
        let local: Arc<dyn LocalStore> = Arc::new(local);
        Self {
            content,
            identity,
            progress,
            local,
        }
    }
}
