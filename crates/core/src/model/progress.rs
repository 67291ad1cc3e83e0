use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::language::Language;
use crate::model::{CourseId, LessonId, Owner, ProgressId, SlideId, StudentId};

/// Per-lesson progress entry. An entry with `completed_at` is a completion.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LessonProgress {
    pub completed_at: Option<DateTime<Utc>>,
    pub time_spent_minutes: u32,
    pub last_accessed: Option<DateTime<Utc>>,
}

impl LessonProgress {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Last saved code for a lesson.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeSnapshot {
    pub language: Language,
    pub code: String,
    pub saved_at: DateTime<Utc>,
}

/// A student's progress through one course.
///
/// Student-owned records mirror the single remote record for the
/// (student, course) pair and always carry its id. Guest records live only
/// in memory and never have one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressRecord {
    id: Option<ProgressId>,
    owner: Owner,
    course_id: CourseId,
    current_lesson: Option<LessonId>,
    current_slide: Option<SlideId>,
    time_spent_minutes: u32,
    lessons: BTreeMap<LessonId, LessonProgress>,
    code: BTreeMap<LessonId, CodeSnapshot>,
    last_accessed: Option<DateTime<Utc>>,
}

impl ProgressRecord {
    /// Local-only record for a guest session.
    #[must_use]
    pub fn guest(course_id: CourseId, current_lesson: Option<LessonId>) -> Self {
        Self {
            id: None,
            owner: Owner::Guest,
            course_id,
            current_lesson,
            current_slide: None,
            time_spent_minutes: 0,
            lessons: BTreeMap::new(),
            code: BTreeMap::new(),
            last_accessed: None,
        }
    }

    /// Rehydrate a student record fetched from the progress service.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn from_persisted(
        id: ProgressId,
        student_id: StudentId,
        course_id: CourseId,
        current_lesson: Option<LessonId>,
        current_slide: Option<SlideId>,
        time_spent_minutes: u32,
        lessons: BTreeMap<LessonId, LessonProgress>,
        code: BTreeMap<LessonId, CodeSnapshot>,
        last_accessed: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: Some(id),
            owner: Owner::Student(student_id),
            course_id,
            current_lesson,
            current_slide,
            time_spent_minutes,
            lessons,
            code,
            last_accessed,
        }
    }

    /// Remote id; `None` for guest records.
    #[must_use]
    pub fn id(&self) -> Option<&ProgressId> {
        self.id.as_ref()
    }

    #[must_use]
    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    #[must_use]
    pub fn course_id(&self) -> &CourseId {
        &self.course_id
    }

    #[must_use]
    pub fn current_lesson(&self) -> Option<&LessonId> {
        self.current_lesson.as_ref()
    }

    #[must_use]
    pub fn current_slide(&self) -> Option<&SlideId> {
        self.current_slide.as_ref()
    }

    #[must_use]
    pub fn time_spent_minutes(&self) -> u32 {
        self.time_spent_minutes
    }

    #[must_use]
    pub fn lessons(&self) -> &BTreeMap<LessonId, LessonProgress> {
        &self.lessons
    }

    #[must_use]
    pub fn lesson(&self, lesson_id: &LessonId) -> Option<&LessonProgress> {
        self.lessons.get(lesson_id)
    }

    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.lessons.values().filter(|l| l.is_completed()).count()
    }

    #[must_use]
    pub fn code_for(&self, lesson_id: &LessonId) -> Option<&CodeSnapshot> {
        self.code.get(lesson_id)
    }

    #[must_use]
    pub fn last_accessed(&self) -> Option<DateTime<Utc>> {
        self.last_accessed
    }

    /// Move the record's cursor and stamp both the lesson and the record.
    ///
    /// Returns true when the lesson already had an entry.
    pub fn record_visit(
        &mut self,
        lesson_id: &LessonId,
        slide_id: Option<SlideId>,
        at: DateTime<Utc>,
    ) -> bool {
        self.current_lesson = Some(lesson_id.clone());
        self.current_slide = slide_id;
        self.last_accessed = Some(at);
        match self.lessons.get_mut(lesson_id) {
            Some(entry) => {
                entry.last_accessed = Some(at);
                true
            }
            None => {
                self.lessons.insert(
                    lesson_id.clone(),
                    LessonProgress {
                        completed_at: None,
                        time_spent_minutes: 0,
                        last_accessed: Some(at),
                    },
                );
                false
            }
        }
    }

    /// Mark a lesson complete. A later completion replaces the time spent.
    pub fn mark_completed(&mut self, lesson_id: &LessonId, minutes: u32, at: DateTime<Utc>) {
        let entry = self.lessons.entry(lesson_id.clone()).or_default();
        entry.completed_at = Some(at);
        entry.time_spent_minutes = minutes;
        entry.last_accessed = Some(at);
        self.last_accessed = Some(at);
    }

    pub fn store_code(&mut self, lesson_id: &LessonId, snapshot: CodeSnapshot) {
        self.last_accessed = Some(snapshot.saved_at);
        self.code.insert(lesson_id.clone(), snapshot);
    }

    pub fn add_minutes(&mut self, minutes: u32) {
        self.time_spent_minutes = self.time_spent_minutes.saturating_add(minutes);
    }
}
