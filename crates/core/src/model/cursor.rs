use crate::model::{CourseTree, LessonId, ProgressRecord};

/// In-memory pointer to what the learner is looking at and editing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCursor {
    lesson_id: LessonId,
    slide_index: usize,
    code_buffer: String,
}

impl SessionCursor {
    #[must_use]
    pub fn new(lesson_id: LessonId, slide_index: usize, code_buffer: impl Into<String>) -> Self {
        Self {
            lesson_id,
            slide_index,
            code_buffer: code_buffer.into(),
        }
    }

    #[must_use]
    pub fn lesson_id(&self) -> &LessonId {
        &self.lesson_id
    }

    #[must_use]
    pub fn slide_index(&self) -> usize {
        self.slide_index
    }

    #[must_use]
    pub fn code(&self) -> &str {
        &self.code_buffer
    }

    pub fn set_code(&mut self, code: impl Into<String>) {
        self.code_buffer = code.into();
    }

    pub fn set_slide(&mut self, index: usize) {
        self.slide_index = index;
    }

    /// Jump to another lesson, replacing the buffer.
    pub fn enter_lesson(
        &mut self,
        lesson_id: LessonId,
        slide_index: usize,
        code: impl Into<String>,
    ) {
        self.lesson_id = lesson_id;
        self.slide_index = slide_index;
        self.code_buffer = code.into();
    }
}

/// Where a freshly mounted session should open.
///
/// The record's lesson and slide win when they still exist in the course;
/// otherwise the first lesson's first slide. `None` for a course without
/// lessons.
#[must_use]
pub fn resume_point(
    tree: &CourseTree,
    record: Option<&ProgressRecord>,
) -> Option<(LessonId, usize)> {
    let from_record = record.and_then(|rec| {
        let lesson = rec.current_lesson().and_then(|id| tree.lesson(id))?;
        let slide = rec
            .current_slide()
            .and_then(|slide_id| tree.slide_index(&lesson.id, slide_id))
            .unwrap_or(0);
        Some((lesson.id.clone(), slide))
    });

    from_record.or_else(|| tree.first_lesson().map(|l| (l.id.clone(), 0)))
}

/// Pick the buffer for a lesson: local mirror, then the record's saved code,
/// then the slide's starting code.
#[must_use]
pub fn initial_code(
    tree: &CourseTree,
    record: Option<&ProgressRecord>,
    lesson_id: &LessonId,
    slide_index: usize,
    mirrored: Option<String>,
) -> String {
    if let Some(code) = mirrored {
        return code;
    }
    if let Some(snapshot) = record.and_then(|r| r.code_for(lesson_id)) {
        return snapshot.code.clone();
    }
    tree.starting_code(lesson_id, slide_index).to_owned()
}
