use std::fmt;

use crate::model::{CourseId, LessonId, Owner};

/// Key of a local code mirror entry: `code-{course}-{lesson}[-{student}]`.
///
/// Guest entries carry no student suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MirrorKey {
    course_id: CourseId,
    lesson_id: LessonId,
    owner: Owner,
}

impl MirrorKey {
    #[must_use]
    pub fn new(course_id: CourseId, lesson_id: LessonId, owner: Owner) -> Self {
        Self {
            course_id,
            lesson_id,
            owner,
        }
    }

    #[must_use]
    pub fn lesson_id(&self) -> &LessonId {
        &self.lesson_id
    }
}

impl fmt::Display for MirrorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code-{}-{}", self.course_id, self.lesson_id)?;
        if let Owner::Student(id) = &self.owner {
            write!(f, "-{id}")?;
        }
        Ok(())
    }
}
