use std::sync::Arc;

use ide_core::model::{CourseId, CourseTree, Lesson, Slide};
use storage::repository::{ContentRepository, SlideRecord, StorageError};

/// Loads a course with its lessons and slides into a `CourseTree`.
#[derive(Clone)]
pub struct CourseLoader {
    content: Arc<dyn ContentRepository>,
}

impl CourseLoader {
    #[must_use]
    pub fn new(content: Arc<dyn ContentRepository>) -> Self {
        Self { content }
    }

    /// Fetch the course, then every lesson's slides in turn.
    ///
    /// # Errors
    ///
    /// Returns the first `StorageError` from the content service.
    pub async fn load(&self, course_id: &CourseId) -> Result<CourseTree, StorageError> {
        let course = self.content.get_course(course_id).await?;
        let lesson_rows = self.content.list_lessons(course_id).await?;

        let mut lessons = Vec::with_capacity(lesson_rows.len());
        for row in lesson_rows {
            let slides = self.content.list_slides(&row.id).await?;
            lessons.push(Lesson {
                id: row.id,
                title: row.title,
                order: row.order,
                slides: slides.into_iter().map(slide_from_record).collect(),
            });
        }

        tracing::debug!(course = %course.id, lessons = lessons.len(), "course loaded");
        Ok(CourseTree::new(course.id, course.title, lessons))
    }
}

fn slide_from_record(record: SlideRecord) -> Slide {
    Slide {
        id: record.id,
        title: record.title,
        order: record.order,
        starting_code: record.starting_code.unwrap_or_default(),
    }
}
