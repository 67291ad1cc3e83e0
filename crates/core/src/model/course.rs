use crate::model::{CourseId, LessonId, SlideId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slide {
    pub id: SlideId,
    pub title: String,
    pub order: i64,
    pub starting_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lesson {
    pub id: LessonId,
    pub title: String,
    pub order: Option<i64>,
    pub slides: Vec<Slide>,
}

/// Hydrated course content, ordered for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseTree {
    id: CourseId,
    title: String,
    lessons: Vec<Lesson>,
}

impl CourseTree {
    /// Build a tree, sorting slides by `order` and lessons by `order` when
    /// every lesson has one. Sorting is stable, so ties keep service order.
    #[must_use]
    pub fn new(id: CourseId, title: impl Into<String>, mut lessons: Vec<Lesson>) -> Self {
        for lesson in &mut lessons {
            lesson.slides.sort_by_key(|s| s.order);
        }
        if lessons.iter().all(|l| l.order.is_some()) {
            lessons.sort_by_key(|l| l.order);
        }
        Self {
            id,
            title: title.into(),
            lessons,
        }
    }

    #[must_use]
    pub fn id(&self) -> &CourseId {
        &self.id
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn lessons(&self) -> &[Lesson] {
        &self.lessons
    }

    #[must_use]
    pub fn first_lesson(&self) -> Option<&Lesson> {
        self.lessons.first()
    }

    #[must_use]
    pub fn lesson(&self, id: &LessonId) -> Option<&Lesson> {
        self.lessons.iter().find(|l| &l.id == id)
    }

    #[must_use]
    pub fn slide(&self, lesson_id: &LessonId, index: usize) -> Option<&Slide> {
        self.lesson(lesson_id).and_then(|l| l.slides.get(index))
    }

    /// Position of a slide within its lesson.
    #[must_use]
    pub fn slide_index(&self, lesson_id: &LessonId, slide_id: &SlideId) -> Option<usize> {
        self.lesson(lesson_id)
            .and_then(|l| l.slides.iter().position(|s| &s.id == slide_id))
    }

    /// Starting code of a slide, or empty when the slide has none.
    #[must_use]
    pub fn starting_code(&self, lesson_id: &LessonId, index: usize) -> &str {
        self.slide(lesson_id, index)
            .map_or("", |s| s.starting_code.as_str())
    }
}
