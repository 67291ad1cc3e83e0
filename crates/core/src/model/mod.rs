mod course;
mod cursor;
mod identity;
mod ids;
mod mirror;
mod progress;

pub use course::{CourseTree, Lesson, Slide};
pub use cursor::{SessionCursor, initial_code, resume_point};
pub use identity::{
    GUEST_TOKEN, Identity, Owner, Role, TokenError, decode_user_token, encode_user_token, initials,
};
pub use ids::{CourseId, LessonId, ParseIdError, ProgressId, SlideId, StudentId, UserId};
pub use mirror::MirrorKey;
pub use progress::{CodeSnapshot, LessonProgress, ProgressRecord};
