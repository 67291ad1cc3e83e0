//! JSON shapes exchanged with the course backend and their mapping to records.

use chrono::{DateTime, Utc};
use ide_core::Language;
use ide_core::model::{
    CodeSnapshot, CourseId, LessonId, LessonProgress, ProgressId, ProgressRecord, Role, SlideId,
    StudentId, UserId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::repository::{
    CompleteLessonRecord, CourseRecord, LessonRecord, NewProgressRecord, SaveCodeRecord,
    SlideRecord, StudentRecord, TimeSpentPatch, UserRecord,
};

/// Document id read from `_id`, falling back to `id`.
///
/// Documents serialised with virtuals carry both keys.
#[derive(Debug, Deserialize)]
#[serde(try_from = "RawDocId")]
pub(crate) struct DocId(String);

#[derive(Debug, Deserialize)]
struct RawDocId {
    #[serde(rename = "_id", default)]
    mongo_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

impl TryFrom<RawDocId> for DocId {
    type Error = &'static str;

    fn try_from(raw: RawDocId) -> Result<Self, Self::Error> {
        raw.mongo_id.or(raw.id).map(Self).ok_or("missing field `_id`")
    }
}

/// A reference that the backend may send either as a bare id or populated.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum WireRef {
    Id(String),
    Doc(DocId),
}

impl WireRef {
    fn into_id(self) -> String {
        match self {
            WireRef::Id(id) | WireRef::Doc(DocId(id)) => id,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireCourse {
    #[serde(flatten)]
    id: DocId,
    #[serde(default, alias = "courseTitle")]
    title: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireLesson {
    #[serde(flatten)]
    id: DocId,
    #[serde(default)]
    title: String,
    #[serde(default)]
    order: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireSlide {
    #[serde(flatten)]
    id: DocId,
    #[serde(default)]
    title: String,
    #[serde(default)]
    order: Option<i64>,
    #[serde(default)]
    starting_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireUser {
    #[serde(flatten)]
    id: DocId,
    email: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    role: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireStudent {
    #[serde(flatten)]
    id: DocId,
    #[serde(default)]
    user_id: Option<WireRef>,
    #[serde(default)]
    email: Option<String>,
}

/// Total minutes, or minutes bucketed by week key.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum WireTimeSpent {
    Total(u64),
    Weekly(BTreeMap<String, u64>),
}

impl WireTimeSpent {
    fn total_minutes(&self) -> u32 {
        let total = match self {
            WireTimeSpent::Total(m) => *m,
            WireTimeSpent::Weekly(weeks) => weeks
                .values()
                .fold(0_u64, |acc, m| acc.saturating_add(*m)),
        };
        u32::try_from(total).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireLessonEntry {
    #[serde(default)]
    is_completed: bool,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    time_spent: u32,
    #[serde(default)]
    last_accessed: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireCode {
    #[serde(default)]
    language: String,
    #[serde(default)]
    code: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireProgress {
    #[serde(flatten)]
    id: DocId,
    student_id: WireRef,
    course_id: WireRef,
    #[serde(default)]
    current_lesson: Option<WireRef>,
    #[serde(default)]
    current_slide: Option<WireRef>,
    #[serde(default)]
    time_spent: Option<WireTimeSpent>,
    #[serde(default)]
    completed_lessons: BTreeMap<String, WireLessonEntry>,
    #[serde(default)]
    lesson_code: BTreeMap<String, WireCode>,
    #[serde(default)]
    last_accessed: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireCreateProgress<'a> {
    student_id: &'a str,
    course_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_lesson: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireCompleteLesson<'a> {
    lesson_id: &'a str,
    time_spent: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireSaveCode<'a> {
    lesson_id: &'a str,
    language: &'static str,
    code: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireTimeSpentPatch<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    minutes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lesson_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    slide_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_accessed: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireActivity {
    pub(crate) last_active_at: DateTime<Utc>,
}

// ─── Mapping ───────────────────────────────────────────────────────────────────

impl From<WireCourse> for CourseRecord {
    fn from(w: WireCourse) -> Self {
        Self {
            id: CourseId::new(w.id.0),
            title: w.title,
        }
    }
}

impl From<WireLesson> for LessonRecord {
    fn from(w: WireLesson) -> Self {
        Self {
            id: LessonId::new(w.id.0),
            title: w.title,
            order: w.order,
        }
    }
}

impl From<WireSlide> for SlideRecord {
    fn from(w: WireSlide) -> Self {
        Self {
            id: SlideId::new(w.id.0),
            title: w.title,
            order: w.order.unwrap_or(0),
            starting_code: w.starting_code,
        }
    }
}

fn parse_role(raw: &str) -> Role {
    match raw.trim().to_ascii_lowercase().as_str() {
        "teacher" => Role::Teacher,
        "admin" => Role::Admin,
        "parent" => Role::Parent,
        _ => Role::Student,
    }
}

impl From<WireUser> for UserRecord {
    fn from(w: WireUser) -> Self {
        Self {
            id: UserId::new(w.id.0),
            email: w.email,
            name: w.name,
            role: w.role.as_deref().map(parse_role),
        }
    }
}

impl WireStudent {
    pub(crate) fn into_record(self, requested_email: &str) -> StudentRecord {
        StudentRecord {
            id: StudentId::new(self.id.0),
            user_id: self.user_id.map(|r| UserId::new(r.into_id())),
            email: self.email.unwrap_or_else(|| requested_email.to_owned()),
        }
    }
}

impl From<WireProgress> for ProgressRecord {
    fn from(w: WireProgress) -> Self {
        let fallback_at = w.updated_at;
        let lessons = w
            .completed_lessons
            .into_iter()
            .map(|(lesson, entry)| {
                let completed_at = if entry.is_completed {
                    entry.completed_at.or(entry.last_accessed).or(fallback_at)
                } else {
                    None
                };
                (
                    LessonId::new(lesson),
                    LessonProgress {
                        completed_at,
                        time_spent_minutes: entry.time_spent,
                        last_accessed: entry.last_accessed,
                    },
                )
            })
            .collect();
        let code = w
            .lesson_code
            .into_iter()
            .map(|(lesson, snapshot)| {
                let language = Language::from_tag(&snapshot.language)
                    .unwrap_or_else(|| ide_core::detect(&snapshot.code));
                (
                    LessonId::new(lesson),
                    CodeSnapshot {
                        language,
                        code: snapshot.code,
                        saved_at: snapshot.timestamp.or(fallback_at).unwrap_or_default(),
                    },
                )
            })
            .collect();

        ProgressRecord::from_persisted(
            ProgressId::new(w.id.0),
            StudentId::new(w.student_id.into_id()),
            CourseId::new(w.course_id.into_id()),
            w.current_lesson.map(|r| LessonId::new(r.into_id())),
            w.current_slide.map(|r| SlideId::new(r.into_id())),
            w.time_spent.as_ref().map_or(0, WireTimeSpent::total_minutes),
            lessons,
            code,
            w.last_accessed.or(fallback_at),
        )
    }
}

impl<'a> From<&'a NewProgressRecord> for WireCreateProgress<'a> {
    fn from(r: &'a NewProgressRecord) -> Self {
        Self {
            student_id: r.student_id.as_str(),
            course_id: r.course_id.as_str(),
            current_lesson: r.current_lesson.as_ref().map(LessonId::as_str),
        }
    }
}

impl<'a> From<&'a CompleteLessonRecord> for WireCompleteLesson<'a> {
    fn from(r: &'a CompleteLessonRecord) -> Self {
        Self {
            lesson_id: r.lesson_id.as_str(),
            time_spent: r.time_spent_minutes,
        }
    }
}

impl<'a> From<&'a SaveCodeRecord> for WireSaveCode<'a> {
    fn from(r: &'a SaveCodeRecord) -> Self {
        Self {
            lesson_id: r.lesson_id.as_str(),
            language: r.language.as_str(),
            code: &r.code,
        }
    }
}

impl<'a> From<&'a TimeSpentPatch> for WireTimeSpentPatch<'a> {
    fn from(p: &'a TimeSpentPatch) -> Self {
        Self {
            minutes: p.minutes,
            lesson_id: p.lesson_id.as_ref().map(LessonId::as_str),
            slide_id: p.slide_id.as_ref().map(SlideId::as_str),
            last_accessed: p.last_accessed,
        }
    }
}
