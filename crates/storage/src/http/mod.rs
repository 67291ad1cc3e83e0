use async_trait::async_trait;
use chrono::Utc;
use ide_core::model::{CourseId, LessonId, ProgressId, ProgressRecord, StudentId};
use reqwest::{Client, Method, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

use crate::repository::{
    CompleteLessonRecord, ContentRepository, CourseRecord, IdentityRepository, LessonRecord,
    NewProgressRecord, ProgressRepository, SaveCodeRecord, SlideRecord, StorageError,
    StudentRecord, TimeSpentPatch, UserRecord,
};

mod wire;

use wire::{
    WireActivity, WireCompleteLesson, WireCourse, WireCreateProgress, WireLesson, WireProgress,
    WireSaveCode, WireSlide, WireStudent, WireTimeSpentPatch, WireUser,
};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HttpInitError {
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
}

/// JSON-over-HTTP client for the course backend.
///
/// Implements every remote contract against one base URL. No timeout is
/// configured beyond the client default.
#[derive(Clone, Debug)]
pub struct HttpBackend {
    client: Client,
    base_url: Url,
}

impl HttpBackend {
    /// # Errors
    ///
    /// Returns `HttpInitError::InvalidBaseUrl` if `base_url` is not an
    /// absolute http(s) URL.
    pub fn new(base_url: &str) -> Result<Self, HttpInitError> {
        let parsed = Url::parse(base_url.trim())
            .map_err(|_| HttpInitError::InvalidBaseUrl(base_url.to_owned()))?;
        if parsed.cannot_be_a_base() || !matches!(parsed.scheme(), "http" | "https") {
            return Err(HttpInitError::InvalidBaseUrl(base_url.to_owned()));
        }
        Ok(Self {
            client: Client::new(),
            base_url: parsed,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, StorageError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| StorageError::Connection(format!("bad base url {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn endpoint_with_query(
        &self,
        segments: &[&str],
        key: &str,
        value: &str,
    ) -> Result<Url, StorageError> {
        let mut url = self.endpoint(segments)?;
        url.query_pairs_mut().append_pair(key, value);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, StorageError> {
        tracing::debug!(%url, "GET");
        let response = self.client.get(url).send().await.map_err(connection)?;
        let body = check_status(response)?.bytes().await.map_err(connection)?;
        serde_json::from_slice(&body).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    async fn send_json<B: Serialize + Sync>(
        &self,
        method: Method,
        url: Url,
        body: &B,
    ) -> Result<(), StorageError> {
        tracing::debug!(%method, %url, "send");
        let response = self
            .client
            .request(method, url)
            .json(body)
            .send()
            .await
            .map_err(connection)?;
        check_status(response)?;
        Ok(())
    }
}

fn connection(err: reqwest::Error) -> StorageError {
    StorageError::Connection(err.to_string())
}

fn check_status(response: Response) -> Result<Response, StorageError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND => Err(StorageError::NotFound),
        StatusCode::CONFLICT => Err(StorageError::Conflict),
        status => Err(StorageError::Status(status.as_u16())),
    }
}

#[async_trait]
impl ContentRepository for HttpBackend {
    async fn get_course(&self, id: &CourseId) -> Result<CourseRecord, StorageError> {
        let url = self.endpoint(&["courses", id.as_str()])?;
        let course: WireCourse = self.get_json(url).await?;
        Ok(course.into())
    }

    async fn list_lessons(&self, course_id: &CourseId) -> Result<Vec<LessonRecord>, StorageError> {
        let url = self.endpoint_with_query(&["lessons"], "courseId", course_id.as_str())?;
        let lessons: Vec<WireLesson> = self.get_json(url).await?;
        Ok(lessons.into_iter().map(Into::into).collect())
    }

    async fn list_slides(&self, lesson_id: &LessonId) -> Result<Vec<SlideRecord>, StorageError> {
        let url = self.endpoint_with_query(&["slides"], "lessonId", lesson_id.as_str())?;
        let slides: Vec<WireSlide> = self.get_json(url).await?;
        Ok(slides.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl IdentityRepository for HttpBackend {
    async fn get_user_by_email(&self, email: &str) -> Result<UserRecord, StorageError> {
        let url = self.endpoint_with_query(&["users", "by-email"], "email", email)?;
        let user: WireUser = self.get_json(url).await?;
        Ok(user.into())
    }

    async fn get_student_by_email(&self, email: &str) -> Result<StudentRecord, StorageError> {
        let url = self.endpoint(&["students", "email", email])?;
        let student: WireStudent = self.get_json(url).await?;
        Ok(student.into_record(email))
    }

    async fn ping_activity(&self, student_id: &StudentId) -> Result<(), StorageError> {
        let url = self.endpoint(&["students", student_id.as_str(), "activity"])?;
        let body = WireActivity {
            last_active_at: Utc::now(),
        };
        self.send_json(Method::PATCH, url, &body).await
    }
}

#[async_trait]
impl ProgressRepository for HttpBackend {
    async fn get_by_student_and_course(
        &self,
        student_id: &StudentId,
        course_id: &CourseId,
    ) -> Result<ProgressRecord, StorageError> {
        let url = self.endpoint(&["progress", student_id.as_str(), course_id.as_str()])?;
        let progress: WireProgress = self.get_json(url).await?;
        Ok(progress.into())
    }

    async fn create(&self, record: &NewProgressRecord) -> Result<(), StorageError> {
        let url = self.endpoint(&["progress"])?;
        self.send_json(Method::POST, url, &WireCreateProgress::from(record))
            .await
    }

    async fn complete_lesson(
        &self,
        id: &ProgressId,
        completion: &CompleteLessonRecord,
    ) -> Result<(), StorageError> {
        let url = self.endpoint(&["progress", id.as_str(), "complete-lesson"])?;
        self.send_json(Method::PATCH, url, &WireCompleteLesson::from(completion))
            .await
    }

    async fn save_code(&self, id: &ProgressId, code: &SaveCodeRecord) -> Result<(), StorageError> {
        let url = self.endpoint(&["progress", id.as_str(), "save-code"])?;
        self.send_json(Method::PATCH, url, &WireSaveCode::from(code))
            .await
    }

    async fn update_time_spent(
        &self,
        id: &ProgressId,
        patch: &TimeSpentPatch,
    ) -> Result<(), StorageError> {
        let url = self.endpoint(&["progress", id.as_str(), "time-spent"])?;
        self.send_json(Method::PATCH, url, &WireTimeSpentPatch::from(patch))
            .await
    }
}
