use std::sync::Arc;

use ide_core::model::{GUEST_TOKEN, Identity, Role, decode_user_token};
use storage::repository::IdentityRepository;
use tracing::{debug, warn};

use crate::error::SyncError;

/// Turns a route token into the session's `Identity`.
///
/// Never fails: any lookup problem degrades to the guest identity.
#[derive(Clone)]
pub struct IdentityResolver {
    identity: Arc<dyn IdentityRepository>,
}

impl IdentityResolver {
    #[must_use]
    pub fn new(identity: Arc<dyn IdentityRepository>) -> Self {
        Self { identity }
    }

    /// Resolve a token to an identity and ping activity for students.
    ///
    /// Must run inside a tokio runtime; the activity ping is spawned onto it.
    pub async fn resolve(&self, token: &str) -> Identity {
        let email = match decode_user_token(token) {
            Ok(email) => email,
            Err(err) => {
                warn!(%err, "undecodable user token; continuing as guest");
                return Identity::guest(GUEST_TOKEN);
            }
        };
        if email == GUEST_TOKEN {
            return Identity::guest(GUEST_TOKEN);
        }

        let identity = match self.lookup(&email).await {
            Ok(identity) => identity,
            Err(err) => {
                warn!(%err, email = %email, "identity lookup failed; continuing as guest");
                Identity::guest(email)
            }
        };

        if let Some(student_id) = identity.student_id().cloned() {
            let repo = Arc::clone(&self.identity);
            tokio::spawn(async move {
                if let Err(err) = repo.ping_activity(&student_id).await {
                    warn!(%err, student = %student_id, "activity ping failed");
                }
            });
        }

        debug!(
            email = identity.email(),
            role = ?identity.role(),
            tracked = identity.tracks_progress(),
            "identity resolved"
        );
        identity
    }

    async fn lookup(&self, email: &str) -> Result<Identity, SyncError> {
        let user = self
            .identity
            .get_user_by_email(email)
            .await
            .map_err(SyncError::IdentityLookupFailed)?;
        let role = user.role.unwrap_or_default();

        let student_id = if role == Role::Student {
            let student = self
                .identity
                .get_student_by_email(email)
                .await
                .map_err(SyncError::IdentityLookupFailed)?;
            Some(student.id)
        } else {
            None
        };

        Ok(Identity::account(
            user.email,
            user.id,
            user.name.as_deref(),
            role,
            student_id,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ide_core::model::{StudentId, UserId, encode_user_token};
    use storage::repository::{InMemoryBackend, StudentRecord, UserRecord};

    fn build_backend() -> InMemoryBackend {
        let backend = InMemoryBackend::new();
        backend
            .insert_user(UserRecord {
                id: UserId::new("u1"),
                email: "ada@example.com".into(),
                name: Some("Ada Lovelace".into()),
                role: Some(Role::Student),
            })
            .unwrap();
        backend
            .insert_student(StudentRecord {
                id: StudentId::new("s1"),
                user_id: Some(UserId::new("u1")),
                email: "ada@example.com".into(),
            })
            .unwrap();
        backend
            .insert_user(UserRecord {
                id: UserId::new("u2"),
                email: "grace@example.com".into(),
                name: Some("Grace Hopper".into()),
                role: Some(Role::Teacher),
            })
            .unwrap();
        backend
    }

    #[tokio::test]
    async fn encoded_token_resolves_student() {
        let backend = build_backend();
        let resolver = IdentityResolver::new(Arc::new(backend.clone()));

        let identity = resolver
            .resolve(&encode_user_token("ada@example.com"))
            .await;

        assert_eq!(identity.student_id(), Some(&StudentId::new("s1")));
        assert_eq!(identity.initials(), "AL");
        assert!(identity.tracks_progress());

        tokio::task::yield_now().await;
        assert_eq!(backend.pings().unwrap(), vec![StudentId::new("s1")]);
    }

    #[tokio::test]
    async fn guest_token_skips_lookups() {
        let resolver = IdentityResolver::new(Arc::new(InMemoryBackend::new()));
        let identity = resolver.resolve("guest").await;
        assert!(identity.owner().is_guest());
        assert_eq!(identity.initials(), "GU");
    }

    #[tokio::test]
    async fn unknown_user_degrades_to_guest() {
        let resolver = IdentityResolver::new(Arc::new(build_backend()));
        let identity = resolver.resolve("nobody@example.com").await;
        assert!(identity.owner().is_guest());
        assert_eq!(identity.role(), Role::Student);
        assert_eq!(identity.email(), "nobody@example.com");
    }

    #[tokio::test]
    async fn garbage_token_degrades_to_guest() {
        let resolver = IdentityResolver::new(Arc::new(build_backend()));
        let identity = resolver.resolve("!!not-base64!!").await;
        assert!(identity.owner().is_guest());
    }

    #[tokio::test]
    async fn teachers_keep_role_without_progress() {
        let backend = build_backend();
        let resolver = IdentityResolver::new(Arc::new(backend.clone()));
        let identity = resolver.resolve("grace@example.com").await;
        assert_eq!(identity.role(), Role::Teacher);
        assert!(!identity.tracks_progress());
        assert_eq!(identity.display_name(), "Grace Hopper");

        tokio::task::yield_now().await;
        assert!(backend.pings().unwrap().is_empty());
    }
}
