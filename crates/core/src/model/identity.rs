use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{StudentId, UserId};

/// Route token that stands for an anonymous visitor.
pub const GUEST_TOKEN: &str = "guest";

const GUEST_NAME: &str = "Guest User";
const GUEST_INITIALS: &str = "GU";
const TOKEN_SALT: &str = "beblocky_2024";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TokenError {
    #[error("token is not valid base64")]
    Encoding,
    #[error("token does not decode to utf-8 text")]
    Utf8,
    #[error("token decodes to an empty email")]
    Empty,
}

/// Account role as reported by the identity service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Student,
    Teacher,
    Admin,
    Parent,
}

/// Who owns progress for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Owner {
    Guest,
    Student(StudentId),
}

impl Owner {
    #[must_use]
    pub fn student_id(&self) -> Option<&StudentId> {
        match self {
            Owner::Guest => None,
            Owner::Student(id) => Some(id),
        }
    }

    #[must_use]
    pub fn is_guest(&self) -> bool {
        matches!(self, Owner::Guest)
    }
}

/// Resolved identity for one mounted session. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    email: String,
    user_id: Option<UserId>,
    owner: Owner,
    role: Role,
    display_name: String,
    initials: String,
}

impl Identity {
    /// The anonymous identity. `email` is kept for display only.
    #[must_use]
    pub fn guest(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            user_id: None,
            owner: Owner::Guest,
            role: Role::Student,
            display_name: GUEST_NAME.to_owned(),
            initials: GUEST_INITIALS.to_owned(),
        }
    }

    /// Identity backed by a user account.
    ///
    /// Only students with a linked student record own remote progress; any
    /// other combination keeps its role but gets a guest owner.
    #[must_use]
    pub fn account(
        email: impl Into<String>,
        user_id: UserId,
        name: Option<&str>,
        role: Role,
        student_id: Option<StudentId>,
    ) -> Self {
        let email = email.into();
        let display_name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(email.as_str())
            .to_owned();
        let initials = initials(name.unwrap_or_default(), Some(&email));
        let owner = match (role, student_id) {
            (Role::Student, Some(id)) => Owner::Student(id),
            _ => Owner::Guest,
        };
        Self {
            email,
            user_id: Some(user_id),
            owner,
            role,
            display_name,
            initials,
        }
    }

    #[must_use]
    pub fn email(&self) -> &str {
        &self.email
    }

    #[must_use]
    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    #[must_use]
    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    #[must_use]
    pub fn student_id(&self) -> Option<&StudentId> {
        self.owner.student_id()
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    #[must_use]
    pub fn initials(&self) -> &str {
        &self.initials
    }

    /// True when saves and navigation should reach the progress service.
    #[must_use]
    pub fn tracks_progress(&self) -> bool {
        !self.owner.is_guest()
    }
}

/// Derive display initials from a name, falling back to the email local part.
#[must_use]
pub fn initials(name: &str, email: Option<&str>) -> String {
    let name = name.trim();
    if name == GUEST_NAME {
        return GUEST_INITIALS.to_owned();
    }

    let parts: Vec<&str> = name.split_whitespace().collect();
    let first_char = |s: &str| s.chars().next().map(|c| c.to_uppercase().to_string());
    match parts.as_slice() {
        [first, .., last] => {
            if let (Some(a), Some(b)) = (first_char(first), first_char(last)) {
                return a + &b;
            }
        }
        [only] => {
            if let Some(a) = first_char(only) {
                return a;
            }
        }
        [] => {}
    }

    if let Some(email) = email.filter(|e| !e.is_empty() && *e != GUEST_TOKEN) {
        let local = email.split('@').next().unwrap_or_default();
        let prefix: String = local.chars().take(2).collect();
        if !prefix.is_empty() {
            return prefix.to_uppercase();
        }
    }

    GUEST_INITIALS.to_owned()
}

/// Encode an email into the route token form.
#[must_use]
pub fn encode_user_token(email: &str) -> String {
    if email.is_empty() {
        return GUEST_TOKEN.to_owned();
    }
    let reversed: String = format!("{email}{TOKEN_SALT}").chars().rev().collect();
    URL_SAFE_NO_PAD.encode(reversed.as_bytes())
}

/// Decode a route token into an email.
///
/// `"guest"` and the empty token decode to `"guest"`. Tokens that already look
/// like an email are returned unchanged.
///
/// # Errors
///
/// Returns `TokenError` when the token is neither an email nor a valid
/// encoded token.
pub fn decode_user_token(token: &str) -> Result<String, TokenError> {
    let token = token.trim();
    if token.is_empty() || token == GUEST_TOKEN {
        return Ok(GUEST_TOKEN.to_owned());
    }
    if token.contains('@') {
        return Ok(token.to_owned());
    }

    let normalized: String = token
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();
    let bytes = URL_SAFE_NO_PAD
        .decode(normalized.as_bytes())
        .map_err(|_| TokenError::Encoding)?;
    let decoded = String::from_utf8(bytes).map_err(|_| TokenError::Utf8)?;
    let salted: String = decoded.chars().rev().collect();
    let email = match salted.strip_suffix(TOKEN_SALT) {
        Some(email) => email.to_owned(),
        None => salted.replacen(TOKEN_SALT, "", 1),
    };

    if email.trim().is_empty() {
        return Err(TokenError::Empty);
    }
    Ok(email)
}
