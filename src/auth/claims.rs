//! Token claims accepted by the JWT authenticator

use serde::{Deserialize, Serialize};

use crate::connection_manager::UserId;

/// Token subject; peers address each other by string or numeric ids
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Subject {
    Number(i64),
    Text(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Subject,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

impl Claims {
    /// User id carried by the token; None for a blank subject
    pub fn user_id(&self) -> Option<UserId> {
        match &self.sub {
            Subject::Number(n) => Some(n.to_string()),
            Subject::Text(s) if s.trim().is_empty() => None,
            Subject::Text(s) => Some(s.clone()),
        }
    }
}
