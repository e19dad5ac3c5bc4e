//! The operations a batch pass needs from a mail provider.

use crate::address::extract_address;

pub const LABEL_INBOX: &str = "INBOX";
pub const LABEL_SPAM: &str = "SPAM";
pub const DEFAULT_QUERY: &str = "in:inbox";

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    /// Credentials were rejected or expired; the user has to authorize again.
    #[error("Authorization expired or revoked: {0}")]
    AuthExpired(String),

    #[error("Message not found: {0}")]
    NotFound(String),

    #[error("Rate limited by mail provider")]
    RateLimited,

    #[error("Mail provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl MailError {
    pub fn is_auth(&self) -> bool {
        matches!(self, MailError::AuthExpired(_))
    }
}

pub type MailResult<T> = std::result::Result<T, MailError>;

/// Raw header values as the provider returned them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    pub from: String,
    pub subject: String,
}

/// A fetched message reduced to what the rule engine looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedMessage {
    pub id: String,
    pub from: String,
    pub subject: String,
}

impl NormalizedMessage {
    pub fn new(id: impl Into<String>, headers: MessageHeaders) -> Self {
        NormalizedMessage {
            id: id.into(),
            from: extract_address(&headers.from),
            subject: headers.subject,
        }
    }
}

/// An authorized handle on one mailbox.
pub trait MailSession {
    fn list_message_ids(&mut self, query: &str) -> MailResult<Vec<String>>;
    fn get_headers(&mut self, id: &str) -> MailResult<MessageHeaders>;
    fn trash(&mut self, id: &str) -> MailResult<()>;
    fn add_label(&mut self, id: &str, label: &str) -> MailResult<()>;
    fn remove_label(&mut self, id: &str, label: &str) -> MailResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_message_extracts_address() {
        let msg = NormalizedMessage::new(
            "18c1",
            MessageHeaders {
                from: "\"Shop\" <deals@shop.com>".to_string(),
                subject: "Sale".to_string(),
            },
        );
        assert_eq!(msg.id, "18c1");
        assert_eq!(msg.from, "deals@shop.com");
        assert_eq!(msg.subject, "Sale");
    }

    #[test]
    fn test_missing_from_normalizes_to_empty() {
        let msg = NormalizedMessage::new("1", MessageHeaders::default());
        assert_eq!(msg.from, "");
        assert_eq!(msg.subject, "");
    }

    #[test]
    fn test_is_auth() {
        assert!(MailError::AuthExpired("invalid_grant".into()).is_auth());
        assert!(!MailError::RateLimited.is_auth());
        assert!(!MailError::NotFound("x".into()).is_auth());
    }
}
