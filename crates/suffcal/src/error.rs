//! Error type shared by every suffcal module.
//!
//! Binaries wrap these in `anyhow` at the edges; the library itself returns
//! [`Result`] so callers can tell a wrong password from a dead calendar server.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Required settings are missing or malformed
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Instagram refused the login (bad password, 2FA, checkpoint)
    #[error("Instagram login failed: {0}")]
    InstagramLogin(String),

    #[error("Instagram API error: {0}")]
    Instagram(String),

    #[error("CalDAV error: {0}")]
    CalDav(String),

    #[error("Calendar '{name}' not found (available: {available})")]
    CalendarNotFound { name: String, available: String },

    #[error("OCR failed: {0}")]
    Ocr(String),

    #[error("LLM request failed: {0}")]
    Llm(String),

    /// Model output that no repair strategy could turn into JSON
    #[error("Unable to parse AI response as JSON. Raw: {0}")]
    UnparsableResponse(String),

    #[error("Download of {url} failed: {reason}")]
    Download { url: String, reason: String },
}

impl Error {
    /// Create a config error for missing settings
    pub fn missing(names: &[&str]) -> Self {
        Error::Config(format!("Missing required parameter(s): {}", names.join(", ")))
    }

    pub fn caldav(message: impl Into<String>) -> Self {
        Error::CalDav(message.into())
    }

    pub fn instagram(message: impl Into<String>) -> Self {
        Error::Instagram(message.into())
    }
}

impl From<quick_xml::Error> for Error {
    fn from(err: quick_xml::Error) -> Self {
        Error::CalDav(format!("Invalid XML response: {}", err))
    }
}

/// Result type alias for suffcal operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_lists_every_name() {
        let err = Error::missing(&["insta_user", "calendar_url"]);
        assert_eq!(
            err.to_string(),
            "Configuration error: Missing required parameter(s): insta_user, calendar_url"
        );
    }

    #[test]
    fn test_calendar_not_found_message() {
        let err = Error::CalendarNotFound {
            name: "feste".to_string(),
            available: "personal, work".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Calendar 'feste' not found (available: personal, work)"
        );
    }
}
