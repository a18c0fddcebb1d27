use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    PayloadTooLarge,
    RateLimited,
    Internal,
    #[serde(other)]
    Unknown,
}

/// Error body returned by the request/response endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    #[serde(default, alias = "error")]
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self.code, ErrorCode::Unauthorized | ErrorCode::Forbidden)
    }

    /// Worth trying again later without changing the request.
    pub fn is_transient(&self) -> bool {
        matches!(self.code, ErrorCode::RateLimited | ErrorCode::Internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_codes_still_parse() {
        let parsed: ApiError =
            serde_json::from_str(r#"{ "code": "quota_exceeded", "error": "slow down" }"#)
                .expect("parse");
        assert_eq!(parsed.code, ErrorCode::Unknown);
        assert_eq!(parsed.message, "slow down");
        assert!(!parsed.is_auth());
    }

    #[test]
    fn classifies_codes() {
        assert!(ApiError::new(ErrorCode::Forbidden, "no").is_auth());
        assert!(ApiError::new(ErrorCode::RateLimited, "later").is_transient());
        assert!(!ApiError::new(ErrorCode::Validation, "bad").is_transient());
    }
}
