use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Wire envelope: `{"error":{"message":...,"type":...,"code":<status>}}`.
#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize, Debug)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: &'static str,
    pub code: u16,
}

#[derive(Debug)]
pub enum ApiError {
    Authentication { message: String },
    Access { message: String },
    BudgetExceeded { message: String },
    InsufficientQuota { message: String },
    RateLimit { message: String, retry_after_secs: Option<u64> },
    InvalidRequest { message: String },
    NotFound { message: String },
    Guardrail { message: String },
    Unavailable { message: String },
    Internal { message: String },
}

impl ApiError {
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::Internal { message: err.to_string() }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest { message: message.into() }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication { message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ApiError::Authentication { .. } => "authentication_error",
            ApiError::Access { .. } => "access_error",
            ApiError::BudgetExceeded { .. } => "budget_error",
            ApiError::InsufficientQuota { .. } => "insufficient_quota",
            ApiError::RateLimit { .. } => "rate_limit_error",
            ApiError::InvalidRequest { .. } => "invalid_request_error",
            ApiError::NotFound { .. } => "not_found",
            ApiError::Guardrail { .. } => "guardrail_violation",
            ApiError::Unavailable { .. } | ApiError::Internal { .. } => "api_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Authentication { .. } => StatusCode::UNAUTHORIZED,
            ApiError::Access { .. } => StatusCode::FORBIDDEN,
            ApiError::BudgetExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            ApiError::InsufficientQuota { .. } | ApiError::RateLimit { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ApiError::InvalidRequest { .. } | ApiError::Guardrail { .. } => {
                StatusCode::BAD_REQUEST
            }
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> &str {
        match self {
            ApiError::Authentication { message }
            | ApiError::Access { message }
            | ApiError::BudgetExceeded { message }
            | ApiError::InsufficientQuota { message }
            | ApiError::RateLimit { message, .. }
            | ApiError::InvalidRequest { message }
            | ApiError::NotFound { message }
            | ApiError::Guardrail { message }
            | ApiError::Unavailable { message }
            | ApiError::Internal { message } => message,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type(), self.message())
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_type = self.error_type();
        let retry_after = match &self {
            ApiError::RateLimit { retry_after_secs, .. } => *retry_after_secs,
            _ => None,
        };
        let body = ErrorBody {
            error: ErrorDetail {
                message: self.message().to_string(),
                error_type,
                code: status.as_u16(),
            },
        };
        let mut resp = (status, Json(body)).into_response();
        if let Ok(val) = HeaderValue::from_str(error_type) {
            resp.headers_mut().insert("X-Error-Code", val);
        }
        if let Some(secs) = retry_after {
            if let Ok(val) = HeaderValue::from_str(&secs.to_string()) {
                resp.headers_mut().insert(axum::http::header::RETRY_AFTER, val);
            }
        }
        resp
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn budget_error_shape() {
        let err = ApiError::BudgetExceeded { message: "budget exhausted".into() };
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "budget_error");
        let bytes = to_bytes(resp.into_body(), 1024).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["type"], "budget_error");
        assert_eq!(body["error"]["code"], 402);
        assert_eq!(body["error"]["message"], "budget exhausted");
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let err = ApiError::RateLimit {
            message: "rate limit exceeded".into(),
            retry_after_secs: Some(31),
        };
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get("retry-after").unwrap(), "31");
    }
}
