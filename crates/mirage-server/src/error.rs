use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use mirage_store::StoreError;
use serde_json::json;

/// Every failure a route can answer with. Rendered as
/// `{"success": false, "error": "<message>"}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Method Not Allowed")]
    MethodNotAllowed { allow: &'static str },

    #[error("Model not ready")]
    NotReady,

    #[error("Model response was not valid JSON")]
    InvalidModelJson,

    /// The model call itself failed.
    #[error("{0}")]
    Upstream(String),

    #[error("Unknown REST endpoint")]
    UnknownRestEndpoint,

    #[error("Image generation disabled")]
    ImageGenDisabled,

    #[error("Image generation not configured")]
    ImageGenUnavailable,

    #[error("Missing prompt")]
    MissingPrompt,

    #[error("Missing API key for image provider")]
    MissingApiKey,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Store(e) => store_status(e),
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::NotReady | Self::ImageGenUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidModelJson | Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::UnknownRestEndpoint | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ImageGenDisabled => StatusCode::FORBIDDEN,
            Self::MissingPrompt | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::MissingApiKey => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn store_status(e: &StoreError) -> StatusCode {
    match e {
        StoreError::ForkAlreadyActive(_) | StoreError::ForkActive => StatusCode::CONFLICT,
        StoreError::NoSuchFork(_) | StoreError::NoSuchBranch(_) | StoreError::NoSuchEntry(_) => {
            StatusCode::NOT_FOUND
        }
        StoreError::ForkRouting(_) | StoreError::InvalidSnapshot(_) | StoreError::EmptyHistory => {
            StatusCode::BAD_REQUEST
        }
        StoreError::NoSuchSession(_) | StoreError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "request rejected");
        }
        let mut response = (status, Json(json!({"success": false, "error": self.to_string()})))
            .into_response();
        if let Self::MethodNotAllowed { allow } = self {
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static(allow));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use mirage_core::ids::{ForkId, SessionId};

    #[test]
    fn store_errors_map_to_statuses() {
        let conflict: ApiError = StoreError::ForkAlreadyActive(ForkId::from_raw("fork_1")).into();
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::from(StoreError::ForkActive).status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::from(StoreError::NoSuchFork(ForkId::from_raw("fork_x"))).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(StoreError::ForkRouting(SessionId::from_raw("sess_1"))).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(StoreError::NoSuchSession(SessionId::from_raw("sess_1"))).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn method_not_allowed_sets_allow_header() {
        let response = ApiError::MethodNotAllowed { allow: "GET, POST" }.into_response();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::ALLOW], "GET, POST");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, json!({"success": false, "error": "Method Not Allowed"}));
    }
}
