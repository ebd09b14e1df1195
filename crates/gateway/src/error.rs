use {
    axum::{
        Json,
        http::StatusCode,
        response::{IntoResponse, Response},
    },
    serde_json::json,
    switchboard_sessions::SessionError,
    tracing::warn,
};

/// Failure of a control request, rendered as `{"error": ...}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("session {session_id} belongs to worker {owner}")]
    Misdirected { session_id: String, owner: usize },

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Misdirected { .. } => StatusCode::MISDIRECTED_REQUEST,
            Self::Session(e) => match e {
                SessionError::NotFound(_) => StatusCode::NOT_FOUND,
                SessionError::AlreadyExists(_) | SessionError::AlreadyRestarting(_) => {
                    StatusCode::CONFLICT
                },
                SessionError::InvalidId(_) => StatusCode::BAD_REQUEST,
                SessionError::HandshakeFailed(_) | SessionError::Protocol(_) => {
                    StatusCode::BAD_GATEWAY
                },
                SessionError::HandshakeTimeout => StatusCode::GATEWAY_TIMEOUT,
                SessionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self, "control request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_errors_map_to_statuses() {
        let cases = [
            (SessionError::NotFound("s".into()), StatusCode::NOT_FOUND),
            (SessionError::AlreadyExists("s".into()), StatusCode::CONFLICT),
            (SessionError::AlreadyRestarting("s".into()), StatusCode::CONFLICT),
            (SessionError::HandshakeFailed("x".into()), StatusCode::BAD_GATEWAY),
            (SessionError::HandshakeTimeout, StatusCode::GATEWAY_TIMEOUT),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
        assert_eq!(
            ApiError::BadRequest("tenantId is required".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
