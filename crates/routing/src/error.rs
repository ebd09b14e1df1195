use {
    axum::{
        Json,
        http::StatusCode,
        response::{IntoResponse, Response},
    },
    serde_json::json,
};

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("worker {index} is down")]
    WorkerDown { index: usize },

    #[error("no workers configured")]
    NoWorkers,

    #[error("request body too large")]
    BodyTooLarge,

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

impl RouteError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NoWorkers => StatusCode::SERVICE_UNAVAILABLE,
            // Session state lives in one worker only; nothing to fail over to.
            Self::WorkerDown { .. } | Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_worker_is_bad_gateway() {
        let resp = RouteError::WorkerDown { index: 2 }.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(RouteError::BodyTooLarge.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
