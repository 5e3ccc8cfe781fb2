use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error;
use tracing::error;

/// Stable error taxonomy for the HTTP surface.
///
/// Validation failures map to 422 with a fixed text code, auth failures to
/// 401, and anything unexpected to 500. The text codes are part of the API
/// contract and must not change.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing feed URI")]
    MissingFeedUri,
    #[error("invalid feed URI")]
    InvalidFeedUri,
    #[error("invalid limit")]
    InvalidLimit,
    #[error("limit too high")]
    LimitTooHigh,
    #[error("invalid feed cursor")]
    InvalidFeedCursor,
    #[error("missing rkey")]
    MissingRkey,
    #[error("missing service")]
    MissingService,
    #[error("missing resource")]
    MissingResource,
    #[error("invalid resource")]
    InvalidResource,

    #[error("unauthorized")]
    Unauthorized,

    #[error("request timed out")]
    Timeout,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingFeedUri
            | Self::InvalidFeedUri
            | Self::InvalidLimit
            | Self::LimitTooHigh
            | Self::InvalidFeedCursor
            | Self::MissingRkey
            | Self::MissingService
            | Self::MissingResource
            | Self::InvalidResource => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Timeout => StatusCode::REQUEST_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();

        match &self {
            Self::Internal(err) => {
                error!("Request failed: {:?}", err);
                status.into_response()
            }
            _ => {
                error!("{}", self);
                (status, self.to_string()).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::MissingFeedUri.status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::LimitTooHigh.status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Timeout.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(
            ApiError::Internal(anyhow::anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_stable_text_codes() {
        assert_eq!(ApiError::MissingFeedUri.to_string(), "missing feed URI");
        assert_eq!(ApiError::InvalidFeedCursor.to_string(), "invalid feed cursor");
        assert_eq!(ApiError::InvalidResource.to_string(), "invalid resource");
    }
}
