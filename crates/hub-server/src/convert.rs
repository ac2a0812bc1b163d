use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, SecondsFormat, Utc};

use hub_types::HubError;

pub fn hub_to_status(err: &HubError) -> StatusCode {
    match err {
        HubError::NotLeader { .. } => StatusCode::FORBIDDEN,
        HubError::LockBusy { .. } | HubError::VersionConflict { .. } => StatusCode::CONFLICT,
        HubError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        HubError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        HubError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        HubError::ApplyFailure { .. } | HubError::StaleLock { .. } | HubError::Codec(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// `HubError` as an HTTP response: `{ "error": { "kind", "message" } }`,
/// plus the leader hint on `not_leader`.
#[derive(Debug)]
pub struct ApiError(pub HubError);

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = hub_to_status(&self.0);
        if status.is_server_error() {
            tracing::warn!(kind = self.0.kind(), error = %self.0, "status request failed");
        }
        let mut error = serde_json::json!({
            "kind": self.0.kind(),
            "message": self.0.to_string(),
        });
        if let HubError::NotLeader { leader } = &self.0 {
            error["leader"] = serde_json::json!(leader);
        }
        (status, Json(serde_json::json!({ "error": error }))).into_response()
    }
}

const NANOS_PER_SEC: i64 = 1_000_000_000;

pub fn ns_to_rfc3339(ns: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(ns.div_euclid(NANOS_PER_SEC), ns.rem_euclid(NANOS_PER_SEC) as u32)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leader_only_maps_to_forbidden() {
        assert_eq!(hub_to_status(&HubError::NotLeader { leader: None }), StatusCode::FORBIDDEN);
        assert_eq!(
            hub_to_status(&HubError::LockBusy { resource: "x".into(), holder: None }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            hub_to_status(&HubError::StoreUnavailable("down".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn timestamps_render_as_utc() {
        assert_eq!(ns_to_rfc3339(0).as_deref(), Some("1970-01-01T00:00:00.000Z"));
        assert_eq!(ns_to_rfc3339(1_500_000_000).as_deref(), Some("1970-01-01T00:00:01.500Z"));
    }
}
