// Request parsing utilities for HTTP handlers

use hyper::{Body, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::web::response_helpers::json_error;
use crate::{log_debug, log_error};

/// Parse a JSON request body into a typed structure.
///
/// Returns the deserialized value on success, or a ready-to-send error
/// response on failure.
pub async fn parse_json_body<T: DeserializeOwned>(body: Body) -> Result<T, Response<Body>> {
    let body_bytes = match hyper::body::to_bytes(body).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return Err(json_error(
                StatusCode::BAD_REQUEST,
                "Failed to read request body",
            ));
        }
    };

    if let Ok(body_str) = std::str::from_utf8(&body_bytes) {
        if !body_str.is_empty() {
            log_debug!("[REQUEST] Body: {}", body_str);
        }
    }

    match serde_json::from_slice::<T>(&body_bytes) {
        Ok(parsed) => Ok(parsed),
        Err(e) => {
            log_error!("[REQUEST] JSON parsing error: {}", e);
            Err(json_error(StatusCode::BAD_REQUEST, "Invalid JSON format"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize, Debug)]
    struct Probe {
        value: u32,
    }

    #[tokio::test]
    async fn parses_valid_json() {
        let body = Body::from(r#"{"value": 7}"#);
        let probe: Probe = parse_json_body(body).await.unwrap();
        assert_eq!(probe.value, 7);
    }

    #[tokio::test]
    async fn rejects_invalid_json_with_400() {
        let body = Body::from("not json");
        let err = parse_json_body::<Probe>(body).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
