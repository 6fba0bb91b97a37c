// Health check route handler

use std::convert::Infallible;

use hyper::{Body, Response, StatusCode};

use crate::web::response_helpers::json_raw;

pub async fn handle() -> Result<Response<Body>, Infallible> {
    Ok(json_raw(
        StatusCode::OK,
        r#"{"hi": "server is running."}"#.to_string(),
    ))
}
