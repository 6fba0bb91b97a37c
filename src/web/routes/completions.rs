// Chat completions route handler

use std::convert::Infallible;
use std::sync::Arc;

use hyper::body::Bytes;
use hyper::{Body, Request, Response, StatusCode};

use crate::llm::service::{CompletionRequest, CompletionService};
use crate::web::request_parsing::parse_json_body;
use crate::web::response_helpers::{error_response, json_response, sse_response};
use crate::log_info;

pub async fn handle(
    req: Request<Body>,
    service: Arc<CompletionService>,
) -> Result<Response<Body>, Infallible> {
    let completion_request: CompletionRequest = match parse_json_body(req.into_body()).await {
        Ok(parsed) => parsed,
        Err(error_response) => return Ok(error_response),
    };

    if completion_request.stream {
        handle_streaming(completion_request, service).await
    } else {
        handle_full(completion_request, service).await
    }
}

async fn handle_full(
    request: CompletionRequest,
    service: Arc<CompletionService>,
) -> Result<Response<Body>, Infallible> {
    match service.complete(&request).await {
        Ok(completion) => Ok(json_response(StatusCode::OK, &completion)),
        Err(e) => Ok(error_response(&e)),
    }
}

async fn handle_streaming(
    request: CompletionRequest,
    service: Arc<CompletionService>,
) -> Result<Response<Body>, Infallible> {
    // Validation and prompt construction happen before the response starts,
    // so template errors still surface with a proper status code.
    let mut events = match service.stream_events(&request).await {
        Ok(rx) => rx,
        Err(e) => return Ok(error_response(&e)),
    };

    let (mut sender, body) = Body::channel();
    tokio::spawn(async move {
        while let Some(frame) = events.recv().await {
            // A failed send means the client disconnected; dropping the
            // receiver propagates the cancellation up the pipeline.
            if sender.send_data(Bytes::from(frame)).await.is_err() {
                log_info!("SSE client disconnected mid-stream");
                break;
            }
        }
    });

    Ok(sse_response(body))
}
