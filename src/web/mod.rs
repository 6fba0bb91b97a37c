//! HTTP surface: router, server bootstrap, request/response plumbing.

pub mod request_parsing;
pub mod response_helpers;
pub mod routes;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use tokio::sync::oneshot;

use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::llm::service::CompletionService;
use crate::web::response_helpers::{cors_preflight, json_error};
use crate::log_info;

/// Dispatch one request. Split out from the server loop so tests can drive
/// it without a socket.
pub async fn route_request(
    req: Request<Body>,
    service: Arc<CompletionService>,
    url_prefix: &str,
) -> Result<Response<Body>, Infallible> {
    let path = req.uri().path().to_string();
    let relative = match path.strip_prefix(url_prefix) {
        Some(rest) if url_prefix.is_empty() || rest.is_empty() || rest.starts_with('/') => rest,
        _ => {
            return Ok(json_error(StatusCode::NOT_FOUND, "Not found"));
        }
    };

    match (req.method(), relative) {
        (&Method::GET, "/hi") => routes::hi::handle().await,
        (&Method::POST, "/chat/completions") => routes::completions::handle(req, service).await,
        (&Method::OPTIONS, _) => Ok(cors_preflight()),
        _ => Ok(json_error(StatusCode::NOT_FOUND, "Not found")),
    }
}

/// Bind and run the HTTP server. `ready` fires once the listener is bound,
/// after which requests are accepted; the interactive chatbot waits on it
/// before taking input.
pub async fn run_server(
    config: &AppConfig,
    service: Arc<CompletionService>,
    ready: oneshot::Sender<SocketAddr>,
) -> Result<(), GatewayError> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| GatewayError::Config(format!("invalid host/port: {e}")))?;
    let url_prefix = config.url_prefix.clone();

    let make_svc = make_service_fn({
        let service = service.clone();
        let url_prefix = url_prefix.clone();
        move |_conn| {
            let service = service.clone();
            let url_prefix = url_prefix.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let service = service.clone();
                    let url_prefix = url_prefix.clone();
                    async move { route_request(req, service, &url_prefix).await }
                }))
            }
        }
    });

    let server = Server::try_bind(&addr)
        .map_err(|e| GatewayError::Config(format!("cannot bind {addr}: {e}")))?
        .serve(make_svc);

    log_info!("Server listening on http://{}{}", addr, url_prefix);
    let _ = ready.send(addr);

    server
        .await
        .map_err(|e| GatewayError::Inference(format!("server error: {e}")))
}
