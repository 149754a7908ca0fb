//! The request pipeline wrapped around every route, outermost first:
//!
//! 1. panic recovery, so one faulty request cannot take the process down
//! 2. a tracing span per request; store calls nest under it
//! 3. request count and latency metrics
//! 4. instance identity headers
//!
//! Recovery has to stay outermost so the other stages can't crash the process,
//! while tracing and metrics still wrap the handler and see its failures,
//! panics included.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use axum::body::Body;
use axum::extract::{MatchedPath, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use futures::FutureExt;
use tower::ServiceBuilder;
use tower_http::catch_panic::{CatchPanicLayer, ResponseForPanic};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::{DefaultOnResponse, MakeSpan, TraceLayer};
use tracing::{error, Level, Span};

use crate::api::ErrorResponse;
use crate::config::{ServiceIdentity, SERVICE_NAME};
use crate::telemetry::Metrics;

pub const POD_NAME_HEADER: &str = "x-pod-name";
pub const SERVICE_VERSION_HEADER: &str = "x-service-version";

/// Route label for requests that matched no route.
const UNMATCHED_ROUTE: &str = "unmatched";

pub fn instrument(router: Router, identity: &ServiceIdentity, metrics: Metrics) -> Router {
    let headers = IdentityHeaders::new(identity);

    router.layer(
        ServiceBuilder::new()
            .layer(CatchPanicLayer::custom(PanicResponse {
                headers: headers.clone(),
            }))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(RequestSpan)
                    .on_response(DefaultOnResponse::new().level(Level::INFO)),
            )
            .layer(middleware::from_fn_with_state(metrics, record_metrics))
            .layer(SetResponseHeaderLayer::overriding(
                HeaderName::from_static(POD_NAME_HEADER),
                headers.pod_name.clone(),
            ))
            .layer(SetResponseHeaderLayer::overriding(
                HeaderName::from_static(SERVICE_VERSION_HEADER),
                headers.version,
            )),
    )
}

#[derive(Clone)]
struct IdentityHeaders {
    pod_name: HeaderValue,
    version: HeaderValue,
}

impl IdentityHeaders {
    fn new(identity: &ServiceIdentity) -> Self {
        Self {
            pod_name: header_value(&identity.pod_name),
            version: header_value(&identity.version),
        }
    }

    fn apply(&self, response: &mut Response) {
        let headers = response.headers_mut();
        headers.insert(HeaderName::from_static(POD_NAME_HEADER), self.pod_name.clone());
        headers.insert(HeaderName::from_static(SERVICE_VERSION_HEADER), self.version.clone());
    }
}

fn header_value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap_or_else(|_| HeaderValue::from_static("unknown"))
}

fn route_label<B>(request: &axum::http::Request<B>) -> String {
    request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_owned())
}

/// Converts a handler panic into a plain 500. The identity headers are added
/// here as well since the inner header stage never saw a response.
#[derive(Clone)]
struct PanicResponse {
    headers: IdentityHeaders,
}

impl ResponseForPanic for PanicResponse {
    type ResponseBody = Body;

    fn response_for_panic(&mut self, err: Box<dyn Any + Send + 'static>) -> Response<Body> {
        let detail = if let Some(message) = err.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = err.downcast_ref::<String>() {
            message.clone()
        } else {
            "unknown panic payload".to_string()
        };
        error!(panic = %detail, "Request handler panicked");

        let mut response = (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "Internal server error".to_string(),
            }),
        )
            .into_response();
        self.headers.apply(&mut response);
        response
    }
}

#[derive(Clone, Copy)]
struct RequestSpan;

impl<B> MakeSpan<B> for RequestSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> Span {
        let route = route_label(request);
        tracing::info_span!(
            "request",
            otel.name = %format!("{} {}", request.method(), route),
            otel.kind = "server",
            service = SERVICE_NAME,
            method = %request.method(),
            route = %route,
        )
    }
}

/// Records every request, including ones whose handler panics: those are
/// counted as 500 before the panic continues to the recovery stage.
async fn record_metrics(State(metrics): State<Metrics>, request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let endpoint = route_label(&request);
    let start = Instant::now();

    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => {
            metrics.observe_request(&method, &endpoint, response.status().as_u16(), start.elapsed());
            response
        }
        Err(panic) => {
            metrics.observe_request(
                &method,
                &endpoint,
                StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                start.elapsed(),
            );
            panic::resume_unwind(panic)
        }
    }
}
