//! HTTP API for the queue engine
//!
//! Exposes the join/verify/dispatch operations and a Prometheus metrics
//! endpoint over a small hyper server. The route set mirrors the admin
//! and customer surfaces the engine serves; all engine operations are
//! synchronous ledger transactions, so handlers never await mid-request.

use crate::domain::error::{ErrorKind, QueueError};
use crate::domain::token::TokenState;
use crate::domain::types::{CounterId, GeoPoint, ServiceId, ServiceStatus, TokenId};
use crate::infra::config::Config;
use crate::infra::metrics::{Metrics, MetricsSummary};
use crate::services::{AdmissionController, CallDispatcher, PresenceVerifier, TokenLedger};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Shared handles the HTTP layer dispatches into
pub struct ApiContext {
    pub admission: AdmissionController,
    pub verifier: PresenceVerifier,
    pub dispatcher: CallDispatcher,
    pub ledger: Arc<TokenLedger>,
    pub metrics: Arc<Metrics>,
    pub site_id: String,
    pub default_presence_radius_m: f64,
}

impl ApiContext {
    pub fn new(config: &Config, ledger: Arc<TokenLedger>, metrics: Arc<Metrics>) -> Self {
        Self {
            admission: AdmissionController::new(ledger.clone(), metrics.clone()),
            verifier: PresenceVerifier::new(ledger.clone(), metrics.clone()),
            dispatcher: CallDispatcher::new(ledger.clone(), metrics.clone()),
            ledger,
            metrics,
            site_id: config.site_id().to_string(),
            default_presence_radius_m: config.default_presence_radius_m(),
        }
    }
}

// --- request payloads (field names follow the public wire format) ---

#[derive(Debug, Deserialize)]
struct JoinRequest {
    service_id: ServiceId,
    user_identifier: String,
    #[serde(default)]
    user_lat: Option<f64>,
    #[serde(default)]
    user_long: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    token_id: TokenId,
    lat: f64,
    long: f64,
}

#[derive(Debug, Deserialize)]
struct CallNextRequest {
    service_id: ServiceId,
    counter_id: CounterId,
}

#[derive(Debug, Deserialize)]
struct ScanRequest {
    token_id: TokenId,
    proof: String,
}

#[derive(Debug, Deserialize)]
struct CancelTokenRequest {
    token_id: TokenId,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ToggleServiceRequest {
    service_id: ServiceId,
    status: ServiceStatus,
}

#[derive(Debug, Deserialize)]
struct CreateServiceRequest {
    name: String,
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    presence_radius: Option<f64>,
}

// --- response helpers ---

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static response should not fail")
}

fn ok_json(body: serde_json::Value) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, body)
}

fn bad_request(message: &str) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::BAD_REQUEST,
        json!({ "success": false, "error": "validation", "message": message }),
    )
}

/// Map an engine error onto an HTTP status and structured body
fn queue_error_response(err: &QueueError) -> Response<Full<Bytes>> {
    let status = match err {
        QueueError::InvalidProof => StatusCode::FORBIDDEN,
        QueueError::ServiceClosed => StatusCode::BAD_REQUEST,
        _ => match err.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::StateConflict => StatusCode::CONFLICT,
            ErrorKind::Precondition => StatusCode::BAD_REQUEST,
            ErrorKind::Concurrency => StatusCode::SERVICE_UNAVAILABLE,
        },
    };
    let mut body = json!({
        "success": false,
        "error": err.kind().as_str(),
        "message": err.to_string(),
    });
    if let Some(state) = err.current_state() {
        body["state"] = json!(state);
    }
    json_response(status, body)
}

fn parse_json<T: serde::de::DeserializeOwned>(
    bytes: &Bytes,
) -> Result<T, Response<Full<Bytes>>> {
    serde_json::from_slice(bytes)
        .map_err(|e| bad_request(&format!("malformed request body: {e}")))
}

// --- routing ---

/// Route one request. Engine operations are synchronous, so this is a
/// plain function the async handler delegates to after body collection.
fn route(method: &Method, path: &str, body: Bytes, ctx: &ApiContext) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::POST, "/queue/join") => {
            let req: JoinRequest = match parse_json(&body) {
                Ok(req) => req,
                Err(resp) => return resp,
            };
            let coordinates = match (req.user_lat, req.user_long) {
                (Some(lat), Some(long)) => Some(GeoPoint::new(lat, long)),
                (None, None) => None,
                _ => return bad_request("user_lat and user_long must be provided together"),
            };
            match ctx.admission.join(req.service_id, &req.user_identifier, coordinates) {
                Ok(token) => ok_json(json!({ "success": true, "token": token })),
                Err(e) => queue_error_response(&e),
            }
        }
        (&Method::POST, "/presence/verify") => {
            let req: VerifyRequest = match parse_json(&body) {
                Ok(req) => req,
                Err(resp) => return resp,
            };
            match ctx.verifier.verify(req.token_id, GeoPoint::new(req.lat, req.long)) {
                // Geofence rejection is a domain outcome, not a transport error
                Ok(outcome) => ok_json(json!({
                    "success": outcome.accepted,
                    "message": outcome.message,
                    "token": outcome.token,
                })),
                Err(e) => queue_error_response(&e),
            }
        }
        (&Method::POST, "/admin/call-next") => {
            let req: CallNextRequest = match parse_json(&body) {
                Ok(req) => req,
                Err(resp) => return resp,
            };
            match ctx.dispatcher.call_next(req.service_id, req.counter_id) {
                Ok(Some(token)) => ok_json(json!({ "success": true, "token": token })),
                Ok(None) => ok_json(json!({
                    "success": false,
                    "message": "No eligible tokens waiting.",
                })),
                Err(e) => queue_error_response(&e),
            }
        }
        (&Method::POST, "/flow/entry") => {
            let req: ScanRequest = match parse_json(&body) {
                Ok(req) => req,
                Err(resp) => return resp,
            };
            match ctx.dispatcher.complete_arrival(req.token_id, &req.proof) {
                Ok(token) => ok_json(json!({ "success": true, "token": token })),
                Err(e) => queue_error_response(&e),
            }
        }
        (&Method::POST, "/flow/exit") => {
            let req: ScanRequest = match parse_json(&body) {
                Ok(req) => req,
                Err(resp) => return resp,
            };
            match ctx.dispatcher.complete_service(req.token_id, &req.proof) {
                Ok(token) => ok_json(json!({
                    "success": true,
                    "message": "Service completed.",
                    "token": token,
                })),
                Err(e) => queue_error_response(&e),
            }
        }
        (&Method::POST, "/admin/cancel-token") => {
            let req: CancelTokenRequest = match parse_json(&body) {
                Ok(req) => req,
                Err(resp) => return resp,
            };
            if let Some(reason) = &req.reason {
                info!(token_id = %req.token_id, reason = %reason, "cancel_requested");
            }
            match ctx.dispatcher.cancel(req.token_id) {
                Ok(token) => ok_json(json!({ "success": true, "token": token })),
                Err(e) => queue_error_response(&e),
            }
        }
        (&Method::POST, "/admin/toggle-service") => {
            let req: ToggleServiceRequest = match parse_json(&body) {
                Ok(req) => req,
                Err(resp) => return resp,
            };
            match ctx.dispatcher.toggle_service(req.service_id, req.status) {
                Ok(service) => ok_json(json!({ "success": true, "service": service })),
                Err(e) => queue_error_response(&e),
            }
        }
        (&Method::POST, "/admin/services") => {
            let req: CreateServiceRequest = match parse_json(&body) {
                Ok(req) => req,
                Err(resp) => return resp,
            };
            if !GeoPoint::new(req.latitude, req.longitude).is_valid() {
                return bad_request("malformed anchor coordinates");
            }
            let radius = req.presence_radius.unwrap_or(ctx.default_presence_radius_m);
            if !(radius.is_finite() && radius > 0.0) {
                return bad_request("presence_radius must be a positive number of meters");
            }
            let service =
                ctx.ledger.create_service(&req.name, req.latitude, req.longitude, radius);
            let counter = match ctx.ledger.add_counter(service.id, "Counter 1") {
                Ok(counter) => counter,
                Err(e) => return queue_error_response(&e),
            };
            ok_json(json!({ "success": true, "service": service, "counter": counter }))
        }
        (&Method::GET, path) if path.starts_with("/queue/") && path.ends_with("/tokens") => {
            let raw = &path["/queue/".len()..path.len() - "/tokens".len()];
            let service_id: ServiceId = match raw.parse() {
                Ok(id) => id,
                Err(_) => return bad_request("malformed service id"),
            };
            match ctx.ledger.active_tokens(service_id) {
                Ok(tokens) => ok_json(json!({ "success": true, "tokens": tokens })),
                Err(e) => queue_error_response(&e),
            }
        }
        // The customer app's reconnect fetch: its active token, if any
        (&Method::GET, path) if path.starts_with("/queue/") && path.contains("/token/") => {
            let rest = &path["/queue/".len()..];
            let mut parts = rest.splitn(3, '/');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(raw_service), Some("token"), Some(user_id)) if !user_id.is_empty() => {
                    let service_id: ServiceId = match raw_service.parse() {
                        Ok(id) => id,
                        Err(_) => return bad_request("malformed service id"),
                    };
                    let token = ctx.ledger.active_token_for_user(service_id, user_id);
                    ok_json(json!({ "success": true, "token": token }))
                }
                _ => json_response(
                    StatusCode::NOT_FOUND,
                    json!({ "success": false, "error": "not_found", "message": "no such route" }),
                ),
            }
        }
        (&Method::GET, path) if path.starts_with("/services/") => {
            let raw = &path["/services/".len()..];
            let service_id: ServiceId = match raw.parse() {
                Ok(id) => id,
                Err(_) => return bad_request("malformed service id"),
            };
            match ctx.ledger.service(service_id) {
                Ok(service) => ok_json(json!({ "success": true, "service": service })),
                Err(e) => queue_error_response(&e),
            }
        }
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(
                &ctx.metrics.report(),
                &ctx.ledger.state_census(),
                &ctx.site_id,
            );
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail")
        }
        (&Method::GET, "/health") => Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .expect("static response should not fail"),
        (&Method::OPTIONS, _) => Response::builder()
            .status(StatusCode::OK)
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
            .header("Access-Control-Allow-Headers", "Content-Type")
            .body(Full::new(Bytes::from("")))
            .expect("static response should not fail"),
        _ => json_response(
            StatusCode::NOT_FOUND,
            json!({ "success": false, "error": "not_found", "message": "no such route" }),
        ),
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    ctx: Arc<ApiContext>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return Ok(bad_request(&format!("failed to read request body: {e}"))),
    };
    Ok(route(&parts.method, parts.uri.path(), bytes, &ctx))
}

// --- Prometheus text exposition ---

enum MetricType {
    Counter,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
        }
    }
}

fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write the per-state token gauge, one labeled series per lifecycle state
fn write_state_gauges(output: &mut String, site: &str, census: &FxHashMap<TokenState, usize>) {
    const STATES: [TokenState; 9] = [
        TokenState::Waiting,
        TokenState::Near,
        TokenState::Confirming,
        TokenState::Confirmed,
        TokenState::Called,
        TokenState::Serving,
        TokenState::Done,
        TokenState::Missed,
        TokenState::Expired,
    ];
    let _ = writeln!(output, "# HELP queueless_tokens_in_state Tokens currently in each state");
    let _ = writeln!(output, "# TYPE queueless_tokens_in_state gauge");
    for state in STATES {
        let count = census.get(&state).copied().unwrap_or(0);
        let _ = writeln!(
            output,
            "queueless_tokens_in_state{{site=\"{site}\",state=\"{state}\"}} {count}"
        );
    }
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(
    summary: &MetricsSummary,
    census: &FxHashMap<TokenState, usize>,
    site: &str,
) -> String {
    let mut output = String::with_capacity(2048);
    let rows: [(&str, &str, u64); 11] = [
        ("queueless_tokens_issued_total", "Tokens issued", summary.tokens_issued),
        ("queueless_joins_rejected_total", "Join requests rejected", summary.joins_rejected),
        (
            "queueless_presence_confirmed_total",
            "Presence verifications accepted",
            summary.presence_confirmed,
        ),
        (
            "queueless_presence_rejected_total",
            "Presence verifications rejected by the geofence",
            summary.presence_rejected,
        ),
        ("queueless_calls_dispatched_total", "Tokens called to a counter", summary.calls_dispatched),
        ("queueless_arrivals_total", "Entry proofs accepted", summary.arrivals),
        ("queueless_services_completed_total", "Exit proofs accepted", summary.services_completed),
        ("queueless_tokens_cancelled_total", "Administrative cancellations", summary.tokens_cancelled),
        ("queueless_swept_missed_total", "CALLED tokens timed out to MISSED", summary.swept_missed),
        ("queueless_swept_expired_total", "WAITING/NEAR tokens aged to EXPIRED", summary.swept_expired),
        ("queueless_events_published_total", "Change events published", summary.events_published),
    ];
    for (name, help, val) in rows {
        write_metric(&mut output, name, help, MetricType::Counter, site, val);
    }
    write_state_gauges(&mut output, site, census);
    output
}

/// Start the HTTP API server
pub async fn start_api_server(
    bind_address: &str,
    port: u16,
    ctx: Arc<ApiContext>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: SocketAddr = format!("{bind_address}:{port}").parse()?;
    let listener = TcpListener::bind(addr).await?;

    info!(port = %port, site = %ctx.site_id, "api_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let ctx = ctx.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let ctx = ctx.clone();
                                async move { handle_request(req, ctx).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "api_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "api_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("api_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
