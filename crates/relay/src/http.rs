//! Read-only HTTP query surface over the dispatch engine.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use taxi_dispatch::DispatchEngine;
use taxi_store::EventFilter;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

const MAX_EVENT_LIMIT: usize = 500;

pub async fn run(addr: &str, engine: DispatchEngine) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "http query server listening");
    serve(listener, engine).await
}

pub async fn serve(listener: TcpListener, engine: DispatchEngine) -> anyhow::Result<()> {
    let started = Instant::now();
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let engine = engine.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let engine = engine.clone();
                        async move { handle_request(engine, started, addr, req).await }
                    });
                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        error!(%addr, error = ?err, "error serving http connection");
                    }
                });
            }
            Err(err) => {
                error!(error = ?err, "error accepting http connection");
            }
        }
    }
}

async fn handle_request(
    engine: DispatchEngine,
    started: Instant,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    debug!(%addr, %method, %path, "http request");

    if method != Method::GET {
        let body = json!({ "error": "Method Not Allowed", "method": method.as_str() });
        return Ok(to_boxed(json_response(StatusCode::METHOD_NOT_ALLOWED, &body)));
    }

    let response = match path.as_str() {
        "/health" => ok(&json!({ "status": "ok", "timestamp": Utc::now() })),
        "/status" => {
            let stats = engine.stats().await;
            ok(&json!({
                "status": "ok",
                "uptime_secs": started.elapsed().as_secs(),
                "stats": stats,
                "timestamp": Utc::now(),
            }))
        }
        "/api/drivers" => listing("drivers", engine.drivers().await),
        "/api/passengers" => listing("passengers", engine.passengers().await),
        "/api/rides" => listing("rides", engine.live_rides().await),
        "/api/completed-rides" => listing("rides", engine.completed_rides().await),
        "/api/cancelled-rides" => listing("rides", engine.cancelled_rides().await),
        "/api/ride-events" => ride_events(&engine, query.as_deref()).await,
        _ => {
            if let Some(id) = path.strip_prefix("/api/driver/") {
                found(&path, engine.driver(id).await)
            } else if let Some(id) = path.strip_prefix("/api/passenger/") {
                found(&path, engine.passenger(id).await)
            } else if let Some(id) = path.strip_prefix("/api/ride/") {
                found(&path, engine.ride(id).await)
            } else {
                not_found_response(&path)
            }
        }
    };
    Ok(to_boxed(response))
}

async fn ride_events(engine: &DispatchEngine, query: Option<&str>) -> Response<Full<Bytes>> {
    let filter = match parse_event_filter(query.unwrap_or("")) {
        Ok(filter) => filter,
        Err(message) => return bad_request_response(&message),
    };
    match engine.recent_events(&filter).await {
        Ok(events) => listing("events", events),
        Err(err) => {
            error!(error = %err, "reading ride events failed");
            let body = json!({ "error": "Internal Server Error", "message": err.to_string() });
            json_response(StatusCode::INTERNAL_SERVER_ERROR, &body)
        }
    }
}

/// `?actor=&type=&since=<rfc3339>&limit=`
fn parse_event_filter(query: &str) -> Result<EventFilter, String> {
    let params: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    let since = match params.get("since") {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map_err(|err| format!("invalid since '{raw}': {err}"))?
                .with_timezone(&Utc),
        ),
        None => None,
    };
    let limit = match params.get("limit") {
        Some(raw) => {
            let limit: usize = raw
                .parse()
                .map_err(|_| format!("invalid limit '{raw}'"))?;
            Some(limit.min(MAX_EVENT_LIMIT))
        }
        None => None,
    };
    Ok(EventFilter {
        actor: params.get("actor").cloned(),
        event_type: params.get("type").cloned(),
        since,
        limit,
    })
}

fn ok(body: &Value) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, body)
}

fn listing<T: Serialize>(key: &str, items: Vec<T>) -> Response<Full<Bytes>> {
    let count = items.len();
    ok(&json!({ key: items, "count": count }))
}

fn found<T: Serialize>(path: &str, item: Option<T>) -> Response<Full<Bytes>> {
    match item {
        Some(item) => ok(&json!(item)),
        None => not_found_response(path),
    }
}

fn json_response(status: StatusCode, body: &Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    let body = json!({ "error": "Not Found", "path": path });
    json_response(StatusCode::NOT_FOUND, &body)
}

fn bad_request_response(message: &str) -> Response<Full<Bytes>> {
    let body = json!({ "error": "Bad Request", "message": message });
    json_response(StatusCode::BAD_REQUEST, &body)
}

fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}
