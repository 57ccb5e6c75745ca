//! Kuview HTTP surface: the SSE subscription endpoint, the liveness probe,
//! static assets, and a pod-log pass-through to the upstream API.

#![forbid(unsafe_code)]

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{sse, IntoResponse, Redirect, Response, Sse},
    routing::get,
    Router,
};
use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, LogParams},
    Client,
};
use kuview_core::Event;
use kuview_hub::Hub;
use serde::Deserialize;
use tokio_util::{compat::FuturesAsyncReadCompatExt, io::ReaderStream};
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, services::ServeDir, trace::TraceLayer,
};
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub client: Client,
}

pub fn router(state: AppState, static_dir: &str) -> Router {
    Router::new()
        .route("/", get(|| async { Redirect::temporary("/static") }))
        .route("/kuview", get(subscribe))
        .route("/kuview/available", get(|| async { "yes" }))
        .route("/api/v1/namespaces/:namespace/pods/:pod/log", get(pod_logs))
        .nest_service("/static", ServeDir::new(static_dir))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .with_state(state)
}

/// The event stream. Snapshot and queue registration happen atomically in
/// the hub, so the client misses nothing that existed at attach time; the
/// live tail follows until the client goes away or the hub shuts down.
async fn subscribe(State(state): State<AppState>) -> impl IntoResponse {
    let (snapshot, sub) = state.hub.snapshot_and_subscribe();
    info!(snapshot = snapshot.len(), id = sub.id(), "subscriber attached");

    // The subscription travels inside the stream; dropping the response on
    // any path (disconnect, shutdown, error) unsubscribes.
    let live = stream::unfold(sub, |mut sub| async move {
        sub.rx.recv().await.map(|event| (event, sub))
    });
    let frames = stream::iter(snapshot)
        .chain(live)
        .filter_map(|event| async move { encode_event(&event) })
        .map(Ok::<_, Infallible>);

    (
        [(header::CACHE_CONTROL, "no-cache"), (header::CONNECTION, "keep-alive")],
        Sse::new(frames),
    )
}

/// Render one event as an SSE frame: the whole envelope as single-line JSON
/// in the `data` field, no `event:` or `id:`. A marshal failure skips the
/// event rather than breaking the stream.
fn encode_event(event: &Event) -> Option<sse::Event> {
    match serde_json::to_string(event) {
        Ok(json) => Some(sse::Event::default().data(json)),
        Err(e) => {
            warn!(error = %e, "failed to marshal event; skipping");
            None
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogQuery {
    container: Option<String>,
    #[serde(default)]
    follow: bool,
    #[serde(default)]
    previous: bool,
    #[serde(default)]
    timestamps: bool,
    tail_lines: Option<i64>,
    since_seconds: Option<i64>,
}

/// Pod logs fetched from the upstream on the client's behalf, streamed
/// through unbuffered so `follow=true` behaves.
async fn pod_logs(
    State(state): State<AppState>,
    Path((namespace, pod)): Path<(String, String)>,
    Query(query): Query<LogQuery>,
) -> Result<Response, (StatusCode, String)> {
    info!(namespace = %namespace, pod = %pod, follow = query.follow, "log pass-through");

    let api: Api<Pod> = Api::namespaced(state.client.clone(), &namespace);
    let mut lp = LogParams::default();
    lp.container = query.container;
    lp.follow = query.follow;
    lp.previous = query.previous;
    lp.timestamps = query.timestamps;
    lp.tail_lines = query.tail_lines;
    lp.since_seconds = query.since_seconds;

    let reader = api.log_stream(&pod, &lp).await.map_err(map_kube_error)?;
    let body = Body::from_stream(ReaderStream::new(reader.compat()));
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response())
}

fn map_kube_error(err: kube::Error) -> (StatusCode, String) {
    match &err {
        kube::Error::Api(ae) => (
            StatusCode::from_u16(ae.code).unwrap_or(StatusCode::BAD_GATEWAY),
            ae.message.clone(),
        ),
        _ => (StatusCode::BAD_GATEWAY, err.to_string()),
    }
}
