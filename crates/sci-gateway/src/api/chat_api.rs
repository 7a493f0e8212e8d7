//! `POST /v1/chat/completions`
//!
//! Both variants share classification and dispatch. The non-streamed
//! variant answers with one assembled `ChatResponse`; the streamed one
//! forwards backend increments as `chat.completion.chunk` SSE events and
//! ends with the `[DONE]` sentinel.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures_util::StreamExt;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::{validated, DOMAIN_HEADER, PARTIAL_HEADER, ROUTING_HEADER};
use crate::assembler::StreamFramer;
use crate::domain::DomainIntent;
use crate::error::GatewayError;
use crate::metrics::{self, InflightGuard};
use crate::orchestrator::{DispatchOutcome, StageTracker, StreamEvent};
use crate::protocol::{ChatCompletionChunk, ChatRequest, STREAM_SENTINEL};
use crate::shared_state::AppState;

const ROUTE: &str = "chat_completions";
const KEEP_ALIVE: Duration = Duration::from_secs(15);

pub async fn create_chat_completion(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let request_no = state.counters.inc_total_requests();
    let span = info_span!("chat", req = request_no);
    let stages = StageTracker::new(format!("req-{}", request_no));
    handle(state, payload, stages).instrument(span).await
}

async fn handle(
    state: AppState,
    payload: Result<Json<ChatRequest>, JsonRejection>,
    mut stages: StageTracker,
) -> Response {
    let (request, intent) = match admit(&state, payload) {
        Ok(admitted) => admitted,
        Err(e) => {
            stages.fail();
            return reject(&state, e);
        }
    };

    if request.stream {
        return stream_completion(state, request, intent, stages);
    }

    let _inflight = InflightGuard::enter();
    let mut outcome = match state.orchestrator.dispatch(&intent, &request, stages).await {
        Ok(outcome) => outcome,
        Err(e) => return reject(&state, e),
    };
    record_outcome(&state, &outcome);

    let response = state.assembler.assemble(&request, &outcome);
    let status = match outcome.to_error() {
        Some(e) => {
            warn!("Request failed after fallback: {}", e);
            e.status_code()
        }
        None => StatusCode::OK,
    };
    outcome.mark_done();
    debug!("[{}] finished as {}", outcome.stages.request_id(), outcome.stages.current());
    metrics::inc_request(ROUTE, status.as_str());

    (status, outcome_headers(&outcome), Json(response)).into_response()
}

/// Validate, check the model, then classify. Nothing here calls a backend.
fn admit(
    state: &AppState,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<(ChatRequest, DomainIntent), GatewayError> {
    let request = validated(payload)?;
    if !state.config.is_served_model(&request.model) {
        return Err(GatewayError::ModelNotFound(request.model));
    }
    let intent = state.classifier.classify(&request)?;
    info!(
        "Routing model={} stream={} -> {} (confidence {:.2}, task {})",
        request.model,
        request.stream,
        intent.domain,
        intent.confidence,
        intent.params.task_name()
    );
    Ok((request, intent))
}

fn reject(state: &AppState, err: GatewayError) -> Response {
    if err.is_client_error() {
        state.counters.inc_rejected();
        info!("Rejected request: {}", err);
    } else {
        state.counters.inc_failed();
        error!("Request failed: {}", err);
    }
    metrics::inc_request(ROUTE, err.status_code().as_str());
    err.into_response()
}

fn record_outcome(state: &AppState, outcome: &DispatchOutcome) {
    if outcome.all_failed() {
        state.counters.inc_failed();
        return;
    }
    if outcome.answered_by_fallback() {
        state.counters.inc_fallback();
    }
    if outcome.partial {
        state.counters.inc_partial();
    }
}

fn outcome_headers(outcome: &DispatchOutcome) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(DOMAIN_HEADER, HeaderValue::from_static(outcome.primary_domain.as_str()));
    if outcome.answered_by_fallback() {
        headers.insert(ROUTING_HEADER, HeaderValue::from_static("fallback"));
    }
    if outcome.partial && !outcome.all_failed() {
        headers.insert(PARTIAL_HEADER, HeaderValue::from_static("true"));
    }
    headers
}

fn chunk_event(chunk: &ChatCompletionChunk) -> Event {
    match serde_json::to_string(chunk) {
        Ok(data) => Event::default().data(data),
        Err(e) => {
            error!("Failed to serialize chunk: {}", e);
            Event::default().comment("unserializable chunk")
        }
    }
}

/// Stream response. Status and headers go out before dispatch finishes,
/// so a fallback or failure is reported inside the stream: a closing note
/// chunk and `finish_reason`.
fn stream_completion(state: AppState, request: ChatRequest, intent: DomainIntent, stages: StageTracker) -> Response {
    let inflight = InflightGuard::enter();
    let mut events = match state.orchestrator.dispatch_stream(&intent, &request, stages) {
        Ok(events) => events,
        Err(e) => return reject(&state, e),
    };
    metrics::inc_request(ROUTE, StatusCode::OK.as_str());

    let mut framer = StreamFramer::new(&request);
    info!("Streaming completion {}", framer.id());

    let output = async_stream::stream! {
        let _inflight = inflight;
        while let Some(event) = events.next().await {
            match event {
                StreamEvent::Delta(delta) => {
                    yield Ok::<_, Infallible>(chunk_event(&framer.content(&delta.content)));
                }
                StreamEvent::Completed(mut outcome) => {
                    record_outcome(&state, &outcome);
                    for chunk in framer.finish(&state.assembler, &request, &outcome) {
                        yield Ok(chunk_event(&chunk));
                    }
                    outcome.mark_done();
                    debug!("[{}] stream finished as {}", outcome.stages.request_id(), outcome.stages.current());
                }
            }
        }
        yield Ok(Event::default().data(STREAM_SENTINEL));
    };

    let mut headers = HeaderMap::new();
    headers.insert(DOMAIN_HEADER, HeaderValue::from_static(intent.domain.as_str()));
    (headers, Sse::new(output).keep_alive(KeepAlive::new().interval(KEEP_ALIVE))).into_response()
}
