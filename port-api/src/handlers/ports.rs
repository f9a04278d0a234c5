use std::io;

use axum::{
    body::Bytes,
    extract::{multipart::Field, Multipart, State},
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tracing::{debug, error};

use port_ingestor::ingestor::IngestSummary;
use port_ingestor::source::SourceSelection;

use super::AppState;

/// Name of the multipart form field carrying an uploaded ports document.
const FILE_FIELD: &str = "file";

#[derive(Serialize, Debug, Default, PartialEq)]
pub struct PortsResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    created: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    updated: Option<u64>,
}

impl From<IngestSummary> for PortsResponse {
    fn from(summary: IngestSummary) -> Self {
        Self {
            error: None,
            created: Some(summary.created),
            updated: Some(summary.updated),
        }
    }
}

type ErrorResponse = (StatusCode, Json<PortsResponse>);
type PostResult = Result<(StatusCode, Json<PortsResponse>), ErrorResponse>;

/// Ingest the configured ports file, resolved against the data directory.
pub async fn post(State(state): State<AppState>) -> PostResult {
    debug!("ingesting ports from {}", state.ports_file.display());

    ingest(&state, SourceSelection::path(state.ports_file.as_path())).await
}

/// Ingest the `file` field of a multipart upload as it arrives, without buffering the document.
pub async fn post_from_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> PostResult {
    while let Some(field) = multipart.next_field().await.map_err(bad_request)? {
        if field.name() == Some(FILE_FIELD) {
            return ingest_field(&state, field).await;
        }
    }

    Err(bad_request("file not found"))
}

/// Hands the field's chunks to the ingestor through a channel, so the ingestion and the body
/// read make progress together while the field keeps borrowing the request.
async fn ingest_field(state: &AppState, field: Field<'_>) -> PostResult {
    let (sender, receiver) = mpsc::channel(1);
    let chunks = Box::pin(futures::stream::unfold(receiver, |mut receiver| async move {
        receiver.recv().await.map(|chunk| (chunk, receiver))
    }));
    let selection = SourceSelection::stream(StreamReader::new(chunks));

    let (result, ()) = tokio::join!(ingest(state, selection), forward(field, sender));
    result
}

/// Stops early once the ingestion is done with the stream.
async fn forward(mut field: Field<'_>, sender: mpsc::Sender<io::Result<Bytes>>) {
    loop {
        let chunk = match field.chunk().await {
            Ok(Some(chunk)) => Ok(chunk),
            Ok(None) => return,
            Err(err) => Err(io::Error::other(err)),
        };

        let failed = chunk.is_err();
        if sender.send(chunk).await.is_err() || failed {
            return;
        }
    }
}

async fn ingest(state: &AppState, selection: SourceSelection) -> PostResult {
    let result = state
        .ingestor
        .run_until(selection, state.shutdown.clone())
        .await;

    // Even a failed run may have written some records.
    state.list_cache.invalidate();

    let summary = result.map_err(internal_error)?;

    Ok((StatusCode::CREATED, Json(summary.into())))
}

pub async fn list(State(state): State<AppState>, uri: Uri) -> Result<Response, ErrorResponse> {
    let body = state
        .list_cache
        .get_or_load(&uri.to_string(), state.ingestor.repository().as_ref())
        .await
        .map_err(internal_error)?;

    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

fn bad_request<E>(err: E) -> ErrorResponse
where
    E: ToString,
{
    (
        StatusCode::BAD_REQUEST,
        Json(PortsResponse {
            error: Some(err.to_string()),
            ..Default::default()
        }),
    )
}

fn internal_error<E>(err: E) -> ErrorResponse
where
    E: std::error::Error,
{
    error!("internal error: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(PortsResponse {
            error: Some(err.to_string()),
            ..Default::default()
        }),
    )
}
