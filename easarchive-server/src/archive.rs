//! Archive delivery: recording lookup, finalization check and byte-range
//! streaming, plus the alert log endpoint that shares the `/archive` path.

use std::io::{self, SeekFrom};
use std::path::PathBuf;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use log::{debug, error, warn};
use serde::Deserialize;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use easarchive_core::{
    manifest::{parse_recording_id, Manifest},
    range::{self, RangeOutcome},
    wav, ParseError, WatchList,
};

use crate::Session;

/// Body chunk size
pub const CHUNK_SIZE: usize = 8 * 1024;

const AUDIO_WAV: &str = "audio/wav";

/// 425 Too Early
fn too_early() -> StatusCode {
    StatusCode::from_u16(425).unwrap_or(StatusCode::SERVICE_UNAVAILABLE)
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("{0}")]
    BadRequest(String),
    #[error("Recording {0} not found")]
    NotFound(u64),
    #[error("Recording {0} is still being written")]
    NotReady(u64),
    #[error("Range not satisfiable for {size} bytes")]
    RangeUnsatisfiable { size: u64 },
    #[error("Reading recording failed: {0}")]
    Io(#[from] io::Error),
    #[error("Alert log could not be parsed: {0}")]
    Parse(#[from] ParseError),
    #[error("Building response failed: {0}")]
    Http(#[from] axum::http::Error),
}

impl IntoResponse for ArchiveError {
    fn into_response(self) -> Response {
        match self {
            ArchiveError::RangeUnsatisfiable { size } => (
                StatusCode::RANGE_NOT_SATISFIABLE,
                [
                    (header::CONTENT_RANGE, format!("bytes */{size}")),
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                ],
            )
                .into_response(),
            ArchiveError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()).into_response(),
            ArchiveError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()).into_response(),
            ArchiveError::NotReady(_) => (too_early(), self.to_string()).into_response(),
            ArchiveError::Io(_) | ArchiveError::Parse(_) | ArchiveError::Http(_) => {
                error!("{}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
            }
        }
    }
}

// =============================================================================
// Recording resolution and delivery
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRecording {
    pub id: u64,
    pub path: PathBuf,
    pub file_name: String,
}

/// Map a raw id parameter to an existing recording file.
pub fn resolve(manifest: &Manifest, raw_id: &str) -> Result<ResolvedRecording, ArchiveError> {
    let id = parse_recording_id(raw_id)
        .ok_or_else(|| ArchiveError::BadRequest(format!("Invalid recording id '{raw_id}'")))?;
    let path = PathBuf::from(manifest.get(id).ok_or(ArchiveError::NotFound(id))?);
    if !path.is_file() {
        return Err(ArchiveError::NotFound(id));
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(ResolvedRecording {
        id,
        path,
        file_name,
    })
}

/// Read the container header from the start of `file` and compare it with
/// the file's current length. Leaves the cursor past the header.
async fn header_is_finalized(file: &mut File, len: u64) -> io::Result<bool> {
    let mut header = Vec::with_capacity(wav::HEADER_SIZE);
    (&mut *file)
        .take(wav::HEADER_SIZE as u64)
        .read_to_end(&mut header)
        .await?;
    Ok(wav::is_finalized(&header, len))
}

/// Check whether the recorder has finished writing `path`.
pub async fn is_finalized(path: &std::path::Path) -> io::Result<bool> {
    let mut file = File::open(path).await?;
    let len = file.metadata().await?.len();
    header_is_finalized(&mut file, len).await
}

/// Build the response for a recording, honouring an optional Range header.
///
/// For `HEAD` the status and headers are identical and the body is empty.
pub async fn deliver(
    recording: &ResolvedRecording,
    range_header: Option<&str>,
    head_only: bool,
) -> Result<Response, ArchiveError> {
    let mut file = File::open(&recording.path).await?;
    let size = file.metadata().await?.len();

    if !header_is_finalized(&mut file, size).await? {
        debug!("Recording {} not finalized yet", recording.id);
        return Err(ArchiveError::NotReady(recording.id));
    }

    let outcome = range::resolve(range_header, size);
    if outcome == RangeOutcome::Unsatisfiable {
        return Err(ArchiveError::RangeUnsatisfiable { size });
    }
    let length = outcome.content_length(size);

    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, AUDIO_WAV)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, length)
        .header(
            header::CONTENT_DISPOSITION,
            format!("inline; filename=\"{}\"", recording.file_name),
        )
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate");
    builder = match outcome.content_range(size) {
        Some(content_range) => builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_RANGE, content_range),
        None => builder.status(StatusCode::OK),
    };

    if head_only {
        return Ok(builder.body(Body::empty())?);
    }

    file.seek(SeekFrom::Start(outcome.offset())).await?;
    // Dropping the body (peer gone) drops the stream and closes the file
    let stream = ReaderStream::with_capacity(file.take(length), CHUNK_SIZE);
    Ok(builder.body(Body::from_stream(stream))?)
}

// =============================================================================
// Alert log
// =============================================================================

/// Parse the alert log file. A missing log means no alerts yet.
pub async fn load_alerts(
    session: &Session,
    watch: &WatchList,
) -> Result<Vec<easarchive_core::AlertRecord>, ArchiveError> {
    let text = match tokio::fs::read_to_string(session.alert_log()).await {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("Alert log {} does not exist yet", session.alert_log().display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };
    Ok(session.parser().parse(&text, watch)?)
}

// =============================================================================
// Handler
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ArchiveQuery {
    pub latest_id: Option<String>,
    pub recording_id: Option<String>,
    pub fetch_alerts: Option<String>,
    pub filter_alerts: Option<String>,
}

fn is_true(flag: &Option<String>) -> bool {
    flag.as_deref()
        .is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

/// GET|HEAD /archive
pub async fn archive_handler(
    State(session): State<Session>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<ArchiveQuery>,
) -> Result<Response, ArchiveError> {
    if let Some(raw_id) = &query.recording_id {
        let manifest = manifest_snapshot(&session).await?;
        let recording = resolve(&manifest, raw_id)?;
        let range_header = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
        debug!(
            "{} recording {} ({}) range {:?}",
            method, recording.id, recording.file_name, range_header
        );
        return deliver(&recording, range_header, method == Method::HEAD).await;
    }

    if is_true(&query.latest_id) {
        let manifest = manifest_snapshot(&session).await?;
        let body = match manifest.latest_id() {
            Some(id) => id.to_string(),
            None => "-1".to_string(),
        };
        let mut response = body.into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        return Ok(response);
    }

    if is_true(&query.fetch_alerts) {
        let watch = match query.filter_alerts.as_deref() {
            Some("watched_fips") => session.watch_list().clone(),
            Some(other) => {
                warn!("Ignoring unknown alert filter '{}'", other);
                WatchList::default()
            }
            None => WatchList::default(),
        };
        let alerts = load_alerts(&session, &watch).await?;
        return Ok(Json(alerts).into_response());
    }

    Err(ArchiveError::BadRequest(
        "Expected one of latest_id, recording_id or fetch_alerts".to_string(),
    ))
}

async fn manifest_snapshot(
    session: &Session,
) -> Result<std::sync::Arc<Manifest>, ArchiveError> {
    let cache = session.manifest().clone();
    tokio::task::spawn_blocking(move || cache.get_manifest(false))
        .await
        .map_err(|e| ArchiveError::Io(io::Error::other(e)))
}
