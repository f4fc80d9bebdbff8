//! Per-session retrieval: manifest loop and per-track state machines.
//!
//! One supervisor task runs per started session. It performs the initial
//! manifest round trip, spawns one task per track (audio, video), and then
//! drives the manifest refresh timer while watching for track completion.
//! Within one track, requests are strictly sequential; the next request is
//! never issued before the current one is fully resolved. Tracks and
//! sessions are otherwise fully independent.
//!
//! Every fetch shares one retry policy: a non-success status or an idle
//! timeout increments the retry count and backs off for
//! `base / max(1, retry_limit - (retry_count - 1))`, so waits shrink as
//! attempts run out. Backoff time accumulates as compensation debt which the
//! segment pacing sleep later repays.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use url::Url;

use crate::config::FetchConfig;
use crate::fetch::SegmentFetch;
use crate::manifest::{RepresentationId, SegmentTracker};
use crate::media::MediaStore;
use crate::session::{SessionError, SessionId, SessionRegistry, StreamType, TrackKind};

/// How a session's retrieval ended, as reported to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalOutcome {
    /// Cancelled by the engine; no state change needed.
    Stopped,
    /// The source ran out or failed on a STATIC session; stop gracefully.
    SourceEnded,
    /// Unrecoverable failure on a LIVE session; the source is gone.
    Fatal,
}

/// Everything a session supervisor needs, cloned out of the engine.
pub(crate) struct RetrievalContext {
    pub session_id: SessionId,
    pub source_uri: String,
    pub config: FetchConfig,
    pub fetcher: Arc<dyn SegmentFetch>,
    pub media: MediaStore,
    pub registry: SessionRegistry,
    pub tracker: Arc<SegmentTracker>,
    pub stop: watch::Receiver<bool>,
}

/// Track retrieval phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackState {
    Idle,
    ManifestDone,
    /// Resting and active state for the perpetual segment loop.
    InitSegmentDone,
}

/// Mutable per-track retry and pacing state.
struct TrackRuntime {
    state: TrackState,
    retry_count: u32,
    compensation_micros: u64,
    is_retrying: bool,
}

impl TrackRuntime {
    fn new() -> Self {
        Self {
            state: TrackState::Idle,
            retry_count: 0,
            compensation_micros: 0,
            is_retrying: false,
        }
    }

    fn transition(&mut self, session: &SessionId, track: TrackKind, state: TrackState) {
        tracing::debug!(session = %session, %track, from = ?self.state, to = ?state, "track transition");
        self.state = state;
    }
}

enum TrackEnd {
    /// Cancelled via the stop signal.
    Stopped,
    /// Retry budget spent; the source stopped answering.
    Exhausted,
    /// Structural failure (bad segment name, persistence error).
    Failed(SessionError),
}

/// Supervises one session's retrieval end to end.
pub(crate) async fn run_session(ctx: RetrievalContext) -> RetrievalOutcome {
    let mut stop = ctx.stop.clone();

    let manifest = tokio::select! {
        _ = stop.changed() => return RetrievalOutcome::Stopped,
        result = initial_manifest(&ctx) => result,
    };
    if let Err(e) = manifest {
        if matches!(e, SessionError::EngineShutdown) {
            return RetrievalOutcome::Stopped;
        }
        tracing::error!(session = %ctx.session_id, error = %e, "manifest retrieval failed");
        return escalate(&ctx);
    }

    let mut tracks = tokio::task::JoinSet::new();
    for kind in [TrackKind::Video, TrackKind::Audio] {
        // Relay the first listed variant of each track.
        if let Some(representation) = ctx.tracker.representations_for(kind).into_iter().next() {
            tracks.spawn(run_track(TrackContext {
                session_id: ctx.session_id.clone(),
                kind,
                representation,
                source_uri: ctx.source_uri.clone(),
                config: ctx.config.clone(),
                fetcher: Arc::clone(&ctx.fetcher),
                media: ctx.media.clone(),
                tracker: Arc::clone(&ctx.tracker),
                stop: ctx.stop.clone(),
            }));
        }
    }
    if tracks.is_empty() {
        tracing::error!(session = %ctx.session_id, "manifest has no audio or video representations");
        return escalate(&ctx);
    }

    let mut refresh = Box::pin(refresh_loop(&ctx));
    loop {
        tokio::select! {
            _ = stop.changed() => {
                tracks.abort_all();
                return RetrievalOutcome::Stopped;
            }
            joined = tracks.join_next() => {
                match joined {
                    Some(Ok(TrackEnd::Stopped)) | Some(Err(_)) => {
                        if let Some(Err(e)) = &joined {
                            tracing::error!(session = %ctx.session_id, error = %e, "track task aborted");
                        }
                    }
                    Some(Ok(TrackEnd::Exhausted)) => {
                        tracks.abort_all();
                        return escalate(&ctx);
                    }
                    Some(Ok(TrackEnd::Failed(e))) => {
                        tracing::error!(session = %ctx.session_id, error = %e, "track failed");
                        tracks.abort_all();
                        return escalate(&ctx);
                    }
                    None => {}
                }
                if tracks.is_empty() {
                    return RetrievalOutcome::SourceEnded;
                }
            }
            error = &mut refresh => {
                tracing::error!(session = %ctx.session_id, error = %error, "manifest refresh failed");
                tracks.abort_all();
                return escalate(&ctx);
            }
        }
    }
}

/// Manifest failures stop a STATIC session gracefully and delete a LIVE one.
/// Before the first successful parse the session is assumed LIVE.
fn escalate(ctx: &RetrievalContext) -> RetrievalOutcome {
    match ctx.tracker.stream_type() {
        Some(StreamType::Static) => RetrievalOutcome::SourceEnded,
        _ => RetrievalOutcome::Fatal,
    }
}

/// Fetches, persists, parses, and validates the manifest, then publishes
/// stream metadata to the registry.
async fn initial_manifest(ctx: &RetrievalContext) -> Result<(), SessionError> {
    let mut stop = ctx.stop.clone();
    let mut runtime = TrackRuntime::new();
    let body = fetch_with_retry(
        &ctx.fetcher,
        &ctx.config,
        &mut stop,
        &mut runtime,
        &ctx.source_uri,
        ctx.config.manifest_retry_delay.as_micros() as u64,
        "manifest",
    )
    .await?;
    apply_manifest(ctx, &body).await
}

async fn apply_manifest(ctx: &RetrievalContext, body: &Bytes) -> Result<(), SessionError> {
    let name = super::manifest_file_name(&ctx.source_uri);
    let path = ctx.media.persist(&ctx.session_id, &name, body).await?;

    let text = String::from_utf8_lossy(body);
    ctx.tracker.load(&text)?;
    if ctx.config.validate_manifests && !ctx.tracker.validate() {
        return Err(SessionError::ManifestValidation { path });
    }
    ctx.tracker.seed_start_numbers();

    let stream_type = ctx.tracker.stream_type().unwrap_or(StreamType::Live);
    ctx.registry.set_stream_type(&ctx.session_id, stream_type);
    ctx.registry.record_manifest_meta(
        &ctx.session_id,
        ctx.tracker.min_buffer_time(),
        ctx.tracker.media_presentation_duration(),
    );
    tracing::info!(session = %ctx.session_id, r#type = %stream_type, "manifest applied");
    Ok(())
}

/// Re-fetches the manifest each refresh window. Returns only on a failure
/// that should end the session.
async fn refresh_loop(ctx: &RetrievalContext) -> SessionError {
    let mut stop = ctx.stop.clone();
    let mut runtime = TrackRuntime::new();
    loop {
        let window = ctx.tracker.refresh_window(ctx.config.default_refresh_window);
        tokio::time::sleep(window).await;

        let result = fetch_with_retry(
            &ctx.fetcher,
            &ctx.config,
            &mut stop,
            &mut runtime,
            &ctx.source_uri,
            ctx.config.manifest_retry_delay.as_micros() as u64,
            "manifest",
        )
        .await;
        let body = match result {
            Ok(body) => body,
            Err(e) => return e,
        };
        runtime.compensation_micros = 0;
        if let Err(e) = apply_manifest(ctx, &body).await {
            return e;
        }
        tracing::debug!(session = %ctx.session_id, "manifest refreshed");
    }
}

struct TrackContext {
    session_id: SessionId,
    kind: TrackKind,
    representation: RepresentationId,
    source_uri: String,
    config: FetchConfig,
    fetcher: Arc<dyn SegmentFetch>,
    media: MediaStore,
    tracker: Arc<SegmentTracker>,
    stop: watch::Receiver<bool>,
}

/// One track's state machine: init segment, then the perpetual segment loop.
async fn run_track(mut ctx: TrackContext) -> TrackEnd {
    let mut runtime = TrackRuntime::new();
    // The supervisor only spawns tracks after the manifest round trip.
    runtime.transition(&ctx.session_id, ctx.kind, TrackState::ManifestDone);

    match retrieve_init_segment(&mut ctx, &mut runtime).await {
        Ok(()) => {}
        Err(e) => return end_for(&ctx, e),
    }
    runtime.transition(&ctx.session_id, ctx.kind, TrackState::InitSegmentDone);

    // INIT_SEGMENT_DONE self-loop: only the sequence cursor advances.
    loop {
        if *ctx.stop.borrow() {
            return TrackEnd::Stopped;
        }

        let number = ctx.tracker.next_sequence(&ctx.representation);
        let name = match ctx.tracker.segment_name(&ctx.representation, number) {
            Ok(name) => name,
            Err(e) => return end_for(&ctx, e),
        };
        let url = match resolve_url(&ctx.source_uri, &name) {
            Ok(url) => url,
            Err(e) => return end_for(&ctx, e),
        };

        let base_micros = ctx.tracker.segment_duration_micros(&ctx.representation);
        let body = match fetch_with_retry(
            &ctx.fetcher,
            &ctx.config,
            &mut ctx.stop,
            &mut runtime,
            &url,
            base_micros,
            &format!("{} segment {number}", ctx.kind),
        )
        .await
        {
            Ok(body) => body,
            Err(e) => return end_for(&ctx, e),
        };

        if let Err(e) = ctx.media.persist(&ctx.session_id, &name, &body).await {
            return end_for(&ctx, e.into());
        }
        ctx.tracker.record_retrieved(&ctx.representation, number);
        tracing::debug!(
            session = %ctx.session_id,
            track = %ctx.kind,
            segment = number,
            bytes = body.len(),
            "segment retrieved"
        );

        // Pacing: nominal duration less the live-edge offset, minus any
        // compensation debt from retries. If the debt exceeds the window,
        // sleep the unadjusted window rather than going negative.
        let adjusted = base_micros
            .saturating_sub(ctx.tracker.availability_offset_micros(&ctx.representation));
        let pace_micros = if adjusted >= runtime.compensation_micros {
            adjusted - runtime.compensation_micros
        } else {
            adjusted
        };
        runtime.compensation_micros = 0;

        tokio::select! {
            _ = ctx.stop.changed() => return TrackEnd::Stopped,
            _ = tokio::time::sleep(Duration::from_micros(pace_micros)) => {}
        }
    }
}

async fn retrieve_init_segment(
    ctx: &mut TrackContext,
    runtime: &mut TrackRuntime,
) -> Result<(), SessionError> {
    let name = ctx.tracker.init_segment_name(&ctx.representation)?;
    let url = resolve_url(&ctx.source_uri, &name)?;
    let body = fetch_with_retry(
        &ctx.fetcher,
        &ctx.config,
        &mut ctx.stop,
        runtime,
        &url,
        ctx.config.manifest_retry_delay.as_micros() as u64,
        &format!("{} init segment", ctx.kind),
    )
    .await?;
    runtime.compensation_micros = 0;
    ctx.media.persist(&ctx.session_id, &name, &body).await?;
    Ok(())
}

fn end_for(ctx: &TrackContext, error: SessionError) -> TrackEnd {
    match error {
        SessionError::EngineShutdown => TrackEnd::Stopped,
        SessionError::RetriesExhausted { target, attempts } => {
            tracing::error!(
                session = %ctx.session_id,
                track = %ctx.kind,
                target,
                attempts,
                "retries exhausted"
            );
            TrackEnd::Exhausted
        }
        other => TrackEnd::Failed(other),
    }
}

fn resolve_url(base: &str, name: &str) -> Result<String, SessionError> {
    Ok(Url::parse(base)?.join(name)?.to_string())
}

/// Shared retry policy for manifest, init-segment, and media-segment
/// fetches. Success resets the retry state; the accumulated compensation is
/// left for the caller to repay.
async fn fetch_with_retry(
    fetcher: &Arc<dyn SegmentFetch>,
    config: &FetchConfig,
    stop: &mut watch::Receiver<bool>,
    runtime: &mut TrackRuntime,
    url: &str,
    base_micros: u64,
    target: &str,
) -> Result<Bytes, SessionError> {
    loop {
        if *stop.borrow() {
            return Err(SessionError::EngineShutdown);
        }

        let attempt = tokio::select! {
            _ = stop.changed() => return Err(SessionError::EngineShutdown),
            result = tokio::time::timeout(config.idle_timeout, fetcher.fetch(url)) => result,
        };
        let failure = match attempt {
            Ok(Ok(body)) => {
                if runtime.is_retrying {
                    tracing::info!(target, url, attempts = runtime.retry_count, "fetch recovered");
                }
                runtime.retry_count = 0;
                runtime.is_retrying = false;
                return Ok(body);
            }
            Ok(Err(e)) => e,
            Err(_) => SessionError::IdleTimeout {
                url: url.to_string(),
            },
        };

        runtime.retry_count += 1;
        if runtime.retry_count > config.retry_limit {
            runtime.is_retrying = false;
            return Err(SessionError::RetriesExhausted {
                target: target.to_string(),
                attempts: runtime.retry_count,
            });
        }
        runtime.is_retrying = true;

        let divisor = u64::from(config.retry_limit - (runtime.retry_count - 1)).max(1);
        let backoff_micros = base_micros / divisor;
        runtime.compensation_micros += backoff_micros;
        tracing::warn!(
            target,
            url,
            retry = runtime.retry_count,
            backoff_ms = backoff_micros / 1000,
            error = %failure,
            "fetch failed, backing off"
        );

        tokio::select! {
            _ = stop.changed() => return Err(SessionError::EngineShutdown),
            _ = tokio::time::sleep(Duration::from_micros(backoff_micros)) => {}
        }
    }
}
