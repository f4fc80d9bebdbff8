//! Session retrieval engine actor.
//!
//! The engine owns all retrieval tasks and is driven through
//! `EngineHandle` over a command channel. Session records live in the shared
//! `SessionRegistry`; the engine coordinates their lifecycle: create, start
//! the per-track retrieval loops, stop, delete. Retrieval tasks report back
//! through the same command channel, so a session whose source disappears is
//! escalated exactly once, even racing a concurrent stop.

pub mod retrieval;


use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use url::Url;

use crate::config::DriftwoodConfig;
use crate::fetch::SegmentFetch;
use crate::manifest::SegmentTracker;
use crate::media::MediaStore;
use crate::segmenter::Segmenter;
use crate::session::{Session, SessionError, SessionId, SessionRegistry, StreamType};
use self::retrieval::{RetrievalContext, RetrievalOutcome};

/// Parameters for creating one session.
#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub id: SessionId,
    pub source_uri: String,
    /// Expiry epoch from the session-begin control message, if any.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Commands accepted by the engine actor.
pub enum EngineCommand {
    CreateSession {
        request: CreateSessionRequest,
        responder: oneshot::Sender<Result<SessionId, SessionError>>,
    },
    StartRetrieval {
        id: SessionId,
        responder: oneshot::Sender<Result<(), SessionError>>,
    },
    StopRetrieval {
        id: SessionId,
        responder: oneshot::Sender<Result<(), SessionError>>,
    },
    DeleteSession {
        id: SessionId,
        responder: oneshot::Sender<Result<(), SessionError>>,
    },
    GetSession {
        id: SessionId,
        responder: oneshot::Sender<Result<Session, SessionError>>,
    },
    GetActiveSessions {
        responder: oneshot::Sender<Vec<Session>>,
    },
    GenerateManifest {
        name: String,
        source_path: PathBuf,
        responder: oneshot::Sender<Result<PathBuf, SessionError>>,
    },
    /// Internal: a session's retrieval supervisor finished.
    RetrievalEnded {
        id: SessionId,
        outcome: RetrievalOutcome,
    },
    Shutdown {
        responder: oneshot::Sender<()>,
    },
}

/// Public-facing handle to the engine actor; cheap to clone.
#[derive(Clone)]
pub struct EngineHandle {
    sender: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    /// Creates a session record without starting retrieval.
    ///
    /// # Errors
    /// - `SessionError::DuplicateSession` - id already registered
    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<SessionId, SessionError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(EngineCommand::CreateSession { request, responder })
            .await
            .map_err(|_| SessionError::EngineShutdown)?;
        rx.await.map_err(|_| SessionError::EngineShutdown)?
    }

    /// Starts manifest and track retrieval for a created session.
    ///
    /// # Errors
    /// - `SessionError::SessionNotFound` / `AlreadyRunning`
    pub async fn start_retrieval(&self, id: &SessionId) -> Result<(), SessionError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(EngineCommand::StartRetrieval {
                id: id.clone(),
                responder,
            })
            .await
            .map_err(|_| SessionError::EngineShutdown)?;
        rx.await.map_err(|_| SessionError::EngineShutdown)?
    }

    /// Cancels retrieval; the session stays queryable in `Stopped` state.
    pub async fn stop_retrieval(&self, id: &SessionId) -> Result<(), SessionError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(EngineCommand::StopRetrieval {
                id: id.clone(),
                responder,
            })
            .await
            .map_err(|_| SessionError::EngineShutdown)?;
        rx.await.map_err(|_| SessionError::EngineShutdown)?
    }

    /// Stops retrieval, removes the record, and purges stored artifacts.
    ///
    /// # Errors
    /// - `SessionError::SessionNotFound` - no such session
    pub async fn delete_session(&self, id: &SessionId) -> Result<(), SessionError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(EngineCommand::DeleteSession {
                id: id.clone(),
                responder,
            })
            .await
            .map_err(|_| SessionError::EngineShutdown)?;
        rx.await.map_err(|_| SessionError::EngineShutdown)?
    }

    /// Fetches a session record.
    ///
    /// # Errors
    /// - `SessionError::SessionNotFound` - no such session
    pub async fn session(&self, id: &SessionId) -> Result<Session, SessionError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(EngineCommand::GetSession {
                id: id.clone(),
                responder,
            })
            .await
            .map_err(|_| SessionError::EngineShutdown)?;
        rx.await.map_err(|_| SessionError::EngineShutdown)?
    }

    /// Snapshot of all session records.
    pub async fn active_sessions(&self) -> Result<Vec<Session>, SessionError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(EngineCommand::GetActiveSessions { responder })
            .await
            .map_err(|_| SessionError::EngineShutdown)?;
        rx.await.map_err(|_| SessionError::EngineShutdown)
    }

    /// Segments a local source that has no manifest yet and registers a
    /// STATIC session for the result.
    ///
    /// # Errors
    /// - `SessionError::ToolInvocation` - the segmentation script failed
    /// - `SessionError::DuplicateSession` - a session with this name exists
    pub async fn generate_manifest(
        &self,
        name: &str,
        source_path: impl Into<PathBuf>,
    ) -> Result<PathBuf, SessionError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(EngineCommand::GenerateManifest {
                name: name.to_string(),
                source_path: source_path.into(),
                responder,
            })
            .await
            .map_err(|_| SessionError::EngineShutdown)?;
        rx.await.map_err(|_| SessionError::EngineShutdown)?
    }

    /// Stops all retrieval and shuts the actor down.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(EngineCommand::Shutdown { responder })
            .await
            .map_err(|_| SessionError::EngineShutdown)?;
        rx.await.map_err(|_| SessionError::EngineShutdown)
    }

    pub(crate) fn internal_sender(&self) -> mpsc::Sender<EngineCommand> {
        self.sender.clone()
    }
}

/// Spawns the engine actor and returns its handle.
pub fn spawn_relay_engine<F>(
    config: DriftwoodConfig,
    registry: SessionRegistry,
    fetcher: F,
    media: MediaStore,
) -> EngineHandle
where
    F: SegmentFetch,
{
    let (sender, mut receiver) = mpsc::channel(100);
    let handle = EngineHandle {
        sender: sender.clone(),
    };
    let mut engine = RelayEngine {
        config,
        registry,
        fetcher: Arc::new(fetcher),
        media,
        active: HashMap::new(),
        internal_tx: sender,
    };

    tokio::spawn(async move {
        while let Some(command) = receiver.recv().await {
            match command {
                EngineCommand::CreateSession { request, responder } => {
                    let _ = responder.send(engine.create_session(request));
                }
                EngineCommand::StartRetrieval { id, responder } => {
                    let _ = responder.send(engine.start_retrieval(id));
                }
                EngineCommand::StopRetrieval { id, responder } => {
                    let _ = responder.send(engine.stop_retrieval(&id));
                }
                EngineCommand::DeleteSession { id, responder } => {
                    let _ = responder.send(engine.delete_session(&id).await);
                }
                EngineCommand::GetSession { id, responder } => {
                    let result = engine
                        .registry
                        .get(&id)
                        .ok_or(SessionError::SessionNotFound { id });
                    let _ = responder.send(result);
                }
                EngineCommand::GetActiveSessions { responder } => {
                    let _ = responder.send(engine.registry.snapshot());
                }
                EngineCommand::GenerateManifest {
                    name,
                    source_path,
                    responder,
                } => {
                    engine.generate_manifest(name, source_path, responder);
                }
                EngineCommand::RetrievalEnded { id, outcome } => {
                    engine.retrieval_ended(id, outcome).await;
                }
                EngineCommand::Shutdown { responder } => {
                    engine.stop_all();
                    let _ = responder.send(());
                    break;
                }
            }
        }
        tracing::info!("relay engine stopped");
    });

    handle
}

/// One running retrieval: the supervisor task plus its stop signal.
struct ActiveRetrieval {
    stop_tx: watch::Sender<bool>,
    supervisor: tokio::task::JoinHandle<()>,
}

struct RelayEngine {
    config: DriftwoodConfig,
    registry: SessionRegistry,
    fetcher: Arc<dyn SegmentFetch>,
    media: MediaStore,
    active: HashMap<SessionId, ActiveRetrieval>,
    internal_tx: mpsc::Sender<EngineCommand>,
}

impl RelayEngine {
    fn create_session(&self, request: CreateSessionRequest) -> Result<SessionId, SessionError> {
        let manifest_path = self
            .media
            .artifact_path(&request.id, &manifest_file_name(&request.source_uri))?;
        // Stream type is provisional until the first manifest parse.
        let mut session = Session::new(
            request.id.clone(),
            StreamType::Live,
            request.source_uri,
            manifest_path,
        );
        if let Some(expires_at) = request.expires_at {
            session = session.with_expiry(expires_at);
        }
        self.registry.insert(session)?;
        Ok(request.id)
    }

    fn start_retrieval(&mut self, id: SessionId) -> Result<(), SessionError> {
        if self.active.contains_key(&id) {
            return Err(SessionError::AlreadyRunning { id });
        }
        let session = self
            .registry
            .get(&id)
            .ok_or_else(|| SessionError::SessionNotFound { id: id.clone() })?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let context = RetrievalContext {
            session_id: id.clone(),
            source_uri: session.source_uri,
            config: self.config.fetch.clone(),
            fetcher: Arc::clone(&self.fetcher),
            media: self.media.clone(),
            registry: self.registry.clone(),
            tracker: Arc::new(SegmentTracker::new()),
            stop: stop_rx,
        };

        let engine_tx = self.internal_tx.clone();
        let session_id = id.clone();
        let supervisor = tokio::spawn(async move {
            let outcome = retrieval::run_session(context).await;
            let _ = engine_tx
                .send(EngineCommand::RetrievalEnded {
                    id: session_id,
                    outcome,
                })
                .await;
        });

        self.registry.mark_running(&id);
        self.active.insert(id, ActiveRetrieval { stop_tx, supervisor });
        Ok(())
    }

    /// Always succeeds; stopping a session that never started is a no-op
    /// apart from the state transition.
    fn stop_retrieval(&mut self, id: &SessionId) -> Result<(), SessionError> {
        if let Some(active) = self.active.remove(id) {
            let _ = active.stop_tx.send(true);
        }
        self.registry.mark_stopped(id);
        Ok(())
    }

    async fn delete_session(&mut self, id: &SessionId) -> Result<(), SessionError> {
        if let Some(active) = self.active.remove(id) {
            let _ = active.stop_tx.send(true);
        }
        if self.registry.remove(id).is_none() {
            return Err(SessionError::SessionNotFound { id: id.clone() });
        }
        self.media.purge_session(id).await?;
        Ok(())
    }

    /// Completion for a session that was stopped or deleted concurrently is
    /// a no-op.
    async fn retrieval_ended(&mut self, id: SessionId, outcome: RetrievalOutcome) {
        let Some(active) = self.active.remove(&id) else {
            return;
        };
        drop(active.supervisor);

        match outcome {
            RetrievalOutcome::Stopped => {}
            RetrievalOutcome::SourceEnded => {
                tracing::info!(session = %id, "retrieval ended, session stopped");
                self.registry.mark_stopped(&id);
            }
            RetrievalOutcome::Fatal => {
                tracing::warn!(session = %id, "retrieval failed, removing session");
                self.registry.remove(&id);
                if let Err(e) = self.media.purge_session(&id).await {
                    tracing::warn!(session = %id, error = %e, "purge after failure");
                }
            }
        }
    }

    /// Segmentation runs out-of-process and may be slow, so it is spawned
    /// off the actor loop; the session is registered once the tool succeeds.
    fn generate_manifest(
        &self,
        name: String,
        source_path: PathBuf,
        responder: oneshot::Sender<Result<PathBuf, SessionError>>,
    ) {
        let id = SessionId::new(name.clone());
        if self.registry.contains(&id) {
            let _ = responder.send(Err(SessionError::DuplicateSession { id }));
            return;
        }

        let segmenter = Segmenter::new(self.config.media.script_path.clone());
        let registry = self.registry.clone();
        let source = source_path.to_string_lossy().to_string();

        // A source that already is a manifest needs no segmentation.
        let passthrough = source_path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("mpd"));
        let manifest_path = if passthrough {
            source_path.clone()
        } else {
            self.media.session_dir(&id).join(format!("{name}.mpd"))
        };

        tokio::spawn(async move {
            let generated = if passthrough {
                Ok(())
            } else {
                segmenter
                    .generate_manifest(&name, &source, &manifest_path)
                    .await
            };
            let result = generated.and_then(|()| {
                let session = Session::new(
                    id.clone(),
                    StreamType::Static,
                    source,
                    manifest_path.clone(),
                );
                registry.insert(session)?;

                let tracker = SegmentTracker::new();
                match tracker.load_file(&manifest_path) {
                    Ok(()) => registry.record_manifest_meta(
                        &id,
                        tracker.min_buffer_time(),
                        tracker.media_presentation_duration(),
                    ),
                    Err(e) => {
                        tracing::debug!(session = %id, error = %e, "generated manifest not parseable");
                    }
                }
                Ok(manifest_path)
            });
            if let Err(e) = &result {
                tracing::warn!(session = %id, error = %e, "manifest generation failed");
            }
            let _ = responder.send(result);
        });
    }

    fn stop_all(&mut self) {
        for (id, active) in self.active.drain() {
            let _ = active.stop_tx.send(true);
            self.registry.mark_stopped(&id);
        }
    }
}

fn manifest_file_name(source_uri: &str) -> String {
    Url::parse(source_uri)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "manifest.mpd".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_file_name_from_uri() {
        assert_eq!(
            manifest_file_name("http://origin:8080/streams/cam-7/live.mpd"),
            "live.mpd"
        );
        assert_eq!(manifest_file_name("http://origin/"), "manifest.mpd");
        assert_eq!(manifest_file_name("not a url"), "manifest.mpd");
    }
}
