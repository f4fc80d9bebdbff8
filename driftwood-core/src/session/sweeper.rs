//! Periodic eviction of stale sessions.
//!
//! A scheduler job walks a registry snapshot and deletes any session older
//! than the configured age limit, plus any session whose control-message
//! expiry epoch has passed. Deletion goes through the engine so running
//! retrieval tasks are cancelled, not orphaned.

use chrono::Utc;

use crate::config::SessionConfig;
use crate::engine::EngineHandle;
use crate::scheduler::{Job, JobSpec, Scheduler, SchedulerError};
use crate::session::SessionRegistry;

/// Job group the sweep runs in.
pub const SWEEP_GROUP: &str = "session-sweep";

/// Registers the sweep job group and submits the periodic age sweep.
///
/// # Errors
/// - `SchedulerError::DuplicateGroup` - called twice on one scheduler
pub fn register_sweep_job(
    scheduler: &Scheduler,
    registry: SessionRegistry,
    engine: EngineHandle,
    config: &SessionConfig,
) -> Result<(), SchedulerError> {
    scheduler.register_job_group(SWEEP_GROUP, 1, 4)?;

    let age_limit = config.age_limit;
    let spec = JobSpec::periodic("age-sweep", config.sweep_interval, config.sweep_interval);
    scheduler.submit(
        SWEEP_GROUP,
        Job::new(spec, move || {
            let registry = registry.clone();
            let engine = engine.clone();
            async move {
                let now = Utc::now();
                for session in registry.snapshot() {
                    let over_age = session.age() >= age_limit;
                    let expired = session.expires_at.is_some_and(|at| at <= now);
                    if !over_age && !expired {
                        continue;
                    }
                    tracing::info!(
                        session = %session.id,
                        age_ms = session.age().as_millis() as u64,
                        expired,
                        "evicting stale session"
                    );
                    if let Err(e) = engine.delete_session(&session.id).await {
                        tracing::warn!(session = %session.id, error = %e, "sweep eviction");
                    }
                }
            }
        }),
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::DriftwoodConfig;
    use crate::engine::{CreateSessionRequest, spawn_relay_engine};
    use crate::fetch::mock::MockFetcher;
    use crate::media::MediaStore;
    use crate::session::SessionId;

    async fn sweep_harness() -> (tempfile::TempDir, EngineHandle, SessionRegistry, Scheduler) {
        let dir = tempfile::tempdir().unwrap();
        let config = DriftwoodConfig::for_testing();
        let registry = SessionRegistry::new();
        let engine = spawn_relay_engine(
            config.clone(),
            registry.clone(),
            MockFetcher::new(),
            MediaStore::new(dir.path()),
        );
        let scheduler = Scheduler::new();
        register_sweep_job(&scheduler, registry.clone(), engine.clone(), &config.session).unwrap();
        (dir, engine, registry, scheduler)
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_evicted_at_age_limit() {
        let (_dir, engine, registry, _scheduler) = sweep_harness().await;
        let id = engine
            .create_session(CreateSessionRequest {
                id: SessionId::new("stale"),
                source_uri: "http://origin/live.mpd".to_string(),
                expires_at: None,
            })
            .await
            .unwrap();

        // for_testing age limit is 5000ms with a 100ms sweep.
        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert!(registry.contains(&id));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(!registry.contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_session_evicted_before_age_limit() {
        let (_dir, engine, registry, _scheduler) = sweep_harness().await;
        let id = engine
            .create_session(CreateSessionRequest {
                id: SessionId::new("expiring"),
                source_uri: "http://origin/live.mpd".to_string(),
                // Already past its control-message expiry.
                expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!registry.contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_session_untouched() {
        let (_dir, engine, registry, _scheduler) = sweep_harness().await;
        let id = engine
            .create_session(CreateSessionRequest {
                id: SessionId::new("fresh"),
                source_uri: "http://origin/live.mpd".to_string(),
                expires_at: None,
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(registry.contains(&id));
    }

    #[tokio::test]
    async fn test_double_registration_rejected() {
        let (_dir, engine, registry, scheduler) = sweep_harness().await;
        let config = DriftwoodConfig::for_testing();

        let result = register_sweep_job(&scheduler, registry, engine, &config.session);
        assert!(matches!(result, Err(SchedulerError::DuplicateGroup { .. })));
    }
}
