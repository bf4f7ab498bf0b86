use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::services::api::VisitApi;
use crate::services::messaging::Notifier;
use crate::services::scheduler::{Phase, Scheduler, SchedulerSettings};

type SessionKey = (String, String);

struct SessionEntry {
    scheduler: Scheduler,
    last_seen: Instant,
}

pub struct AppState {
    pub config: AppConfig,
    pub api: Arc<dyn VisitApi>,
    pub notifier: Option<Arc<dyn Notifier>>,
    /// One scheduler per (user, listing), stamped on every access.
    sessions: Mutex<HashMap<SessionKey, SessionEntry>>,
}

impl AppState {
    pub fn new(config: AppConfig, api: Arc<dyn VisitApi>, notifier: Option<Arc<dyn Notifier>>) -> Self {
        Self {
            config,
            api,
            notifier,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionKey, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Session for (user, listing), opened if missing.
    pub fn session(&self, user_id: &str, listing_id: &str) -> Scheduler {
        let mut sessions = self.sessions();
        let entry = sessions
            .entry((user_id.to_string(), listing_id.to_string()))
            .or_insert_with(|| {
                tracing::debug!(user_id, listing_id, "opening scheduler session");
                SessionEntry {
                    scheduler: self.open_scheduler(user_id, listing_id),
                    last_seen: Instant::now(),
                }
            });
        entry.last_seen = Instant::now();
        entry.scheduler.clone()
    }

    /// Existing session only; never creates one.
    pub fn existing_session(&self, user_id: &str, listing_id: &str) -> Option<Scheduler> {
        let mut sessions = self.sessions();
        let entry = sessions.get_mut(&(user_id.to_string(), listing_id.to_string()))?;
        entry.last_seen = Instant::now();
        Some(entry.scheduler.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }

    fn open_scheduler(&self, user_id: &str, listing_id: &str) -> Scheduler {
        let settings = SchedulerSettings {
            listing_id: listing_id.to_string(),
            user_id: user_id.to_string(),
            channel: self.config.channel.clone(),
            timezone: self.config.timezone,
            day_policy: self.config.day_policy(),
        };
        let scheduler = Scheduler::new(self.api.clone(), settings);
        match &self.notifier {
            Some(notifier) => scheduler.with_notifier(notifier.clone()),
            None => scheduler,
        }
    }

    /// Drops sessions not touched for longer than the configured idle TTL as
    /// of `now`. Sessions with a request in flight are kept. Returns how many
    /// were dropped.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let ttl = self.config.session_idle_ttl;
        let mut sessions = self.sessions();
        let before = sessions.len();
        sessions.retain(|(user_id, listing_id), entry| {
            let idle = now.saturating_duration_since(entry.last_seen) > ttl;
            let busy = matches!(entry.scheduler.phase(), Phase::Loading | Phase::Booking { .. });
            if idle && !busy {
                tracing::debug!(user_id = %user_id, listing_id = %listing_id, "evicting idle scheduler session");
                return false;
            }
            true
        });
        before - sessions.len()
    }
}

/// Periodically evicts idle sessions until `cancel` fires.
pub async fn sweep_idle_sessions(state: Arc<AppState>, every: Duration, cancel: CancellationToken) {
    tracing::info!(
        interval_secs = every.as_secs(),
        ttl_secs = state.config.session_idle_ttl.as_secs(),
        "session sweeper started"
    );

    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("session sweeper stopping");
                break;
            }
            _ = interval.tick() => {
                let evicted = state.evict_idle(Instant::now());
                if evicted > 0 {
                    tracing::info!(evicted, remaining = state.session_count(), "evicted idle sessions");
                }
            }
        }
    }
}
