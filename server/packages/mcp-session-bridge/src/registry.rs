use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use mcp_bridge_error::BridgeError;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::BridgeConfig;
use crate::launch::LaunchSpec;
use crate::session::{Session, SessionInfo};
use crate::timers::TimerKey;

pub const REASON_IDLE_TIMEOUT: &str = "idle timeout";
pub const REASON_MAX_LIFETIME: &str = "max lifetime reached";
pub const REASON_PROCESS_EXITED: &str = "process exited";
pub const REASON_SHUTDOWN: &str = "server shutdown";
const REASON_SWEEP_LIFETIME: &str = "max lifetime exceeded";
const REASON_SWEEP_DEAD: &str = "process died";
const REASON_SWEEP_IDLE: &str = "idle too long";

/// Owns every live session, keyed by session id.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug)]
struct RegistryInner {
    launch: LaunchSpec,
    config: BridgeConfig,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl SessionRegistry {
    /// Creates a registry without the background sweep.
    pub fn new(launch: LaunchSpec, config: BridgeConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                launch,
                config,
                sessions: RwLock::new(HashMap::new()),
                sweeper: Mutex::new(None),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Creates a registry and starts the periodic stale-session sweep.
    pub fn start(launch: LaunchSpec, config: BridgeConfig) -> Self {
        let registry = Self::new(launch, config);
        registry.spawn_sweeper();
        registry
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Returns the session for `session_id`, creating it (and its worker) if needed. Either
    /// way the idle deadline is pushed out by the idle timeout.
    pub async fn resolve(&self, session_id: &str) -> Result<Arc<Session>, BridgeError> {
        if let Some(existing) = self.inner.sessions.read().await.get(session_id).cloned() {
            self.inner.touch(&existing);
            return Ok(existing);
        }

        let mut sessions = self.inner.sessions.write().await;
        if let Some(existing) = sessions.get(session_id).cloned() {
            self.inner.touch(&existing);
            return Ok(existing);
        }
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(BridgeError::terminated(REASON_SHUTDOWN));
        }

        tracing::info!(session_id = session_id, "creating new session");
        let (session, events) = Session::start(session_id, &self.inner.launch, &self.inner.config)?;

        self.inner.touch(&session);
        let weak = Arc::downgrade(&self.inner);
        let target = Arc::downgrade(&session);
        session.timers().once(
            TimerKey::Lifetime,
            self.inner.config.session_max_lifetime,
            async move {
                evict_weak(&weak, &target, REASON_MAX_LIFETIME).await;
            },
        );

        let weak = Arc::downgrade(&self.inner);
        let pump = session.clone();
        tokio::spawn(async move {
            let exit = pump.run_output_loop(events).await;
            if !pump.is_destroyed() {
                tracing::error!(
                    session_id = %pump.id(),
                    code = exit.and_then(|exit| exit.code),
                    signal = exit.and_then(|exit| exit.signal),
                    "worker process exited unexpectedly"
                );
            }
            if let Some(inner) = weak.upgrade() {
                inner.evict_session(&pump, REASON_PROCESS_EXITED).await;
            }
        });

        sessions.insert(session_id.to_string(), session.clone());
        tracing::debug!(
            session_id = session_id,
            active_sessions = sessions.len(),
            "session registered"
        );
        Ok(session)
    }

    /// Looks a session up without counting it as activity.
    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.read().await.get(session_id).cloned()
    }

    /// Tears down and forgets `session_id`. Returns `false` if it was not registered.
    pub async fn evict(&self, session_id: &str, reason: &str) -> bool {
        let mut sessions = self.inner.sessions.write().await;
        let Some(session) = sessions.get(session_id).cloned() else {
            return false;
        };
        RegistryInner::teardown_locked(&mut sessions, &session, reason);
        true
    }

    /// Evicts `session` only if it is still the registered instance for its id.
    pub async fn evict_session(&self, session: &Arc<Session>, reason: &str) -> bool {
        self.inner.evict_session(session, reason).await
    }

    /// One pass of the stale-session safety net. Returns how many sessions were evicted.
    pub async fn sweep(&self) -> usize {
        self.inner.sweep().await
    }

    pub async fn len(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn snapshot(&self) -> Vec<(String, SessionInfo)> {
        let mut sessions = self
            .inner
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, session)| (id.clone(), session.info()))
            .collect::<Vec<_>>();
        sessions.sort_by(|left, right| left.0.cmp(&right.0));
        sessions
    }

    /// Stops the sweep and evicts every session. Later `resolve` calls are refused.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(sweeper) = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            sweeper.abort();
        }

        let mut sessions = self.inner.sessions.write().await;
        tracing::info!(active_sessions = sessions.len(), "shutting down all sessions");
        for session in sessions.values().cloned().collect::<Vec<_>>() {
            RegistryInner::teardown_locked(&mut sessions, &session, REASON_SHUTDOWN);
        }
    }

    fn spawn_sweeper(&self) {
        let period = self.inner.config.session_check_interval;
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.sweep().await;
            }
        });
        *self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }
}

impl RegistryInner {
    fn touch(self: &Arc<Self>, session: &Arc<Session>) {
        if session.is_destroyed() {
            return;
        }
        session.touch();
        let weak = Arc::downgrade(self);
        let target = Arc::downgrade(session);
        session
            .timers()
            .once(TimerKey::Idle, self.config.session_idle_timeout, async move {
                if let (Some(registry), Some(session)) = (weak.upgrade(), target.upgrade()) {
                    registry.evict_idle(&session).await;
                }
            });
    }

    /// Idle eviction that rechecks the deadline under the write lock; activity that landed
    /// after the timer fired keeps the session.
    async fn evict_idle(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(session.id()) {
            Some(current) if Arc::ptr_eq(current, session) => {}
            _ => return false,
        }
        let idle_for = session.idle_for();
        if idle_for < self.config.session_idle_timeout {
            tracing::debug!(
                session_id = %session.id(),
                idle_ms = idle_for.as_millis() as u64,
                "idle timer fired after fresh activity, keeping session"
            );
            return false;
        }
        Self::teardown_locked(&mut sessions, session, REASON_IDLE_TIMEOUT);
        true
    }

    async fn evict_session(&self, session: &Arc<Session>, reason: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(session.id()) {
            Some(current) if Arc::ptr_eq(current, session) => {}
            _ => return false,
        }
        Self::teardown_locked(&mut sessions, session, reason);
        true
    }

    /// Releases the session's resources, then forgets its id, all under the map's write lock.
    fn teardown_locked(
        sessions: &mut HashMap<String, Arc<Session>>,
        session: &Arc<Session>,
        reason: &str,
    ) {
        tracing::info!(
            session_id = %session.id(),
            reason = reason,
            age_ms = session.age().as_millis() as u64,
            "cleaning up session"
        );
        let failed = session.teardown(reason);
        sessions.remove(session.id());
        tracing::debug!(
            session_id = %session.id(),
            failed_requests = failed,
            active_sessions = sessions.len(),
            "session removed"
        );
    }

    async fn sweep(&self) -> usize {
        let stale = self
            .sessions
            .read()
            .await
            .values()
            .filter_map(|session| {
                let reason = if session.age() > self.config.session_max_lifetime {
                    REASON_SWEEP_LIFETIME
                } else if !session.is_process_alive() {
                    REASON_SWEEP_DEAD
                } else if session.idle_for() > self.config.session_idle_timeout {
                    REASON_SWEEP_IDLE
                } else {
                    return None;
                };
                Some((session.clone(), reason))
            })
            .collect::<Vec<_>>();

        let mut evicted = 0;
        for (session, reason) in stale {
            if self.evict_session(&session, reason).await {
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::info!(evicted = evicted, "stale session sweep");
        }
        evicted
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        for (_, session) in self.sessions.get_mut().drain() {
            session.teardown(REASON_SHUTDOWN);
        }
    }
}

async fn evict_weak(registry: &Weak<RegistryInner>, session: &Weak<Session>, reason: &str) {
    if let (Some(registry), Some(session)) = (registry.upgrade(), session.upgrade()) {
        registry.evict_session(&session, reason).await;
    }
}
