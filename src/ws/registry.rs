use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use super::docsession::{DocSession, MemberId};
use crate::datasafe::DataSafe;

/// Timing shared by every session.
#[derive(Clone, Debug)]
pub struct SessionSettings {
    /// Wait between revoking and granting write permission.
    pub grace: Duration,
    /// Interval of the per-session background save.
    pub save_interval: Duration,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub sessions: usize,
    pub members: usize,
    pub active_writers: usize,
    pub dirty: usize,
}

/// Keeps a session alive for one connection handler.
pub struct SessionLease {
    session: Arc<DocSession>,
}

impl SessionLease {
    pub fn session(&self) -> Arc<DocSession> {
        self.session.clone()
    }
}

impl Deref for SessionLease {
    type Target = DocSession;

    fn deref(&self) -> &DocSession {
        &self.session
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.session.release_lease();
    }
}

/// All live sessions by key.
///
/// The map lock is only held for lookups, inserts, removals and snapshots;
/// sessions are never locked while it is held.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<DocSession>>>,
    datasafe: Arc<dyn DataSafe>,
    settings: SessionSettings,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl SessionRegistry {
    pub fn new(datasafe: Arc<dyn DataSafe>, settings: SessionSettings) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            datasafe,
            settings,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn is_durable(&self) -> bool {
        self.datasafe.is_durable()
    }

    /// Cancelled once the registry starts shutting down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Get the session for `key`, creating and loading it on first use.
    pub async fn get(&self, key: &str) -> SessionLease {
        let session = {
            let mut sessions = self.sessions.lock().await;
            let session = match sessions.get(key) {
                Some(session) => session.clone(),
                None => {
                    let session = self.create(key);
                    sessions.insert(key.to_string(), session.clone());
                    session
                }
            };
            session.acquire_lease();
            session
        };

        let lease = SessionLease { session };
        lease.ensure_loaded().await;
        lease
    }

    fn create(&self, key: &str) -> Arc<DocSession> {
        let session = Arc::new(DocSession::new(
            key,
            self.datasafe.clone(),
            self.settings.grace,
            self.shutdown.child_token(),
        ));
        if self.datasafe.is_durable() {
            self.tasks
                .spawn(session.clone().run_backup(self.settings.save_interval));
        }
        info!("{}: session created", key);
        session
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    #[cfg(test)]
    pub async fn contains(&self, key: &str) -> bool {
        self.sessions.lock().await.contains_key(key)
    }

    async fn snapshot(&self) -> Vec<(String, Arc<DocSession>)> {
        self.sessions
            .lock()
            .await
            .iter()
            .map(|(key, session)| (key.clone(), session.clone()))
            .collect()
    }

    /// Evict every session without members, saving its content first.
    /// Returns the number of evicted sessions.
    pub async fn reap(&self) -> usize {
        info!("gc: begin gc");
        let mut evicted = 0;

        for (key, session) in self.snapshot().await {
            if session.leases() > 0 || !session.can_be_deleted().await {
                continue;
            }

            let revision = session.persist().await;

            let mut sessions = self.sessions.lock().await;
            let unchanged = sessions
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, &session))
                && session.leases() == 0
                && session.revision() == revision;
            if unchanged {
                sessions.remove(&key);
                drop(sessions);
                session.close();
                info!("gc: removed {}", key);
                evicted += 1;
            }
        }

        info!("gc: finished gc");
        evicted
    }

    /// Move write permission to `member` in the background. Pending hand-offs
    /// are dropped once shutdown begins.
    pub fn spawn_handoff(&self, session: Arc<DocSession>, member: MemberId) {
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => debug!("hand-off to {} cancelled by shutdown", member),
                _ = session.request_write(member) => {}
            }
        });
    }

    /// Run [`reap`](Self::reap) every `every` until shutdown.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) {
        let registry = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            info!("gc: worker started");
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.reap().await;
                    }
                }
            }
            debug!("gc: worker stopped");
        });
    }

    pub async fn stats(&self) -> RegistryStats {
        let sessions = self.snapshot().await;
        let mut stats = RegistryStats {
            sessions: sessions.len(),
            ..RegistryStats::default()
        };
        for (_, session) in sessions {
            stats.members += session.member_count().await;
            if session.active_member().await.is_some() {
                stats.active_writers += 1;
            }
            if session.is_dirty() {
                stats.dirty += 1;
            }
        }
        stats
    }

    /// Stop background work, save every session and flush the backend.
    pub async fn shutdown(&self) {
        info!("Shutting down sessions");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        for (_, session) in self.snapshot().await {
            session.persist().await;
        }

        self.datasafe.flush_and_close().await;
        info!("All sessions saved");
    }
}
