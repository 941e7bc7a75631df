use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::message::Command;
use crate::datasafe::DataSafe;

/// Per-session connection id. Never reused within one session.
pub type MemberId = u64;

/// Outbound frames for one connection. Dropping it closes the connection.
pub type Outbound = mpsc::UnboundedSender<Command>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{key}: can not deliver to member {member}")]
    Connection { key: String, member: MemberId },

    #[error("{key}: member {member} submitted content without write permission")]
    NotActiveWriter { key: String, member: MemberId },
}

enum Delivery {
    Sent,
    Absent,
    Failed,
}

struct SessionState {
    content: String,
    members: BTreeMap<MemberId, Outbound>,
    next_id: MemberId,
    active: Option<MemberId>,
}

impl SessionState {
    /// Send `cmd` to everyone except `except`. Members that can not be reached
    /// are removed and the remaining ones get the new count.
    fn push(&mut self, key: &str, mut cmd: Command, mut except: Option<MemberId>) {
        loop {
            let unreachable: Vec<MemberId> = self
                .members
                .iter()
                .filter(|(id, _)| Some(**id) != except)
                .filter(|(_, tx)| tx.send(cmd.clone()).is_err())
                .map(|(id, _)| *id)
                .collect();

            if unreachable.is_empty() {
                return;
            }
            for id in unreachable {
                warn!("{}: {} unreachable, removing", key, id);
                self.members.remove(&id);
            }
            cmd = Command::number_user(self.members.len());
            except = None;
        }
    }

    fn remove(&mut self, key: &str, id: MemberId) -> bool {
        if self.members.remove(&id).is_none() {
            return false;
        }
        info!("{}: removed {}", key, id);
        let count = self.members.len();
        self.push(key, Command::number_user(count), None);
        true
    }

    fn deliver(&mut self, key: &str, id: MemberId, cmd: Command) -> Delivery {
        let Some(tx) = self.members.get(&id) else {
            return Delivery::Absent;
        };
        if tx.send(cmd).is_ok() {
            return Delivery::Sent;
        }
        warn!("{}: {} unreachable, removing", key, id);
        self.remove(key, id);
        Delivery::Failed
    }
}

/// Live state of one collaboratively edited document.
///
/// Membership, content and the active writer sit behind one lock. Write
/// permission hand-offs are serialized by a second lock so a new hand-off
/// never overlaps one that is still waiting out its grace interval.
pub struct DocSession {
    key: String,
    datasafe: Arc<dyn DataSafe>,
    grace: Duration,
    state: Mutex<SessionState>,
    handoff: Mutex<()>,
    loaded: OnceCell<()>,
    revision: AtomicU64,
    saved_revision: AtomicU64,
    leases: AtomicUsize,
    cancel: CancellationToken,
}

impl DocSession {
    pub fn new(
        key: impl Into<String>,
        datasafe: Arc<dyn DataSafe>,
        grace: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            key: key.into(),
            datasafe,
            grace,
            state: Mutex::new(SessionState {
                content: String::new(),
                members: BTreeMap::new(),
                next_id: 0,
                active: None,
            }),
            handoff: Mutex::new(()),
            loaded: OnceCell::new(),
            revision: AtomicU64::new(0),
            saved_revision: AtomicU64::new(0),
            leases: AtomicUsize::new(0),
            cancel,
        }
    }

    /// Load the stored content once. Missing or unreadable content starts the
    /// session empty.
    pub async fn ensure_loaded(&self) {
        self.loaded
            .get_or_init(|| async {
                let content = match self.datasafe.load(&self.key).await {
                    Ok(content) => content,
                    Err(e) => {
                        warn!("{}: can not load content, starting empty: {}", self.key, e);
                        String::new()
                    }
                };
                debug!("{}: loaded {} bytes", self.key, content.len());
                self.state.lock().await.content = content;
            })
            .await;
    }

    /// Attach a connection. The new member receives the current content, the
    /// others receive the new member count.
    pub async fn join(&self, tx: Outbound) -> Result<MemberId, SessionError> {
        self.ensure_loaded().await;

        let mut state = self.state.lock().await;
        let id = state.next_id;
        state.next_id += 1;

        if tx.send(Command::state(state.content.clone())).is_err() {
            warn!("{}: {} send initial state failed", self.key, id);
            return Err(SessionError::Connection {
                key: self.key.clone(),
                member: id,
            });
        }

        state.members.insert(id, tx);
        info!("{}: added {}", self.key, id);

        let count = state.members.len();
        state.push(&self.key, Command::number_user(count), Some(id));
        Ok(id)
    }

    /// Detach a member and close its connection. Unknown ids are ignored.
    ///
    /// The active writer is not replaced when it leaves; the session has no
    /// writer until someone asks for the token.
    pub async fn leave(&self, id: MemberId) {
        let mut state = self.state.lock().await;
        state.remove(&self.key, id);
    }

    /// Move write permission to `id`.
    ///
    /// The current writer is told to stop, then the grace interval passes
    /// without waiting for any acknowledgement, then `id` becomes the writer
    /// and is told so.
    pub async fn request_write(&self, id: MemberId) {
        let _handoff = self.handoff.lock().await;

        {
            let mut state = self.state.lock().await;
            if let Some(active) = state.active {
                if let Delivery::Sent = state.deliver(&self.key, active, Command::can_not_write()) {
                    debug!("{}: {} revoked", self.key, active);
                }
            }
        }

        tokio::time::sleep(self.grace).await;

        let mut state = self.state.lock().await;
        state.active = Some(id);
        match state.deliver(&self.key, id, Command::can_write()) {
            Delivery::Sent => info!("{}: {} active", self.key, id),
            Delivery::Absent => debug!("{}: {} left before it became active", self.key, id),
            Delivery::Failed => {}
        }
    }

    /// Replace the content with a submission from the active writer and send
    /// it to everyone else. A submission from any other member removes that
    /// member and leaves the content untouched.
    pub async fn submit(&self, id: MemberId, content: String) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;

        if state.active != Some(id) || !state.members.contains_key(&id) {
            warn!("{}: {} is not the active writer", self.key, id);
            state.remove(&self.key, id);
            return Err(SessionError::NotActiveWriter {
                key: self.key.clone(),
                member: id,
            });
        }

        let cmd = Command::state(content.clone());
        state.content = content;
        self.revision.fetch_add(1, Ordering::SeqCst);
        state.push(&self.key, cmd, Some(id));
        Ok(())
    }

    pub async fn can_be_deleted(&self) -> bool {
        self.state.lock().await.members.is_empty()
    }

    pub async fn member_count(&self) -> usize {
        self.state.lock().await.members.len()
    }

    /// The active writer, if it is still attached.
    pub async fn active_member(&self) -> Option<MemberId> {
        let state = self.state.lock().await;
        state.active.filter(|id| state.members.contains_key(id))
    }

    pub async fn content(&self) -> String {
        self.state.lock().await.content.clone()
    }

    /// Number of accepted edits so far.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    pub fn is_dirty(&self) -> bool {
        self.revision() != self.saved_revision.load(Ordering::SeqCst)
    }

    /// Save the content if it changed since the last successful save.
    ///
    /// Returns the revision the stored content now covers (or would have
    /// covered, when the save failed).
    pub async fn persist(&self) -> u64 {
        if !self.loaded.initialized() {
            return self.revision();
        }

        let (content, revision) = {
            let state = self.state.lock().await;
            (state.content.clone(), self.revision())
        };
        if revision == self.saved_revision.load(Ordering::SeqCst) {
            return revision;
        }

        match self.datasafe.save(&self.key, &content).await {
            Ok(()) => {
                self.saved_revision.fetch_max(revision, Ordering::SeqCst);
                debug!("{}: saved revision {}", self.key, revision);
            }
            Err(e) => warn!("{}: can not save content: {}", self.key, e),
        }
        revision
    }

    /// Save periodically until the session is closed.
    pub async fn run_backup(self: Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.persist().await;
                }
            }
        }
        debug!("{}: backup stopped", self.key);
    }

    /// Stop background work for this session.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn acquire_lease(&self) {
        self.leases.fetch_add(1, Ordering::SeqCst);
    }

    pub fn release_lease(&self) {
        self.leases.fetch_sub(1, Ordering::SeqCst);
    }

    /// Connection handlers currently holding this session.
    pub fn leases(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasafe::memory::MemoryDataSafe;
    use crate::ws::message::{CAN_NOT_WRITE, CAN_WRITE, NUMBER_USER, STATE};
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::Instant;

    const GRACE: Duration = Duration::from_secs(5);

    fn session_with(datasafe: Arc<MemoryDataSafe>) -> Arc<DocSession> {
        Arc::new(DocSession::new("doc1", datasafe, GRACE, CancellationToken::new()))
    }

    fn session() -> Arc<DocSession> {
        session_with(Arc::new(MemoryDataSafe::default()))
    }

    fn peer() -> (Outbound, UnboundedReceiver<Command>) {
        mpsc::unbounded_channel()
    }

    fn drain(rx: &mut UnboundedReceiver<Command>) -> Vec<Command> {
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            out.push(cmd);
        }
        out
    }

    async fn writer(session: &Arc<DocSession>) -> (MemberId, UnboundedReceiver<Command>) {
        let (tx, mut rx) = peer();
        let id = session.join(tx).await.unwrap();
        session.request_write(id).await;
        drain(&mut rx);
        (id, rx)
    }

    #[tokio::test]
    async fn test_join_sends_snapshot_and_announces_count() {
        let session = session();

        let (tx_a, mut rx_a) = peer();
        let a = session.join(tx_a).await.unwrap();
        assert_eq!(drain(&mut rx_a), vec![Command::new(STATE, "")]);

        let (tx_b, mut rx_b) = peer();
        let b = session.join(tx_b).await.unwrap();
        assert!(b > a);
        assert_eq!(drain(&mut rx_b), vec![Command::new(STATE, "")]);
        assert_eq!(drain(&mut rx_a), vec![Command::new(NUMBER_USER, "2")]);
        assert_eq!(session.member_count().await, 2);
    }

    #[tokio::test]
    async fn test_join_loads_stored_content() {
        let session = session_with(Arc::new(MemoryDataSafe::with_entry("doc1", "stored")));
        let (tx, mut rx) = peer();
        session.join(tx).await.unwrap();
        assert_eq!(drain(&mut rx), vec![Command::state("stored")]);
    }

    #[tokio::test]
    async fn test_load_failure_starts_empty() {
        let datasafe = Arc::new(MemoryDataSafe::with_entry("doc1", "stored"));
        datasafe.set_failing(true);
        let session = session_with(datasafe);

        let (tx, mut rx) = peer();
        session.join(tx).await.unwrap();
        assert_eq!(drain(&mut rx), vec![Command::state("")]);
    }

    #[tokio::test]
    async fn test_join_with_dead_connection_is_not_registered() {
        let session = session();
        let (tx, rx) = peer();
        drop(rx);
        assert!(matches!(session.join(tx).await, Err(SessionError::Connection { .. })));
        assert!(session.can_be_deleted().await);

        // Ids are not reused after a failed join.
        let (tx, _rx) = peer();
        assert_eq!(session.join(tx).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_leave_is_idempotent_and_tracks_deletability() {
        let session = session();
        assert!(session.can_be_deleted().await);

        let (tx_a, _rx_a) = peer();
        let (tx_b, mut rx_b) = peer();
        let a = session.join(tx_a).await.unwrap();
        let b = session.join(tx_b).await.unwrap();
        drain(&mut rx_b);
        assert!(!session.can_be_deleted().await);

        session.leave(a).await;
        assert_eq!(drain(&mut rx_b), vec![Command::number_user(1)]);
        session.leave(a).await;
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(session.member_count().await, 1);

        session.leave(b).await;
        assert!(session.can_be_deleted().await);
        // Leaving closed the outbound channel.
        assert!(rx_b.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_member_is_dropped_on_broadcast() {
        let session = session();
        let (tx_a, mut rx_a) = peer();
        let (tx_b, rx_b) = peer();
        session.join(tx_a).await.unwrap();
        session.join(tx_b).await.unwrap();
        drop(rx_b);
        drain(&mut rx_a);

        let (tx_c, _rx_c) = peer();
        session.join(tx_c).await.unwrap();

        assert_eq!(session.member_count().await, 2);
        assert_eq!(
            drain(&mut rx_a),
            vec![Command::number_user(3), Command::number_user(2)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_from_non_active_member_is_rejected() {
        let session = session();
        let (a, mut rx_a) = writer(&session).await;
        session.submit(a, "hello".to_string()).await.unwrap();

        let (tx_b, mut rx_b) = peer();
        let b = session.join(tx_b).await.unwrap();
        drain(&mut rx_b);
        drain(&mut rx_a);

        let err = session.submit(b, "intruder".to_string()).await.unwrap_err();
        assert!(matches!(err, SessionError::NotActiveWriter { member, .. } if member == b));
        assert_eq!(session.content().await, "hello");
        assert_eq!(session.member_count().await, 1);
        assert_eq!(drain(&mut rx_a), vec![Command::number_user(1)]);
        assert!(rx_b.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_submit_reaches_everyone_else() {
        let session = session();
        let (a, mut rx_a) = writer(&session).await;
        let (tx_b, mut rx_b) = peer();
        session.join(tx_b).await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        session.submit(a, "hello".to_string()).await.unwrap();
        assert_eq!(drain(&mut rx_b), vec![Command::state("hello")]);
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(session.revision(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handoff_revokes_then_grants_after_grace() {
        let session = session();
        let (a, mut rx_a) = writer(&session).await;
        assert_eq!(session.active_member().await, Some(a));

        let (tx_b, mut rx_b) = peer();
        let b = session.join(tx_b).await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        let start = Instant::now();
        let handoff = tokio::spawn({
            let session = session.clone();
            async move { session.request_write(b).await }
        });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        // Revoked immediately, not yet granted.
        assert_eq!(drain(&mut rx_a), vec![Command::new(CAN_NOT_WRITE, "")]);
        assert!(drain(&mut rx_b).is_empty());

        handoff.await.unwrap();
        assert!(start.elapsed() >= GRACE);
        assert_eq!(drain(&mut rx_b), vec![Command::new(CAN_WRITE, "")]);
        assert_eq!(session.active_member().await, Some(b));

        // The former writer is caught by the authorization check.
        assert!(session.submit(a, "late".to_string()).await.is_err());
        assert_eq!(session.content().await, "");
        assert!(drain(&mut rx_b).iter().all(|cmd| cmd.comm != STATE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handoff_when_previous_writer_left() {
        let session = session();
        let (a, _rx_a) = writer(&session).await;
        let (tx_b, mut rx_b) = peer();
        let b = session.join(tx_b).await.unwrap();

        session.leave(a).await;
        assert_eq!(session.active_member().await, None);

        session.request_write(b).await;
        assert_eq!(session.active_member().await, Some(b));
        assert!(drain(&mut rx_b).contains(&Command::can_write()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_undeliverable_revoke_removes_old_writer() {
        let session = session();
        let (a, rx_a) = writer(&session).await;
        let (tx_b, mut rx_b) = peer();
        let b = session.join(tx_b).await.unwrap();
        drain(&mut rx_b);
        drop(rx_a);

        session.request_write(b).await;

        assert_eq!(session.member_count().await, 1);
        assert_eq!(session.active_member().await, Some(b));
        assert_eq!(
            drain(&mut rx_b),
            vec![Command::number_user(1), Command::can_write()]
        );
        assert!(session.submit(a, "gone".to_string()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_undeliverable_grant_removes_requester() {
        let session = session();
        let (tx_b, mut rx_b) = peer();
        session.join(tx_b).await.unwrap();
        let (tx_a, rx_a) = peer();
        let a = session.join(tx_a).await.unwrap();
        drain(&mut rx_b);
        drop(rx_a);

        session.request_write(a).await;

        assert_eq!(session.member_count().await, 1);
        assert_eq!(session.active_member().await, None);
        assert_eq!(drain(&mut rx_b), vec![Command::number_user(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handoff_to_departed_member_leaves_session_headless() {
        let session = session();
        let (tx_a, _rx_a) = peer();
        let a = session.join(tx_a).await.unwrap();
        session.leave(a).await;

        session.request_write(a).await;
        assert_eq!(session.active_member().await, None);
        assert!(session.submit(a, "x".to_string()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_are_serialized() {
        let session = session();
        let (tx_a, mut rx_a) = peer();
        let (tx_b, mut rx_b) = peer();
        let a = session.join(tx_a).await.unwrap();
        let b = session.join(tx_b).await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        let first = tokio::spawn({
            let session = session.clone();
            async move { session.request_write(a).await }
        });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        let second = tokio::spawn({
            let session = session.clone();
            async move { session.request_write(b).await }
        });
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(session.active_member().await, Some(b));
        assert_eq!(
            drain(&mut rx_a),
            vec![Command::can_write(), Command::can_not_write()]
        );
        assert_eq!(drain(&mut rx_b), vec![Command::can_write()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_saves_only_changes() {
        let datasafe = Arc::new(MemoryDataSafe::default());
        let session = session_with(datasafe.clone());
        let (a, _rx_a) = writer(&session).await;

        assert_eq!(session.persist().await, 0);
        assert_eq!(datasafe.save_count(), 0);

        session.submit(a, "v1".to_string()).await.unwrap();
        assert!(session.is_dirty());
        assert_eq!(session.persist().await, 1);
        assert_eq!(datasafe.get("doc1").as_deref(), Some("v1"));
        assert!(!session.is_dirty());

        session.persist().await;
        assert_eq!(datasafe.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_save_keeps_session_dirty() {
        let datasafe = Arc::new(MemoryDataSafe::default());
        let session = session_with(datasafe.clone());
        let (a, _rx_a) = writer(&session).await;
        session.submit(a, "v1".to_string()).await.unwrap();

        datasafe.set_failing(true);
        session.persist().await;
        assert!(session.is_dirty());

        datasafe.set_failing(false);
        session.persist().await;
        assert!(!session.is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backup_loop_saves_until_closed() {
        let datasafe = Arc::new(MemoryDataSafe::default());
        let session = session_with(datasafe.clone());
        let (a, _rx_a) = writer(&session).await;

        let backup = tokio::spawn(session.clone().run_backup(Duration::from_secs(30)));
        session.submit(a, "draft".to_string()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(datasafe.get("doc1").as_deref(), Some("draft"));

        session.close();
        backup.await.unwrap();
    }
}
