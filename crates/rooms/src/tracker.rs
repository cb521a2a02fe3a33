//! Admitted sessions keyed by remote feed, with last-wins replacement.

use crate::error::RoomsError;
use room_common::FeedRef;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long a displaced session may take to shut down.
pub const GHOST_TIMEOUT: Duration = Duration::from_secs(10);

struct Entry {
    conn_id: u64,
    started: Instant,
    done: CancellationToken,
    cancel: CancellationToken,
}

/// Proof of admission for one connection. Hand it back to
/// [`Tracker::on_close`] once the session has finished.
#[derive(Debug)]
pub struct Admitted {
    /// Remote identity.
    pub feed: FeedRef,
    /// Connection number, unique for the process.
    pub conn_id: u64,
    /// Session scope; cancelled when the session is displaced or closed.
    pub cancel: CancellationToken,
    started: Instant,
    done: CancellationToken,
}

/// Connection tracker.
#[derive(Debug)]
pub struct Tracker {
    entries: Mutex<HashMap<FeedRef, Entry>>,
    next_conn: AtomicU64,
    ghost_timeout: Duration,
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("conn_id", &self.conn_id)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracker {
    /// Tracker with the standard displacement timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_ghost_timeout(GHOST_TIMEOUT)
    }

    /// Tracker with a custom displacement timeout.
    #[must_use]
    pub fn with_ghost_timeout(ghost_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            ghost_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<FeedRef, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a new session for `feed`, displacing any earlier one.
    ///
    /// # Errors
    ///
    /// Returns [`RoomsError::WouldGhost`] when the earlier session does not
    /// finish within the displacement timeout.
    pub async fn on_accept(
        &self,
        root: &CancellationToken,
        feed: FeedRef,
    ) -> Result<Admitted, RoomsError> {
        loop {
            let previous = {
                let mut entries = self.lock();
                match entries.get(&feed) {
                    Some(old) => {
                        old.cancel.cancel();
                        old.done.clone()
                    }
                    None => {
                        let admitted = Admitted {
                            feed,
                            conn_id: self.next_conn.fetch_add(1, Ordering::Relaxed),
                            cancel: root.child_token(),
                            started: Instant::now(),
                            done: CancellationToken::new(),
                        };
                        entries.insert(
                            feed,
                            Entry {
                                conn_id: admitted.conn_id,
                                started: admitted.started,
                                done: admitted.done.clone(),
                                cancel: admitted.cancel.clone(),
                            },
                        );
                        return Ok(admitted);
                    }
                }
            };

            debug!(feed = %feed.short(), "displacing previous session");
            if tokio::time::timeout(self.ghost_timeout, previous.cancelled())
                .await
                .is_err()
            {
                warn!(feed = %feed.short(), "previous session did not close, refusing new one");
                return Err(RoomsError::WouldGhost);
            }
        }
    }

    /// Forget a finished session and wake anyone waiting to replace it.
    /// Returns how long the session lasted.
    pub fn on_close(&self, admitted: &Admitted) -> Duration {
        {
            let mut entries = self.lock();
            let ours = entries
                .get(&admitted.feed)
                .is_some_and(|e| e.conn_id == admitted.conn_id);
            if ours {
                entries.remove(&admitted.feed);
            }
        }
        admitted.cancel.cancel();
        admitted.done.cancel();
        admitted.started.elapsed()
    }

    /// Number of admitted sessions.
    #[must_use]
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// How long `feed`'s session has been up, if it has one.
    #[must_use]
    pub fn active(&self, feed: &FeedRef) -> Option<Duration> {
        self.lock().get(feed).map(|e| e.started.elapsed())
    }

    /// Cancel every session. Entries go away as sessions call
    /// [`Tracker::on_close`].
    pub fn close_all(&self) {
        for entry in self.lock().values() {
            entry.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(n: u8) -> FeedRef {
        FeedRef::ed25519([n; 32])
    }

    #[tokio::test]
    async fn admits_and_forgets() {
        let tracker = Tracker::new();
        let root = CancellationToken::new();
        let admitted = tracker.on_accept(&root, feed(1)).await.unwrap();
        assert_eq!(tracker.count(), 1);
        assert!(tracker.active(&feed(1)).is_some());
        tracker.on_close(&admitted);
        assert_eq!(tracker.count(), 0);
        assert!(admitted.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn session_scope_follows_root() {
        let tracker = Tracker::new();
        let root = CancellationToken::new();
        let admitted = tracker.on_accept(&root, feed(1)).await.unwrap();
        root.cancel();
        assert!(admitted.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn last_wins_after_old_session_closes() {
        let tracker = std::sync::Arc::new(Tracker::new());
        let root = CancellationToken::new();
        let old = tracker.on_accept(&root, feed(1)).await.unwrap();

        let closer = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                old.cancel.cancelled().await;
                tracker.on_close(&old);
            })
        };

        let new = tracker.on_accept(&root, feed(1)).await.unwrap();
        closer.await.unwrap();
        assert_eq!(tracker.count(), 1);
        assert!(!new.cancel.is_cancelled());

        // The displaced session's close must not evict the new entry.
        tracker.on_close(&Admitted {
            feed: feed(1),
            conn_id: new.conn_id - 1,
            cancel: CancellationToken::new(),
            started: Instant::now(),
            done: CancellationToken::new(),
        });
        assert_eq!(tracker.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refuses_when_old_session_hangs() {
        let tracker = Tracker::new();
        let root = CancellationToken::new();
        let old = tracker.on_accept(&root, feed(1)).await.unwrap();
        let res = tracker.on_accept(&root, feed(1)).await;
        assert!(matches!(res, Err(RoomsError::WouldGhost)));
        assert!(old.cancel.is_cancelled());
        assert_eq!(tracker.count(), 1);
    }

    #[tokio::test]
    async fn close_all_cancels_every_session() {
        let tracker = Tracker::new();
        let root = CancellationToken::new();
        let a = tracker.on_accept(&root, feed(1)).await.unwrap();
        let b = tracker.on_accept(&root, feed(2)).await.unwrap();
        tracker.close_all();
        assert!(a.cancel.is_cancelled());
        assert!(b.cancel.is_cancelled());
        assert_eq!(tracker.count(), 2);
        tracker.on_close(&a);
        tracker.on_close(&b);
        assert_eq!(tracker.count(), 0);
    }
}
