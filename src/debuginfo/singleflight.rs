//! Keyed single-flight groups: concurrent calls that share a key collapse
//! onto one underlying computation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

type Outcome<T> = Result<T, Arc<anyhow::Error>>;
type Slot<T> = watch::Receiver<Option<Outcome<T>>>;

pub struct Group<T> {
    inflight: Mutex<HashMap<String, Slot<T>>>,
}

enum Role<T> {
    Leader(watch::Sender<Option<Outcome<T>>>),
    Follower(Slot<T>),
}

impl<T: Clone + Send + Sync + 'static> Group<T> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `work` under `key`, or joins an in-flight call with the same key.
    /// The boolean is true when the result came from another caller's work.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> (Outcome<T>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let role = {
            let mut inflight = self.inflight.lock().unwrap();
            // A leader that was cancelled mid-flight leaves a dead channel
            // behind; take its place.
            let vacant = match inflight.get(key) {
                Some(rx) => rx.borrow().is_none() && rx.has_changed().is_err(),
                None => true,
            };
            if vacant {
                let (tx, rx) = watch::channel(None);
                inflight.insert(key.to_string(), rx);
                Role::Leader(tx)
            } else {
                Role::Follower(inflight.get(key).unwrap().clone())
            }
        };

        match role {
            Role::Leader(tx) => {
                let result = work().await.map_err(Arc::new);
                self.forget(key);
                let _ = tx.send(Some(result.clone()));
                (result, false)
            }
            Role::Follower(mut rx) => loop {
                {
                    let value = rx.borrow_and_update();
                    if let Some(result) = value.as_ref() {
                        return (result.clone(), true);
                    }
                }
                if rx.changed().await.is_err() {
                    self.forget(key);
                    return (
                        Err(Arc::new(anyhow::anyhow!(
                            "in-flight call for key {key} was dropped"
                        ))),
                        true,
                    );
                }
            },
        }
    }

    /// Drops the in-flight entry for `key` so the next caller starts fresh.
    pub fn forget(&self, key: &str) {
        self.inflight.lock().unwrap().remove(key);
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Group<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_calls_share_one_execution() {
        let group = Arc::new(Group::<u64>::new());
        let executions = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        let leader = {
            let group = group.clone();
            let executions = executions.clone();
            let release = release.clone();
            tokio::spawn(async move {
                group
                    .run("key", || async {
                        executions.fetch_add(1, Ordering::SeqCst);
                        release.notified().await;
                        Ok(42)
                    })
                    .await
            })
        };

        // Let the leader install itself before the followers join.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut followers = Vec::new();
        for _ in 0..5 {
            let group = group.clone();
            let executions = executions.clone();
            followers.push(tokio::spawn(async move {
                group
                    .run("key", || async {
                        executions.fetch_add(1, Ordering::SeqCst);
                        Ok(0)
                    })
                    .await
            }));
        }

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        release.notify_one();

        let (result, shared) = leader.await.unwrap();
        assert_eq!(result.unwrap(), 42);
        assert!(!shared);

        for follower in followers {
            let (result, shared) = follower.await.unwrap();
            assert_eq!(result.unwrap(), 42);
            assert!(shared);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let group = Group::<u64>::new();
        let (result, _) = group.run("key", || async { bail!("boom") }).await;
        assert!(result.is_err());
        group.forget("key");

        let (result, shared) = group.run("key", || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert!(!shared);
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let group = Group::<&'static str>::new();
        let (a, _) = group.run("a", || async { Ok("a") }).await;
        let (b, _) = group.run("b", || async { Ok("b") }).await;
        assert_eq!(a.unwrap(), "a");
        assert_eq!(b.unwrap(), "b");
    }
}
