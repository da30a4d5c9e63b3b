use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

/// Per-target pool of multiplexed clients.
///
/// Multiplexed transports (gRPC/HTTP2, CQL sessions) benefit from reuse up
/// to a stream ceiling: the same client is handed out until `max_streams`
/// callers hold it, then the next caller dials a fresh one which replaces
/// the pooled entry. Handles are reference counted; dropping one releases
/// its slot, and the underlying transport closes when the last clone of the
/// client goes away.
pub struct ClientShare<C> {
    entries: Mutex<HashMap<String, Entry<C>>>,
}

struct Entry<C> {
    client: C,
    current: Arc<AtomicUsize>,
}

/// A counted lease on a shared client. Derefs to the client.
pub struct ShareHandle<C> {
    client: C,
    current: Arc<AtomicUsize>,
}

impl<C> Deref for ShareHandle<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.client
    }
}

impl<C> Drop for ShareHandle<C> {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<C: Clone> ClientShare<C> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Hand out the pooled client for `target`, dialing a new one when the
    /// pool is empty or the current client is at its stream ceiling. The
    /// returned bool reports whether a dial happened.
    ///
    /// The pool lock is held across the dial so concurrent callers of a cold
    /// target line up behind one dial instead of racing their own.
    pub async fn get<F, Fut, E>(
        &self,
        target: &str,
        max_streams: usize,
        dial: F,
    ) -> Result<(ShareHandle<C>, bool), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, E>>,
    {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get(target) {
            if entry.current.load(Ordering::Acquire) < max_streams {
                tracing::debug!("reusing connection for {target}");
                entry.current.fetch_add(1, Ordering::AcqRel);
                return Ok((
                    ShareHandle {
                        client: entry.client.clone(),
                        current: entry.current.clone(),
                    },
                    false,
                ));
            }
        }

        let client = dial().await?;
        let current = Arc::new(AtomicUsize::new(1));
        entries.insert(
            target.to_string(),
            Entry {
                client: client.clone(),
                current: current.clone(),
            },
        );

        Ok((ShareHandle { client, current }, true))
    }
}

impl<C: Clone> Default for ClientShare<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    async fn get_ok(
        share: &ClientShare<usize>,
        max: usize,
        dialed: &AtomicUsize,
    ) -> ShareHandle<usize> {
        let (handle, fresh) = share
            .get("node:9042", max, || async {
                Ok::<_, Infallible>(dialed.fetch_add(1, Ordering::SeqCst))
            })
            .await
            .unwrap();
        let _ = fresh;
        handle
    }

    #[tokio::test]
    async fn dials_once_under_ceiling() {
        let share = ClientShare::new();
        let dialed = AtomicUsize::new(0);

        let a = get_ok(&share, 4, &dialed).await;
        let b = get_ok(&share, 4, &dialed).await;

        assert_eq!(dialed.load(Ordering::SeqCst), 1);
        assert_eq!(*a, *b);
    }

    #[tokio::test]
    async fn five_callers_with_ceiling_two_dial_three_times() {
        let share = ClientShare::new();
        let dialed = AtomicUsize::new(0);

        let mut handles = Vec::new();
        for _ in 0..5 {
            handles.push(get_ok(&share, 2, &dialed).await);
        }

        assert_eq!(dialed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn release_frees_a_slot() {
        let share = ClientShare::new();
        let dialed = AtomicUsize::new(0);

        let a = get_ok(&share, 1, &dialed).await;
        drop(a);
        let _b = get_ok(&share, 1, &dialed).await;

        // The slot freed by the drop is reused, no second dial.
        assert_eq!(dialed.load(Ordering::SeqCst), 1);
    }
}
