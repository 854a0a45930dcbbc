//! Collapse overlapping invocations of a parameterless async task into at
//! most one in-flight call plus one queued follow-up (spec.md §4.6).
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

struct State {
    in_flight: bool,
    queued: bool,
}

/// A debounced wrapper around an async task `f`. Cloning shares the same
/// in-flight/queued bookkeeping, so every clone debounces against the same
/// underlying task.
pub struct Debounce<F> {
    f: Arc<F>,
    state: Arc<Mutex<State>>,
    settled: broadcast::Sender<()>,
}

impl<F> Clone for Debounce<F> {
    fn clone(&self) -> Self {
        Self {
            f: self.f.clone(),
            state: self.state.clone(),
            settled: self.settled.clone(),
        }
    }
}

impl<F, Fut> Debounce<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        let (settled, _) = broadcast::channel(16);
        Self {
            f: Arc::new(f),
            state: Arc::new(Mutex::new(State {
                in_flight: false,
                queued: false,
            })),
            settled,
        }
    }

    /// Trigger the debounced task. Resolves once either this call's own
    /// invocation, or the invocation it was collapsed into, has completed.
    pub async fn call(&self) {
        enum Role {
            RunNow,
            RunQueued(broadcast::Receiver<()>),
            WaitOnly(broadcast::Receiver<()>),
        }

        let role = {
            let mut st = self.state.lock().await;
            if !st.in_flight {
                st.in_flight = true;
                Role::RunNow
            } else if !st.queued {
                st.queued = true;
                Role::RunQueued(self.settled.subscribe())
            } else {
                Role::WaitOnly(self.settled.subscribe())
            }
        };

        match role {
            Role::RunNow => self.run_once().await,
            Role::RunQueued(mut rx) => {
                rx.recv().await.ok();
                self.run_once().await;
            }
            Role::WaitOnly(mut rx) => {
                // Wait for the current in-flight run, then the queued run
                // it collapsed us into.
                rx.recv().await.ok();
                rx.recv().await.ok();
            }
        }
    }

    async fn run_once(&self) {
        (self.f)().await;
        let mut st = self.state.lock().await;
        let reruns_as_in_flight = st.queued;
        st.in_flight = reruns_as_in_flight;
        st.queued = false;
        drop(st);
        let _ = self.settled.send(());
    }
}

pub fn debounce<F, Fut>(f: F) -> Debounce<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Debounce::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn sequential_calls_each_run() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let d = debounce(move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        d.call().await;
        d.call().await;
        d.call().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn overlapping_calls_collapse() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let d = debounce(move || {
            let c = c.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        let d1 = d.clone();
        let h1 = tokio::spawn(async move { d1.call().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        // These three all arrive while h1's invocation is in flight; they
        // must collapse into a single follow-up run.
        let d2 = d.clone();
        let d3 = d.clone();
        let d4 = d.clone();
        let h2 = tokio::spawn(async move { d2.call().await });
        let h3 = tokio::spawn(async move { d3.call().await });
        let h4 = tokio::spawn(async move { d4.call().await });

        h1.await.unwrap();
        h2.await.unwrap();
        h3.await.unwrap();
        h4.await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
