//! Bounded async map whose entries have async construction and async
//! destruction, serialising construct-after-destruct of the same key
//! (spec.md §4.4).
use anyhow::Result;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

type Shared<V> = Arc<tokio::sync::RwLock<Result<V, String>>>;
type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Constructs a value for `key`, asynchronously.
pub trait Construct<K, V>: Send + Sync {
    fn construct(&self, key: K) -> BoxFuture<Result<V>>;
}

/// Destructs a value that was previously constructed for `key`.
pub trait Destruct<K, V>: Send + Sync {
    fn destruct(&self, value: V, key: K) -> BoxFuture<()>;
}

impl<K, V, F, Fut> Construct<K, V> for F
where
    F: Fn(K) -> Fut + Send + Sync,
    Fut: Future<Output = Result<V>> + Send + 'static,
{
    fn construct(&self, key: K) -> BoxFuture<Result<V>> {
        Box::pin((self)(key))
    }
}

impl<K, V, F, Fut> Destruct<K, V> for F
where
    F: Fn(V, K) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn destruct(&self, value: V, key: K) -> BoxFuture<()> {
        Box::pin((self)(value, key))
    }
}

struct Inner<K, V> {
    /// Insertion order is LRU order: most recently touched key at the tail.
    order: Vec<K>,
    cache: HashMap<K, Shared<V>>,
    destructions: HashMap<K, Arc<Mutex<()>>>,
}

/// A bounded map keyed by `K` whose values `V` are built and torn down
/// asynchronously. See spec.md §4.4 for the full contract.
pub struct Lru<K, V, C, D> {
    cap: usize,
    construct: Arc<C>,
    destruct: Arc<D>,
    inner: Arc<Mutex<Inner<K, V>>>,
}

impl<K, V, C, D> Clone for Lru<K, V, C, D> {
    fn clone(&self) -> Self {
        Self {
            cap: self.cap,
            construct: self.construct.clone(),
            destruct: self.destruct.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<K, V, C, D> Lru<K, V, C, D>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    C: Construct<K, V> + 'static,
    D: Destruct<K, V> + 'static,
{
    pub fn new(cap: usize, construct: C, destruct: D) -> Self {
        Self {
            cap,
            construct: Arc::new(construct),
            destruct: Arc::new(destruct),
            inner: Arc::new(Mutex::new(Inner {
                order: Vec::new(),
                cache: HashMap::new(),
                destructions: HashMap::new(),
            })),
        }
    }

    /// Fetch the value for `key`, constructing it if absent. Re-inserts the
    /// key at the tail (most-recently-used) on every access.
    pub async fn get(&self, key: K) -> Result<V> {
        let (slot, pending_destruct, is_new) = {
            let mut inner = self.inner.lock().await;
            if let Some(slot) = inner.cache.get(&key).cloned() {
                Self::touch(&mut inner.order, &key);
                (slot, None, false)
            } else {
                let slot: Shared<V> = Arc::new(tokio::sync::RwLock::new(Err(
                    "constructing".to_string()
                )));
                inner.cache.insert(key.clone(), slot.clone());
                Self::touch(&mut inner.order, &key);
                let pending = inner.destructions.get(&key).cloned();
                (slot, pending, true)
            }
        };

        if !is_new {
            // Blocks on the writer below if construction is still in flight,
            // rather than observing the "constructing" placeholder.
            let guard = slot.read().await;
            return guard.clone().map_err(anyhow::Error::msg);
        }

        // Held across construction so concurrent readers of this key block
        // on the real result instead of racing the placeholder (§4.4: a
        // concurrent `get()` of an in-flight key must resolve to the same
        // constructed value, not an error).
        let mut guard = slot.write().await;

        if let Some(lock) = pending_destruct {
            // Construction after destruction of the same key must not start
            // before the previous destructor finishes (§4.4 invariant).
            let _guard = lock.lock().await;
        }

        let built = self.construct.construct(key.clone()).await;
        *guard = built.as_ref().map(|v| v.clone()).map_err(|e| e.to_string());
        drop(guard);

        match built {
            Ok(v) => {
                self.evict_if_over_capacity().await;
                Ok(v)
            }
            Err(e) => {
                let mut inner = self.inner.lock().await;
                // Only remove the entry if nobody replaced it in the meantime.
                if let Some(current) = inner.cache.get(&key) {
                    if Arc::ptr_eq(current, &slot) {
                        inner.cache.remove(&key);
                        inner.order.retain(|k| k != &key);
                    }
                }
                Err(e)
            }
        }
    }

    async fn evict_if_over_capacity(&self) {
        let head = {
            let inner = self.inner.lock().await;
            if inner.order.len() > self.cap {
                inner.order.first().cloned()
            } else {
                None
            }
        };
        if let Some(head_key) = head {
            self.delete(head_key).await;
        }
    }

    fn touch(order: &mut Vec<K>, key: &K) {
        order.retain(|k| k != key);
        order.push(key.clone());
    }

    /// Evict `key`, running its destructor asynchronously. If a destruction
    /// is already in flight for this key, this simply lets it finish.
    pub async fn delete(&self, key: K) {
        let (slot, lock) = {
            let mut inner = self.inner.lock().await;
            inner.order.retain(|k| k != &key);
            let slot = inner.cache.remove(&key);
            let lock = slot.as_ref().map(|_| {
                inner
                    .destructions
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .clone()
            });
            (slot, lock)
        };

        let (slot, lock) = match (slot, lock) {
            (Some(s), Some(l)) => (s, l),
            _ => return,
        };

        let destruct = self.destruct.clone();
        let inner = self.inner.clone();
        let key_for_cleanup = key.clone();
        tokio::spawn(async move {
            let _guard = lock.lock().await;
            let value = {
                let r = slot.read().await;
                r.clone().ok()
            };
            if let Some(v) = value {
                destruct.destruct(v, key).await;
            }
            let mut inner = inner.lock().await;
            inner.destructions.remove(&key_for_cleanup);
        });
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn constructs_once_and_evicts_lru_head() {
        let constructs = Arc::new(AtomicUsize::new(0));
        let destructs = Arc::new(AtomicUsize::new(0));
        let c2 = constructs.clone();
        let d2 = destructs.clone();

        let lru = Lru::new(
            2,
            move |k: u32| {
                let c2 = c2.clone();
                async move {
                    c2.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(k * 10)
                }
            },
            move |_v: u32, _k: u32| {
                let d2 = d2.clone();
                async move {
                    d2.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        assert_eq!(lru.get(1).await.unwrap(), 10);
        assert_eq!(lru.get(1).await.unwrap(), 10);
        assert_eq!(constructs.load(Ordering::SeqCst), 1);

        lru.get(2).await.unwrap();
        lru.get(3).await.unwrap(); // evicts key 1 (LRU head)

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(destructs.load(Ordering::SeqCst), 1);
        assert_eq!(lru.len().await, 2);
    }

    #[tokio::test]
    async fn construct_waits_for_prior_destruct() {
        let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));
        let o1 = order.clone();
        let o2 = order.clone();

        let lru = Lru::new(
            10,
            move |_k: u32| {
                let o1 = o1.clone();
                async move {
                    o1.lock().await.push("construct");
                    Ok::<_, anyhow::Error>(())
                }
            },
            move |_v: (), _k: u32| {
                let o2 = o2.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    o2.lock().await.push("destruct");
                }
            },
        );

        lru.get(1).await.unwrap();
        lru.delete(1).await;
        // Immediately request again; construction must wait for the
        // in-flight destructor to finish first.
        lru.get(1).await.unwrap();

        let log = order.lock().await;
        assert_eq!(&log[..], ["construct", "destruct", "construct"]);
    }

    #[tokio::test]
    async fn concurrent_get_of_new_key_never_sees_placeholder_error() {
        let lru = Arc::new(Lru::new(
            10,
            |k: u32| async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok::<_, anyhow::Error>(k * 10)
            },
            |_v: u32, _k: u32| async move {},
        ));

        let a = {
            let lru = lru.clone();
            tokio::spawn(async move { lru.get(1).await })
        };
        // Give the first caller time to insert the placeholder slot but not
        // to finish construction.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let b = {
            let lru = lru.clone();
            tokio::spawn(async move { lru.get(1).await })
        };

        assert_eq!(a.await.unwrap().unwrap(), 10);
        assert_eq!(b.await.unwrap().unwrap(), 10);
    }
}
