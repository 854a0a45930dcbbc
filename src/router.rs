//! Maps client sessions onto backends, constructing and evicting
//! [`MediaDescriptor`]s through the shared media LRU (spec.md §4.5).
use crate::backend::QualityBackend;
use crate::lru::Lru;
use crate::media::{self, MediaDescriptor, MediaParams};
use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Fixed capacity of the media-level LRU (spec.md §4.4). Deployments must
/// keep `max_client_number < MEDIA_LRU_CAPACITY`, or a full set of distinct
/// clients could thrash the cache faster than any one of them can finish
/// watching.
pub const MEDIA_LRU_CAPACITY: usize = 20;

type MediaLru = Lru<
    String,
    Arc<MediaDescriptor>,
    Box<dyn Fn(String) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Arc<MediaDescriptor>>> + Send>> + Send + Sync>,
    Box<dyn Fn(Arc<MediaDescriptor>, String) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + Sync>,
>;

struct ClientSession {
    media_key: String,
    quality: String,
    backend: Arc<QualityBackend>,
}

/// Client sessions plus their touch order, oldest at the head — mirrors
/// `lru::Lru`'s own order-tracking shape so eviction here reads the same way
/// (spec.md §4.5).
struct Sessions {
    order: Vec<String>,
    map: HashMap<String, ClientSession>,
}

impl Sessions {
    fn touch(&mut self, client_id: &str) {
        self.order.retain(|id| id != client_id);
        self.order.push(client_id.to_string());
    }
}

pub struct Router {
    media: MediaLru,
    max_client_number: usize,
    sessions: Mutex<Sessions>,
}

impl Router {
    pub fn new(params: MediaParams, max_client_number: usize) -> Self {
        let construct: Box<
            dyn Fn(String) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Arc<MediaDescriptor>>> + Send>>
                + Send
                + Sync,
        > = Box::new(move |key: String| {
            let params = params.clone();
            Box::pin(async move { MediaDescriptor::construct(key, params).await })
        });
        let destruct: Box<
            dyn Fn(Arc<MediaDescriptor>, String) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
                + Send
                + Sync,
        > = Box::new(|value, key| Box::pin(media::destruct(value, key)));

        Self {
            media: Lru::new(MEDIA_LRU_CAPACITY, construct, destruct),
            max_client_number,
            sessions: Mutex::new(Sessions {
                order: Vec::new(),
                map: HashMap::new(),
            }),
        }
    }

    pub async fn media(&self, source_path: &str) -> Result<Arc<MediaDescriptor>> {
        self.media.get(source_path.to_string()).await
    }

    /// Resolves `(client_id, source_path, quality)` to a backend, evicting
    /// the client's previous association if it picked a different file or
    /// quality (spec.md §4.5's "reassociation" rule). If this is a new
    /// client and the session table is already at capacity, evicts the
    /// oldest client first (spec.md §4.5, §8 Scenario 5).
    pub async fn get_backend(
        &self,
        client_id: &str,
        source_path: &str,
        quality: &str,
    ) -> Result<Arc<QualityBackend>> {
        let media = self.media(source_path).await?;
        let backend = media.backend(quality).await?;

        let (previous, evicted) = {
            let mut sessions = self.sessions.lock().await;
            let previous = sessions
                .map
                .get(client_id)
                .map(|s| (s.media_key.clone(), s.quality.clone(), s.backend.clone()));

            let mut evicted = None;
            if previous.is_none() && sessions.map.len() >= self.max_client_number {
                if let Some(oldest_id) = sessions.order.first().cloned() {
                    sessions.order.retain(|id| id != &oldest_id);
                    if let Some(oldest) = sessions.map.remove(&oldest_id) {
                        evicted = Some((oldest_id, oldest.backend));
                    }
                } else {
                    bail!("client limit ({}) reached", self.max_client_number);
                }
            }

            sessions.touch(client_id);
            sessions.map.insert(
                client_id.to_string(),
                ClientSession {
                    media_key: source_path.to_string(),
                    quality: quality.to_string(),
                    backend: backend.clone(),
                },
            );
            (previous, evicted)
        };

        if let Some((evicted_id, evicted_backend)) = evicted {
            evicted_backend.remove_client(&evicted_id).await;
        }

        if let Some((key, q, old_backend)) = previous {
            if key != source_path || q != quality {
                old_backend.remove_client(client_id).await;
            }
        }

        Ok(backend)
    }

    /// Removes a client's association entirely (spec.md §4.3.7, surfaced via
    /// `DELETE /hls.:client/`).
    pub async fn remove_client(&self, client_id: &str) {
        let session = {
            let mut sessions = self.sessions.lock().await;
            sessions.order.retain(|id| id != client_id);
            sessions.map.remove(client_id)
        };
        if let Some(session) = session {
            session.backend.remove_client(client_id).await;
        }
    }

    pub async fn client_count(&self) -> usize {
        self.sessions.lock().await.map.len()
    }

    pub async fn media_count(&self) -> usize {
        self.media.len().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_contract_is_documented_and_checkable() {
        assert_eq!(MEDIA_LRU_CAPACITY, 20);
    }

    /// Exercises the order-tracking `Sessions` uses to find "the oldest
    /// entry" (spec.md §4.5, §8 Scenario 5), independent of the real
    /// `MediaDescriptor` construction `get_backend` also needs.
    #[test]
    fn oldest_session_is_evicted_first() {
        let mut sessions = Sessions {
            order: Vec::new(),
            map: HashMap::new(),
        };
        for id in ["a", "b", "c"] {
            sessions.touch(id);
        }
        assert_eq!(sessions.order, vec!["a", "b", "c"]);

        // Re-touching an existing entry moves it to the tail.
        sessions.touch("a");
        assert_eq!(sessions.order, vec!["b", "c", "a"]);
        assert_eq!(sessions.order.first().cloned(), Some("b".to_string()));
    }
}
