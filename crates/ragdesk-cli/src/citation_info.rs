//! Lazily resolved citation sources

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::task::JoinSet;

use ragdesk_core::{Citation, CitationInfo, KnowledgeBaseApi, Result, info_key};

/// Memo of citation source names, keyed by `"{kb_id}-{document_id}"`.
///
/// Lookups run as background tasks and fill the memo as they finish, so
/// callers render immediately with whatever has arrived. Each pair is
/// requested at most once per cache, even when the lookup fails. Dropping
/// the cache aborts lookups still in flight.
#[derive(Debug, Default)]
pub struct CitationInfoCache {
    infos: Arc<RwLock<HashMap<String, CitationInfo>>>,
    requested: HashSet<String>,
    lookups: JoinSet<()>,
}

impl CitationInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<CitationInfo> {
        self.read().get(key).cloned()
    }

    /// Copy of every source resolved so far
    pub fn snapshot(&self) -> HashMap<String, CitationInfo> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Number of lookups still running
    pub fn pending(&self) -> usize {
        self.lookups.len()
    }

    /// Start lookups for a decoded message's citations.
    ///
    /// One lookup per unique `(kb_id, document_id)` pair not requested
    /// before. Failed lookups are logged and left out. Returns the number of
    /// lookups started.
    pub fn resolve_for<A>(&mut self, api: &Arc<A>, citations: &[Citation]) -> usize
    where
        A: KnowledgeBaseApi + ?Sized + 'static,
    {
        let mut pairs = BTreeMap::new();
        for citation in citations {
            if let (Some(kb_id), Some(document_id)) = (citation.kb_id(), citation.document_id()) {
                let key = info_key(&kb_id, &document_id);
                if !self.requested.contains(&key) {
                    pairs.insert(key, (kb_id, document_id));
                }
            }
        }

        let started = pairs.len();
        for (key, (kb_id, document_id)) in pairs {
            self.requested.insert(key.clone());
            let api = api.clone();
            let infos = self.infos.clone();
            self.lookups.spawn(async move {
                match lookup(&*api, &kb_id, &document_id).await {
                    Ok(info) => {
                        infos
                            .write()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(key, info);
                    }
                    Err(e) => tracing::warn!(%key, error = %e, "failed to fetch citation info"),
                }
            });
        }
        if started > 0 {
            tracing::debug!(started, "fetching citation sources");
        }
        started
    }

    /// Wait for every lookup started so far.
    ///
    /// Cancel safe: dropping the future leaves unfinished lookups running.
    pub async fn settle(&mut self) {
        while let Some(joined) = self.lookups.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "citation lookup task ended abnormally");
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, CitationInfo>> {
        self.infos.read().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn lookup<A>(api: &A, kb_id: &str, document_id: &str) -> Result<CitationInfo>
where
    A: KnowledgeBaseApi + ?Sized,
{
    let (kb, document) = futures::try_join!(
        api.get_knowledge_base(kb_id),
        api.get_document(kb_id, document_id)
    )?;

    Ok(CitationInfo {
        knowledge_base_name: kb.name,
        document_file_name: document.file_name,
    })
}
