use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use media_proto::protocol::Outgoing;
use media_proto::TabId;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("tab {0} has no report source listening")]
    NoListener(TabId),
    #[error("report source for tab {0} went away")]
    Closed(TabId),
    #[error("no browser connection available to inject a source into tab {0}")]
    NoBrowser(TabId),
}

/// Outcome of asking for a Report Source in a tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    AlreadyPresent,
    Requested,
}

/// The coordinator's view of the browser: liveness, command delivery and
/// source injection.  Calls are suspension points; the coordinator runs them
/// off its loop and feeds the results back in as events.
pub trait TabHost: Clone + Send + Sync + 'static {
    fn tab_exists(&self, tab_id: TabId) -> impl Future<Output = bool> + Send;

    fn dispatch(
        &self,
        tab_id: TabId,
        message: Outgoing,
    ) -> impl Future<Output = Result<(), DispatchError>> + Send;

    fn ensure_source(
        &self,
        tab_id: TabId,
    ) -> impl Future<Output = Result<EnsureOutcome, DispatchError>> + Send;
}

struct TabEntry {
    /// Outbound queue of the attached Report Source, if any.
    source: Option<mpsc::Sender<Outgoing>>,
    /// The browser shim announced this tab.
    announced: bool,
    url: Option<String>,
}

#[derive(Default)]
struct Inner {
    tabs: HashMap<TabId, TabEntry>,
    browsers: HashMap<u64, mpsc::Sender<Outgoing>>,
}

/// Live tabs as learned from socket connections.
///
/// A tab exists while a Report Source for it is connected or while the browser
/// shim has announced it and not yet removed it.
#[derive(Clone, Default)]
pub struct TabRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl TabRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A Report Source connected for `tab_id`.  Replaces any earlier source.
    pub async fn attach_source(
        &self,
        tab_id: TabId,
        url: Option<String>,
        tx: mpsc::Sender<Outgoing>,
    ) {
        let mut inner = self.inner.write().await;
        let entry = inner.tabs.entry(tab_id).or_insert(TabEntry {
            source: None,
            announced: false,
            url: None,
        });
        entry.source = Some(tx);
        if url.is_some() {
            entry.url = url;
        }
    }

    /// A Report Source disconnected.  Returns `true` when the tab is now
    /// unknown, i.e. the browser never announced it.
    pub async fn detach_source(&self, tab_id: TabId, tx: &mpsc::Sender<Outgoing>) -> bool {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.tabs.get_mut(&tab_id) else {
            return true;
        };
        // a newer connection for the same tab may already have replaced us
        if entry.source.as_ref().is_some_and(|s| s.same_channel(tx)) {
            entry.source = None;
        }
        if entry.source.is_none() && !entry.announced {
            inner.tabs.remove(&tab_id);
            return true;
        }
        false
    }

    /// The browser reported a tab (navigation or load).
    pub async fn tab_updated(&self, tab_id: TabId, url: String) {
        let mut inner = self.inner.write().await;
        let entry = inner.tabs.entry(tab_id).or_insert(TabEntry {
            source: None,
            announced: true,
            url: None,
        });
        entry.announced = true;
        entry.url = Some(url);
    }

    pub async fn tab_removed(&self, tab_id: TabId) {
        self.inner.write().await.tabs.remove(&tab_id);
    }

    pub async fn add_browser(&self, conn_id: u64, tx: mpsc::Sender<Outgoing>) {
        self.inner.write().await.browsers.insert(conn_id, tx);
    }

    pub async fn remove_browser(&self, conn_id: u64) {
        self.inner.write().await.browsers.remove(&conn_id);
    }

    pub async fn url(&self, tab_id: TabId) -> Option<String> {
        self.inner
            .read()
            .await
            .tabs
            .get(&tab_id)
            .and_then(|e| e.url.clone())
    }
}

impl TabHost for TabRegistry {
    async fn tab_exists(&self, tab_id: TabId) -> bool {
        self.inner.read().await.tabs.contains_key(&tab_id)
    }

    async fn dispatch(&self, tab_id: TabId, message: Outgoing) -> Result<(), DispatchError> {
        let tx = {
            let inner = self.inner.read().await;
            inner
                .tabs
                .get(&tab_id)
                .and_then(|e| e.source.clone())
                .ok_or(DispatchError::NoListener(tab_id))?
        };
        tx.send(message)
            .await
            .map_err(|_| DispatchError::Closed(tab_id))
    }

    async fn ensure_source(&self, tab_id: TabId) -> Result<EnsureOutcome, DispatchError> {
        let browsers: Vec<_> = {
            let inner = self.inner.read().await;
            if inner.tabs.get(&tab_id).is_some_and(|e| e.source.is_some()) {
                return Ok(EnsureOutcome::AlreadyPresent);
            }
            inner.browsers.values().cloned().collect()
        };
        for tx in browsers {
            if tx.send(Outgoing::EnsureSource { tab_id }).await.is_ok() {
                return Ok(EnsureOutcome::Requested);
            }
            debug!("browser connection closed while requesting source for tab {}", tab_id);
        }
        Err(DispatchError::NoBrowser(tab_id))
    }
}
