//! Local mirror of the coordinator's agent roster for one dispatcher.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::task::EndpointInfo;

use super::agent_proxy::{AgentProxy, ProxyContext, ProxyStatus};

pub struct AgentPool {
    context: ProxyContext,
    proxies: Mutex<HashMap<String, AgentProxy>>,
}

impl AgentPool {
    pub fn new(context: ProxyContext) -> Self {
        Self {
            context,
            proxies: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, AgentProxy>> {
        self.proxies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn(&self, info: EndpointInfo) -> Option<AgentProxy> {
        match AgentProxy::spawn(info.clone(), self.context.clone()) {
            Ok(proxy) => Some(proxy),
            Err(e) => {
                tracing::warn!(agent = %info.name, url = %info.rpc_url, error = %e, "Cannot connect to agent");
                None
            }
        }
    }

    /// Create a proxy for `info`. An existing proxy with different addresses
    /// is replaced.
    pub async fn add(&self, info: EndpointInfo) {
        let replaced = {
            let mut proxies = self.lock();
            if proxies.get(&info.name).is_some_and(|p| *p.info() == info) {
                return;
            }
            let replaced = proxies.remove(&info.name);
            if let Some(proxy) = self.spawn(info.clone()) {
                proxies.insert(info.name.clone(), proxy);
            }
            replaced
        };

        if let Some(proxy) = replaced {
            proxy.dispose().await;
        }
    }

    pub async fn remove(&self, name: &str) {
        let removed = self.lock().remove(name);
        match removed {
            Some(proxy) => {
                tracing::info!(agent = name, "Agent removed from pool");
                proxy.dispose().await;
            }
            None => tracing::debug!(agent = name, "Removal of unknown agent"),
        }
    }

    /// Replace the roster: dispose proxies no longer listed or whose
    /// addresses changed, create proxies for new entries.
    pub async fn update(&self, infos: Vec<EndpointInfo>) {
        let stale = {
            let mut proxies = self.lock();
            let outdated: Vec<String> = {
                let listed: HashMap<&str, &EndpointInfo> =
                    infos.iter().map(|i| (i.name.as_str(), i)).collect();
                proxies
                    .iter()
                    .filter(|(name, proxy)| {
                        listed
                            .get(name.as_str())
                            .map_or(true, |info| *info != proxy.info())
                    })
                    .map(|(name, _)| name.clone())
                    .collect()
            };
            let stale: Vec<AgentProxy> = outdated
                .iter()
                .filter_map(|name| proxies.remove(name))
                .collect();

            for info in infos {
                if proxies.contains_key(&info.name) {
                    continue;
                }
                if let Some(proxy) = self.spawn(info.clone()) {
                    proxies.insert(info.name, proxy);
                }
            }
            stale
        };

        if !stale.is_empty() {
            tracing::info!(removed = stale.len(), "Agent roster updated");
        }
        for proxy in stale {
            proxy.dispose().await;
        }
    }

    /// Dispose every proxy.
    pub async fn clear(&self) {
        let drained: Vec<AgentProxy> = self.lock().drain().map(|(_, proxy)| proxy).collect();
        for proxy in drained {
            proxy.dispose().await;
        }
    }

    /// Connected agent names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn status(&self, name: &str) -> Option<ProxyStatus> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        {
            let proxies = self.lock();
            let proxy = proxies.get(name)?;
            proxy.forward_status(tx);
        }
        rx.await.ok()
    }
}
