//! Stream clients shared by every call of a gateway.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::credentials::CredentialProvider;
use crate::error::CallError;
use crate::resolve::HostConfig;
use crate::transport::StreamClient;

/// Endpoint URI → pooled client, created once on first use.
///
/// Creation happens under the map entry's lock, so concurrent first calls to
/// one endpoint end up sharing a single client.
pub struct ClientCache {
    credentials: Arc<dyn CredentialProvider>,
    clients: DashMap<String, Arc<StreamClient>>,
    max_idle: Option<usize>,
}

impl std::fmt::Debug for ClientCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCache")
            .field("clients", &self.clients.len())
            .finish_non_exhaustive()
    }
}

impl ClientCache {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            credentials,
            clients: DashMap::new(),
            max_idle: None,
        }
    }

    /// Idle connections kept per endpoint.
    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = Some(max_idle);
        self
    }

    pub fn get_or_create(&self, host: &HostConfig) -> Result<Arc<StreamClient>, CallError> {
        let uri = host.uri();
        if let Some(client) = self.clients.get(&uri) {
            return Ok(Arc::clone(&client));
        }
        match self.clients.entry(uri) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let connector = self.credentials.credentials_for(&host.host)?;
                let mut client = StreamClient::new(host.host.clone(), host.port, connector);
                if let Some(max_idle) = self.max_idle {
                    client = client.with_max_idle(max_idle);
                }
                tracing::debug!(uri = %entry.key(), "Created stream client");
                let client = Arc::new(client);
                entry.insert(Arc::clone(&client));
                Ok(client)
            }
        }
    }

    /// Forget a client whose endpoint could not be reached.
    pub fn evict(&self, host: &HostConfig) {
        if self.clients.remove(&host.uri()).is_some() {
            tracing::debug!(uri = %host.uri(), "Evicted stream client");
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Connector, TcpConnector};
    use crate::options::CallOptions;
    use crate::resolve::Transport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingCredentials(AtomicUsize);

    impl CredentialProvider for CountingCredentials {
        fn credentials_for(&self, _peer: &str) -> Result<Arc<dyn Connector>, CallError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(TcpConnector))
        }
    }

    struct NoCredentials;

    impl CredentialProvider for NoCredentials {
        fn credentials_for(&self, peer: &str) -> Result<Arc<dyn Connector>, CallError> {
            Err(CallError::Config(format!("no certificate for {peer}")))
        }
    }

    fn host(name: &str, port: u16) -> HostConfig {
        HostConfig {
            transport: Transport::Remote,
            host: name.into(),
            port,
            options: CallOptions::new(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_use_creates_one_client() {
        let credentials = Arc::new(CountingCredentials::default());
        let cache = Arc::new(ClientCache::new(credentials.clone()));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get_or_create(&host("echo", 2424)).unwrap() })
            })
            .collect();
        let mut clients = Vec::new();
        for task in tasks {
            clients.push(task.await.unwrap());
        }

        assert_eq!(credentials.0.load(Ordering::SeqCst), 1);
        assert!(clients.iter().all(|c| Arc::ptr_eq(c, &clients[0])));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn endpoints_are_keyed_by_port_and_evictable() {
        let cache = ClientCache::new(Arc::new(CountingCredentials::default()));
        let a = cache.get_or_create(&host("echo", 2424)).unwrap();
        let b = cache.get_or_create(&host("echo", 2525)).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 2);

        cache.evict(&host("echo", 2424));
        assert_eq!(cache.len(), 1);
        let c = cache.get_or_create(&host("echo", 2424)).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn credential_failure_caches_nothing() {
        let cache = ClientCache::new(Arc::new(NoCredentials));
        let err = cache.get_or_create(&host("secure", 2424)).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
        assert!(cache.is_empty());
    }
}
