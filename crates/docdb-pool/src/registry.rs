//! Pools of every known server.
//!
//! The topology layer owns one [`PoolRegistry`]. Servers that appear get a
//! pool, servers marked healthy get their pool marked Ready, servers that fail
//! get their pool cleared, and servers that leave the topology get their pool
//! closed.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::address::ServerId;
use crate::config::PoolOptions;
use crate::connector::Connector;
use crate::error::PoolError;
use crate::event::EventHandler;
use crate::inner::ClearRequest;
use crate::pool::ConnectionPool;

/// Per-server pools sharing one configuration, connector and event handler.
///
/// Pools are keyed by [`ServerId`], so the same address seen in two clusters
/// gets two pools.
pub struct PoolRegistry {
    options: PoolOptions,
    connector: Arc<dyn Connector>,
    handler: Option<Arc<dyn EventHandler>>,
    pools: RwLock<HashMap<ServerId, ConnectionPool>>,
}

impl PoolRegistry {
    /// Create an empty registry.
    pub fn new<C: Connector>(options: PoolOptions, connector: C) -> Result<Self, PoolError> {
        options.validate()?;
        Ok(Self {
            options,
            connector: Arc::new(connector),
            handler: None,
            pools: RwLock::new(HashMap::new()),
        })
    }

    /// Publish the events of every pool to `handler`.
    #[must_use]
    pub fn with_event_handler<H: EventHandler + 'static>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// The pool of a server, created Paused on first use.
    pub fn get_or_create(&self, server_id: &ServerId) -> Result<ConnectionPool, PoolError> {
        if let Some(pool) = self.pools.read().get(server_id) {
            return Ok(pool.clone());
        }

        let mut pools = self.pools.write();
        if let Some(pool) = pools.get(server_id) {
            return Ok(pool.clone());
        }
        let pool = ConnectionPool::new(
            server_id.clone(),
            self.options.clone(),
            Arc::clone(&self.connector),
            self.handler.clone(),
        )?;
        pools.insert(server_id.clone(), pool.clone());
        Ok(pool)
    }

    /// The pool of a server, if one exists.
    #[must_use]
    pub fn get(&self, server_id: &ServerId) -> Option<ConnectionPool> {
        self.pools.read().get(server_id).cloned()
    }

    /// Mark a server's pool Ready. Returns `false` if there is no such pool or
    /// it was not Paused.
    pub fn mark_ready(&self, server_id: &ServerId) -> bool {
        self.get(server_id).is_some_and(|pool| pool.mark_ready())
    }

    /// Clear a server's pool. Returns `false` if there is no such pool or the
    /// clear was a no-op.
    pub fn clear(&self, server_id: &ServerId, request: ClearRequest) -> bool {
        self.get(server_id).is_some_and(|pool| pool.clear(request))
    }

    /// Remove and close a server's pool.
    pub async fn remove(&self, server_id: &ServerId) -> bool {
        let removed = self.pools.write().remove(server_id);
        match removed {
            Some(pool) => {
                pool.close().await;
                true
            }
            None => false,
        }
    }

    /// Close every pool and empty the registry.
    pub async fn close_all(&self) {
        let pools: Vec<ConnectionPool> = self.pools.write().drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.close().await;
        }
    }

    /// Every registered server.
    #[must_use]
    pub fn servers(&self) -> Vec<ServerId> {
        let mut servers: Vec<_> = self.pools.read().keys().cloned().collect();
        servers.sort();
        servers
    }

    /// Number of registered pools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.read().len()
    }

    /// Check if no pool is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::address::ServerAddress;
    use crate::connector::TcpConnector;
    use crate::inner::PoolState;

    fn server(host: &str) -> ServerId {
        ServerId::new(1, ServerAddress::new(host, 27017))
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_pool() {
        let registry = PoolRegistry::new(PoolOptions::new(), TcpConnector::new()).unwrap();
        let a = registry.get_or_create(&server("a")).unwrap();
        let again = registry.get_or_create(&server("a")).unwrap();
        registry.get_or_create(&server("b")).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(a.server_id(), again.server_id());
        assert!(a.clear(ClearRequest::new()));
        assert_eq!(again.generation(None), 1);
    }

    #[tokio::test]
    async fn test_remove_closes_pool() {
        let registry = PoolRegistry::new(PoolOptions::new(), TcpConnector::new()).unwrap();
        let pool = registry.get_or_create(&server("a")).unwrap();

        assert!(registry.remove(&server("a")).await);
        assert!(!registry.remove(&server("a")).await);
        assert_eq!(pool.state(), PoolState::Closed);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_lifecycle_by_address() {
        let registry = PoolRegistry::new(PoolOptions::new(), TcpConnector::new()).unwrap();
        let pool = registry.get_or_create(&server("a")).unwrap();
        let missing = server("missing");

        assert!(registry.mark_ready(&server("a")));
        assert!(!registry.mark_ready(&missing));
        assert!(registry.clear(&server("a"), ClearRequest::new()));
        assert!(!registry.clear(&missing, ClearRequest::new()));
        assert_eq!(pool.state(), PoolState::Ready);

        registry.get_or_create(&server("b")).unwrap();
        assert_eq!(registry.servers().len(), 2);
        registry.close_all().await;
        assert!(registry.is_empty());
        assert!(pool.is_closed());
    }

    #[tokio::test]
    async fn test_same_address_in_two_clusters() {
        let registry = PoolRegistry::new(PoolOptions::new(), TcpConnector::new()).unwrap();
        let first = server("a");
        let second = ServerId::new(2, first.address.clone());
        let a1 = registry.get_or_create(&first).unwrap();
        let a2 = registry.get_or_create(&second).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(a1.server_id(), &first);
        assert_eq!(a2.server_id(), &second);
        assert_eq!(registry.servers(), vec![first.clone(), second.clone()]);

        assert!(registry.remove(&second).await);
        assert!(a2.is_closed());
        assert!(!a1.is_closed());
        assert!(registry.get(&first).is_some());
        registry.close_all().await;
    }

    #[test]
    fn test_invalid_options_rejected() {
        let options = PoolOptions::new().max_pool_size(1).min_pool_size(2);
        assert!(PoolRegistry::new(options, TcpConnector::new()).is_err());
    }
}
