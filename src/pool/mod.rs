//! Connection pools, keyed process-wide by normalized connection string.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use log::info;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::cancellation::CancelToken;
use crate::config::{Options, TargetSessionAttrs};
use crate::connector::{Connector, QueryResult};
use crate::errors::Error;
use crate::messages::Parameter;
use crate::multiplex::Multiplexer;

mod errors;
pub mod hosts;
mod inner;

pub use errors::{PoolError, TimeoutType};
pub use hosts::HostRole;
pub use inner::{PoolStatus, PooledConnector};

pub(crate) use inner::PoolInner;

type PoolMap = HashMap<String, Pool>;

/// All pools, swapped atomically on creation. Pools live for the process;
/// they are never removed from the registry.
static POOLS: Lazy<ArcSwap<PoolMap>> = Lazy::new(|| ArcSwap::from_pointee(HashMap::new()));
static CREATE_LOCK: Mutex<()> = Mutex::new(());

/// The pool for a connection string, created on first use.
pub fn get_or_create(options: Options) -> Pool {
    let key = options.pool_key().to_string();
    if let Some(pool) = POOLS.load().get(&key) {
        return pool.clone();
    }

    let _guard = CREATE_LOCK.lock();
    // Someone else may have won the race while we waited.
    if let Some(pool) = POOLS.load().get(&key) {
        return pool.clone();
    }

    info!("Creating pool for {key}");
    let pool = Pool::new(Arc::new(options));
    let mut map: PoolMap = POOLS.load().as_ref().clone();
    map.insert(key, pool.clone());
    POOLS.store(Arc::new(map));
    pool
}

/// Snapshot of every pool's accounting, keyed by normalized connection
/// string.
pub fn all_pool_statuses() -> Vec<(String, PoolStatus)> {
    POOLS
        .load()
        .iter()
        .map(|(key, pool)| (key.clone(), pool.status()))
        .collect()
}

/// A bounded multiset of connectors for one connection string. Cloning is
/// cheap and shares the underlying state.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
    multiplexer: Option<Arc<Multiplexer>>,
    options: Arc<Options>,
}

impl Pool {
    /// Build a standalone pool. Most callers go through [`get_or_create`],
    /// which shares pools process-wide by connection string.
    pub fn new(options: Arc<Options>) -> Pool {
        let inner = PoolInner::new(options.clone());
        inner.stats.pool_created();
        let multiplexer = options
            .multiplexing
            .then(|| Arc::new(Multiplexer::new(inner.clone())));
        Pool {
            inner,
            multiplexer,
            options,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn status(&self) -> PoolStatus {
        self.inner.status()
    }

    /// Rent a connector for exclusive use. With `Pooling=false` every rent
    /// opens a fresh physical connection whose drop closes it.
    pub async fn rent(
        &self,
        attrs: Option<TargetSessionAttrs>,
        cancel: &CancelToken,
    ) -> Result<PooledConnector, PoolError> {
        if !self.options.pooling {
            let host = hosts::candidates(
                &self.options,
                attrs.unwrap_or(self.options.target_session_attributes),
                &std::sync::atomic::AtomicUsize::new(0),
            )
            .into_iter()
            .next()
            .ok_or(PoolError::Backend(Error::Configuration(
                crate::errors::ConfigError::MissingHost,
            )))?;
            let conn = Connector::open(self.options.clone(), host, cancel).await?;
            return Ok(PooledConnector::unpooled(conn));
        }
        self.inner.rent(attrs, cancel).await
    }

    /// Execute one command. Multiplexing routes it through the shared
    /// command queue; otherwise a connector is rented for the duration.
    pub async fn execute(
        &self,
        sql: &str,
        params: &[Parameter],
        cancel: &CancelToken,
    ) -> Result<QueryResult, Error> {
        if let Some(multiplexer) = &self.multiplexer {
            return multiplexer.submit(sql, params, cancel).await;
        }
        let mut conn = self.rent(None, cancel).await.map_err(Error::from)?;
        conn.execute_collect(sql, params, cancel).await
    }

    /// Pre-open connectors up to `MinPoolSize`.
    pub async fn warm_up(&self, cancel: &CancelToken) {
        if self.options.pooling {
            self.inner.fill_to_min(cancel).await;
        }
    }

    /// Run one pruning pass now (the background pruner does this every
    /// `ConnectionPruningInterval` seconds).
    pub async fn prune_now(&self) {
        self.inner.prune().await;
    }

    /// Close the pool: idle connectors are dropped, waiters fail with
    /// `PoolClosed`, rented connectors are discarded on return.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("status", &self.status())
            .field("multiplexing", &self.multiplexer.is_some())
            .finish()
    }
}
