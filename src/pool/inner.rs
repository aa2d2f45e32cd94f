//! Pool internals: slot accounting, idle queue, bounded waiting, pruning.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::cancellation::CancelToken;
use crate::config::{HostSpec, Options, TargetSessionAttrs};
use crate::connector::Connector;
use crate::errors::Error;
use crate::stats::DriverStats;

use super::errors::{PoolError, TimeoutType};
use super::hosts;

struct IdleConnector {
    conn: Connector,
    since: quanta::Instant,
}

struct Slots {
    idle: VecDeque<IdleConnector>,
    /// Busy + idle. Never exceeds `max_size`.
    total: usize,
    max_size: usize,
}

pub(crate) struct PoolInner {
    pub(crate) options: Arc<Options>,
    slots: Mutex<Slots>,
    /// Permits bound concurrent rentals: available permits + handed-out
    /// connectors always equals `max_size`.
    semaphore: Semaphore,
    /// Renters currently blocked waiting for a permit.
    waiting: AtomicUsize,
    round_robin: AtomicUsize,
    pub(crate) stats: Arc<DriverStats>,
}

/// Point-in-time pool accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_size: usize,
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub waiting: usize,
}

impl fmt::Debug for PoolInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status();
        f.debug_struct("PoolInner")
            .field("status", &status)
            .finish()
    }
}

impl PoolInner {
    pub(crate) fn new(options: Arc<Options>) -> Arc<PoolInner> {
        let max_size = options.max_pool_size;
        let inner = Arc::new(PoolInner {
            options,
            slots: Mutex::new(Slots {
                idle: VecDeque::with_capacity(max_size),
                total: 0,
                max_size,
            }),
            semaphore: Semaphore::new(max_size),
            waiting: AtomicUsize::new(0),
            round_robin: AtomicUsize::new(0),
            stats: crate::stats::global(),
        });
        inner.spawn_pruner();
        inner
    }

    pub(crate) fn status(&self) -> PoolStatus {
        let slots = self.slots.lock();
        PoolStatus {
            max_size: slots.max_size,
            total: slots.total,
            idle: slots.idle.len(),
            busy: slots.total - slots.idle.len(),
            waiting: self.waiting.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn close(&self) {
        self.semaphore.close();
        let drained: Vec<IdleConnector> = {
            let mut slots = self.slots.lock();
            let drained = slots.idle.drain(..).collect::<Vec<_>>();
            slots.total -= drained.len();
            drained
        };
        for _ in &drained {
            self.stats.connection_idle_gone();
        }
        // Connectors send their Terminate from Drop.
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Rent a connector: idle first, then a fresh open while under
    /// `MaxPoolSize`, else wait until a return frees a slot or `Timeout`
    /// expires.
    pub(crate) async fn rent(
        self: &Arc<PoolInner>,
        attrs: Option<TargetSessionAttrs>,
        cancel: &CancelToken,
    ) -> Result<PooledConnector, PoolError> {
        let attrs = attrs.unwrap_or(self.options.target_session_attributes);
        let permit = self.acquire_permit(cancel).await?;

        let candidates = hosts::candidates(&self.options, attrs, &self.round_robin);
        if candidates.is_empty() {
            return Err(PoolError::Backend(Error::Configuration(
                crate::errors::ConfigError::MissingHost,
            )));
        }

        let mut last_error: Option<PoolError> = None;
        for host in &candidates {
            // Idle connectors for this host first.
            while let Some(idle) = self.pop_idle_for(host) {
                match self.validate_idle(idle, attrs, host).await {
                    Ok(Some(conn)) => return Ok(self.hand_out(conn, permit)),
                    Ok(None) => break, // host is the wrong kind for `attrs`
                    Err(()) => continue, // connector was dead; try the next
                }
            }

            // Open a fresh one while capacity remains, unless the cache
            // already knows this host is the wrong kind. Offline hosts are
            // still attempted (last in candidate order); a refused open
            // re-marks them.
            let cached = hosts::cached_role(host, self.options.host_recheck());
            let wrong_kind = matches!(
                cached,
                hosts::HostRole::Primary | hosts::HostRole::Standby
            ) && !hosts::acceptable(attrs, cached);
            if wrong_kind {
                continue;
            }
            if !self.reserve_slot(host) {
                continue;
            }
            match self.open_checked(host, attrs, cancel).await {
                Ok(Some(conn)) => return Ok(self.hand_out(conn, permit)),
                Ok(None) => {
                    self.unreserve_slot();
                }
                Err(err) => {
                    self.unreserve_slot();
                    if matches!(err, PoolError::Canceled | PoolError::Timeout(_)) {
                        return Err(err);
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or(PoolError::Backend(Error::ConnectionFailed {
            identifier: crate::errors::ServerIdentifier::new(
                &candidates[0].host,
                candidates[0].port,
                self.options.database_or_username(),
                &self.options.username,
            ),
            reason: format!(
                "no host satisfies TargetSessionAttributes={}",
                attrs.as_str()
            ),
        })))
    }

    async fn acquire_permit(
        self: &Arc<PoolInner>,
        cancel: &CancelToken,
    ) -> Result<SemaphorePermit<'_>, PoolError> {
        // Fast path.
        if let Ok(permit) = self.semaphore.try_acquire() {
            return Ok(permit);
        }

        self.waiting.fetch_add(1, Ordering::Relaxed);
        scopeguard::defer! {
            self.waiting.fetch_sub(1, Ordering::Relaxed);
        }

        let wait = async {
            match self.options.connect_timeout() {
                Some(timeout) => tokio::time::timeout(timeout, self.semaphore.acquire())
                    .await
                    .map_err(|_| PoolError::Timeout(TimeoutType::Wait))?
                    .map_err(|_| PoolError::Closed),
                None => self
                    .semaphore
                    .acquire()
                    .await
                    .map_err(|_| PoolError::Closed),
            }
        };
        tokio::select! {
            biased;
            _ = cancel.canceled() => Err(PoolError::Canceled),
            permit = wait => permit,
        }
    }

    fn pop_idle_for(&self, host: &HostSpec) -> Option<IdleConnector> {
        let mut slots = self.slots.lock();
        let index = slots.idle.iter().position(|idle| idle.conn.host() == host)?;
        let idle = slots.idle.remove(index);
        if idle.is_some() {
            // Still counted in `total`; the caller decides its fate.
            self.stats.connection_idle_gone();
        }
        idle
    }

    /// Check an idle connector before handing it out. `Ok(None)` means the
    /// host itself fails the selector; `Err(())` means the connector died.
    async fn validate_idle(
        &self,
        idle: IdleConnector,
        attrs: TargetSessionAttrs,
        host: &HostSpec,
    ) -> Result<Option<Connector>, ()> {
        let mut conn = idle.conn;

        if conn.is_broken() {
            self.drop_tracked(conn);
            return Err(());
        }
        if let Some(lifetime) = self.options.lifetime() {
            if conn.age() >= lifetime {
                debug!("Connector {conn} exceeded ConnectionLifetime, closing");
                self.drop_tracked(conn);
                return Err(());
            }
        }
        if conn.keepalive().await.is_err() {
            self.drop_tracked(conn);
            return Err(());
        }

        if hosts::needs_role(attrs) {
            let ttl = self.options.host_recheck();
            let mut role = hosts::cached_role(host, ttl);
            if role == hosts::HostRole::Unknown {
                match conn.probe_read_only().await {
                    Ok(read_only) => {
                        role = if read_only {
                            hosts::HostRole::Standby
                        } else {
                            hosts::HostRole::Primary
                        };
                        hosts::record_role(host, role);
                    }
                    Err(_) => {
                        self.drop_tracked(conn);
                        return Err(());
                    }
                }
            }
            if !hosts::acceptable(attrs, role) {
                // Wrong kind of host; the connector itself is healthy, put
                // it back for renters with laxer requirements.
                self.push_idle(conn);
                return Ok(None);
            }
        }

        Ok(Some(conn))
    }

    /// Open on `host` with one retry for transient failures, then verify the
    /// role when the selector demands one. `Ok(None)` is a healthy host of
    /// the wrong kind.
    async fn open_checked(
        self: &Arc<PoolInner>,
        host: &HostSpec,
        attrs: TargetSessionAttrs,
        cancel: &CancelToken,
    ) -> Result<Option<Connector>, PoolError> {
        let mut conn = match self.open_with_retry(host, cancel).await {
            Ok(conn) => conn,
            Err(err) => {
                if matches!(err, Error::ConnectionFailed { .. }) {
                    hosts::mark_offline(host);
                }
                return Err(err.into());
            }
        };

        if hosts::needs_role(attrs) {
            let read_only = match conn.probe_read_only().await {
                Ok(read_only) => read_only,
                Err(err) => return Err(err.into()),
            };
            hosts::record_role(
                host,
                if read_only {
                    hosts::HostRole::Standby
                } else {
                    hosts::HostRole::Primary
                },
            );
            if hosts::rejects(attrs, read_only) {
                conn.terminate().await;
                return Ok(None);
            }
        }
        Ok(Some(conn))
    }

    async fn open_with_retry(
        &self,
        host: &HostSpec,
        cancel: &CancelToken,
    ) -> Result<Connector, Error> {
        match Connector::open(self.options.clone(), host.clone(), cancel).await {
            Ok(conn) => Ok(conn),
            // One retry for transient classes; failed opens are never cached.
            Err(err) if err.is_transient() => {
                warn!("Open failed transiently ({err}), retrying once");
                Connector::open(self.options.clone(), host.clone(), cancel).await
            }
            Err(err) => Err(err),
        }
    }

    /// Reserve capacity for a new physical connection, closing a surplus
    /// idle connector for another host when the pool is at its cap.
    fn reserve_slot(&self, host: &HostSpec) -> bool {
        let mut slots = self.slots.lock();
        if slots.total < slots.max_size {
            slots.total += 1;
            return true;
        }
        // At cap: all capacity is busy or idle-for-other-hosts. A surplus
        // idle connector can make room.
        let index = slots
            .idle
            .iter()
            .position(|idle| idle.conn.host() != host);
        if let Some(index) = index {
            let victim = slots.idle.remove(index);
            drop(slots);
            if victim.is_some() {
                self.stats.connection_idle_gone();
            }
            // Victim's slot transfers to the new connection: total unchanged.
            return true;
        }
        false
    }

    fn unreserve_slot(&self) {
        let mut slots = self.slots.lock();
        slots.total -= 1;
    }

    fn hand_out(
        self: &Arc<PoolInner>,
        conn: Connector,
        permit: SemaphorePermit<'_>,
    ) -> PooledConnector {
        permit.forget();
        self.stats.connection_busy();
        PooledConnector {
            conn: Some(conn),
            pool: Arc::downgrade(self),
        }
    }

    /// A rented connector that died: free its slot before any waiter wakes.
    fn discard_rented(&self, conn: Connector) {
        {
            let mut slots = self.slots.lock();
            slots.total -= 1;
        }
        self.stats.connection_busy_gone();
        drop(conn);
        self.semaphore.add_permits(1);
    }

    /// An idle (never handed out this cycle) connector that died.
    fn drop_tracked(&self, conn: Connector) {
        {
            let mut slots = self.slots.lock();
            slots.total -= 1;
        }
        drop(conn);
    }

    fn push_idle(&self, conn: Connector) {
        let mut slots = self.slots.lock();
        slots.idle.push_front(IdleConnector {
            conn,
            since: crate::clock::now(),
        });
        drop(slots);
        self.stats.connection_idle();
    }

    /// Return path for rented connectors.
    pub(crate) fn checkin(self: Arc<Self>, conn: Connector) {
        if self.is_closed() {
            self.discard_rented(conn);
            return;
        }
        if conn.is_broken() {
            self.discard_rented(conn);
            return;
        }
        let lifetime_expired = self
            .options
            .lifetime()
            .is_some_and(|lifetime| conn.age() >= lifetime);
        let needs_reset = !conn.is_ready()
            || conn.transaction_status() != crate::messages::TransactionStatus::Idle
            || conn.dirty;

        if lifetime_expired || needs_reset {
            // Async cleanup; without a runtime the connector is dropped and
            // its slot freed.
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let pool = self.clone();
                    handle.spawn(async move {
                        pool.checkin_slow(conn, lifetime_expired).await;
                    });
                }
                Err(_) => self.discard_rented(conn),
            }
            return;
        }

        self.return_idle(conn);
    }

    async fn checkin_slow(self: Arc<Self>, mut conn: Connector, lifetime_expired: bool) {
        if lifetime_expired {
            info!("Connector {conn} exceeded ConnectionLifetime, closing");
            conn.terminate().await;
            self.discard_rented(conn);
            return;
        }
        match conn.reset().await {
            Ok(()) => self.return_idle(conn),
            Err(err) => {
                warn!("Checkin reset failed: {err}");
                self.discard_rented(conn);
            }
        }
    }

    fn return_idle(&self, conn: Connector) {
        {
            let mut slots = self.slots.lock();
            slots.idle.push_front(IdleConnector {
                conn,
                since: crate::clock::now(),
            });
        }
        self.stats.connection_busy_gone();
        self.stats.connection_idle();
        self.semaphore.add_permits(1);
    }

    fn spawn_pruner(self: &Arc<PoolInner>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let interval = self.options.pruning_interval();
        handle.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(pool) = weak.upgrade() else { break };
                if pool.is_closed() {
                    break;
                }
                pool.prune().await;
                pool.fill_to_min(&CancelToken::new()).await;
            }
        });
    }

    /// Close idle connectors past `ConnectionIdleLifetime` (preserving
    /// `MinPoolSize`) and any past `ConnectionLifetime` outright.
    pub(crate) async fn prune(&self) {
        let idle_lifetime = self.options.idle_lifetime();
        let lifetime = self.options.lifetime();
        let min = self.options.min_pool_size;

        let mut victims = Vec::new();
        {
            let mut slots = self.slots.lock();
            // Oldest idles sit at the back of the LIFO queue.
            let mut index = 0;
            while index < slots.idle.len() {
                let entry = &slots.idle[index];
                let lifetime_expired = lifetime.is_some_and(|l| entry.conn.age() >= l);
                let idle_expired = entry.since.elapsed() >= idle_lifetime;
                if lifetime_expired || (idle_expired && slots.total > min) {
                    if let Some(victim) = slots.idle.remove(index) {
                        slots.total -= 1;
                        victims.push(victim.conn);
                    }
                } else {
                    index += 1;
                }
            }
        }
        for mut conn in victims {
            self.stats.connection_idle_gone();
            debug!("Pruning idle connector {conn}");
            conn.terminate().await;
        }
    }

    /// Top the pool back up to `MinPoolSize`.
    pub(crate) async fn fill_to_min(self: &Arc<Self>, cancel: &CancelToken) {
        let min = self.options.min_pool_size;
        loop {
            {
                let mut slots = self.slots.lock();
                if slots.total >= min || slots.total >= slots.max_size {
                    return;
                }
                slots.total += 1;
            }
            let host = hosts::candidates(
                &self.options,
                self.options.target_session_attributes,
                &self.round_robin,
            )
            .into_iter()
            .next();
            let Some(host) = host else {
                self.unreserve_slot();
                return;
            };
            match self.open_with_retry(&host, cancel).await {
                Ok(conn) => self.push_idle(conn),
                Err(err) => {
                    warn!("MinPoolSize fill failed: {err}");
                    self.unreserve_slot();
                    return;
                }
            }
        }
    }
}

/// A rented connector. Derefs to [`Connector`] and returns to its pool on
/// drop; broken connectors are discarded and their slot freed before any
/// waiter is woken.
pub struct PooledConnector {
    conn: Option<Connector>,
    pool: Weak<PoolInner>,
}

impl PooledConnector {
    /// Wrap a connector that has no pool (Pooling=false); dropping it closes
    /// the connection.
    pub(crate) fn unpooled(conn: Connector) -> PooledConnector {
        PooledConnector {
            conn: Some(conn),
            pool: Weak::new(),
        }
    }

    /// Take the connector out, leaving the wrapper inert.
    pub fn detach(mut this: Self) -> Connector {
        this.conn.take().expect("connector already taken")
    }
}

impl Deref for PooledConnector {
    type Target = Connector;
    fn deref(&self) -> &Connector {
        self.conn.as_ref().expect("connector already taken")
    }
}

impl DerefMut for PooledConnector {
    fn deref_mut(&mut self) -> &mut Connector {
        self.conn.as_mut().expect("connector already taken")
    }
}

impl fmt::Debug for PooledConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.conn {
            Some(conn) => write!(f, "PooledConnector({conn})"),
            None => write!(f, "PooledConnector(detached)"),
        }
    }
}

impl Drop for PooledConnector {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else { return };
        if let Some(pool) = self.pool.upgrade() {
            pool.checkin(conn);
        }
        // Unpooled or the pool is gone: Connector::drop sends Terminate.
    }
}
