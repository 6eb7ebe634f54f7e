use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::driver::{BrowserDriver, BrowserHandle};
use crate::error::{Result, ScanError};
use crate::orchestration::config::PoolConfig;

/// Bounded, elastic set of headless browser instances.
///
/// `acquire` reuses an idle instance, launches a new one while the live
/// count is below `max_instances`, and otherwise parks the caller on a FIFO
/// wait-list. Instances are handed out as [`BrowserLease`] guards that go
/// back to the pool (or get discarded) when dropped.
#[derive(Clone)]
pub struct BrowserPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for BrowserPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowserPool")
            .field("stats", &self.stats())
            .finish()
    }
}

struct PoolInner {
    driver: Arc<dyn BrowserDriver>,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

struct Instance {
    id: u64,
    handle: Box<dyn BrowserHandle>,
    created_at: Instant,
    last_used_at: Instant,
}

#[derive(Default)]
struct PoolState {
    /// Oldest release at the front.
    idle: VecDeque<Instance>,
    busy: usize,
    launching: usize,
    waiters: VecDeque<oneshot::Sender<Grant>>,
    closed: bool,
    scan_active: bool,
    next_id: u64,
    launched_total: u64,
    discarded_total: u64,
    evicted_total: u64,
}

impl PoolState {
    fn live(&self) -> usize {
        self.idle.len() + self.busy + self.launching
    }
}

/// What a parked waiter receives.
enum Grant {
    Instance(BrowserLease),
    Launch(LaunchReservation),
}

impl Grant {
    /// Takes the payload back without running its drop hook; used when the
    /// waiter vanished before the grant was delivered and the caller still
    /// holds the state lock.
    fn reclaim(self) -> Option<Instance> {
        match self {
            Grant::Instance(lease) => lease.into_instance(),
            Grant::Launch(reservation) => {
                reservation.disarm();
                None
            }
        }
    }
}

/// Counters exposed for status endpoints and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub busy: usize,
    pub launching: usize,
    pub waiting: usize,
    pub min_instances: usize,
    pub max_instances: usize,
    pub launched_total: u64,
    pub discarded_total: u64,
    pub evicted_total: u64,
}

impl PoolStats {
    pub fn live(&self) -> usize {
        self.idle + self.busy + self.launching
    }
}

enum Decision {
    Reuse(BrowserLease),
    Launch(LaunchReservation),
    Wait(oneshot::Receiver<Grant>),
}

impl BrowserPool {
    pub fn new(driver: Arc<dyn BrowserDriver>, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                driver,
                config,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn driver(&self) -> &Arc<dyn BrowserDriver> {
        &self.inner.driver
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Borrows an instance, suspending while the pool is saturated.
    pub async fn acquire(&self) -> Result<BrowserLease> {
        loop {
            let (lease, reused) = self.acquire_once().await?;
            if !reused || lease.handle().is_alive().await {
                return Ok(lease);
            }
            warn!(target: "scan::pool", instance = lease.id(), "idle browser died, discarding");
            lease.discard();
        }
    }

    async fn acquire_once(&self) -> Result<(BrowserLease, bool)> {
        let decision = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(ScanError::PoolClosed);
            }
            if let Some(instance) = state.idle.pop_back() {
                state.busy += 1;
                Decision::Reuse(BrowserLease::new(Arc::clone(&self.inner), instance))
            } else if state.live() < self.inner.config.max_instances {
                state.launching += 1;
                Decision::Launch(LaunchReservation::new(Arc::clone(&self.inner)))
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.retain(|waiter| !waiter.is_closed());
                state.waiters.push_back(tx);
                debug!(
                    target: "scan::pool",
                    waiting = state.waiters.len(),
                    busy = state.busy,
                    "pool saturated, waiting for a release"
                );
                Decision::Wait(rx)
            }
        };

        match decision {
            Decision::Reuse(lease) => Ok((lease, true)),
            Decision::Launch(reservation) => Ok((self.launch(reservation).await?, false)),
            Decision::Wait(rx) => match rx.await {
                Ok(Grant::Instance(lease)) => Ok((lease, true)),
                Ok(Grant::Launch(reservation)) => Ok((self.launch(reservation).await?, false)),
                Err(_) => Err(ScanError::PoolClosed),
            },
        }
    }

    async fn launch(&self, reservation: LaunchReservation) -> Result<BrowserLease> {
        let timeout = self.inner.config.launch_timeout();
        let handle = match tokio::time::timeout(timeout, self.inner.driver.launch()).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(err)) => {
                warn!(target: "scan::pool", error = %err, "browser launch failed");
                return Err(err);
            }
            Err(_) => {
                warn!(target: "scan::pool", ?timeout, "browser launch timed out");
                return Err(ScanError::BrowserCrash(format!(
                    "launch did not finish within {timeout:?}"
                )));
            }
        };
        reservation.fulfil(handle)
    }

    /// Pre-launches instances until `min_instances` are live. Returns the
    /// number launched; launch failures stop warming early.
    pub async fn warm(&self) -> usize {
        let mut launched = 0;
        loop {
            let reservation = {
                let mut state = self.inner.state.lock();
                if state.closed || state.live() >= self.inner.config.min_instances {
                    break;
                }
                state.launching += 1;
                LaunchReservation::new(Arc::clone(&self.inner))
            };
            match self.launch(reservation).await {
                // Dropping the lease parks the instance in the idle set.
                Ok(lease) => {
                    drop(lease);
                    launched += 1;
                }
                Err(err) => {
                    warn!(target: "scan::pool", error = %err, "pool warm-up stopped");
                    break;
                }
            }
        }
        if launched > 0 {
            info!(target: "scan::pool", launched, "browser pool warmed");
        }
        launched
    }

    /// While a scan is active, idle eviction keeps `min_instances` alive.
    pub fn set_scan_active(&self, active: bool) {
        self.inner.state.lock().scan_active = active;
    }

    /// Evicts idle instances unused for longer than the idle timeout.
    /// Returns how many were evicted.
    pub fn sweep_idle(&self) -> usize {
        let idle_timeout = self.inner.config.idle_timeout();
        let evicted: Vec<Instance> = {
            let mut state = self.inner.state.lock();
            let floor = if state.scan_active {
                self.inner.config.min_instances
            } else {
                0
            };
            let mut live = state.live();
            let now = Instant::now();
            let mut kept = VecDeque::with_capacity(state.idle.len());
            let mut evicted = Vec::new();
            while let Some(instance) = state.idle.pop_front() {
                if live > floor && now.duration_since(instance.last_used_at) >= idle_timeout {
                    live -= 1;
                    evicted.push(instance);
                } else {
                    kept.push_back(instance);
                }
            }
            state.idle = kept;
            state.evicted_total += evicted.len() as u64;
            evicted
        };

        let count = evicted.len();
        for instance in evicted {
            debug!(
                target: "scan::pool",
                instance = instance.id,
                age = ?instance.created_at.elapsed(),
                "evicting idle browser"
            );
            close_in_background(instance);
        }
        count
    }

    /// Runs [`sweep_idle`](Self::sweep_idle) every sweep interval until
    /// cancelled.
    pub fn start_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        let period = self.inner.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = pool.sweep_idle();
                        if evicted > 0 {
                            debug!(target: "scan::pool", evicted, "idle sweep");
                        }
                    }
                }
            }
        })
    }

    /// Fails every waiter with [`ScanError::PoolClosed`] and terminates all
    /// idle instances; leased ones are terminated when their lease drops.
    pub async fn shutdown(&self) {
        let (waiters, idle) = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            (
                std::mem::take(&mut state.waiters),
                std::mem::take(&mut state.idle),
            )
        };
        let waiting = waiters.len();
        drop(waiters);

        let closing = idle.len();
        for instance in idle {
            if let Err(err) = instance.handle.close().await {
                warn!(target: "scan::pool", instance = instance.id, error = %err, "browser close failed");
            }
        }
        info!(target: "scan::pool", waiting, closed = closing, "browser pool shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            idle: state.idle.len(),
            busy: state.busy,
            launching: state.launching,
            waiting: state.waiters.iter().filter(|w| !w.is_closed()).count(),
            min_instances: self.inner.config.min_instances,
            max_instances: self.inner.config.max_instances,
            launched_total: state.launched_total,
            discarded_total: state.discarded_total,
            evicted_total: state.evicted_total,
        }
    }
}

impl PoolInner {
    /// Returns a healthy instance: straight to the oldest live waiter, else
    /// to the idle set.
    fn return_instance(self: &Arc<Self>, instance: Instance) {
        let mut leftover = None;
        {
            let mut state = self.state.lock();
            state.busy = state.busy.saturating_sub(1);
            if state.closed {
                leftover = Some(instance);
            } else {
                let mut pending = Some(instance);
                while let Some(instance) = pending.take() {
                    let Some(waiter) = state.waiters.pop_front() else {
                        pending = Some(instance);
                        break;
                    };
                    state.busy += 1;
                    let lease = BrowserLease::new(Arc::clone(self), instance);
                    if let Err(grant) = waiter.send(Grant::Instance(lease)) {
                        state.busy -= 1;
                        pending = grant.reclaim();
                    }
                }
                if let Some(mut instance) = pending {
                    instance.last_used_at = Instant::now();
                    state.idle.push_back(instance);
                }
            }
        }
        if let Some(instance) = leftover {
            close_in_background(instance);
        }
    }

    /// Drops a broken instance and hands its slot to the oldest waiter.
    fn discard_instance(self: &Arc<Self>, instance: Instance) {
        {
            let mut state = self.state.lock();
            state.busy = state.busy.saturating_sub(1);
            state.discarded_total += 1;
            self.hand_off_slot(&mut state);
        }
        debug!(target: "scan::pool", instance = instance.id, "browser discarded");
        close_in_background(instance);
    }

    fn release_launch_slot(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.launching = state.launching.saturating_sub(1);
        self.hand_off_slot(&mut state);
    }

    /// A freed slot becomes a launch grant for the next live waiter.
    fn hand_off_slot(self: &Arc<Self>, state: &mut PoolState) {
        if state.closed {
            return;
        }
        while let Some(waiter) = state.waiters.pop_front() {
            state.launching += 1;
            let reservation = LaunchReservation::new(Arc::clone(self));
            match waiter.send(Grant::Launch(reservation)) {
                Ok(()) => return,
                Err(grant) => {
                    state.launching -= 1;
                    grant.reclaim();
                }
            }
        }
    }
}

fn close_in_background(instance: Instance) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                if let Err(err) = instance.handle.close().await {
                    warn!(target: "scan::pool", instance = instance.id, error = %err, "browser close failed");
                }
            });
        }
        // Outside a runtime the handle's own drop has to do.
        Err(_) => drop(instance),
    }
}

/// A counted launch slot. Dropping it unfulfilled frees the slot.
struct LaunchReservation {
    pool: Arc<PoolInner>,
    armed: bool,
}

impl LaunchReservation {
    fn new(pool: Arc<PoolInner>) -> Self {
        Self { pool, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }

    fn fulfil(mut self, handle: Box<dyn BrowserHandle>) -> Result<BrowserLease> {
        self.armed = false;
        let pool = Arc::clone(&self.pool);
        let mut state = pool.state.lock();
        state.launching = state.launching.saturating_sub(1);
        let now = Instant::now();
        let instance = Instance {
            id: state.next_id,
            handle,
            created_at: now,
            last_used_at: now,
        };
        state.next_id += 1;
        if state.closed {
            drop(state);
            close_in_background(instance);
            return Err(ScanError::PoolClosed);
        }
        state.busy += 1;
        state.launched_total += 1;
        debug!(target: "scan::pool", instance = instance.id, live = state.live(), "browser ready");
        drop(state);
        Ok(BrowserLease::new(pool, instance))
    }
}

impl Drop for LaunchReservation {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release_launch_slot();
        }
    }
}

/// Exclusive loan of one browser instance.
///
/// Dropping the lease returns the instance to the pool; call
/// [`discard`](Self::discard) instead when the instance crashed or hung.
pub struct BrowserLease {
    pool: Arc<PoolInner>,
    instance: Option<Instance>,
    discard: bool,
}

impl fmt::Debug for BrowserLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowserLease")
            .field("instance", &self.instance.as_ref().map(|i| i.id))
            .field("discard", &self.discard)
            .finish()
    }
}

impl BrowserLease {
    fn new(pool: Arc<PoolInner>, instance: Instance) -> Self {
        Self {
            pool,
            instance: Some(instance),
            discard: false,
        }
    }

    /// Pool-local instance id.
    pub fn id(&self) -> u64 {
        self.instance.as_ref().map(|i| i.id).unwrap_or_default()
    }

    pub fn handle(&self) -> &dyn BrowserHandle {
        match &self.instance {
            Some(instance) => instance.handle.as_ref(),
            None => unreachable!("lease instance is only taken on drop"),
        }
    }

    pub fn port(&self) -> u16 {
        self.handle().port()
    }

    /// Drops the instance instead of returning it to the idle set.
    pub fn discard(mut self) {
        self.discard = true;
    }

    fn into_instance(mut self) -> Option<Instance> {
        self.instance.take()
    }
}

impl Drop for BrowserLease {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            if self.discard {
                self.pool.discard_instance(instance);
            } else {
                self.pool.return_instance(instance);
            }
        }
    }
}
