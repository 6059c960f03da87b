//! Host-side service dispatcher
//!
//! # Purpose
//! Observes submitted slots, routes each packet to the handler registered
//! for its service id and publishes the reply into the same slot.
//!
//! # Architecture
//! ```text
//!   poller thread                    worker threads
//!   ─────────────                    ──────────────
//!   sweep slots ── try_claim ──► channel ──► serve(claim)
//!        │                                    ├─ decode packet
//!        └─ idle: snooze, then park           ├─ route to handler
//!                                             └─ complete(slot)
//! ```
//! A slot is claimed by CAS before it is handed to anyone, so no slot is
//! ever dispatched twice. With `workers = 0` the poller serves inline.
//!
//! # Failure handling
//! Nothing a handler does can take the dispatcher down or leave a slot
//! stuck in `Submitted`. Every completion publishes a [`ReplyStatus`] next
//! to the reply words:
//! - handler reply: `Ok`, words passed through untouched
//! - unknown service: `UnknownService`, unknown-service sentinel
//! - `Err(ServiceError)`: `HandlerFailure`, sentinel carrying its code
//! - panic: caught, `HandlerFailure` with `ServiceError::PANICKED`
//!
//! If the worker pool goes away the poller keeps serving inline.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use crossbeam::utils::Backoff;

use crate::config::HostcallConfig;
use crate::error::{HostcallError, Result, ServiceError};
use crate::packet::{CallPacket, ReplyPacket, ReplyStatus};
use crate::service::ServiceId;
use crate::table::SlotTable;

/// A host-side service
pub trait ServiceHandler: Send + Sync {
    /// Produce the reply for one packet
    fn handle(&self, packet: &CallPacket) -> core::result::Result<ReplyPacket, ServiceError>;
}

impl<F> ServiceHandler for F
where
    F: Fn(&CallPacket) -> core::result::Result<ReplyPacket, ServiceError> + Send + Sync,
{
    fn handle(&self, packet: &CallPacket) -> core::result::Result<ReplyPacket, ServiceError> {
        self(packet)
    }
}

fn default_service(_packet: &CallPacket) -> core::result::Result<ReplyPacket, ServiceError> {
    Ok(ReplyPacket::ZERO)
}

/// Static mapping from service id to handler
///
/// Built before the dispatcher starts and immutable afterwards.
#[derive(Clone)]
pub struct ServiceRegistry {
    handlers: BTreeMap<u32, Arc<dyn ServiceHandler>>,
}

impl ServiceRegistry {
    /// Registry with the `Default` no-op service registered
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry
            .handlers
            .insert(ServiceId::Default.raw(), Arc::new(default_service));
        registry
    }

    /// Registry with no handlers at all
    pub fn empty() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    /// Register `handler` for `id`
    ///
    /// # Errors
    /// Returns `HostcallError::DuplicateService` if `id` already has one
    pub fn register<H>(&mut self, id: ServiceId, handler: H) -> Result<()>
    where
        H: ServiceHandler + 'static,
    {
        self.register_arc(id, Arc::new(handler))
    }

    /// Register a shared handler for `id`
    ///
    /// # Errors
    /// Returns `HostcallError::DuplicateService` if `id` already has one
    pub fn register_arc(&mut self, id: ServiceId, handler: Arc<dyn ServiceHandler>) -> Result<()> {
        if self.handlers.contains_key(&id.raw()) {
            return Err(HostcallError::DuplicateService { id });
        }
        self.handlers.insert(id.raw(), handler);
        log::debug!("registered handler for {}", id);
        Ok(())
    }

    /// Install `handler` for `id`, returning the one it displaced
    pub fn replace<H>(&mut self, id: ServiceId, handler: H) -> Option<Arc<dyn ServiceHandler>>
    where
        H: ServiceHandler + 'static,
    {
        let previous = self.handlers.insert(id.raw(), Arc::new(handler));
        if previous.is_some() {
            log::info!("replaced handler for {}", id);
        }
        previous
    }

    pub fn get(&self, id: ServiceId) -> Option<&Arc<dyn ServiceHandler>> {
        self.handlers.get(&id.raw())
    }

    pub fn contains(&self, id: ServiceId) -> bool {
        self.handlers.contains_key(&id.raw())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered ids in ascending order
    pub fn ids(&self) -> impl Iterator<Item = ServiceId> + '_ {
        self.handlers.keys().map(|&raw| ServiceId::from_raw(raw))
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of dispatcher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Slots completed
    pub dispatched: u64,
    /// Packets with no registered handler, or undecodable
    pub unknown: u64,
    /// Handlers that returned an error
    pub failed: u64,
    /// Handlers that panicked
    pub panicked: u64,
    /// Abandoned slots freed after completion
    pub reclaimed: u64,
}

#[derive(Default)]
struct DispatchCounters {
    dispatched: AtomicU64,
    unknown: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    reclaimed: AtomicU64,
}

impl DispatchCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
struct Claim {
    index: usize,
    generation: u64,
}

struct Inner {
    table: Arc<SlotTable>,
    registry: ServiceRegistry,
    counters: DispatchCounters,
}

impl Inner {
    fn sweep(&self, mut on_claim: impl FnMut(Claim) -> bool) -> usize {
        let mut claimed = 0;
        for (index, slot) in self.table.slots().iter().enumerate() {
            if let Some(generation) = slot.try_claim() {
                claimed += 1;
                if !on_claim(Claim { index, generation }) {
                    break;
                }
            }
        }
        claimed
    }

    fn route(&self, packet: &CallPacket) -> (ReplyPacket, ReplyStatus) {
        let service = packet.service_id();
        let Some(handler) = self.registry.get(service) else {
            log::warn!("no handler for {}", service);
            DispatchCounters::bump(&self.counters.unknown);
            return (ReplyPacket::UNKNOWN_SERVICE, ReplyStatus::UnknownService);
        };

        match catch_unwind(AssertUnwindSafe(|| handler.handle(packet))) {
            Ok(Ok(reply)) => (reply, ReplyStatus::Ok),
            Ok(Err(err)) => {
                log::warn!("{} failed: {}", service, err);
                DispatchCounters::bump(&self.counters.failed);
                (ReplyPacket::handler_failure(err.code), ReplyStatus::HandlerFailure)
            }
            Err(_) => {
                log::error!("{} handler panicked", service);
                DispatchCounters::bump(&self.counters.panicked);
                (
                    ReplyPacket::handler_failure(ServiceError::PANICKED.code),
                    ReplyStatus::HandlerFailure,
                )
            }
        }
    }

    fn serve(&self, claim: Claim) {
        let slot = &self.table.slots()[claim.index];
        let (reply, status) = match CallPacket::decode(&slot.read_packet()) {
            Ok(packet) => {
                log::debug!("slot {}: {}", claim.index, packet.service_id());
                self.route(&packet)
            }
            Err(err) => {
                log::warn!("slot {}: {}", claim.index, err);
                DispatchCounters::bump(&self.counters.unknown);
                (ReplyPacket::UNKNOWN_SERVICE, ReplyStatus::UnknownService)
            }
        };

        if slot.complete(claim.generation, reply, status) {
            log::debug!("slot {} was abandoned, freed", claim.index);
            DispatchCounters::bump(&self.counters.reclaimed);
        }
        DispatchCounters::bump(&self.counters.dispatched);
    }
}

/// Serves calls published into a slot table
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(table: Arc<SlotTable>, registry: ServiceRegistry) -> Self {
        Self {
            inner: Arc::new(Inner {
                table,
                registry,
                counters: DispatchCounters::default(),
            }),
        }
    }

    pub fn table(&self) -> &Arc<SlotTable> {
        &self.inner.table
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    /// One sweep over the table, serving every claimable slot inline.
    ///
    /// Returns the number of slots completed.
    pub fn poll_once(&self) -> usize {
        let inner = &self.inner;
        inner.sweep(|claim| {
            inner.serve(claim);
            true
        })
    }

    pub fn stats(&self) -> DispatcherStats {
        let counters = &self.inner.counters;
        DispatcherStats {
            dispatched: counters.dispatched.load(Ordering::Relaxed),
            unknown: counters.unknown.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            panicked: counters.panicked.load(Ordering::Relaxed),
            reclaimed: counters.reclaimed.load(Ordering::Relaxed),
        }
    }

    /// Start the poller and worker threads
    ///
    /// # Errors
    /// Returns `HostcallError::Spawn` if a thread could not be started. Any
    /// thread already running is stopped and joined first.
    pub fn spawn(&self, config: &HostcallConfig) -> Result<DispatcherHandle> {
        self.spawn_with(config, |name| thread::Builder::new().name(name))
    }

    fn spawn_with(
        &self,
        config: &HostcallConfig,
        builder: impl Fn(String) -> thread::Builder,
    ) -> Result<DispatcherHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));

        let (sender, workers) = if config.workers == 0 {
            (None, Vec::new())
        } else {
            let (tx, workers) = self.start_workers(config.workers, &builder)?;
            (Some(tx), workers)
        };

        let poller = {
            let inner = Arc::clone(&self.inner);
            let shutdown = Arc::clone(&shutdown);
            let idle = Duration::from_micros(config.idle_sleep_us);
            builder("hostcall-poller".into()).spawn(move || poll_loop(&inner, sender, &shutdown, idle))
        };
        // A failed spawn drops the closure and with it the sender, so the
        // workers drain and exit
        let poller = match poller {
            Ok(poller) => poller,
            Err(e) => {
                join_all(workers);
                return Err(HostcallError::Spawn(e.to_string()));
            }
        };

        log::info!(
            "dispatcher started: {} slots, {} workers, {} services",
            self.inner.table.capacity(),
            config.workers,
            self.inner.registry.len()
        );

        Ok(DispatcherHandle {
            dispatcher: self.clone(),
            shutdown,
            poller: Some(poller),
            workers,
        })
    }

    fn start_workers(
        &self,
        count: usize,
        builder: &impl Fn(String) -> thread::Builder,
    ) -> Result<(Sender<Claim>, Vec<JoinHandle<()>>)> {
        let (tx, rx) = channel::bounded::<Claim>(self.inner.table.capacity());
        let mut workers = Vec::with_capacity(count);
        for id in 0..count {
            let inner = Arc::clone(&self.inner);
            let rx = rx.clone();
            let spawned = builder(format!("hostcall-worker-{}", id)).spawn(move || {
                for claim in rx.iter() {
                    inner.serve(claim);
                }
            });
            match spawned {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    // Workers leave their receive loop once the only sender is gone
                    drop(tx);
                    join_all(workers);
                    return Err(HostcallError::Spawn(e.to_string()));
                }
            }
        }
        Ok((tx, workers))
    }
}

fn join_all(workers: Vec<JoinHandle<()>>) {
    for worker in workers {
        if worker.join().is_err() {
            log::error!("hostcall worker panicked");
        }
    }
}

fn poll_loop(inner: &Inner, sender: Option<Sender<Claim>>, shutdown: &AtomicBool, idle: Duration) {
    let mut sender = sender;
    let backoff = Backoff::new();
    while !shutdown.load(Ordering::Acquire) {
        let mut connected = sender.is_some();
        let claimed = match &sender {
            Some(tx) => inner.sweep(|claim| {
                if connected && tx.send(claim).is_ok() {
                    return true;
                }
                if connected {
                    log::error!("worker pool gone, serving inline from now on");
                    connected = false;
                }
                inner.serve(claim);
                true
            }),
            None => inner.sweep(|claim| {
                inner.serve(claim);
                true
            }),
        };
        if sender.is_some() && !connected {
            sender = None;
        }

        if claimed > 0 {
            backoff.reset();
        } else if backoff.is_completed() {
            thread::park_timeout(idle);
        } else {
            backoff.snooze();
        }
    }
    log::debug!("poller stopping");
}

/// Running dispatcher threads. Stops and joins them when dropped.
pub struct DispatcherHandle {
    dispatcher: Dispatcher,
    shutdown: Arc<AtomicBool>,
    poller: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    /// Stop polling, let workers drain claimed slots and join every thread.
    ///
    /// Slots submitted but not yet claimed stay `Submitted`.
    pub fn shutdown(mut self) -> DispatcherStats {
        self.stop();
        self.dispatcher.stats()
    }

    fn stop(&mut self) {
        let Some(poller) = self.poller.take() else {
            return;
        };
        self.shutdown.store(true, Ordering::Release);
        poller.thread().unpark();
        if poller.join().is_err() {
            log::error!("hostcall poller panicked");
        }
        // The poller owned the sender; workers exit once the channel drains
        join_all(core::mem::take(&mut self.workers));
        log::info!("dispatcher stopped: {:?}", self.dispatcher.stats());
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
