//! Concurrent hop prober.
//!
//! One task per hop keeps re-probing its hop limit. Tasks never touch shared state
//! themselves: every result goes through [`HopProbeEngine::apply_result`], which runs
//! under a single lock (optionally on a designated delivery thread), updates the
//! ordered hop collection, and collapses the path once the target answers.

use std::{
    any::Any,
    collections::{BTreeMap, HashMap, HashSet},
    net::IpAddr,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures::{future::join_all, FutureExt};
use parking_lot::Mutex;
use tokio::{
    runtime::Handle,
    sync::{broadcast, Notify},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{EngineConfig, MAX_HOPS};
use crate::error::EngineError;
use crate::estimate::{estimate_hops, Estimate};
use crate::events::{self, DeliveryContext, Dispatcher, SessionEvent};
use crate::hop_stats::HopRecord;
use crate::probe::{ProbeReply, ProbeTransport};
use crate::resolver::NameResolver;
use crate::utils;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Estimating,
    Active,
    Stopping,
    Stopped,
}

impl SessionState {
    pub fn is_running(self) -> bool {
        matches!(self, SessionState::Estimating | SessionState::Active)
    }
}

/// One probe outcome for one hop, as handed to the apply step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopResult {
    pub hop: u8,
    pub address: Option<IpAddr>,
    pub latency: Duration,
    pub is_loss: bool,
}

impl HopResult {
    pub fn reply(hop: u8, address: IpAddr, latency: Duration) -> Self {
        Self {
            hop,
            address: Some(address),
            latency,
            is_loss: false,
        }
    }

    pub fn loss(hop: u8) -> Self {
        Self {
            hop,
            address: None,
            latency: Duration::ZERO,
            is_loss: true,
        }
    }

    /// Echo and TTL-exceeded replies are data; everything else is a loss.
    pub fn from_reply(hop: u8, reply: ProbeReply) -> Self {
        match reply.address {
            Some(address) if reply.status.is_reply() => Self::reply(hop, address, reply.latency),
            _ => Self::loss(hop),
        }
    }
}

/// State only ever touched under the apply lock.
struct SharedState {
    target: IpAddr,
    hops: Vec<HopRecord>,
    converged: Option<u8>,
    resolving: HashSet<IpAddr>,
    names: HashMap<IpAddr, Option<String>>,
    epoch: u64,
    runtime: Option<Handle>,
}

impl SharedState {
    fn new(target: IpAddr) -> Self {
        Self {
            target,
            hops: Vec::new(),
            converged: None,
            resolving: HashSet::new(),
            names: HashMap::new(),
            epoch: 0,
            runtime: None,
        }
    }

    fn is_beyond_target(&self, hop: u8) -> bool {
        self.converged.is_some_and(|target_hop| hop > target_hop)
    }

    fn runtime(&self) -> Option<Handle> {
        self.runtime.clone().or_else(|| Handle::try_current().ok())
    }

    fn clear(&mut self, events: &broadcast::Sender<SessionEvent>) {
        if !self.hops.is_empty() {
            self.hops.clear();
            let _ = events.send(SessionEvent::HopsCleared);
        }
    }

    /// Index of the record for `hop`, inserting a fresh one in hop order if needed.
    fn find_or_insert(&mut self, hop: u8, events: &broadcast::Sender<SessionEvent>) -> usize {
        match self.hops.binary_search_by_key(&hop, |record| record.hop) {
            Ok(index) => index,
            Err(index) => {
                self.insert_at(index, HopRecord::new(hop), events);
                index
            }
        }
    }

    fn insert_at(&mut self, index: usize, record: HopRecord, events: &broadcast::Sender<SessionEvent>) {
        self.hops.insert(index, record.clone());
        let _ = events.send(SessionEvent::HopInserted { index, record });
    }

    fn prune_beyond(&mut self, target_hop: u8, events: &broadcast::Sender<SessionEvent>) {
        let mut removed = Vec::new();
        self.hops.retain(|record| {
            let keep = record.hop <= target_hop;
            if !keep {
                removed.push(record.hop);
            }
            keep
        });
        for hop in removed {
            debug!("Pruned hop {} beyond target hop {}", hop, target_hop);
            let _ = events.send(SessionEvent::HopRemoved { hop });
        }
    }

    /// Give `name` to every record answering from `addr` that has no name yet.
    fn apply_hostname(&mut self, addr: IpAddr, name: &str, events: &broadcast::Sender<SessionEvent>) {
        for record in self.hops.iter_mut().filter(|record| record.addr == Some(addr)) {
            if record.set_hostname(name.to_string()) {
                let _ = events.send(SessionEvent::HopChanged(record.clone()));
            }
        }
    }
}

struct HopLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Running per-hop tasks keyed by hop number, plus background joins of pruned ones.
#[derive(Default)]
struct TaskArena {
    loops: BTreeMap<u8, HopLoop>,
    reapers: Vec<JoinHandle<()>>,
}

struct Lifecycle {
    state: SessionState,
    cancel: CancellationToken,
    session: Option<JoinHandle<()>>,
}

struct Inner {
    transport: Arc<dyn ProbeTransport>,
    resolver: Option<Arc<dyn NameResolver>>,
    interval: Duration,
    timeout: Duration,
    shared: Mutex<SharedState>,
    tasks: Mutex<TaskArena>,
    lifecycle: Mutex<Lifecycle>,
    stopped: Notify,
    epoch: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
    dispatcher: Dispatcher,
}

/// Builder for [`HopProbeEngine`].
pub struct EngineBuilder {
    config: EngineConfig,
    transport: Arc<dyn ProbeTransport>,
    resolver: Option<Arc<dyn NameResolver>>,
    delivery: Option<DeliveryContext>,
}

impl EngineBuilder {
    /// Reverse-resolve hop addresses with `resolver`. Without one, hops show addresses only.
    pub fn resolver(mut self, resolver: Arc<dyn NameResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Run every hop update on the thread owning `context`.
    pub fn delivery_context(mut self, context: DeliveryContext) -> Self {
        self.delivery = Some(context);
        self
    }

    pub fn build(self) -> HopProbeEngine {
        let inner = Inner {
            transport: self.transport,
            resolver: self.resolver,
            interval: self.config.interval,
            timeout: self.config.timeout,
            shared: Mutex::new(SharedState::new(self.config.target)),
            tasks: Mutex::new(TaskArena::default()),
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::NotStarted,
                cancel: CancellationToken::new(),
                session: None,
            }),
            stopped: Notify::new(),
            epoch: AtomicU64::new(0),
            events: events::channel(),
            dispatcher: Dispatcher::new(self.delivery),
        };
        HopProbeEngine {
            inner: Arc::new(inner),
        }
    }
}

/// Discovers and continuously re-measures every hop to a target.
pub struct HopProbeEngine {
    inner: Arc<Inner>,
}

impl HopProbeEngine {
    pub fn builder(config: EngineConfig, transport: Arc<dyn ProbeTransport>) -> EngineBuilder {
        EngineBuilder {
            config,
            transport,
            resolver: None,
            delivery: None,
        }
    }

    pub fn new(config: EngineConfig, transport: Arc<dyn ProbeTransport>) -> Self {
        Self::builder(config, transport).build()
    }

    /// Subscribe to hop and status changes.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lifecycle.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn target(&self) -> IpAddr {
        self.inner.shared.lock().target
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Snapshot of the hop collection, ordered by hop number.
    pub fn hops(&self) -> Vec<HopRecord> {
        self.inner.shared.lock().hops.clone()
    }

    /// Hop number at which the target was seen answering, if it has been.
    pub fn converged_hop(&self) -> Option<u8> {
        self.inner.shared.lock().converged
    }

    /// Hop numbers that currently own a probing task.
    pub fn active_loops(&self) -> Vec<u8> {
        self.inner.tasks.lock().loops.keys().copied().collect()
    }

    /// Start probing. Does nothing if a session is already running.
    pub fn start(&self) -> Result<(), EngineError> {
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;

        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.state.is_running() || lifecycle.state == SessionState::Stopping {
            debug!("start() ignored, session is {:?}", lifecycle.state);
            return Ok(());
        }

        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        lifecycle.cancel = cancel.clone();
        lifecycle.state = SessionState::Estimating;
        let _ = self
            .inner
            .events
            .send(SessionEvent::StateChanged(SessionState::Estimating));
        info!("Starting session to {} (epoch {})", self.target(), epoch);

        // Reset inline: hop tasks read these before any queued job runs.
        {
            let mut shared = self.inner.shared.lock();
            shared.converged = None;
            shared.resolving.clear();
            shared.names.clear();
            shared.epoch = epoch;
            shared.runtime = Some(runtime.clone());
        }

        self.inner.notify_status("Starting traceroute...".to_string());
        self.inner.dispatch(move |inner| {
            let mut shared = inner.shared.lock();
            if shared.epoch != epoch {
                return;
            }
            shared.clear(&inner.events);
            shared.insert_at(0, HopRecord::placeholder(), &inner.events);
        });

        let inner = self.inner.clone();
        lifecycle.session = Some(runtime.spawn(run_session(inner, epoch, cancel)));
        Ok(())
    }

    /// Cancel every hop task and wait until all of them have exited.
    /// A second call while stopping or stopped returns immediately.
    pub async fn stop(&self) {
        let session = {
            let mut lifecycle = self.inner.lifecycle.lock();
            if !lifecycle.state.is_running() {
                return;
            }
            lifecycle.state = SessionState::Stopping;
            lifecycle.cancel.cancel();
            let _ = self
                .inner
                .events
                .send(SessionEvent::StateChanged(SessionState::Stopping));
            lifecycle.session.take()
        };
        info!("Stopping session");

        // The session task is the only one spawning hop loops, so wait for it first.
        if let Some(session) = session {
            if let Err(e) = session.await {
                warn!("Session task ended abnormally: {}", e);
            }
        }

        let (loops, reapers) = {
            let mut tasks = self.inner.tasks.lock();
            (
                std::mem::take(&mut tasks.loops),
                std::mem::take(&mut tasks.reapers),
            )
        };
        for hop_loop in loops.values() {
            hop_loop.cancel.cancel();
        }
        let loop_count = loops.len();
        let handles = loops.into_values().map(|hop_loop| hop_loop.handle);
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!("Hop task ended abnormally: {}", e);
            }
        }
        join_all(reapers).await;

        self.inner.lifecycle.lock().state = SessionState::Stopped;
        self.inner.stopped.notify_waiters();
        let _ = self
            .inner
            .events
            .send(SessionEvent::StateChanged(SessionState::Stopped));
        info!("Session stopped, {} hop tasks released", loop_count);
        self.inner.notify_status("Stopped".to_string());
    }

    /// Resolves once no `stop` is in progress.
    async fn wait_until_stopped(&self) {
        loop {
            let notified = self.inner.stopped.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state() != SessionState::Stopping {
                return;
            }
            notified.await;
        }
    }

    /// Tear the session down and start again against a new target. A session that
    /// another caller is already stopping counts as running and is restarted.
    pub async fn change_target(&self, target: IpAddr) -> Result<(), EngineError> {
        let state = self.state();
        let was_running = state.is_running() || state == SessionState::Stopping;
        self.stop().await;
        self.wait_until_stopped().await;
        self.inner.shared.lock().target = target;
        info!("Target changed to {}", target);
        if was_running {
            self.start()?;
        }
        Ok(())
    }

    /// Probe one hop right now, outside its regular schedule.
    pub async fn refresh_hop(&self, hop: u8) {
        if !self.is_running() {
            return;
        }
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let target = self.target();
        self.inner.refresh(hop, target, epoch).await;
    }

    /// Apply one result to the hop collection: the single mutation entry point.
    pub fn apply_result(&self, result: HopResult) {
        self.inner.dispatch(move |inner| inner.apply(result, None, true));
    }
}

impl Drop for HopProbeEngine {
    fn drop(&mut self) {
        self.inner.lifecycle.lock().cancel.cancel();
    }
}

impl Inner {
    fn dispatch(self: &Arc<Self>, job: impl FnOnce(&Arc<Inner>) + Send + 'static) {
        let inner = self.clone();
        self.dispatcher.execute(move || job(&inner));
    }

    fn notify_status(self: &Arc<Self>, status: String) {
        debug!("Status: {}", status);
        self.dispatch(move |inner| {
            let _ = inner.events.send(SessionEvent::Status(status));
        });
    }

    fn is_beyond_target(&self, hop: u8) -> bool {
        self.shared.lock().is_beyond_target(hop)
    }

    /// Record `result`. Results from a previous session (`epoch` mismatch) or for hops
    /// beyond the target are dropped.
    fn apply(self: &Arc<Self>, result: HopResult, epoch: Option<u64>, check_target: bool) {
        let mut shared = self.shared.lock();
        if epoch.is_some_and(|epoch| epoch != shared.epoch) {
            trace!("Dropping stale result for hop {}", result.hop);
            return;
        }
        if shared.is_beyond_target(result.hop) {
            trace!("Dropping result for hop {} beyond target", result.hop);
            return;
        }

        let index = shared.find_or_insert(result.hop, &self.events);
        let record = &mut shared.hops[index];
        let first_addr = match result.address {
            Some(addr) if !result.is_loss && record.claim_addr(addr) => Some(addr),
            _ => None,
        };
        if result.is_loss {
            record.record_loss();
        } else {
            record.record_reply(result.latency);
        }

        if let Some(addr) = first_addr {
            self.request_hostname(&mut shared, addr);
        }
        let _ = self
            .events
            .send(SessionEvent::HopChanged(shared.hops[index].clone()));

        if check_target && !result.is_loss {
            self.check_target_reached(&mut shared, &result);
        }
    }

    fn check_target_reached(self: &Arc<Self>, shared: &mut SharedState, result: &HopResult) {
        if result.address != Some(shared.target) {
            return;
        }
        let improves = shared
            .converged
            .map_or(true, |target_hop| result.hop < target_hop);
        if !improves {
            return;
        }

        let target_hop = result.hop;
        shared.converged = Some(target_hop);
        info!("Target {} reached at hop {}", shared.target, target_hop);

        self.cancel_loops_beyond(target_hop, shared.runtime());
        shared.prune_beyond(target_hop, &self.events);
        self.notify_status(format!("Target reached at hop {}", target_hop));
    }

    /// Signal every hop task past `target_hop` and release it once it has exited.
    fn cancel_loops_beyond(&self, target_hop: u8, runtime: Option<Handle>) {
        let Some(first_beyond) = target_hop.checked_add(1) else {
            return;
        };
        let mut tasks = self.tasks.lock();
        let cancelled = tasks.loops.split_off(&first_beyond);
        if cancelled.is_empty() {
            return;
        }
        for hop_loop in cancelled.values() {
            hop_loop.cancel.cancel();
        }
        debug!(
            "Cancelled hop tasks {:?} beyond target hop {}",
            cancelled.keys().collect::<Vec<_>>(),
            target_hop
        );

        let Some(runtime) = runtime else {
            return;
        };
        let reaper = runtime.spawn(async move {
            let hops: Vec<u8> = cancelled.keys().copied().collect();
            let handles = cancelled.into_values().map(|hop_loop| hop_loop.handle);
            join_all(handles).await;
            debug!("Released hop tasks {:?}", hops);
        });
        tasks.reapers.retain(|reaper| !reaper.is_finished());
        tasks.reapers.push(reaper);
    }

    /// Look `addr` up at most once per session; reuse the answer for later hops.
    fn request_hostname(self: &Arc<Self>, shared: &mut SharedState, addr: IpAddr) {
        if let Some(cached) = shared.names.get(&addr).cloned() {
            if let Some(name) = cached {
                shared.apply_hostname(addr, &name, &self.events);
            }
            return;
        }
        let Some(resolver) = self.resolver.clone() else {
            return;
        };
        if shared.resolving.contains(&addr) {
            return;
        }
        let Some(runtime) = shared.runtime() else {
            return;
        };

        shared.resolving.insert(addr);
        let epoch = shared.epoch;
        let inner = self.clone();
        runtime.spawn(async move {
            let lookup = resolver.reverse(addr);
            let name = match AssertUnwindSafe(lookup).catch_unwind().await {
                Ok(name) => name,
                Err(panic) => {
                    warn!("Reverse lookup for {} panicked: {}", addr, panic_message(&*panic));
                    None
                }
            };
            debug!("Resolved {} -> {:?}", addr, name);
            inner.dispatch(move |inner| {
                let mut shared = inner.shared.lock();
                if shared.epoch != epoch {
                    return;
                }
                shared.resolving.remove(&addr);
                shared.names.insert(addr, name.clone());
                if let Some(name) = name {
                    shared.apply_hostname(addr, &name, &inner.events);
                }
            });
        });
    }

    /// Replace the placeholder with hops `1..=estimate.hops` and record the estimation
    /// probe as data for the last one.
    fn promote_initial(self: &Arc<Self>, estimate: Estimate, epoch: u64) {
        {
            let mut shared = self.shared.lock();
            if shared.epoch != epoch {
                return;
            }
            shared.clear(&self.events);
            for hop in 1..=estimate.hops {
                let index = shared.hops.len();
                shared.insert_at(index, HopRecord::new(hop), &self.events);
            }
        }
        let result = HopResult::from_reply(estimate.hops, estimate.reply);
        self.apply(result, Some(epoch), false);
    }

    async fn probe_hop(&self, hop: u8, target: IpAddr) -> HopResult {
        let probe = self.transport.probe(target, hop, self.timeout);
        match AssertUnwindSafe(probe).catch_unwind().await {
            Ok(Ok(reply)) => HopResult::from_reply(hop, reply),
            Ok(Err(e)) => {
                debug!("Hop {} probe failed: {}", hop, e);
                HopResult::loss(hop)
            }
            Err(panic) => {
                warn!("Hop {} probe panicked: {}", hop, panic_message(&*panic));
                HopResult::loss(hop)
            }
        }
    }

    /// Probe `hop` once and hand the result to the apply step.
    async fn refresh(self: &Arc<Self>, hop: u8, target: IpAddr, epoch: u64) {
        if self.is_beyond_target(hop) {
            return;
        }
        let result = self.probe_hop(hop, target).await;
        if self.is_beyond_target(hop) {
            return;
        }
        self.dispatch(move |inner| inner.apply(result, Some(epoch), true));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Estimate the hop count, seed the collection, then launch one task per hop.
async fn run_session(inner: Arc<Inner>, epoch: u64, cancel: CancellationToken) {
    inner.notify_status("Sending initial ping to estimate hop count...".to_string());
    let target = inner.shared.lock().target;

    let estimation = AssertUnwindSafe(estimate_hops(&*inner.transport, target, inner.timeout));
    let estimate = tokio::select! {
        _ = cancel.cancelled() => return,
        outcome = estimation.catch_unwind() => match outcome {
            Ok(estimate) => estimate,
            Err(panic) => {
                inner.notify_status(format!("Error during startup: {}", panic_message(&*panic)));
                Estimate {
                    hops: MAX_HOPS,
                    reply: ProbeReply::timeout(Duration::ZERO),
                }
            }
        },
    };
    if cancel.is_cancelled() {
        return;
    }

    let hop_count = estimate.hops;
    inner.notify_status(format!("Estimated {} hops, starting traceroute...", hop_count));
    inner.dispatch(move |inner| inner.promote_initial(estimate, epoch));

    {
        let mut lifecycle = inner.lifecycle.lock();
        if lifecycle.state == SessionState::Estimating {
            lifecycle.state = SessionState::Active;
            let _ = inner
                .events
                .send(SessionEvent::StateChanged(SessionState::Active));
        }
    }

    for hop in 1..=hop_count {
        if cancel.is_cancelled() {
            return;
        }
        if inner.is_beyond_target(hop) {
            break;
        }
        let hop_cancel = cancel.child_token();
        let handle = tokio::spawn(run_hop_loop(inner.clone(), hop, target, epoch, hop_cancel.clone()));
        inner.tasks.lock().loops.insert(
            hop,
            HopLoop {
                cancel: hop_cancel,
                handle,
            },
        );
    }
    info!("Launched {} hop tasks", hop_count);
}

/// Probe `hop` every interval until cancelled or superseded by a closer target hop.
async fn run_hop_loop(
    inner: Arc<Inner>,
    hop: u8,
    target: IpAddr,
    epoch: u64,
    cancel: CancellationToken,
) {
    trace!("Hop {} task started", hop);
    while !cancel.is_cancelled() {
        if inner.is_beyond_target(hop) {
            // Nobody else will join this task; drop our own arena entry.
            inner.tasks.lock().loops.remove(&hop);
            break;
        }

        let started = Instant::now();
        inner.refresh(hop, target, epoch).await;
        let pause = utils::time::remaining(inner.interval, started.elapsed());

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(pause) => {}
        }
    }
    trace!("Hop {} task exited", hop);
}
