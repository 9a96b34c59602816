use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use glam::Vec3;
use voxelcore_common::{BlockKey, Voxel};
use voxelcore_kernel::{World, WorldError};
use voxelcore_mesh::{Mesh, MeshSink};

use crate::budget::{FrameTimer, StreamConfig, StreamStats, TickReport};
use crate::lod::{desired_leaves, viewer_distance};
use crate::workers::{TaskError, TaskHandle, WorkerPool};

/// Lifecycle of one block as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Unloaded,
    Generating,
    Generated,
    Meshed,
    /// Content changed after the last mesh; a rebuild is queued.
    Dirty,
    /// Its root is queued for eviction.
    Evicting,
    Failed { attempts: u32, retry_at: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    Generate,
    Mesh,
    Evict,
}

impl Action {
    /// Priority class; lower runs first.
    fn class(self) -> u8 {
        match self {
            Action::Generate | Action::Mesh => 0,
            Action::Evict => 1,
        }
    }
}

/// A queued unit of streaming work.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingRequest {
    pub key: BlockKey,
    pub action: Action,
    /// Distance to the nearest viewer at the last re-prioritisation.
    pub distance: f32,
    /// Insertion order; breaks distance ties.
    pub seq: u64,
}

/// Change to hand to the rendering boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    Updated(Mesh),
    Removed(BlockKey),
}

enum Job {
    Generate(TaskHandle<Vec<Voxel>>),
    Mesh(TaskHandle<Mesh>),
}

enum Output {
    Samples(Vec<Voxel>),
    Mesh(Mesh),
}

impl Job {
    fn try_take(&self) -> Option<Result<Output, TaskError>> {
        match self {
            Job::Generate(h) => h.try_take().map(|r| r.map(Output::Samples)),
            Job::Mesh(h) => h.try_take().map(|r| r.map(Output::Mesh)),
        }
    }

    fn cancel(&self) {
        match self {
            Job::Generate(h) => h.cancel(),
            Job::Mesh(h) => h.cancel(),
        }
    }
}

/// Viewer-driven streaming over one [`World`].
///
/// Each [`tick`](StreamingScheduler::tick) collects finished worker jobs,
/// picks the leaves the viewers want, reconciles them with the octree and
/// dispatches a bounded amount of generate, mesh and evict work, nearest
/// first. The scheduler is the single writer of the world; workers only see
/// owned copies of blocks and borders.
pub struct StreamingScheduler {
    config: StreamConfig,
    pool: WorkerPool,
    tick: u64,
    next_seq: u64,
    queue: Vec<StreamingRequest>,
    queued: BTreeSet<(BlockKey, Action)>,
    states: BTreeMap<BlockKey, BlockState>,
    in_flight: BTreeMap<BlockKey, Job>,
    failures: BTreeMap<BlockKey, u32>,
    deferred: BTreeSet<BlockKey>,
    uploaded: BTreeSet<BlockKey>,
    events: Vec<MeshEvent>,
    stats: StreamStats,
    timer: FrameTimer,
}

impl std::fmt::Debug for StreamingScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingScheduler")
            .field("tick", &self.tick)
            .field("pool", &self.pool)
            .field("queued", &self.queue.len())
            .field("in_flight", &self.in_flight.len())
            .field("tracked", &self.states.len())
            .finish()
    }
}

impl StreamingScheduler {
    /// Scheduler backed by a thread pool sized from `config.worker_threads`.
    pub fn new(config: StreamConfig) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = WorkerPool::new(config.worker_threads)?;
        Ok(Self::with_pool(config, pool))
    }

    /// Scheduler that runs every job on the calling thread.
    pub fn inline(config: StreamConfig) -> Self {
        Self::with_pool(config, WorkerPool::inline())
    }

    pub fn with_pool(config: StreamConfig, pool: WorkerPool) -> Self {
        let timer = FrameTimer::new(config.frame_history);
        Self {
            config,
            pool,
            tick: 0,
            next_seq: 0,
            queue: Vec::new(),
            queued: BTreeSet::new(),
            states: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            failures: BTreeMap::new(),
            deferred: BTreeSet::new(),
            uploaded: BTreeSet::new(),
            events: Vec::new(),
            stats: StreamStats::default(),
            timer,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    pub fn state(&self, key: BlockKey) -> Option<BlockState> {
        self.states.get(&key).copied()
    }

    pub fn states(&self) -> &BTreeMap<BlockKey, BlockState> {
        &self.states
    }

    /// Pending requests in dispatch order as of the last tick.
    pub fn queue(&self) -> &[StreamingRequest] {
        &self.queue
    }

    pub fn is_queued(&self, key: BlockKey, action: Action) -> bool {
        self.queued.contains(&(key, action))
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    pub fn timer(&self) -> &FrameTimer {
        &self.timer
    }

    /// Mesh changes produced since the last call.
    pub fn drain_events(&mut self) -> Vec<MeshEvent> {
        std::mem::take(&mut self.events)
    }

    /// Forward pending mesh changes to `sink`. Returns how many were sent.
    pub fn flush_to(&mut self, sink: &mut dyn MeshSink) -> usize {
        let events = self.drain_events();
        let count = events.len();
        for event in events {
            match event {
                MeshEvent::Updated(mesh) => sink.upload(mesh.key, &mesh.view()),
                MeshEvent::Removed(key) => sink.remove(key),
            }
        }
        count
    }

    /// Run one scheduling pass.
    pub fn tick(&mut self, world: &mut World, viewers: &[Vec3]) -> TickReport {
        let started = Instant::now();
        self.tick += 1;
        let span = tracing::info_span!("stream_tick", tick = self.tick);
        let _enter = span.enter();

        let mut report = TickReport {
            tick: self.tick,
            ..TickReport::default()
        };
        self.collect(world, &mut report);
        self.absorb_dirty(world);

        let edge = world.edge();
        let desired = desired_leaves(viewers, &self.config, world.config());
        self.cancel_evictions(world, &desired, &mut report);
        self.reconcile(world, &desired, &mut report);
        self.sweep(world);
        self.schedule_evictions(world, viewers);
        self.reprioritize(edge, viewers);
        self.dispatch(world, &mut report);

        report.needed = desired.len();
        report.ready = desired
            .keys()
            .filter(|key| self.is_ready(world, **key))
            .count();
        report.queued = self.queue.len();
        report.in_flight = self.in_flight.len();
        report.frame_time = started.elapsed();
        self.timer.record(report.frame_time);
        self.stats.absorb(&report);
        tracing::debug!(
            dispatched = report.dispatched.len(),
            queued = report.queued,
            in_flight = report.in_flight,
            ready = report.ready,
            needed = report.needed,
            "tick complete"
        );
        report
    }

    /// Tick until nothing is queued or in flight, or `max_ticks` passes.
    /// Returns the last report.
    pub fn run_until_idle(
        &mut self,
        world: &mut World,
        viewers: &[Vec3],
        max_ticks: u64,
    ) -> TickReport {
        let mut report = TickReport::default();
        for _ in 0..max_ticks {
            report = self.tick(world, viewers);
            if report.is_idle() {
                break;
            }
            if !self.pool.is_inline() && report.dispatched.is_empty() && report.in_flight > 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        report
    }

    fn collect(&mut self, world: &mut World, report: &mut TickReport) {
        let finished: Vec<(BlockKey, Result<Output, TaskError>)> = self
            .in_flight
            .iter()
            .filter_map(|(key, job)| job.try_take().map(|out| (*key, out)))
            .collect();
        for (key, outcome) in finished {
            self.in_flight.remove(&key);
            let evicting = self.states.get(&key) == Some(&BlockState::Evicting);
            match outcome {
                Ok(Output::Samples(samples)) => match world.install_generated(key, samples) {
                    Ok(true) => {
                        report.generated += 1;
                        self.failures.remove(&key);
                        tracing::trace!(%key, "block generated");
                        if !evicting {
                            self.states.insert(key, BlockState::Generated);
                            self.enqueue(key, Action::Mesh);
                        }
                    }
                    Ok(false) => {
                        report.discarded += 1;
                        tracing::trace!(%key, "stale generation discarded");
                        if !evicting {
                            self.settle(world, key);
                        }
                    }
                    Err(err) => self.fail(key, &err.to_string(), report),
                },
                Ok(Output::Mesh(mesh)) => self.finish_mesh(world, mesh, evicting, report),
                Err(TaskError::Cancelled) => {
                    tracing::trace!(%key, "job cancelled before start");
                    if !evicting {
                        self.settle(world, key);
                    }
                }
                Err(err) => self.fail(key, &err.to_string(), report),
            }
        }
    }

    fn finish_mesh(&mut self, world: &mut World, mesh: Mesh, evicting: bool, report: &mut TickReport) {
        let key = mesh.key;
        let current = world
            .block(key)
            .filter(|b| b.is_generated())
            .map(|b| (b.revision(), mesh.is_stale(b)));
        match current {
            None => {
                report.discarded += 1;
            }
            Some(_) if evicting => {
                report.discarded += 1;
            }
            Some((revision, true)) => {
                report.discarded += 1;
                tracing::trace!(%key, built = mesh.revision, current = revision, "stale mesh requeued");
                self.states.insert(key, BlockState::Dirty);
                self.enqueue(key, Action::Mesh);
            }
            Some(_) => {
                world.mark_meshed(key, mesh.revision);
                report.meshed += 1;
                self.failures.remove(&key);
                self.states.insert(key, BlockState::Meshed);
                self.uploaded.insert(key);
                self.events.push(MeshEvent::Updated(mesh));
            }
        }
    }

    fn fail(&mut self, key: BlockKey, reason: &str, report: &mut TickReport) {
        report.failed += 1;
        let attempts = self.failures.entry(key).or_insert(0);
        *attempts += 1;
        let attempts = *attempts;
        let retry_at = self.tick + self.config.backoff(attempts);
        tracing::warn!(%key, attempts, retry_at, reason, "block job failed");
        if self.states.get(&key) != Some(&BlockState::Evicting) {
            self.states.insert(key, BlockState::Failed { attempts, retry_at });
        }
    }

    /// Re-derive a block's state from the world after an aborted job.
    fn settle(&mut self, world: &World, key: BlockKey) {
        match world.block(key) {
            None => {
                self.states.remove(&key);
            }
            Some(block) if block.is_generated() => {
                self.states.insert(key, BlockState::Generated);
                self.enqueue(key, Action::Mesh);
            }
            Some(_) => {
                self.states.insert(key, BlockState::Unloaded);
            }
        }
    }

    fn absorb_dirty(&mut self, world: &mut World) {
        for key in world.take_dirty() {
            match self.states.get(&key).copied() {
                Some(BlockState::Meshed) => {
                    tracing::trace!(%key, "meshed block dirtied");
                    self.states.insert(key, BlockState::Dirty);
                    self.enqueue(key, Action::Mesh);
                }
                Some(BlockState::Generated | BlockState::Dirty) => self.enqueue(key, Action::Mesh),
                Some(BlockState::Unloaded | BlockState::Generating | BlockState::Failed { .. }) => {
                    if world.block(key).is_some_and(|b| b.is_generated()) {
                        self.states.insert(key, BlockState::Generated);
                        self.enqueue(key, Action::Mesh);
                    }
                }
                Some(BlockState::Evicting) | None => {}
            }
        }
    }

    fn root_of(world: &World, key: BlockKey) -> BlockKey {
        let max_lod = world.config().max_lod;
        BlockKey::containing(key.origin(world.edge()), max_lod, world.edge())
    }

    /// Drop queued root evictions that the viewers want again.
    fn cancel_evictions(
        &mut self,
        world: &World,
        desired: &BTreeMap<BlockKey, f32>,
        report: &mut TickReport,
    ) {
        let roots: BTreeSet<BlockKey> = desired.keys().map(|k| Self::root_of(world, *k)).collect();
        for root in roots {
            if !self.queued.remove(&(root, Action::Evict)) {
                continue;
            }
            self.queue
                .retain(|r| !(r.key == root && r.action == Action::Evict));
            self.deferred.remove(&root);
            report.cancelled_evictions += 1;
            tracing::debug!(%root, "eviction cancelled, root back in range");

            let region = root.region(world.edge());
            let evicting: Vec<BlockKey> = self
                .states
                .iter()
                .filter(|(k, s)| **s == BlockState::Evicting && region.intersects(&k.region(world.edge())))
                .map(|(k, _)| *k)
                .collect();
            for key in evicting {
                match world.block(key) {
                    Some(block) if block.is_generated() => {
                        if block.is_dirty() || !self.uploaded.contains(&key) {
                            self.states.insert(key, BlockState::Generated);
                            self.enqueue(key, Action::Mesh);
                        } else {
                            self.states.insert(key, BlockState::Meshed);
                        }
                    }
                    _ => {
                        self.states.remove(&key);
                    }
                }
            }
        }
    }

    fn reconcile(&mut self, world: &mut World, desired: &BTreeMap<BlockKey, f32>, report: &mut TickReport) {
        let edge = world.edge();
        for &key in desired.keys() {
            let id = world.ensure_node(key);
            let Some(node) = world.octree().node(id) else {
                continue;
            };
            if node.is_leaf() {
                self.handle_leaf(world, key);
                continue;
            }
            if !self.region_busy(key, edge) {
                match world.coarsen(key) {
                    Ok(()) => {
                        report.coarsened += 1;
                        tracing::debug!(%key, "branch coarsened");
                        self.handle_leaf(world, key);
                        continue;
                    }
                    Err(err) => tracing::debug!(%key, %err, "coarsen denied, keeping finer leaves"),
                }
            }
            let leaves: Vec<BlockKey> = world
                .octree()
                .subtree_leaves(id)
                .into_iter()
                .filter_map(|leaf| world.octree().node(leaf).map(|n| n.key()))
                .collect();
            for leaf in leaves {
                self.handle_leaf(world, leaf);
            }
        }
    }

    fn handle_leaf(&mut self, world: &World, key: BlockKey) {
        if self.in_flight.contains_key(&key) {
            return;
        }
        let generated = world.block(key).is_some_and(|b| b.is_generated());
        match self.states.get(&key).copied() {
            None | Some(BlockState::Unloaded) => {
                if generated {
                    self.states.insert(key, BlockState::Generated);
                    self.enqueue(key, Action::Mesh);
                } else {
                    self.states.insert(key, BlockState::Unloaded);
                    self.enqueue(key, Action::Generate);
                }
            }
            Some(BlockState::Failed { retry_at, .. }) => {
                if self.tick >= retry_at {
                    let action = if generated { Action::Mesh } else { Action::Generate };
                    self.enqueue(key, action);
                }
            }
            Some(BlockState::Generated | BlockState::Dirty) => self.enqueue(key, Action::Mesh),
            Some(BlockState::Generating | BlockState::Meshed | BlockState::Evicting) => {}
        }
    }

    /// Forget blocks that left the tree and stop jobs whose block is gone.
    fn sweep(&mut self, world: &World) {
        let gone: Vec<BlockKey> = self
            .states
            .keys()
            .filter(|k| world.block(**k).is_none() && !self.in_flight.contains_key(k))
            .copied()
            .collect();
        for key in gone {
            self.forget(key);
        }
        for (key, job) in &self.in_flight {
            if world.block(*key).is_none() {
                job.cancel();
            }
        }
    }

    fn forget(&mut self, key: BlockKey) {
        self.states.remove(&key);
        self.failures.remove(&key);
        if self.uploaded.remove(&key) {
            self.events.push(MeshEvent::Removed(key));
        }
    }

    fn schedule_evictions(&mut self, world: &World, viewers: &[Vec3]) {
        let edge = world.edge();
        let roots: Vec<BlockKey> = world.octree().roots().map(|(key, _)| key).collect();
        for root in roots {
            if self.queued.contains(&(root, Action::Evict))
                || viewer_distance(root, edge, viewers) <= self.config.view_radius
            {
                continue;
            }
            let region = root.region(edge);
            self.queue.retain(|r| {
                r.action == Action::Evict || !region.intersects(&r.key.region(edge))
            });
            self.queued.retain(|(k, action)| {
                *action == Action::Evict || !region.intersects(&k.region(edge))
            });
            for (key, state) in self.states.iter_mut() {
                if region.intersects(&key.region(edge)) {
                    *state = BlockState::Evicting;
                }
            }
            tracing::trace!(%root, "root out of range, eviction queued");
            self.enqueue(root, Action::Evict);
        }
    }

    fn reprioritize(&mut self, edge: u32, viewers: &[Vec3]) {
        for request in &mut self.queue {
            request.distance = viewer_distance(request.key, edge, viewers);
        }
        self.queue.sort_by(|a, b| {
            a.action
                .class()
                .cmp(&b.action.class())
                .then(a.distance.total_cmp(&b.distance))
                .then(a.seq.cmp(&b.seq))
        });
    }

    fn dispatch(&mut self, world: &mut World, report: &mut TickReport) {
        let edge = world.edge();
        let queue = std::mem::take(&mut self.queue);
        let mut kept = Vec::new();
        let mut followups = Vec::new();
        for request in queue {
            if report.dispatched.len() >= self.config.dispatch_budget {
                kept.push(request);
                continue;
            }
            let key = request.key;
            match request.action {
                Action::Generate | Action::Mesh => {
                    if self.in_flight.contains_key(&key) || self.in_flight.len() >= self.config.max_in_flight {
                        kept.push(request);
                        continue;
                    }
                    let Some(block) = world.block(key) else {
                        continue;
                    };
                    let generated = block.is_generated();
                    if request.action == Action::Mesh {
                        if !generated {
                            continue;
                        }
                        let block = block.clone();
                        let borders = world.neighbor_borders(key);
                        let handle = self.pool.submit(move || voxelcore_mesh::build(&block, &borders));
                        self.in_flight.insert(key, Job::Mesh(handle));
                        report.dispatched.push((key, Action::Mesh));
                        continue;
                    }
                    if generated {
                        self.states.insert(key, BlockState::Generated);
                        followups.push(key);
                        continue;
                    }
                    report.dispatched.push((key, Action::Generate));
                    match world.load_persisted(key) {
                        Ok(true) => {
                            report.loaded += 1;
                            self.failures.remove(&key);
                            self.states.insert(key, BlockState::Generated);
                            followups.push(key);
                            continue;
                        }
                        Ok(false) => {}
                        Err(WorldError::Corrupt(_)) => report.corrupt += 1,
                        Err(err) => {
                            self.fail(key, &err.to_string(), report);
                            continue;
                        }
                    }
                    let generator = world.generator().clone();
                    let handle = self.pool.submit(move || generator.samples_for(key, edge));
                    self.in_flight.insert(key, Job::Generate(handle));
                    self.states.insert(key, BlockState::Generating);
                }
                Action::Evict => {
                    if self.region_busy(key, edge) {
                        kept.push(request);
                        continue;
                    }
                    report.dispatched.push((key, Action::Evict));
                    match world.evict(key) {
                        Ok(released) => {
                            report.evicted += 1;
                            self.deferred.remove(&key);
                            let region = key.region(edge);
                            let inside: Vec<BlockKey> = self
                                .states
                                .keys()
                                .filter(|k| region.intersects(&k.region(edge)))
                                .copied()
                                .collect();
                            for k in inside {
                                self.forget(k);
                            }
                            tracing::debug!(root = %key, released, "root evicted");
                        }
                        Err(err) => {
                            report.deferred_evictions += 1;
                            if self.deferred.insert(key) {
                                tracing::warn!(root = %key, %err, "eviction deferred");
                            } else {
                                tracing::debug!(root = %key, %err, "eviction still deferred");
                            }
                            kept.push(StreamingRequest {
                                seq: self.bump_seq(),
                                ..request
                            });
                        }
                    }
                }
            }
        }
        self.queue = kept;
        self.queued = self.queue.iter().map(|r| (r.key, r.action)).collect();
        for key in followups {
            self.enqueue(key, Action::Mesh);
        }
    }

    fn region_busy(&self, key: BlockKey, edge: u32) -> bool {
        let region = key.region(edge);
        self.in_flight
            .keys()
            .any(|k| region.intersects(&k.region(edge)))
    }

    fn is_ready(&self, world: &World, key: BlockKey) -> bool {
        if self.states.get(&key) == Some(&BlockState::Meshed) {
            return true;
        }
        let octree = world.octree();
        let Some(id) = octree.find(key) else {
            return false;
        };
        if octree.node(id).is_none_or(|n| n.is_leaf()) {
            return false;
        }
        octree.subtree_leaves(id).into_iter().all(|leaf| {
            octree
                .node(leaf)
                .is_some_and(|n| self.states.get(&n.key()) == Some(&BlockState::Meshed))
        })
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn enqueue(&mut self, key: BlockKey, action: Action) {
        if !self.queued.insert((key, action)) {
            return;
        }
        let seq = self.bump_seq();
        self.queue.push(StreamingRequest {
            key,
            action,
            distance: f32::INFINITY,
            seq,
        });
    }
}
