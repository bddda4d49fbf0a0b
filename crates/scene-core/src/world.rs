//! World - owns the object store and every component manager, and drives
//! the per-frame update.
//!
//! A frame runs as follows:
//!
//! 1. Commands carried over from the previous frame are applied, followed
//!    by commands the host queued since.
//! 2. Each configured phase runs. Within a phase, managers run level by
//!    level; a level starts only after the previous one has finished, so a
//!    kind never starts before its dependencies. Managers of one level run
//!    on the worker pool.
//! 3. Commands queued during a phase are applied at the boundary after it;
//!    those queued during the last phase are carried to the next frame.
//! 4. The frame counter advances and the handles invalidated during the
//!    frame are published.
//!
//! A manager that returns an error or panics loses the rest of its work for
//! that phase. The failure is logged and reported; the frame continues.

use std::{
    any::Any,
    io::Write,
    panic::{self, AssertUnwindSafe},
    time::{Duration, Instant},
};

use parking_lot::{MappedRwLockReadGuard, RwLock};
use rayon::prelude::*;

use crate::{
    command::{Command, CommandQueue, Deferred, HOST_ORIGIN, ObjectSpawn, PendingComponent},
    component::{Component, KindId, KindRegistry, Phase},
    config::WorldConfig,
    context::FrameContext,
    error::{Error, Result},
    handle::{AnyHandle, Handle},
    manager::{ComponentManager, ComponentRef, ManagerCell, ManagerRef, ManagerTable},
    object::{GameObjectStore, ObjectDesc, ObjectHandle},
    schedule::{PhasePlan, Schedule},
    storage::StorageConfig,
    transform::Transform,
};

/// Lifecycle state of a [`World`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldState {
    Idle,
    Updating(Phase),
    ShuttingDown,
    Stopped,
}

/// A handle that stopped resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Invalidation {
    Object(ObjectHandle),
    Component(AnyHandle),
}

/// How one manager fared in one phase.
#[derive(Debug, Clone)]
pub struct ManagerOutcome {
    pub phase: Phase,
    pub kind: KindId,
    pub name: &'static str,
    /// Components updated before finishing or failing.
    pub processed: usize,
    pub elapsed: Duration,
    pub failure: Option<String>,
}

/// Summary of one [`World::update`].
#[derive(Debug, Clone, Default)]
pub struct FrameReport {
    pub frame: u64,
    pub delta_time: f32,
    /// Outcomes in execution order.
    pub managers: Vec<ManagerOutcome>,
    /// Deferred commands applied.
    pub applied: usize,
    /// Deferred commands skipped because their targets were gone.
    pub skipped: usize,
    /// Objects spawned through deferred commands.
    pub spawned: Vec<ObjectHandle>,
    pub invalidated: Vec<Invalidation>,
}

impl FrameReport {
    pub fn failures(&self) -> impl Iterator<Item = &ManagerOutcome> {
        self.managers.iter().filter(|o| o.failure.is_some())
    }

    #[must_use]
    pub fn outcome(&self, kind: KindId, phase: Phase) -> Option<&ManagerOutcome> {
        self.managers
            .iter()
            .find(|o| o.kind == kind && o.phase == phase)
    }
}

/// The simulation: object hierarchy, managers and update loop.
///
/// `&mut World` is the single mutable access token. Everything that changes
/// structure takes `&mut self`; only transform writes and deferred commands
/// are available through `&self`.
pub struct World {
    config: WorldConfig,
    objects: GameObjectStore,
    managers: ManagerTable,
    schedule: Schedule,
    plans: Vec<PhasePlan>,
    commands: CommandQueue,
    carried: Vec<Command>,
    state: WorldState,
    frame: u64,
    elapsed: f64,
    pool: Option<rayon::ThreadPool>,
    pending_invalidations: Vec<Invalidation>,
    published: Vec<Invalidation>,
}

impl World {
    /// Build a world with one manager per registered kind.
    ///
    /// Fails with [`Error::DependencyCycle`] or [`Error::UnknownKind`] if
    /// the registered dependencies cannot be ordered.
    pub fn new(registry: &KindRegistry, config: WorldConfig) -> Result<Self> {
        let schedule = Schedule::build(registry)?;
        let kinds: Vec<_> = registry.iter().collect();

        let mut managers = ManagerTable::default();
        for &index in schedule.order() {
            let kind = kinds[index];
            let storage = StorageConfig {
                layout: kind.layout,
                block_size: kind.block_size.unwrap_or(config.block_size),
                capacity: kind.capacity.unwrap_or(config.max_components_per_kind),
            };
            let manager = kind.instantiate(storage);
            managers.push(ManagerCell {
                kind: kind.id,
                name: kind.name,
                origin: 0,
                dependencies: kind.dependencies.clone(),
                phases: kind.phases,
                generations: manager.generations(),
                manager: RwLock::new(manager),
            });
        }

        let plans = config
            .phases
            .iter()
            .map(|&phase| PhasePlan::build(phase, &schedule, &managers))
            .collect();

        let pool = if config.parallel {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(config.worker_threads)
                    .thread_name(|i| format!("scene-worker-{i}"))
                    .build()?,
            )
        } else {
            None
        };

        let objects = GameObjectStore::new(
            StorageConfig::free_list()
                .with_block_size(config.block_size)
                .with_capacity(config.max_objects),
        );

        tracing::info!(
            kinds = managers.len(),
            levels = schedule.depth(),
            parallel = config.parallel,
            "world created"
        );

        Ok(Self {
            config,
            objects,
            managers,
            schedule,
            plans,
            commands: CommandQueue::new(),
            carried: Vec::new(),
            state: WorldState::Idle,
            frame: 0,
            elapsed: 0.0,
            pool,
            pending_invalidations: Vec::new(),
            published: Vec::new(),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &WorldConfig {
        &self.config
    }

    #[must_use]
    pub const fn state(&self) -> WorldState {
        self.state
    }

    /// Number of completed frames.
    #[must_use]
    pub const fn frame(&self) -> u64 {
        self.frame
    }

    /// Sum of all delta times passed to [`World::update`].
    #[must_use]
    pub const fn elapsed(&self) -> f64 {
        self.elapsed
    }

    #[must_use]
    pub const fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    #[must_use]
    pub const fn objects(&self) -> &GameObjectStore {
        &self.objects
    }

    /// Registered managers in schedule order.
    pub fn kinds(&self) -> impl Iterator<Item = &ManagerCell> {
        self.managers.iter()
    }

    /// Payload version a kind serializes with.
    #[must_use]
    pub fn kind_version(&self, kind: KindId) -> Option<u16> {
        self.managers
            .cell(kind)
            .map(|cell| cell.manager.read().version())
    }

    /// Handles invalidated during the last completed frame.
    #[must_use]
    pub fn invalidated(&self) -> &[Invalidation] {
        &self.published
    }

    fn ensure_live(&self) -> Result<()> {
        match self.state {
            WorldState::ShuttingDown | WorldState::Stopped => Err(Error::InvalidState(self.state)),
            WorldState::Idle | WorldState::Updating(_) => Ok(()),
        }
    }

    // ==================== Object Operations ====================

    pub fn create_object(&mut self, parent: Option<ObjectHandle>) -> Result<ObjectHandle> {
        self.ensure_live()?;
        self.objects.create_object(parent)
    }

    /// Create an object with its initial components. Nothing is left behind
    /// if a component cannot be created.
    pub fn spawn(&mut self, spawn: ObjectSpawn) -> Result<ObjectHandle> {
        self.ensure_live()?;
        let object = self.objects.create_object_with(ObjectDesc {
            parent: spawn.parent,
            name: spawn.name,
            local: spawn.local,
            active: Some(spawn.active),
        })?;

        for component in spawn.components {
            if let Err(err) = self.insert_component(object, component) {
                self.discard_tree(object)?;
                return Err(err);
            }
        }
        Ok(object)
    }

    /// Destroy an object and, with `cascade`, all its descendants, children
    /// first. Every attached component is destroyed through its manager.
    /// Returns the number of objects destroyed.
    pub fn destroy_object(&mut self, object: ObjectHandle, cascade: bool) -> Result<usize> {
        self.ensure_live()?;
        self.destroy_tree(object, cascade)
    }

    /// Undo objects whose handles never left the caller, such as a batch
    /// that failed part way. Destroys like `destroy_object(object, true)`
    /// but reports no invalidations.
    pub fn discard_object(&mut self, object: ObjectHandle) -> Result<usize> {
        self.ensure_live()?;
        self.discard_tree(object)
    }

    fn discard_tree(&mut self, object: ObjectHandle) -> Result<usize> {
        let mark = self.pending_invalidations.len();
        let destroyed = self.destroy_tree(object, true);
        self.pending_invalidations.truncate(mark);
        destroyed
    }

    fn destroy_tree(&mut self, object: ObjectHandle, cascade: bool) -> Result<usize> {
        let order = self.objects.destruction_order(object, cascade)?;
        for &handle in &order {
            let components = self
                .objects
                .components(handle)
                .map(<[AnyHandle]>::to_vec)
                .unwrap_or_default();
            for component in components {
                self.managers
                    .cell_mut(component.kind())?
                    .get_mut()
                    .destroy_erased(&mut self.objects, component.raw())?;
                self.pending_invalidations
                    .push(Invalidation::Component(component));
            }
            self.objects.remove_leaf(handle)?;
            self.pending_invalidations.push(Invalidation::Object(handle));
        }
        Ok(order.len())
    }

    pub fn set_parent(&mut self, object: ObjectHandle, parent: Option<ObjectHandle>) -> Result<()> {
        self.ensure_live()?;
        self.objects.set_parent(object, parent)
    }

    pub fn set_parent_keep_world(
        &mut self,
        object: ObjectHandle,
        parent: Option<ObjectHandle>,
    ) -> Result<()> {
        self.ensure_live()?;
        self.objects.set_parent_keep_world(object, parent)
    }

    pub fn set_name(&mut self, object: ObjectHandle, name: Option<String>) -> Result<()> {
        self.ensure_live()?;
        self.objects.set_name(object, name)
    }

    pub fn set_active(&mut self, object: ObjectHandle, active: bool) -> Result<()> {
        self.ensure_live()?;
        self.objects.set_active(object, active)
    }

    pub fn set_local_transform(&self, object: ObjectHandle, local: Transform) -> Result<()> {
        self.objects.set_local_transform(object, local)
    }

    pub fn world_transform(&self, object: ObjectHandle) -> Result<Transform> {
        self.objects.world_transform(object)
    }

    // ==================== Component Operations ====================

    pub fn create_component<T: Component>(
        &mut self,
        owner: ObjectHandle,
        value: T,
    ) -> Result<Handle<T>> {
        self.ensure_live()?;
        let manager = self
            .managers
            .get_mut::<T>()
            .ok_or(Error::UnknownKind(T::KIND))?;
        manager.create(&mut self.objects, owner, value)
    }

    /// Destroy a component and return its value.
    pub fn destroy_component<T: Component>(&mut self, handle: Handle<T>) -> Result<T> {
        self.ensure_live()?;
        let manager = self
            .managers
            .get_mut::<T>()
            .ok_or(Error::UnknownKind(T::KIND))?;
        let value = manager.destroy(&mut self.objects, handle)?;
        self.pending_invalidations
            .push(Invalidation::Component(handle.into()));
        Ok(value)
    }

    pub fn destroy_any(&mut self, handle: AnyHandle) -> Result<()> {
        self.ensure_live()?;
        self.managers
            .cell_mut(handle.kind())?
            .get_mut()
            .destroy_erased(&mut self.objects, handle.raw())?;
        self.pending_invalidations
            .push(Invalidation::Component(handle));
        Ok(())
    }

    /// Shared access to one component.
    #[must_use]
    pub fn get<T: Component>(&self, handle: Handle<T>) -> Option<ComponentRef<'_, T>> {
        let manager = self.managers.read::<T>()?;
        MappedRwLockReadGuard::try_map(manager, |manager| manager.get(handle)).ok()
    }

    pub fn get_mut<T: Component>(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.managers.get_mut::<T>()?.get_mut(handle)
    }

    #[must_use]
    pub fn manager<T: Component>(&self) -> Option<ManagerRef<'_, T>> {
        self.managers.read::<T>()
    }

    pub fn manager_mut<T: Component>(&mut self) -> Option<&mut ComponentManager<T>> {
        self.managers.get_mut::<T>()
    }

    /// Whether `handle` names a live component. Takes no locks.
    #[must_use]
    pub fn is_valid(&self, handle: AnyHandle) -> bool {
        self.managers
            .cell(handle.kind())
            .is_some_and(|cell| cell.is_valid(handle.raw()))
    }

    #[must_use]
    pub fn component_owner(&self, handle: AnyHandle) -> Option<ObjectHandle> {
        self.managers
            .cell(handle.kind())?
            .manager
            .read()
            .owner(handle.raw())
    }

    pub fn set_component_active(&mut self, handle: AnyHandle, active: bool) -> Result<()> {
        self.ensure_live()?;
        self.managers
            .cell_mut(handle.kind())?
            .get_mut()
            .set_active_erased(handle.raw(), active)
    }

    /// Queue structural changes from the host. They are applied at the
    /// start of the next frame.
    #[must_use]
    pub fn defer(&self) -> Deferred<'_> {
        Deferred::new(&self.commands, HOST_ORIGIN)
    }

    // ==================== Serialization Support ====================

    /// Write a component's payload. Returns the version written.
    pub fn serialize_component(&self, handle: AnyHandle, writer: &mut dyn Write) -> Result<u16> {
        self.managers
            .cell(handle.kind())
            .ok_or(Error::UnknownKind(handle.kind()))?
            .manager
            .read()
            .serialize_erased(handle.raw(), writer)
    }

    /// Decode a payload without touching the world.
    pub fn decode_component(
        &self,
        kind: KindId,
        version: u16,
        payload: &[u8],
    ) -> Result<PendingComponent> {
        let value: Box<dyn Any + Send> = self
            .managers
            .cell(kind)
            .ok_or(Error::UnknownKind(kind))?
            .manager
            .read()
            .decode_erased(version, payload)?;
        Ok(PendingComponent { kind, value })
    }

    /// Attach a decoded component to `owner`.
    pub fn insert_component(
        &mut self,
        owner: ObjectHandle,
        component: PendingComponent,
    ) -> Result<AnyHandle> {
        self.ensure_live()?;
        let kind = component.kind;
        let raw = self
            .managers
            .cell_mut(kind)?
            .get_mut()
            .create_erased(&mut self.objects, owner, component.value)?;
        Ok(AnyHandle::new(kind, raw))
    }

    // ==================== Frame Update ====================

    /// Run one frame.
    pub fn update(&mut self, delta_time: f32) -> Result<FrameReport> {
        if self.state != WorldState::Idle {
            return Err(Error::InvalidState(self.state));
        }

        let span = tracing::debug_span!("frame", frame = self.frame);
        let _enter = span.enter();

        let mut report = FrameReport {
            frame: self.frame,
            delta_time,
            ..FrameReport::default()
        };

        let mut pending = std::mem::take(&mut self.carried);
        pending.extend(self.commands.drain());
        self.apply(pending, &mut report);

        for index in 0..self.plans.len() {
            let phase = self.plans[index].phase;
            self.state = WorldState::Updating(phase);
            tracing::debug!(?phase, "phase started");

            self.run_phase(&self.plans[index], delta_time, &mut report);

            let commands = self.commands.drain();
            if index + 1 == self.plans.len() {
                self.carried = commands;
            } else {
                self.apply(commands, &mut report);
            }
        }

        self.state = WorldState::Idle;
        self.frame += 1;
        self.elapsed += f64::from(delta_time);
        self.published = std::mem::take(&mut self.pending_invalidations);
        report.invalidated.clone_from(&self.published);

        tracing::debug!(
            managers = report.managers.len(),
            applied = report.applied,
            invalidated = report.invalidated.len(),
            carried = self.carried.len(),
            "frame finished"
        );
        Ok(report)
    }

    fn run_phase(&self, plan: &PhasePlan, delta_time: f32, report: &mut FrameReport) {
        let frame = FrameContext {
            objects: &self.objects,
            commands: &self.commands,
            managers: &self.managers,
            phase: plan.phase,
            delta_time,
            frame: self.frame,
        };

        for level in &plan.levels {
            let outcomes: Vec<ManagerOutcome> = match &self.pool {
                Some(pool) if level.len() > 1 => pool.install(|| {
                    level
                        .par_iter()
                        .map(|&index| run_manager(&frame, index))
                        .collect()
                }),
                _ => level
                    .iter()
                    .map(|&index| run_manager(&frame, index))
                    .collect(),
            };
            report.managers.extend(outcomes);
        }
    }

    fn apply(&mut self, commands: Vec<Command>, report: &mut FrameReport) {
        if commands.is_empty() {
            return;
        }
        let before = (report.applied, report.skipped);

        for command in commands {
            match self.apply_one(command, report) {
                Ok(()) => report.applied += 1,
                Err(err) => {
                    tracing::warn!(%err, "skipping deferred command");
                    report.skipped += 1;
                }
            }
        }

        tracing::debug!(
            applied = report.applied - before.0,
            skipped = report.skipped - before.1,
            "applied deferred commands"
        );
    }

    fn apply_one(&mut self, command: Command, report: &mut FrameReport) -> Result<()> {
        match command {
            Command::SpawnObject(spawn) => {
                let object = self.spawn(spawn)?;
                report.spawned.push(object);
            }
            Command::DestroyObject { object, cascade } => {
                self.destroy_object(object, cascade)?;
            }
            Command::SetParent { object, parent } => self.set_parent(object, parent)?,
            Command::CreateComponent { owner, component } => {
                self.insert_component(owner, component)?;
            }
            Command::DestroyComponent(handle) => self.destroy_any(handle)?,
        }
        Ok(())
    }

    /// Destroy every object, children first, and stop the world. Queued
    /// commands are dropped. Later updates fail with [`Error::InvalidState`].
    pub fn shutdown(&mut self) -> Result<()> {
        match self.state {
            WorldState::Stopped => return Ok(()),
            WorldState::Updating(_) => return Err(Error::InvalidState(self.state)),
            WorldState::Idle | WorldState::ShuttingDown => {}
        }
        self.state = WorldState::ShuttingDown;

        let dropped = self.carried.len() + self.commands.drain().len();
        self.carried.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "dropping deferred commands on shutdown");
        }

        let roots: Vec<_> = self.objects.roots().collect();
        let mut destroyed = 0;
        for root in roots {
            destroyed += self.destroy_tree(root, true)?;
        }
        for cell in self.managers.iter_mut() {
            cell.get_mut().clear(&mut self.objects);
        }

        self.published = std::mem::take(&mut self.pending_invalidations);
        self.state = WorldState::Stopped;
        tracing::info!(frames = self.frame, destroyed, "world stopped");
        Ok(())
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("state", &self.state)
            .field("frame", &self.frame)
            .field("objects", &self.objects.len())
            .field("managers", &self.managers.len())
            .finish_non_exhaustive()
    }
}

fn run_manager(frame: &FrameContext<'_>, index: usize) -> ManagerOutcome {
    let cell = frame.managers.at(index);
    let start = Instant::now();
    let mut processed = 0;
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        cell.manager.write().update(frame, cell, &mut processed)
    }));
    let elapsed = start.elapsed();

    let failure = match result {
        Ok(Ok(())) => None,
        Ok(Err(err)) => {
            tracing::error!(kind = cell.name(), phase = ?frame.phase, processed, %err, "manager update failed");
            Some(err.to_string())
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(kind = cell.name(), phase = ?frame.phase, processed, %message, "manager update panicked");
            Some(message)
        }
    };

    ManagerOutcome {
        phase: frame.phase,
        kind: cell.kind(),
        name: cell.name(),
        processed,
        elapsed,
        failure,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_owned()
    }
}
