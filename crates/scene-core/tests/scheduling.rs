//! Frame execution: ordering, parallelism, deferred commands and failures.

use std::{
    io::{Read, Write},
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use scene_core::{ManagerOutcome, nalgebra::Vector3, prelude::*};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

macro_rules! no_payload {
    () => {
        fn serialize(&self, _writer: &mut dyn Write) -> Result<()> {
            Ok(())
        }

        fn deserialize(_version: u16, _reader: &mut dyn Read) -> Result<Self> {
            Err(Error::Corrupt("not serializable".into()))
        }
    };
}

// ============================================================================
// Dependency Ordering
// ============================================================================

/// Start/finish log shared by the ordering components of one test.
#[derive(Default)]
struct Timeline {
    clock: AtomicU64,
    physics_finished: Mutex<Vec<u64>>,
    rendering_started: Mutex<Vec<u64>>,
}

fn timeline() -> &'static Timeline {
    static TIMELINE: OnceLock<Timeline> = OnceLock::new();
    TIMELINE.get_or_init(Timeline::default)
}

struct Physics {
    jitter: u64,
}

impl Component for Physics {
    const KIND: KindId = KindId::new(1);
    const NAME: &'static str = "Physics";

    fn update(&mut self, ctx: &mut UpdateContext<'_>) -> Result<()> {
        std::thread::sleep(Duration::from_micros((self.jitter * 37 + ctx.frame()) % 200));
        let owner = ctx.owner();
        let mut local = ctx.objects().local_transform(owner)?;
        local.translation += Vector3::new(1.0, 0.0, 0.0);
        ctx.objects().set_local_transform(owner, local)?;

        let t = timeline();
        let tick = t.clock.fetch_add(1, Ordering::SeqCst);
        t.physics_finished.lock().unwrap().push(tick);
        Ok(())
    }

    no_payload!();
}

struct Rendering {
    seen_x: f32,
}

impl Component for Rendering {
    const KIND: KindId = KindId::new(2);
    const NAME: &'static str = "Rendering";

    fn update(&mut self, ctx: &mut UpdateContext<'_>) -> Result<()> {
        let t = timeline();
        let tick = t.clock.fetch_add(1, Ordering::SeqCst);
        t.rendering_started.lock().unwrap().push(tick);

        self.seen_x = ctx.objects().world_transform(ctx.owner())?.translation.x;
        // Declared dependency is readable, anything else is not.
        assert!(ctx.read::<Physics>().is_some());
        assert!(ctx.read::<Audio>().is_none());
        Ok(())
    }

    no_payload!();
}

struct Audio;

impl Component for Audio {
    const KIND: KindId = KindId::new(3);
    const NAME: &'static str = "Audio";

    fn update(&mut self, _ctx: &mut UpdateContext<'_>) -> Result<()> {
        std::thread::sleep(Duration::from_micros(50));
        Ok(())
    }

    no_payload!();
}

#[test]
fn test_dependency_finishes_before_dependent_starts() {
    init_tracing();

    let mut registry = KindRegistry::new();
    registry
        .register::<Rendering>(Registration::new().depends_on::<Physics>())
        .unwrap()
        .register::<Physics>(Registration::new())
        .unwrap()
        .register::<Audio>(Registration::new())
        .unwrap();

    let config = WorldConfig {
        parallel: true,
        worker_threads: 4,
        ..WorldConfig::default()
    };
    let mut world = World::new(&registry, config).unwrap();

    let mut renderers = Vec::new();
    for i in 0..16 {
        let object = world.create_object(None).unwrap();
        world.create_component(object, Physics { jitter: i }).unwrap();
        world.create_component(object, Audio).unwrap();
        renderers.push(world.create_component(object, Rendering { seen_x: 0.0 }).unwrap());
    }

    for frame in 0..25 {
        let report = world.update(1.0 / 60.0).unwrap();
        assert_eq!(report.failures().count(), 0);

        let t = timeline();
        let finished = std::mem::take(&mut *t.physics_finished.lock().unwrap());
        let started = std::mem::take(&mut *t.rendering_started.lock().unwrap());
        assert_eq!(finished.len(), 16);
        assert_eq!(started.len(), 16);
        let last_physics = finished.iter().max().unwrap();
        let first_render = started.iter().min().unwrap();
        assert!(
            last_physics < first_render,
            "frame {frame}: rendering started at {first_render} before physics finished at {last_physics}"
        );

        // Rendering observes the transform Physics wrote this frame.
        for handle in &renderers {
            let seen = world.get(*handle).unwrap().seen_x;
            assert_eq!(seen, (frame + 1) as f32);
        }
    }
}

// ============================================================================
// Deferred Commands
// ============================================================================

#[derive(Default)]
struct Spawner {
    spawned: bool,
}

impl Component for Spawner {
    const KIND: KindId = KindId::new(10);
    const NAME: &'static str = "Spawner";

    fn update(&mut self, ctx: &mut UpdateContext<'_>) -> Result<()> {
        if !self.spawned {
            ctx.defer().spawn(
                ObjectSpawn::new()
                    .parent(ctx.owner())
                    .name("spawned")
                    .with(Counter::default()),
            );
            ctx.create(ctx.owner(), Counter::default())?;
            self.spawned = true;
        }
        Ok(())
    }

    no_payload!();
}

#[derive(Default)]
struct Counter {
    count: u32,
}

impl Component for Counter {
    const KIND: KindId = KindId::new(11);
    const NAME: &'static str = "Counter";

    fn update(&mut self, ctx: &mut UpdateContext<'_>) -> Result<()> {
        self.count += 1;
        if let Some(this) = ctx.this::<Self>() {
            assert!(matches!(
                ctx.destroy(this),
                Err(Error::ConcurrentModification { kind: "Counter" })
            ));
        }
        Ok(())
    }

    no_payload!();
}

#[test]
fn test_deferred_commands_apply_at_phase_boundary() {
    init_tracing();

    let mut registry = KindRegistry::new();
    registry
        .register::<Spawner>(Registration::new().phases(Phase::PreSimulation))
        .unwrap()
        .register::<Counter>(Registration::new().phases(Phase::Simulation))
        .unwrap();
    let mut world = World::new(&registry, WorldConfig::sequential()).unwrap();

    let host = world.create_object(None).unwrap();
    world.create_component(host, Spawner::default()).unwrap();

    let report = world.update(0.1).unwrap();

    // Spawned after PreSimulation, so Counter ran on both new components
    // during Simulation of the same frame.
    assert_eq!(report.spawned.len(), 1);
    assert_eq!(report.applied, 2);
    assert_eq!(report.outcome(Counter::KIND, Phase::Simulation).unwrap().processed, 2);

    let child = world.objects().find_by_name("spawned").unwrap();
    assert_eq!(world.objects().parent(child), Some(host));
    assert_eq!(
        world.objects().components_of_kind(host, Counter::KIND).len(),
        1
    );
    let counters: Vec<u32> = world
        .manager::<Counter>()
        .unwrap()
        .iter()
        .map(|(_, c)| c.count)
        .collect();
    assert_eq!(counters, vec![1, 1]);
}

struct Reaper;

impl Component for Reaper {
    const KIND: KindId = KindId::new(20);
    const NAME: &'static str = "Reaper";

    fn update(&mut self, ctx: &mut UpdateContext<'_>) -> Result<()> {
        ctx.defer().destroy_object(ctx.owner(), true);
        Ok(())
    }

    no_payload!();
}

#[test]
fn test_last_phase_commands_carry_to_next_frame() {
    let mut registry = KindRegistry::new();
    registry
        .register::<Reaper>(Registration::new().phases(Phase::PostSimulation))
        .unwrap();
    let mut world = World::new(&registry, WorldConfig::sequential()).unwrap();

    let doomed = world.create_object(None).unwrap();
    world.create_component(doomed, Reaper).unwrap();

    let first = world.update(0.0).unwrap();
    assert_eq!(first.applied, 0);
    assert!(world.objects().is_alive(doomed));

    let second = world.update(0.0).unwrap();
    assert_eq!(second.applied, 1);
    assert!(!world.objects().is_alive(doomed));
    assert!(second.invalidated.contains(&scene_core::Invalidation::Object(doomed)));
}

#[test]
fn test_stale_deferred_command_is_skipped() {
    let mut world = World::new(&KindRegistry::new(), WorldConfig::sequential()).unwrap();
    let object = world.create_object(None).unwrap();

    world.defer().destroy_object(object, false);
    world.defer().destroy_object(object, false);

    let report = world.update(0.0).unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(report.skipped, 1);
}

// ============================================================================
// Handle Validity During Updates
// ============================================================================

struct Beacon;

impl Component for Beacon {
    const KIND: KindId = KindId::new(40);
    const NAME: &'static str = "Beacon";

    fn update(&mut self, _ctx: &mut UpdateContext<'_>) -> Result<()> {
        std::thread::sleep(Duration::from_micros(200));
        Ok(())
    }

    no_payload!();
}

struct Watcher {
    targets: Vec<(AnyHandle, bool)>,
    checked: Arc<AtomicU32>,
}

impl Component for Watcher {
    const KIND: KindId = KindId::new(41);
    const NAME: &'static str = "Watcher";

    fn update(&mut self, ctx: &mut UpdateContext<'_>) -> Result<()> {
        // Beacon is not a dependency, so its manager is not readable here.
        assert!(ctx.read::<Beacon>().is_none());
        for &(target, alive) in &self.targets {
            assert_eq!(ctx.is_valid(target), alive, "{target:?}");
            self.checked.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    no_payload!();
}

#[test]
fn test_independent_kind_handles_checked_mid_frame() {
    init_tracing();

    let mut registry = KindRegistry::new();
    registry
        .register::<Beacon>(Registration::new())
        .unwrap()
        .register::<Watcher>(Registration::new())
        .unwrap();
    let config = WorldConfig {
        parallel: true,
        worker_threads: 4,
        ..WorldConfig::default()
    };
    let mut world = World::new(&registry, config).unwrap();

    let mut targets = Vec::new();
    for i in 0..32 {
        let object = world.create_object(None).unwrap();
        let beacon = world.create_component(object, Beacon).unwrap();
        targets.push((AnyHandle::from(beacon), i % 4 != 0));
    }
    for &(target, alive) in &targets {
        if !alive {
            world.destroy_any(target).unwrap();
        }
    }
    assert!(targets.iter().all(|&(t, alive)| world.is_valid(t) == alive));

    let checked = Arc::new(AtomicU32::new(0));
    let watcher = world.create_object(None).unwrap();
    world
        .create_component(
            watcher,
            Watcher {
                targets: targets.clone(),
                checked: Arc::clone(&checked),
            },
        )
        .unwrap();

    for _ in 0..10 {
        let report = world.update(0.0).unwrap();
        assert_eq!(report.failures().count(), 0);
    }
    assert_eq!(checked.load(Ordering::SeqCst), 320);
}

// ============================================================================
// Failure Isolation
// ============================================================================

struct Fragile {
    id: u32,
}

static FRAGILE_UPDATES: AtomicU32 = AtomicU32::new(0);

impl Component for Fragile {
    const KIND: KindId = KindId::new(30);
    const NAME: &'static str = "Fragile";

    fn update(&mut self, _ctx: &mut UpdateContext<'_>) -> Result<()> {
        FRAGILE_UPDATES.fetch_add(1, Ordering::SeqCst);
        match self.id {
            1 => Err(Error::Update("fragile component broke".into())),
            _ => Ok(()),
        }
    }

    no_payload!();
}

struct Panicky;

impl Component for Panicky {
    const KIND: KindId = KindId::new(31);
    const NAME: &'static str = "Panicky";

    fn update(&mut self, _ctx: &mut UpdateContext<'_>) -> Result<()> {
        panic!("panicky component");
    }

    no_payload!();
}

struct Steady {
    ticks: Arc<AtomicU32>,
}

impl Component for Steady {
    const KIND: KindId = KindId::new(32);
    const NAME: &'static str = "Steady";

    fn update(&mut self, _ctx: &mut UpdateContext<'_>) -> Result<()> {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    no_payload!();
}

#[test]
fn test_failures_are_isolated_per_manager() {
    init_tracing();

    let mut registry = KindRegistry::new();
    registry
        .register::<Fragile>(Registration::new())
        .unwrap()
        .register::<Panicky>(Registration::new())
        .unwrap()
        .register::<Steady>(Registration::new().depends_on::<Panicky>())
        .unwrap();
    let config = WorldConfig {
        worker_threads: 2,
        ..WorldConfig::default()
    };
    let mut world = World::new(&registry, config).unwrap();

    let ticks = Arc::new(AtomicU32::new(0));
    let object = world.create_object(None).unwrap();
    for id in 0..3 {
        world.create_component(object, Fragile { id }).unwrap();
    }
    world.create_component(object, Panicky).unwrap();
    world
        .create_component(object, Steady { ticks: Arc::clone(&ticks) })
        .unwrap();

    let report = world.update(0.0).unwrap();

    let failed: Vec<&ManagerOutcome> = report.failures().collect();
    assert_eq!(failed.len(), 2);
    assert!(failed.iter().any(|o| o.name == "Fragile"));
    assert!(failed.iter().any(|o| o.name == "Panicky"));

    // The error aborts the rest of Fragile's phase after the second component.
    assert_eq!(FRAGILE_UPDATES.load(Ordering::SeqCst), 2);
    let fragile = report.outcome(Fragile::KIND, Phase::Simulation).unwrap();
    assert_eq!(fragile.processed, 1);
    assert_eq!(report.outcome(Panicky::KIND, Phase::Simulation).unwrap().processed, 0);
    // Dependents of a failed manager still run.
    assert_eq!(ticks.load(Ordering::SeqCst), 1);
    assert_eq!(world.frame(), 1);

    // Next frame runs normally.
    world.update(0.0).unwrap();
    assert_eq!(ticks.load(Ordering::SeqCst), 2);
}

#[test]
fn test_inactive_objects_and_components_are_skipped() {
    let mut registry = KindRegistry::new();
    registry.register::<Steady>(Registration::new()).unwrap();
    let mut world = World::new(&registry, WorldConfig::sequential()).unwrap();

    let ticks = Arc::new(AtomicU32::new(0));
    let root = world.create_object(None).unwrap();
    let child = world.create_object(Some(root)).unwrap();
    let other = world.create_object(None).unwrap();
    world
        .create_component(child, Steady { ticks: Arc::clone(&ticks) })
        .unwrap();
    let muted = world
        .create_component(other, Steady { ticks: Arc::clone(&ticks) })
        .unwrap();

    world.set_active(root, false).unwrap();
    world.set_component_active(muted.into(), false).unwrap();
    let report = world.update(0.0).unwrap();
    assert_eq!(ticks.load(Ordering::SeqCst), 0);
    assert_eq!(report.outcome(Steady::KIND, Phase::Simulation).unwrap().processed, 0);

    world.set_active(root, true).unwrap();
    world.update(0.0).unwrap();
    assert_eq!(ticks.load(Ordering::SeqCst), 1);
}

#[test]
fn test_dependency_cycle_rejected_at_construction() {
    let mut registry = KindRegistry::new();
    registry
        .register::<Physics>(Registration::new().depends_on::<Rendering>())
        .unwrap()
        .register::<Rendering>(Registration::new().depends_on::<Physics>())
        .unwrap();

    assert!(matches!(
        World::new(&registry, WorldConfig::default()),
        Err(Error::DependencyCycle { .. })
    ));
}
