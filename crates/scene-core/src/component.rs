//! Component kinds and their registration.
//!
//! Every concrete component type is a *kind* with a stable small id. Kinds are
//! registered on a [`KindRegistry`] value at start-up; the world builds one
//! type-erased manager per kind from the registry's descriptors.

use std::{
    fmt,
    io::{Read, Write},
};

use bitflags::bitflags;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
    context::UpdateContext,
    error::{Error, Result},
    manager::{ComponentManager, ErasedManager},
    storage::{StorageConfig, StorageLayout},
};

/// Stable identifier for a component kind.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KindId(u16);

impl KindId {
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for KindId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KindId({})", self.0)
    }
}

/// A behavioral component attached to a game object.
///
/// # Example
///
/// ```ignore
/// struct Spin { speed: f32 }
///
/// impl Component for Spin {
///     const KIND: KindId = KindId::new(7);
///     const NAME: &'static str = "Spin";
///
///     fn update(&mut self, ctx: &mut UpdateContext<'_>) -> Result<()> {
///         let owner = ctx.owner();
///         let mut local = ctx.objects().local_transform(owner)?;
///         local.rotation *= UnitQuaternion::from_euler_angles(0.0, 0.0, self.speed * ctx.delta_time());
///         ctx.objects().set_local_transform(owner, local)
///     }
///
///     fn serialize(&self, w: &mut dyn Write) -> Result<()> {
///         Ok(w.write_f32::<LittleEndian>(self.speed)?)
///     }
///
///     fn deserialize(_version: u16, r: &mut dyn Read) -> Result<Self> {
///         Ok(Self { speed: r.read_f32::<LittleEndian>()? })
///     }
/// }
/// ```
pub trait Component: Sized + Send + Sync + 'static {
    /// Kind id, unique within a registry.
    const KIND: KindId;
    /// Human readable kind name.
    const NAME: &'static str;
    /// Payload version written ahead of serialized data.
    const VERSION: u16 = 1;

    /// Called once per frame for every phase the kind is registered for.
    fn update(&mut self, ctx: &mut UpdateContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Write the payload for [`Component::VERSION`].
    fn serialize(&self, writer: &mut dyn Write) -> Result<()>;

    /// Read a payload written by `version` of this kind.
    fn deserialize(version: u16, reader: &mut dyn Read) -> Result<Self>;
}

/// Update phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    PreSimulation,
    Simulation,
    PostSimulation,
}

impl Phase {
    pub const ALL: [Self; 3] = [Self::PreSimulation, Self::Simulation, Self::PostSimulation];

    #[must_use]
    pub const fn as_set(self) -> PhaseSet {
        match self {
            Self::PreSimulation => PhaseSet::PRE_SIMULATION,
            Self::Simulation => PhaseSet::SIMULATION,
            Self::PostSimulation => PhaseSet::POST_SIMULATION,
        }
    }
}

bitflags! {
    /// Set of phases a kind updates in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PhaseSet: u8 {
        const PRE_SIMULATION = 1 << 0;
        const SIMULATION = 1 << 1;
        const POST_SIMULATION = 1 << 2;
    }
}

impl PhaseSet {
    #[must_use]
    pub const fn has(self, phase: Phase) -> bool {
        self.contains(phase.as_set())
    }
}

impl From<Phase> for PhaseSet {
    fn from(phase: Phase) -> Self {
        phase.as_set()
    }
}

/// Per-kind registration options.
#[derive(Debug, Clone)]
pub struct Registration {
    layout: StorageLayout,
    phases: PhaseSet,
    dependencies: SmallVec<[KindId; 4]>,
    capacity: Option<usize>,
    block_size: Option<usize>,
}

impl Default for Registration {
    fn default() -> Self {
        Self {
            layout: StorageLayout::Compact,
            phases: PhaseSet::SIMULATION,
            dependencies: SmallVec::new(),
            capacity: None,
            block_size: None,
        }
    }
}

impl Registration {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn layout(mut self, layout: StorageLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Phases the kind updates in. An empty set means never updated.
    #[must_use]
    pub fn phases(mut self, phases: impl Into<PhaseSet>) -> Self {
        self.phases = phases.into();
        self
    }

    /// Run after `U` has finished each shared phase.
    #[must_use]
    pub fn depends_on<U: Component>(self) -> Self {
        self.depends_on_kind(U::KIND)
    }

    #[must_use]
    pub fn depends_on_kind(mut self, kind: KindId) -> Self {
        if !self.dependencies.contains(&kind) {
            self.dependencies.push(kind);
        }
        self
    }

    /// Hard ceiling on live components. Defaults to the world config value.
    #[must_use]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    #[must_use]
    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = Some(block_size);
        self
    }
}

type ManagerFactory = fn(StorageConfig) -> Box<dyn ErasedManager>;

/// Capability table for one registered kind.
#[derive(Clone)]
pub struct KindDescriptor {
    pub id: KindId,
    pub name: &'static str,
    pub version: u16,
    pub layout: StorageLayout,
    pub phases: PhaseSet,
    pub dependencies: SmallVec<[KindId; 4]>,
    pub capacity: Option<usize>,
    pub block_size: Option<usize>,
    factory: ManagerFactory,
}

impl KindDescriptor {
    fn of<T: Component>(registration: Registration) -> Self {
        Self {
            id: T::KIND,
            name: T::NAME,
            version: T::VERSION,
            layout: registration.layout,
            phases: registration.phases,
            dependencies: registration.dependencies,
            capacity: registration.capacity,
            block_size: registration.block_size,
            factory: |config| Box::new(ComponentManager::<T>::new(config)),
        }
    }

    /// Build an empty manager for this kind.
    #[must_use]
    pub fn instantiate(&self, config: StorageConfig) -> Box<dyn ErasedManager> {
        (self.factory)(config)
    }
}

impl fmt::Debug for KindDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("version", &self.version)
            .field("layout", &self.layout)
            .field("phases", &self.phases)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// Registered kinds, in registration order.
#[derive(Debug, Default, Clone)]
pub struct KindRegistry {
    kinds: Vec<KindDescriptor>,
    by_id: FxHashMap<KindId, usize>,
}

impl KindRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T`.
    ///
    /// Dependencies may name kinds registered later; they are checked when
    /// a world is built from the registry.
    pub fn register<T: Component>(&mut self, registration: Registration) -> Result<&mut Self> {
        if let Some(&existing) = self.by_id.get(&T::KIND) {
            return Err(Error::DuplicateKind {
                id: T::KIND,
                name: self.kinds[existing].name,
            });
        }

        tracing::debug!(kind = T::NAME, id = T::KIND.get(), "registered component kind");
        self.by_id.insert(T::KIND, self.kinds.len());
        self.kinds.push(KindDescriptor::of::<T>(registration));
        Ok(self)
    }

    #[must_use]
    pub fn get(&self, id: KindId) -> Option<&KindDescriptor> {
        self.by_id.get(&id).map(|&index| &self.kinds[index])
    }

    #[must_use]
    pub fn position(&self, id: KindId) -> Option<usize> {
        self.by_id.get(&id).copied()
    }

    #[must_use]
    pub fn contains(&self, id: KindId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &KindDescriptor> {
        self.kinds.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Alpha;
    struct Beta;

    impl Component for Alpha {
        const KIND: KindId = KindId::new(1);
        const NAME: &'static str = "Alpha";

        fn serialize(&self, _writer: &mut dyn Write) -> Result<()> {
            Ok(())
        }

        fn deserialize(_version: u16, _reader: &mut dyn Read) -> Result<Self> {
            Ok(Self)
        }
    }

    impl Component for Beta {
        const KIND: KindId = KindId::new(1);
        const NAME: &'static str = "Beta";
        const VERSION: u16 = 3;

        fn serialize(&self, _writer: &mut dyn Write) -> Result<()> {
            Ok(())
        }

        fn deserialize(_version: u16, _reader: &mut dyn Read) -> Result<Self> {
            Ok(Self)
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = KindRegistry::new();
        registry
            .register::<Alpha>(Registration::new().phases(PhaseSet::all()))
            .unwrap();

        let descriptor = registry.get(KindId::new(1)).unwrap();
        assert_eq!(descriptor.name, "Alpha");
        assert_eq!(descriptor.version, 1);
        assert!(descriptor.phases.has(Phase::PreSimulation));
        assert_eq!(registry.position(KindId::new(1)), Some(0));
        assert!(registry.get(KindId::new(2)).is_none());
    }

    #[test]
    fn test_duplicate_kind_rejected() {
        let mut registry = KindRegistry::new();
        registry.register::<Alpha>(Registration::new()).unwrap();

        let err = registry.register::<Beta>(Registration::new()).unwrap_err();
        assert!(matches!(err, Error::DuplicateKind { name: "Alpha", .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registration_dedups_dependencies() {
        let registration = Registration::new()
            .depends_on::<Alpha>()
            .depends_on_kind(KindId::new(1))
            .phases(Phase::PostSimulation);

        assert_eq!(registration.dependencies.as_slice(), &[KindId::new(1)]);
        assert_eq!(registration.phases, PhaseSet::POST_SIMULATION);
    }
}
