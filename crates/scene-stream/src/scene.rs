//! Scene capture, encoding and instantiation.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rustc_hash::FxHashMap;
use scene_core::{KindId, ObjectHandle, ObjectSpawn, PendingComponent, Transform, World};
use tracing::{debug, info, warn};

use crate::{
    error::{StreamError, StreamResult},
    format::{
        COMPONENT_TABLE_VERSION, Decode, Encode, HEADER_VERSION, MAGIC, NO_PARENT,
        OBJECT_TABLE_VERSION, read_bool, read_name, read_version, write_name,
    },
};

/// Objects reserved up front when reading; larger tables grow as they decode.
const MAX_PREALLOCATE: usize = 4096;

/// Serialized component payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneComponent {
    pub kind: KindId,
    pub version: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SceneObject {
    /// Position-independent id used to link parents.
    pub ordinal: u32,
    pub parent: Option<u32>,
    pub name: Option<String>,
    pub active: bool,
    pub transform: Transform,
    pub components: Vec<SceneComponent>,
}

/// Decoded object graph, detached from any world.
///
/// Parents always appear before their children.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scene {
    pub objects: Vec<SceneObject>,
}

impl Scene {
    /// Snapshot every live object in `world`.
    ///
    /// Objects are ordered depth first: roots in index order, children in
    /// hierarchy order.
    pub fn capture(world: &World) -> StreamResult<Self> {
        let store = world.objects();
        let mut objects = Vec::with_capacity(store.len());
        let mut stack: Vec<(ObjectHandle, Option<u32>)> = Vec::new();

        let roots: Vec<_> = store.roots().collect();
        for root in roots.into_iter().rev() {
            stack.push((root, None));
        }

        while let Some((handle, parent)) = stack.pop() {
            let object = store
                .get(handle)
                .ok_or_else(|| StreamError::World(scene_core::Error::NotFound(handle.raw())))?;
            let ordinal = u32::try_from(objects.len())
                .ok()
                .filter(|&ordinal| ordinal != NO_PARENT)
                .ok_or_else(|| StreamError::Corrupt("too many objects for one stream".into()))?;

            let mut components = Vec::with_capacity(object.components().len());
            for &component in object.components() {
                let mut payload = Vec::new();
                let version = world.serialize_component(component, &mut payload)?;
                components.push(SceneComponent {
                    kind: component.kind(),
                    version,
                    payload,
                });
            }

            objects.push(SceneObject {
                ordinal,
                parent,
                name: object.name().map(str::to_owned),
                active: object.is_active(),
                transform: object.local_transform(),
                components,
            });

            for &child in object.children().iter().rev() {
                stack.push((child, Some(ordinal)));
            }
        }

        debug!(objects = objects.len(), "captured scene");
        Ok(Self { objects })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Check that ordinals are unique and every parent precedes its child.
    fn validate(&self) -> StreamResult<()> {
        let mut seen = FxHashMap::default();
        for (position, object) in self.objects.iter().enumerate() {
            if object.ordinal == NO_PARENT {
                return Err(StreamError::Corrupt(format!(
                    "object {position} uses the reserved ordinal"
                )));
            }
            if let Some(parent) = object.parent.filter(|parent| !seen.contains_key(parent)) {
                return Err(StreamError::Corrupt(format!(
                    "object {} refers to parent {parent} before it is defined",
                    object.ordinal
                )));
            }
            if seen.insert(object.ordinal, position).is_some() {
                return Err(StreamError::Corrupt(format!(
                    "duplicate ordinal {}",
                    object.ordinal
                )));
            }
        }
        Ok(())
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> StreamResult<()> {
        self.validate()?;
        let count = u32::try_from(self.objects.len())
            .map_err(|_| StreamError::Corrupt("too many objects for one stream".into()))?;

        writer.write_all(&MAGIC)?;
        writer.write_u16::<LittleEndian>(HEADER_VERSION)?;
        writer.write_u32::<LittleEndian>(count)?;

        writer.write_u16::<LittleEndian>(OBJECT_TABLE_VERSION)?;
        for object in &self.objects {
            writer.write_u32::<LittleEndian>(object.ordinal)?;
            writer.write_u32::<LittleEndian>(object.parent.unwrap_or(NO_PARENT))?;
            object.transform.encode(writer)?;
            write_name(writer, object.name.as_deref())?;
            writer.write_u8(u8::from(object.active))?;
        }

        writer.write_u16::<LittleEndian>(COMPONENT_TABLE_VERSION)?;
        for object in &self.objects {
            let count = u32::try_from(object.components.len())
                .map_err(|_| StreamError::Corrupt("too many components on one object".into()))?;
            writer.write_u32::<LittleEndian>(count)?;
            for component in &object.components {
                component.encode(writer)?;
            }
        }

        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> StreamResult<Self> {
        let mut magic = [0; 4];
        reader.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(StreamError::Corrupt(format!("bad magic {magic:02x?}")));
        }
        read_version(reader, "header", HEADER_VERSION)?;
        let count = reader.read_u32::<LittleEndian>()? as usize;

        let table_version = read_version(reader, "object table", OBJECT_TABLE_VERSION)?;
        if table_version < OBJECT_TABLE_VERSION {
            debug!(version = table_version, "migrating object table");
        }

        let mut objects = Vec::with_capacity(count.min(MAX_PREALLOCATE));
        for _ in 0..count {
            let ordinal = reader.read_u32::<LittleEndian>()?;
            let parent = match reader.read_u32::<LittleEndian>()? {
                NO_PARENT => None,
                parent => Some(parent),
            };
            let transform = Transform::decode(reader)?;
            let (name, active) = if table_version >= 2 {
                (read_name(reader)?, read_bool(reader)?)
            } else {
                (None, true)
            };

            objects.push(SceneObject {
                ordinal,
                parent,
                name,
                active,
                transform,
                components: Vec::new(),
            });
        }

        read_version(reader, "component table", COMPONENT_TABLE_VERSION)?;
        for object in &mut objects {
            let components = reader.read_u32::<LittleEndian>()? as usize;
            object.components.reserve(components.min(MAX_PREALLOCATE));
            for _ in 0..components {
                object.components.push(SceneComponent::decode(reader)?);
            }
        }

        let scene = Self { objects };
        scene.validate()?;
        Ok(scene)
    }

    /// Create every object of the scene in `world` under fresh handles.
    ///
    /// All payloads are decoded before the world is touched. If creation fails
    /// part way, the objects created so far are discarded and never show up
    /// as invalidated. Returns the new handles in scene order.
    pub fn instantiate(&self, world: &mut World) -> StreamResult<Vec<ObjectHandle>> {
        self.validate()?;

        let mut decoded: Vec<Vec<PendingComponent>> = Vec::with_capacity(self.objects.len());
        for object in &self.objects {
            let mut pending = Vec::with_capacity(object.components.len());
            for component in &object.components {
                let value = world
                    .decode_component(component.kind, component.version, &component.payload)
                    .map_err(|err| match err {
                        scene_core::Error::Corrupt(reason) => StreamError::Corrupt(format!(
                            "object {}: {reason}",
                            object.ordinal
                        )),
                        other => StreamError::World(other),
                    })?;
                pending.push(value);
            }
            decoded.push(pending);
        }

        let mut handles: FxHashMap<u32, ObjectHandle> = FxHashMap::default();
        let mut created = Vec::with_capacity(self.objects.len());

        for (object, components) in self.objects.iter().zip(decoded) {
            let mut spawn = ObjectSpawn::new().local(object.transform);
            if let Some(name) = &object.name {
                spawn = spawn.name(name.clone());
            }
            if !object.active {
                spawn = spawn.inactive();
            }
            if let Some(parent) = object.parent.and_then(|parent| handles.get(&parent)) {
                spawn = spawn.parent(*parent);
            }
            for component in components {
                spawn = spawn.with_pending(component);
            }

            match world.spawn(spawn) {
                Ok(handle) => {
                    handles.insert(object.ordinal, handle);
                    created.push(handle);
                }
                Err(err) => {
                    warn!(ordinal = object.ordinal, %err, "scene instantiation failed, rolling back");
                    self.roll_back(world, &created);
                    return Err(err.into());
                }
            }
        }

        info!(objects = created.len(), "instantiated scene");
        Ok(created)
    }

    fn roll_back(&self, world: &mut World, created: &[ObjectHandle]) {
        let roots = self
            .objects
            .iter()
            .zip(created)
            .filter(|(object, _)| object.parent.is_none());
        for (_, &handle) in roots {
            if let Err(err) = world.discard_object(handle) {
                warn!(%err, "failed to remove partially loaded object");
            }
        }
    }
}

/// Write every live object of `world`.
pub fn save<W: Write>(world: &World, writer: &mut W) -> StreamResult<()> {
    let scene = Scene::capture(world)?;
    scene.write_to(writer)?;
    info!(objects = scene.len(), "saved scene");
    Ok(())
}

/// Decode a stream without touching any world.
pub fn read_scene<R: Read>(reader: &mut R) -> StreamResult<Scene> {
    Scene::read_from(reader)
}

/// Load a stream into `world`, which need not be empty.
pub fn load<R: Read>(world: &mut World, reader: &mut R) -> StreamResult<Vec<ObjectHandle>> {
    Scene::read_from(reader)?.instantiate(world)
}
