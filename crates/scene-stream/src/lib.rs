#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

//! Versioned streams of scene-core object graphs.
//!
//! A stream is a header followed by two tables, each with its own version:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Header           magic, stream version, object count        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Object table     ordinal, parent ordinal, transform,        │
//! │                   name, active flag                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Component table  per object: (kind, version, payload)*      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Parents are referenced by ordinal, never by handle. Loading allocates
//! fresh handles in the destination world, which may already contain objects.
//! A stream that fails to decode leaves the destination untouched.
//!
//! # Usage
//!
//! ```ignore
//! let mut bytes = Vec::new();
//! scene_stream::save(&world, &mut bytes)?;
//!
//! let mut other = World::new(&registry, WorldConfig::default())?;
//! let handles = scene_stream::load(&mut other, &mut bytes.as_slice())?;
//! ```

mod error;
mod format;
mod scene;

use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

use scene_core::{ObjectHandle, World};

pub use error::{StreamError, StreamResult};
pub use format::{COMPONENT_TABLE_VERSION, HEADER_VERSION, MAGIC, OBJECT_TABLE_VERSION};
pub use scene::{Scene, SceneComponent, SceneObject, load, read_scene, save};

/// Save `world` to a file, replacing it if it exists.
pub fn save_to_path(world: &World, path: impl AsRef<Path>) -> StreamResult<()> {
    let mut writer = BufWriter::new(File::create(path.as_ref())?);
    save(world, &mut writer)?;
    writer.flush()?;
    Ok(())
}

/// Load a file written by [`save_to_path`] into `world`.
pub fn load_from_path(world: &mut World, path: impl AsRef<Path>) -> StreamResult<Vec<ObjectHandle>> {
    let mut reader = BufReader::new(File::open(path.as_ref())?);
    load(world, &mut reader)
}
