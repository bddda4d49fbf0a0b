//! Wire format.
//!
//! All integers and floats are little-endian.
//!
//! ```text
//! magic               b"SCNS"
//! header section      u16 version, u32 object count
//! object table        u16 version, per object:
//!                       u32 ordinal, u32 parent ordinal (NO_PARENT for roots),
//!                       transform (3 f32 translation, 4 f32 quaternion ijkw, f32 scale),
//!                       v2+: u8 has_name [u32 len, utf-8 bytes], u8 active
//! component table     u16 version, per object in object table order:
//!                       u32 count, per component:
//!                         u16 kind, u16 payload version, u32 len, payload bytes
//! ```

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use scene_core::{
    KindId, Transform,
    nalgebra::{Quaternion, UnitQuaternion, Vector3},
};

use crate::{
    error::{StreamError, StreamResult},
    scene::SceneComponent,
};

pub const MAGIC: [u8; 4] = *b"SCNS";

pub const HEADER_VERSION: u16 = 1;
/// v1 had no name or active flag.
pub const OBJECT_TABLE_VERSION: u16 = 2;
pub const COMPONENT_TABLE_VERSION: u16 = 1;

pub const NO_PARENT: u32 = u32::MAX;

/// Rotations shorter than this carry no direction and cannot be normalized.
const MIN_ROTATION_NORM: f32 = 1e-6;

/// Longest name or payload accepted when reading.
pub const MAX_BLOB: u32 = 64 << 20;

pub trait Encode {
    fn encode<W: Write>(&self, writer: &mut W) -> StreamResult<()>;
}

pub trait Decode: Sized {
    fn decode<R: Read>(reader: &mut R) -> StreamResult<Self>;
}

impl Encode for Transform {
    fn encode<W: Write>(&self, writer: &mut W) -> StreamResult<()> {
        for v in self.translation.iter() {
            writer.write_f32::<LittleEndian>(*v)?;
        }
        for v in self.rotation.coords.iter() {
            writer.write_f32::<LittleEndian>(*v)?;
        }
        writer.write_f32::<LittleEndian>(self.scale)?;
        Ok(())
    }
}

impl Decode for Transform {
    fn decode<R: Read>(reader: &mut R) -> StreamResult<Self> {
        let mut f = [0f32; 7];
        reader.read_f32_into::<LittleEndian>(&mut f)?;
        let scale = reader.read_f32::<LittleEndian>()?;

        if f.iter().chain([&scale]).any(|v| !v.is_finite()) {
            return Err(StreamError::Corrupt("non-finite transform".into()));
        }
        let [x, y, z, i, j, k, w] = f;
        // Composed rotations drift from unit length.
        let rotation = Quaternion::new(w, i, j, k);
        if rotation.norm() < MIN_ROTATION_NORM {
            return Err(StreamError::Corrupt("zero-length rotation".into()));
        }

        Ok(Self {
            translation: Vector3::new(x, y, z),
            rotation: UnitQuaternion::from_quaternion(rotation),
            scale,
        })
    }
}

impl Encode for SceneComponent {
    fn encode<W: Write>(&self, writer: &mut W) -> StreamResult<()> {
        writer.write_u16::<LittleEndian>(self.kind.get())?;
        writer.write_u16::<LittleEndian>(self.version)?;
        write_blob(writer, &self.payload)
    }
}

impl Decode for SceneComponent {
    fn decode<R: Read>(reader: &mut R) -> StreamResult<Self> {
        let kind = KindId::new(reader.read_u16::<LittleEndian>()?);
        let version = reader.read_u16::<LittleEndian>()?;
        let payload = read_blob(reader)?;
        Ok(Self {
            kind,
            version,
            payload,
        })
    }
}

pub fn write_blob<W: Write>(writer: &mut W, bytes: &[u8]) -> StreamResult<()> {
    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|&len| len <= MAX_BLOB)
        .ok_or_else(|| StreamError::Corrupt(format!("blob of {} bytes is too large", bytes.len())))?;
    writer.write_u32::<LittleEndian>(len)?;
    writer.write_all(bytes)?;
    Ok(())
}

pub fn read_blob<R: Read>(reader: &mut R) -> StreamResult<Vec<u8>> {
    let len = reader.read_u32::<LittleEndian>()?;
    if len > MAX_BLOB {
        return Err(StreamError::Corrupt(format!("blob length {len} exceeds limit")));
    }
    let mut bytes = Vec::new();
    reader.take(u64::from(len)).read_to_end(&mut bytes)?;
    if bytes.len() != len as usize {
        return Err(StreamError::Corrupt("unexpected end of stream".into()));
    }
    Ok(bytes)
}

pub fn write_name<W: Write>(writer: &mut W, name: Option<&str>) -> StreamResult<()> {
    match name {
        Some(name) => {
            writer.write_u8(1)?;
            write_blob(writer, name.as_bytes())
        }
        None => {
            writer.write_u8(0)?;
            Ok(())
        }
    }
}

pub fn read_name<R: Read>(reader: &mut R) -> StreamResult<Option<String>> {
    match reader.read_u8()? {
        0 => Ok(None),
        1 => String::from_utf8(read_blob(reader)?)
            .map(Some)
            .map_err(|err| StreamError::Corrupt(format!("object name: {err}"))),
        other => Err(StreamError::Corrupt(format!("invalid name flag {other}"))),
    }
}

pub fn read_bool<R: Read>(reader: &mut R) -> StreamResult<bool> {
    match reader.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(StreamError::Corrupt(format!("invalid flag {other}"))),
    }
}

/// Read a section version, rejecting anything newer than `current`.
pub fn read_version<R: Read>(
    reader: &mut R,
    section: &'static str,
    current: u16,
) -> StreamResult<u16> {
    let version = reader.read_u16::<LittleEndian>()?;
    if version == 0 || version > current {
        return Err(StreamError::UnsupportedVersion { section, version });
    }
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_bytes() {
        let t = Transform::from_translation(Vector3::new(1.0, 2.0, 3.0)).with_scale(0.5);
        let mut bytes = Vec::new();
        t.encode(&mut bytes).unwrap();
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[..4], &1.0f32.to_le_bytes());
        // Identity quaternion stored as i, j, k, w.
        assert_eq!(&bytes[24..28], &1.0f32.to_le_bytes());

        let back = Transform::decode(&mut bytes.as_slice()).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn test_transform_rejects_garbage() {
        let mut bytes = Vec::new();
        for v in [0.0f32, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        assert!(matches!(
            Transform::decode(&mut bytes.as_slice()),
            Err(StreamError::Corrupt(_))
        ));

        let nan = [f32::NAN.to_le_bytes(); 8].concat();
        assert!(matches!(
            Transform::decode(&mut nan.as_slice()),
            Err(StreamError::Corrupt(_))
        ));
    }

    #[test]
    fn test_transform_renormalizes_drifted_rotation() {
        let mut bytes = Vec::new();
        for v in [0.0f32, 0.0, 0.0, 0.0, 0.0, 0.6, 0.8 * 1.01, 1.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let back = Transform::decode(&mut bytes.as_slice()).unwrap();
        assert!((back.rotation.quaternion().norm() - 1.0).abs() < 1e-6);
        assert!(back.rotation.k > 0.5);
    }

    #[test]
    fn test_blob_truncated() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&10u32.to_le_bytes());
        bytes.extend_from_slice(&[1, 2, 3]);
        assert!(matches!(
            read_blob(&mut bytes.as_slice()),
            Err(StreamError::Corrupt(_))
        ));
    }

    #[test]
    fn test_newer_section_rejected() {
        let bytes = 9u16.to_le_bytes();
        assert!(matches!(
            read_version(&mut bytes.as_slice(), "object table", OBJECT_TABLE_VERSION),
            Err(StreamError::UnsupportedVersion {
                section: "object table",
                version: 9
            })
        ));
    }
}
