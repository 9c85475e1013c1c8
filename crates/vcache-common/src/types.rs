//! Core type definitions for the vcache asset store
//!
//! Blobs are addressed by a `BlobKey`: a 128-bit asset identifier plus a
//! small enumerated asset kind. Keys order by id first, then kind.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for an asset
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into)]
pub struct AssetId(Uuid);

impl AssetId {
    /// Generate a new random asset ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The nil id, reserved as "invalid"
    #[must_use]
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Check whether this is the reserved nil id
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Get as bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Create from bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for AssetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AssetId({})", self.0)
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind tag for stored assets
///
/// The discriminant is the value written to disk; it must stay stable.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(i16)]
pub enum AssetKind {
    Texture = 0,
    Audio = 1,
    Animation = 2,
    Mesh = 3,
    Material = 4,
    Script = 5,
    Settings = 6,
    Blob = 7,
}

impl AssetKind {
    /// Number of defined kinds
    pub const COUNT: i16 = 8;

    /// The on-disk tag value
    #[must_use]
    pub const fn as_i16(self) -> i16 {
        self as i16
    }

    /// File extension used when bulk-exporting blobs of this kind
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Texture => "tex",
            Self::Audio => "audio",
            Self::Animation => "anim",
            Self::Mesh => "mesh",
            Self::Material => "mtl",
            Self::Script => "script",
            Self::Settings => "settings",
            Self::Blob => "data",
        }
    }
}

impl TryFrom<i16> for AssetKind {
    type Error = i16;

    fn try_from(value: i16) -> std::result::Result<Self, i16> {
        match value {
            0 => Ok(Self::Texture),
            1 => Ok(Self::Audio),
            2 => Ok(Self::Animation),
            3 => Ok(Self::Mesh),
            4 => Ok(Self::Material),
            5 => Ok(Self::Script),
            6 => Ok(Self::Settings),
            7 => Ok(Self::Blob),
            other => Err(other),
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Texture => "texture",
            Self::Audio => "audio",
            Self::Animation => "animation",
            Self::Mesh => "mesh",
            Self::Material => "material",
            Self::Script => "script",
            Self::Settings => "settings",
            Self::Blob => "blob",
        };
        write!(f, "{name}")
    }
}

/// Identity of a stored blob: asset id plus kind
///
/// Field order matters: ordering compares id first, then kind.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlobKey {
    pub id: AssetId,
    pub kind: AssetKind,
}

impl BlobKey {
    /// Create a new blob key
    #[must_use]
    pub const fn new(id: AssetId, kind: AssetKind) -> Self {
        Self { id, kind }
    }
}

impl fmt::Debug for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobKey({}:{})", self.id, self.kind)
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.kind)
    }
}
