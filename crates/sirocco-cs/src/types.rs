//! Plain value types carried inside command records and replicated state.
//!
//! Everything here is `#[repr(C)]` and padding-free so it can be embedded in
//! `Pod` records and copied through the ring byte-for-byte.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use thiserror::Error;

/// Normalized RGBA color.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const TRANSPARENT_BLACK: Self = Self {
        r: 0.0,
        g: 0.0,
        b: 0.0,
        a: 0.0,
    };

    pub const WHITE: Self = Self {
        r: 1.0,
        g: 1.0,
        b: 1.0,
        a: 1.0,
    };
}

/// Integer rectangle, edges exclusive on the right/bottom.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RectI {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl RectI {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }
}

/// Render-target viewport.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub min_z: f32,
    pub max_z: f32,
}

/// Row-major 4x4 transform matrix.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Matrix {
    pub m: [f32; 16],
}

impl Matrix {
    pub const IDENTITY: Self = Self {
        m: [
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ],
    };
}

impl Default for Matrix {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Fixed-function material description.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Material {
    pub diffuse: Color,
    pub ambient: Color,
    pub specular: Color,
    pub emissive: Color,
    pub power: f32,
}

/// Fixed-function light description.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Light {
    /// One of [`LIGHT_POINT`], [`LIGHT_SPOT`], [`LIGHT_DIRECTIONAL`].
    pub kind: u32,
    pub diffuse: Color,
    pub specular: Color,
    pub ambient: Color,
    pub position: [f32; 3],
    pub direction: [f32; 3],
    pub range: f32,
    pub falloff: f32,
    pub attenuation: [f32; 3],
    pub theta: f32,
    pub phi: f32,
}

pub const LIGHT_POINT: u32 = 1;
pub const LIGHT_SPOT: u32 = 2;
pub const LIGHT_DIRECTIONAL: u32 = 3;

/// Primitive topologies supported by draw calls.
///
/// A semantic enum rather than raw API constants, so the rest of the stream
/// stays platform-independent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
    TriangleFan,
}

impl PrimitiveType {
    pub(crate) fn to_u32(self) -> u32 {
        match self {
            Self::PointList => 0,
            Self::LineList => 1,
            Self::LineStrip => 2,
            Self::TriangleList => 3,
            Self::TriangleStrip => 4,
            Self::TriangleFan => 5,
        }
    }

    pub(crate) fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::PointList,
            1 => Self::LineList,
            2 => Self::LineStrip,
            3 => Self::TriangleList,
            4 => Self::TriangleStrip,
            5 => Self::TriangleFan,
            _ => return None,
        })
    }
}

/// Index element width.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    #[default]
    Uint16,
    Uint32,
}

impl IndexFormat {
    pub(crate) fn to_u32(self) -> u32 {
        match self {
            Self::Uint16 => 0,
            Self::Uint32 => 1,
        }
    }

    pub(crate) fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::Uint16,
            1 => Self::Uint32,
            _ => return None,
        })
    }
}

/// Programmable shader stages addressable by the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderType {
    Vertex,
    Pixel,
}

bitflags! {
    /// What a clear operation touches.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ClearFlags: u32 {
        const TARGET = 1 << 0;
        const ZBUFFER = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

bitflags! {
    /// Access intent for a resource map.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const DISCARD = 1 << 2;
        const NO_OVERWRITE = 1 << 3;
    }
}

bitflags! {
    /// Modifiers for query readback.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct QueryFlags: u32 {
        /// Flush pending work while polling.
        const FLUSH = 1 << 0;
    }
}

/// Why a map round-trip failed.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum MapError {
    #[error("resource cannot be mapped")]
    Unmappable,
    #[error("resource is busy")]
    Busy,
}

impl MapError {
    pub(crate) fn to_code(self) -> u32 {
        match self {
            Self::Unmappable => 1,
            Self::Busy => 2,
        }
    }

    pub(crate) fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => Self::Unmappable,
            2 => Self::Busy,
            _ => return None,
        })
    }
}
