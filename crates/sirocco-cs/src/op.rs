//! Command record encoding.
//!
//! Every record is a `#[repr(C)]` `Pod` struct whose first field is the
//! opcode as a little-endian-neutral `u32`, optionally followed in the ring
//! by a trailing payload whose length is computable from the fixed fields
//! alone (`rect_count`, `vec4_count`). 8-byte fields sit on 8-byte offsets
//! with explicit `_pad` words so the structs have no implicit padding.
//!
//! Out-of-band references (fences, result slots, resources) travel as `u64`
//! addresses. The emitting call either blocks until the consumer has signaled
//! the referenced object (fences, slots) or requires the resource to stay
//! alive while records referencing it are in flight; the stream itself never
//! owns what the addresses point at.

use bytemuck::{Pod, Zeroable};

use crate::types::{Color, Light, Material, Matrix, RectI, Viewport};

/// Record alignment inherited from the ring; all record sizes are multiples
/// of this.
pub(crate) const RECORD_ALIGN: usize = sirocco_ring::RECORD_ALIGN;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum Opcode {
    /// Padding, header only. Zero-filled storage decodes as a run of these.
    Nop = 0,
    /// Padding with an explicit total size.
    Skip = 1,
    /// Terminal; no record may follow it.
    Stop = 2,
    Fence = 3,

    Present = 0x10,
    Clear = 0x11,
    Draw = 0x12,
    Blt = 0x13,
    ColorFill = 0x14,

    SetRenderTarget = 0x20,
    SetDepthStencil = 0x21,
    SetViewport = 0x22,
    SetScissorRect = 0x23,
    SetRenderState = 0x24,
    SetTextureStageState = 0x25,
    SetSamplerState = 0x26,
    SetTexture = 0x27,
    SetVertexShader = 0x28,
    SetPixelShader = 0x29,
    SetVsConstsF = 0x2A,
    SetPsConstsF = 0x2B,
    SetTransform = 0x2C,
    SetClipPlane = 0x2D,
    SetMaterial = 0x2E,
    SetLight = 0x2F,
    SetLightEnable = 0x30,
    SetVertexDeclaration = 0x31,
    SetStreamSource = 0x32,
    SetStreamSourceFreq = 0x33,
    SetIndexBuffer = 0x34,
    SetBaseVertexIndex = 0x35,
    SetPrimitiveType = 0x36,
    ResetState = 0x37,

    IssueQuery = 0x40,
    GetQueryData = 0x41,
    Map = 0x42,
    Unmap = 0x43,
    InvalidateBufferRange = 0x44,
    Finish = 0x45,
}

impl Opcode {
    pub(crate) fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::Nop,
            1 => Self::Skip,
            2 => Self::Stop,
            3 => Self::Fence,
            0x10 => Self::Present,
            0x11 => Self::Clear,
            0x12 => Self::Draw,
            0x13 => Self::Blt,
            0x14 => Self::ColorFill,
            0x20 => Self::SetRenderTarget,
            0x21 => Self::SetDepthStencil,
            0x22 => Self::SetViewport,
            0x23 => Self::SetScissorRect,
            0x24 => Self::SetRenderState,
            0x25 => Self::SetTextureStageState,
            0x26 => Self::SetSamplerState,
            0x27 => Self::SetTexture,
            0x28 => Self::SetVertexShader,
            0x29 => Self::SetPixelShader,
            0x2A => Self::SetVsConstsF,
            0x2B => Self::SetPsConstsF,
            0x2C => Self::SetTransform,
            0x2D => Self::SetClipPlane,
            0x2E => Self::SetMaterial,
            0x2F => Self::SetLight,
            0x30 => Self::SetLightEnable,
            0x31 => Self::SetVertexDeclaration,
            0x32 => Self::SetStreamSource,
            0x33 => Self::SetStreamSourceFreq,
            0x34 => Self::SetIndexBuffer,
            0x35 => Self::SetBaseVertexIndex,
            0x36 => Self::SetPrimitiveType,
            0x37 => Self::ResetState,
            0x40 => Self::IssueQuery,
            0x41 => Self::GetQueryData,
            0x42 => Self::Map,
            0x43 => Self::Unmap,
            0x44 => Self::InvalidateBufferRange,
            0x45 => Self::Finish,
            _ => return None,
        })
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct NopOp {
    pub opcode: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct SkipOp {
    pub opcode: u32,
    /// Total bytes this record covers, header included.
    pub size: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct StopOp {
    pub opcode: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct FenceOp {
    pub opcode: u32,
    pub _pad: u32,
    /// Address of the producer-owned [`crate::fence::Fence`].
    pub fence: u64,
}

/// `rect_mask` bits selecting which present rectangles are meaningful.
pub(crate) const PRESENT_SRC_RECT: u32 = 1 << 0;
pub(crate) const PRESENT_DST_RECT: u32 = 1 << 1;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct PresentOp {
    pub opcode: u32,
    pub flags: u32,
    pub swapchain: u64,
    pub src_rect: RectI,
    pub dst_rect: RectI,
    pub rect_mask: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct ClearOp {
    pub opcode: u32,
    pub rect_count: u32,
    pub flags: u32,
    pub stencil: u32,
    pub color: Color,
    pub depth: f32,
    pub _pad: u32,
}

impl ClearOp {
    pub(crate) fn encoded_size(rect_count: u32) -> usize {
        core::mem::size_of::<Self>() + rect_count as usize * core::mem::size_of::<RectI>()
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct DrawOp {
    pub opcode: u32,
    pub start_idx: u32,
    pub index_count: u32,
    pub start_instance: u32,
    pub instance_count: u32,
    pub indexed: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct BltOp {
    pub opcode: u32,
    pub flags: u32,
    pub dst: u64,
    pub src: u64,
    pub dst_rect: RectI,
    pub src_rect: RectI,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct ColorFillOp {
    pub opcode: u32,
    /// Non-zero when `rect` limits the fill.
    pub has_rect: u32,
    pub surface: u64,
    pub rect: RectI,
    pub color: Color,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct SetRenderTargetOp {
    pub opcode: u32,
    pub index: u32,
    pub target: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct SetDepthStencilOp {
    pub opcode: u32,
    pub _pad: u32,
    pub surface: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct SetViewportOp {
    pub opcode: u32,
    pub viewport: Viewport,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct SetScissorRectOp {
    pub opcode: u32,
    pub rect: RectI,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct SetRenderStateOp {
    pub opcode: u32,
    pub state: u32,
    pub value: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct SetTextureStageStateOp {
    pub opcode: u32,
    pub stage: u32,
    pub state: u32,
    pub value: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct SetSamplerStateOp {
    pub opcode: u32,
    pub sampler: u32,
    pub state: u32,
    pub value: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct SetTextureOp {
    pub opcode: u32,
    pub stage: u32,
    pub texture: u64,
}

/// Shared by [`Opcode::SetVertexShader`] and [`Opcode::SetPixelShader`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct SetShaderOp {
    pub opcode: u32,
    pub _pad: u32,
    pub shader: u64,
}

/// Shared by [`Opcode::SetVsConstsF`] and [`Opcode::SetPsConstsF`]; the
/// payload is `vec4_count` float quadruples.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct SetConstsFOp {
    pub opcode: u32,
    pub start_register: u32,
    pub vec4_count: u32,
    pub _pad: u32,
}

impl SetConstsFOp {
    pub(crate) fn encoded_size(vec4_count: u32) -> usize {
        core::mem::size_of::<Self>() + vec4_count as usize * core::mem::size_of::<[f32; 4]>()
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct SetTransformOp {
    pub opcode: u32,
    pub state: u32,
    pub matrix: Matrix,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct SetClipPlaneOp {
    pub opcode: u32,
    pub plane_idx: u32,
    pub plane: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct SetMaterialOp {
    pub opcode: u32,
    pub material: Material,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct SetLightOp {
    pub opcode: u32,
    pub light_idx: u32,
    pub light: Light,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct SetLightEnableOp {
    pub opcode: u32,
    pub light_idx: u32,
    pub enable: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct SetVertexDeclarationOp {
    pub opcode: u32,
    pub _pad: u32,
    pub declaration: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct SetStreamSourceOp {
    pub opcode: u32,
    pub stream_idx: u32,
    pub offset: u32,
    pub stride: u32,
    pub buffer: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct SetStreamSourceFreqOp {
    pub opcode: u32,
    pub stream_idx: u32,
    pub frequency: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct SetIndexBufferOp {
    pub opcode: u32,
    pub format: u32,
    pub buffer: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct SetBaseVertexIndexOp {
    pub opcode: u32,
    pub base_vertex_index: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct SetPrimitiveTypeOp {
    pub opcode: u32,
    pub primitive_type: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct ResetStateOp {
    pub opcode: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct IssueQueryOp {
    pub opcode: u32,
    pub flags: u32,
    pub query: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct GetQueryDataOp {
    pub opcode: u32,
    pub flags: u32,
    pub query: u64,
    /// Address of the producer-owned [`crate::fence::QuerySlot`].
    pub slot: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct MapOp {
    pub opcode: u32,
    pub flags: u32,
    pub resource: u64,
    pub offset: u64,
    pub size: u64,
    /// Address of the producer-owned [`crate::fence::MapSlot`].
    pub slot: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct UnmapOp {
    pub opcode: u32,
    pub _pad: u32,
    pub resource: u64,
    /// Address of the producer-owned [`crate::fence::MapSlot`]; only the
    /// status word is filled.
    pub slot: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct InvalidateBufferRangeOp {
    pub opcode: u32,
    pub _pad: u32,
    pub buffer: u64,
    pub offset: u64,
    pub size: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct FinishOp {
    pub opcode: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_are_aligned() {
        // Every fixed record size must be a multiple of the ring alignment,
        // or the padding discipline at the physical wrap point breaks.
        for size in [
            core::mem::size_of::<NopOp>(),
            core::mem::size_of::<SkipOp>(),
            core::mem::size_of::<StopOp>(),
            core::mem::size_of::<FenceOp>(),
            core::mem::size_of::<PresentOp>(),
            core::mem::size_of::<ClearOp>(),
            core::mem::size_of::<DrawOp>(),
            core::mem::size_of::<BltOp>(),
            core::mem::size_of::<ColorFillOp>(),
            core::mem::size_of::<SetRenderTargetOp>(),
            core::mem::size_of::<SetDepthStencilOp>(),
            core::mem::size_of::<SetViewportOp>(),
            core::mem::size_of::<SetScissorRectOp>(),
            core::mem::size_of::<SetRenderStateOp>(),
            core::mem::size_of::<SetTextureStageStateOp>(),
            core::mem::size_of::<SetSamplerStateOp>(),
            core::mem::size_of::<SetTextureOp>(),
            core::mem::size_of::<SetShaderOp>(),
            core::mem::size_of::<SetConstsFOp>(),
            core::mem::size_of::<SetTransformOp>(),
            core::mem::size_of::<SetClipPlaneOp>(),
            core::mem::size_of::<SetMaterialOp>(),
            core::mem::size_of::<SetLightOp>(),
            core::mem::size_of::<SetLightEnableOp>(),
            core::mem::size_of::<SetVertexDeclarationOp>(),
            core::mem::size_of::<SetStreamSourceOp>(),
            core::mem::size_of::<SetStreamSourceFreqOp>(),
            core::mem::size_of::<SetIndexBufferOp>(),
            core::mem::size_of::<SetBaseVertexIndexOp>(),
            core::mem::size_of::<SetPrimitiveTypeOp>(),
            core::mem::size_of::<ResetStateOp>(),
            core::mem::size_of::<IssueQueryOp>(),
            core::mem::size_of::<GetQueryDataOp>(),
            core::mem::size_of::<MapOp>(),
            core::mem::size_of::<UnmapOp>(),
            core::mem::size_of::<InvalidateBufferRangeOp>(),
            core::mem::size_of::<FinishOp>(),
        ] {
            assert_eq!(size % RECORD_ALIGN, 0, "record size {size} misaligned");
        }
    }

    #[test]
    fn nop_is_header_only() {
        assert_eq!(core::mem::size_of::<NopOp>(), RECORD_ALIGN);
    }

    #[test]
    fn opcode_round_trips() {
        for raw in 0..0x50u32 {
            if let Some(op) = Opcode::from_u32(raw) {
                assert_eq!(op as u32, raw);
            }
        }
        assert_eq!(Opcode::from_u32(0xDEAD), None);
    }
}
