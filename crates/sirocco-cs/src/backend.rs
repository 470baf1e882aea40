//! The rendering backend surface invoked by command handlers.
//!
//! The stream defers *when* operations run, never *how*; everything that
//! touches an actual graphics context goes through this trait. Handlers call
//! it from the consumer worker (or inline in single-threaded mode), always
//! after the replicated state has been updated for the record being
//! dispatched.

use crate::resource::Resource;
use crate::state::DeviceState;
use crate::types::{ClearFlags, Color, MapError, MapFlags, QueryFlags, RectI, ShaderType};

/// Identifies a cached state entry a handler just made stale.
///
/// Mirrors the granularity the handlers mutate state at; a backend with no
/// state cache can ignore these entirely.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateBinding {
    Framebuffer,
    Viewport,
    ScissorRect,
    RenderState(u32),
    TextureStage { stage: u32, state: u32 },
    Sampler(u32),
    Transform(u32),
    ClipPlane(u32),
    Material,
    Light(u32),
    VertexDeclaration,
    StreamSource(u32),
    StreamSourceFreq(u32),
    IndexBuffer,
    Shader(ShaderType),
    ShaderConstants {
        shader: ShaderType,
        start_register: u32,
        vec4_count: u32,
    },
    BaseVertexIndex,
    PrimitiveType,
}

/// Draw parameters, mirroring the deferred draw record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawParams {
    pub start_idx: u32,
    pub index_count: u32,
    pub start_instance: u32,
    pub instance_count: u32,
    pub indexed: bool,
}

/// Rendering backend consumed by the dispatch loop.
///
/// `Send` because in multi-threaded mode the backend moves to the worker
/// thread at stream creation and stays there for the stream's lifetime.
pub trait Backend: Send + 'static {
    /// A state-cache entry became stale.
    fn invalidate(&mut self, binding: StateBinding);

    fn draw(&mut self, state: &DeviceState, params: &DrawParams);

    fn clear(
        &mut self,
        state: &DeviceState,
        rects: &[RectI],
        flags: ClearFlags,
        color: Color,
        depth: f32,
        stencil: u32,
    );

    fn present(
        &mut self,
        state: &DeviceState,
        swapchain: &Resource,
        src_rect: Option<&RectI>,
        dst_rect: Option<&RectI>,
        flags: u32,
    );

    fn blt(
        &mut self,
        dst: &Resource,
        dst_rect: &RectI,
        src: &Resource,
        src_rect: &RectI,
        flags: u32,
    );

    fn color_fill(&mut self, surface: &Resource, rect: Option<&RectI>, color: Color);

    /// Map `size` bytes at `offset`; returns an opaque mapping token the
    /// device layer knows how to turn into memory.
    fn map(
        &mut self,
        resource: &Resource,
        offset: u64,
        size: u64,
        flags: MapFlags,
    ) -> Result<u64, MapError>;

    fn unmap(&mut self, resource: &Resource) -> Result<(), MapError>;

    fn issue_query(&mut self, query: &Resource, flags: QueryFlags);

    /// Poll a query; `None` while the result is not yet available.
    fn read_query(&mut self, query: &Resource, flags: QueryFlags) -> Option<u64>;

    /// A range of a buffer's backing store is about to be rewritten.
    fn invalidate_buffer_range(&mut self, buffer: &Resource, offset: u64, size: u64);

    /// Drain everything previously handed to the device; returns once the
    /// device is idle.
    fn finish(&mut self);
}
