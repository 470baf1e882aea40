//! `sirocco-cs` is a deferred graphics command stream.
//!
//! A producer thread records state changes and draw/present operations as
//! type-tagged, variable-length records in bounded SPSC ring channels
//! (transport in [`sirocco_ring`]); a single consumer worker thread that owns
//! the rendering backend drains them in FIFO order, mutating a replicated
//! copy of the pipeline state and invoking the backend. Expensive graphics
//! work never stalls the calling thread except where it explicitly
//! synchronizes:
//!
//! - [`CommandStream::flush_and_wait`] rendezvous on a one-shot fence;
//! - [`CommandStream::get_query_data`] / [`CommandStream::map`] /
//!   [`CommandStream::unmap`] ride a separate priority channel so a backlog
//!   of ordinary commands cannot delay them;
//! - [`CommandStream::present`] is throttled to one frame in flight.
//!
//! [`ExecutionMode::SingleThreaded`] removes the worker and dispatches each
//! record inline at submit time, with identical observable effects.

mod backend;
mod channel;
mod fence;
mod op;
mod resource;
mod state;
mod stream;
mod types;
mod worker;

pub use backend::{Backend, DrawParams, StateBinding};
pub use resource::{Resource, ResourceKind, ResourceRef};
pub use state::{
    DeviceState, LightEntry, StreamSource, MAX_CLIP_PLANES, MAX_RENDER_TARGETS, MAX_SAMPLERS,
    MAX_SHADER_CONSTS, MAX_STREAMS, MAX_TEXTURE_STAGES, RENDER_STATE_COUNT,
    SAMPLER_STATE_COUNT, TEXTURE_STAGE_STATE_COUNT, TRANSFORM_COUNT,
};
pub use stream::{
    CommandStream, CreateError, ExecutionMode, StreamConfig, MAX_CHANNEL_CAPACITY,
    MIN_CHANNEL_CAPACITY,
};
pub use types::{
    ClearFlags, Color, IndexFormat, Light, MapError, MapFlags, Material, Matrix, PrimitiveType,
    QueryFlags, RectI, ShaderType, Viewport, LIGHT_DIRECTIONAL, LIGHT_POINT, LIGHT_SPOT,
};
