//! The producer-facing command stream.
//!
//! Every operation follows the same template: reserve space in the right
//! channel, fill in the record, submit. Fire-and-forget operations return as
//! soon as the record is published; synchronous round-trips additionally spin
//! on a fence or result slot. In single-threaded mode there is no worker and
//! no queue: records are assembled in a reusable scratch buffer and
//! dispatched inline by `submit`, which keeps the two modes byte-for-byte
//! identical on the wire and identical in observable effect.

use core::cell::RefCell;
use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytemuck::bytes_of;
use thiserror::Error;
use tracing::{debug, error};

use crate::backend::Backend;
use crate::channel::Channel;
use crate::fence::{spin_wait, Fence, MapSlot, QuerySlot, MAP_STATUS_OK, QUERY_STATUS_READY};
use crate::op::*;
use crate::resource::Resource;
use crate::state::DeviceState;
use crate::types::{
    ClearFlags, Color, IndexFormat, Light, MapError, MapFlags, Material, Matrix, PrimitiveType,
    QueryFlags, RectI, Viewport,
};
use crate::worker::{self, StateMachine};

/// Smallest channel a stream will accept; must comfortably hold the largest
/// record (a full 256-register constant upload is 4112 bytes).
pub const MIN_CHANNEL_CAPACITY: usize = 8 * 1024;
pub const MAX_CHANNEL_CAPACITY: usize = 1 << 30;

const DEFAULT_NORMAL_CAPACITY: usize = 1 << 20;
const DEFAULT_PRIORITY_CAPACITY: usize = 64 * 1024;

/// Whether commands defer to a worker thread or execute inline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    /// No worker; `submit` dispatches inline on the calling thread.
    SingleThreaded,
    /// Commands drain on a dedicated consumer thread.
    MultiThreaded,
}

#[derive(Clone, Copy, Debug)]
pub struct StreamConfig {
    pub mode: ExecutionMode,
    pub normal_capacity: usize,
    pub priority_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::MultiThreaded,
            normal_capacity: DEFAULT_NORMAL_CAPACITY,
            priority_capacity: DEFAULT_PRIORITY_CAPACITY,
        }
    }
}

#[derive(Debug, Error)]
pub enum CreateError {
    #[error(
        "{which} channel capacity {got} must be a power of two in \
         {MIN_CHANNEL_CAPACITY}..={MAX_CHANNEL_CAPACITY}"
    )]
    InvalidCapacity { which: &'static str, got: usize },
    #[error("failed to spawn command stream worker: {0}")]
    Spawn(#[source] std::io::Error),
}

fn validate_capacity(which: &'static str, got: usize) -> Result<(), CreateError> {
    if !got.is_power_of_two() || !(MIN_CHANNEL_CAPACITY..=MAX_CHANNEL_CAPACITY).contains(&got) {
        return Err(CreateError::InvalidCapacity { which, got });
    }
    Ok(())
}

/// The two channels a multi-threaded stream drains.
pub(crate) struct Queues {
    pub(crate) normal: Channel,
    pub(crate) priority: Channel,
}

#[derive(Clone, Copy)]
enum Queue {
    Normal,
    Priority,
}

enum ModeState<B: Backend> {
    SingleThreaded {
        scratch: RefCell<Vec<u8>>,
        machine: RefCell<StateMachine<B>>,
    },
    MultiThreaded {
        queues: Arc<Queues>,
        worker: JoinHandle<DeviceState>,
    },
}

/// A deferred command stream bound to one backend.
///
/// Exactly one thread may use a stream instance as producer; the handle is
/// deliberately not `Sync`. Resources passed to the setters must stay alive
/// while records referencing them are in flight: flush before destroying a
/// bound resource, exactly as the immediate path requires.
pub struct CommandStream<B: Backend> {
    pending_presents: Arc<AtomicU32>,
    mode: Option<ModeState<B>>,
}

fn addr_of(resource: Option<&Resource>) -> u64 {
    resource.map_or(0, |r| r as *const Resource as usize as u64)
}

impl<B: Backend> CommandStream<B> {
    pub fn new(backend: B, config: StreamConfig) -> Result<Self, CreateError> {
        validate_capacity("normal", config.normal_capacity)?;
        validate_capacity("priority", config.priority_capacity)?;

        let pending_presents = Arc::new(AtomicU32::new(0));
        let machine = StateMachine::new(backend, pending_presents.clone());

        let mode = match config.mode {
            ExecutionMode::SingleThreaded => ModeState::SingleThreaded {
                scratch: RefCell::new(Vec::with_capacity(MIN_CHANNEL_CAPACITY)),
                machine: RefCell::new(machine),
            },
            ExecutionMode::MultiThreaded => {
                let queues = Arc::new(Queues {
                    normal: Channel::new(config.normal_capacity),
                    priority: Channel::new(config.priority_capacity),
                });
                let worker_queues = queues.clone();
                let worker = std::thread::Builder::new()
                    .name("sirocco-cs".into())
                    .spawn(move || worker::run(machine, worker_queues))
                    .map_err(CreateError::Spawn)?;
                ModeState::MultiThreaded { queues, worker }
            }
        };

        debug!(mode = ?config.mode, "command stream created");
        Ok(Self {
            pending_presents,
            mode: Some(mode),
        })
    }

    /// Queue one record: fixed part plus optional trailing payload.
    fn queue(&self, queue: Queue, header: &[u8], payload: &[u8]) {
        let total = header.len() + payload.len();
        debug_assert_eq!(total % RECORD_ALIGN, 0);
        match self.mode.as_ref().expect("stream is alive") {
            ModeState::MultiThreaded { queues, .. } => {
                let chan = match queue {
                    Queue::Normal => &queues.normal,
                    Queue::Priority => &queues.priority,
                };
                let buf = chan.require_space(total);
                let (head, tail) = buf.split_at_mut(header.len());
                head.copy_from_slice(header);
                tail.copy_from_slice(payload);
                chan.submit(total);
            }
            ModeState::SingleThreaded { scratch, machine } => {
                let mut buf = scratch.borrow_mut();
                buf.clear();
                buf.extend_from_slice(header);
                buf.extend_from_slice(payload);
                if let Err(err) = machine.borrow_mut().dispatch(&buf) {
                    error!(%err, "inline dispatch rejected a record");
                }
            }
        }
    }

    // --- state setters (fire and forget) ---

    pub fn set_render_state(&self, state: u32, value: u32) {
        let op = SetRenderStateOp {
            opcode: Opcode::SetRenderState as u32,
            state,
            value,
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
    }

    pub fn set_texture_stage_state(&self, stage: u32, state: u32, value: u32) {
        let op = SetTextureStageStateOp {
            opcode: Opcode::SetTextureStageState as u32,
            stage,
            state,
            value,
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
    }

    pub fn set_sampler_state(&self, sampler: u32, state: u32, value: u32) {
        let op = SetSamplerStateOp {
            opcode: Opcode::SetSamplerState as u32,
            sampler,
            state,
            value,
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
    }

    pub fn set_texture(&self, stage: u32, texture: Option<&Resource>) {
        let op = SetTextureOp {
            opcode: Opcode::SetTexture as u32,
            stage,
            texture: addr_of(texture),
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
    }

    pub fn set_vertex_shader(&self, shader: Option<&Resource>) {
        let op = SetShaderOp {
            opcode: Opcode::SetVertexShader as u32,
            _pad: 0,
            shader: addr_of(shader),
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
    }

    pub fn set_pixel_shader(&self, shader: Option<&Resource>) {
        let op = SetShaderOp {
            opcode: Opcode::SetPixelShader as u32,
            _pad: 0,
            shader: addr_of(shader),
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
    }

    pub fn set_vs_consts_f(&self, start_register: u32, constants: &[[f32; 4]]) {
        self.set_consts_f(Opcode::SetVsConstsF, start_register, constants);
    }

    pub fn set_ps_consts_f(&self, start_register: u32, constants: &[[f32; 4]]) {
        self.set_consts_f(Opcode::SetPsConstsF, start_register, constants);
    }

    fn set_consts_f(&self, opcode: Opcode, start_register: u32, constants: &[[f32; 4]]) {
        let op = SetConstsFOp {
            opcode: opcode as u32,
            start_register,
            vec4_count: constants.len() as u32,
            _pad: 0,
        };
        self.queue(Queue::Normal, bytes_of(&op), bytemuck::cast_slice(constants));
    }

    pub fn set_transform(&self, state: u32, matrix: &Matrix) {
        let op = SetTransformOp {
            opcode: Opcode::SetTransform as u32,
            state,
            matrix: *matrix,
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
    }

    pub fn set_clip_plane(&self, plane_idx: u32, plane: [f32; 4]) {
        let op = SetClipPlaneOp {
            opcode: Opcode::SetClipPlane as u32,
            plane_idx,
            plane,
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
    }

    pub fn set_material(&self, material: &Material) {
        let op = SetMaterialOp {
            opcode: Opcode::SetMaterial as u32,
            material: *material,
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
    }

    pub fn set_light(&self, light_idx: u32, light: &Light) {
        let op = SetLightOp {
            opcode: Opcode::SetLight as u32,
            light_idx,
            light: *light,
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
    }

    pub fn set_light_enable(&self, light_idx: u32, enable: bool) {
        let op = SetLightEnableOp {
            opcode: Opcode::SetLightEnable as u32,
            light_idx,
            enable: enable as u32,
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
    }

    pub fn set_vertex_declaration(&self, declaration: Option<&Resource>) {
        let op = SetVertexDeclarationOp {
            opcode: Opcode::SetVertexDeclaration as u32,
            _pad: 0,
            declaration: addr_of(declaration),
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
    }

    pub fn set_stream_source(
        &self,
        stream_idx: u32,
        buffer: Option<&Resource>,
        offset: u32,
        stride: u32,
    ) {
        let op = SetStreamSourceOp {
            opcode: Opcode::SetStreamSource as u32,
            stream_idx,
            offset,
            stride,
            buffer: addr_of(buffer),
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
    }

    pub fn set_stream_source_freq(&self, stream_idx: u32, frequency: u32, flags: u32) {
        let op = SetStreamSourceFreqOp {
            opcode: Opcode::SetStreamSourceFreq as u32,
            stream_idx,
            frequency,
            flags,
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
    }

    pub fn set_index_buffer(&self, buffer: Option<&Resource>, format: IndexFormat) {
        let op = SetIndexBufferOp {
            opcode: Opcode::SetIndexBuffer as u32,
            format: format.to_u32(),
            buffer: addr_of(buffer),
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
    }

    pub fn set_viewport(&self, viewport: &Viewport) {
        let op = SetViewportOp {
            opcode: Opcode::SetViewport as u32,
            viewport: *viewport,
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
    }

    pub fn set_scissor_rect(&self, rect: &RectI) {
        let op = SetScissorRectOp {
            opcode: Opcode::SetScissorRect as u32,
            rect: *rect,
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
    }

    pub fn set_render_target(&self, index: u32, target: Option<&Resource>) {
        let op = SetRenderTargetOp {
            opcode: Opcode::SetRenderTarget as u32,
            index,
            target: addr_of(target),
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
    }

    pub fn set_depth_stencil(&self, surface: Option<&Resource>) {
        let op = SetDepthStencilOp {
            opcode: Opcode::SetDepthStencil as u32,
            _pad: 0,
            surface: addr_of(surface),
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
    }

    pub fn set_base_vertex_index(&self, base_vertex_index: u32) {
        let op = SetBaseVertexIndexOp {
            opcode: Opcode::SetBaseVertexIndex as u32,
            base_vertex_index,
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
    }

    pub fn set_primitive_type(&self, primitive_type: PrimitiveType) {
        let op = SetPrimitiveTypeOp {
            opcode: Opcode::SetPrimitiveType as u32,
            primitive_type: primitive_type.to_u32(),
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
    }

    /// Reset the replicated state wholesale, releasing every binding.
    pub fn reset_state(&self) {
        let op = ResetStateOp {
            opcode: Opcode::ResetState as u32,
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
    }

    // --- actions ---

    pub fn draw(
        &self,
        start_idx: u32,
        index_count: u32,
        start_instance: u32,
        instance_count: u32,
        indexed: bool,
    ) {
        let op = DrawOp {
            opcode: Opcode::Draw as u32,
            start_idx,
            index_count,
            start_instance,
            instance_count,
            indexed: indexed as u32,
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
    }

    pub fn clear(
        &self,
        rects: &[RectI],
        flags: ClearFlags,
        color: Color,
        depth: f32,
        stencil: u32,
    ) {
        let op = ClearOp {
            opcode: Opcode::Clear as u32,
            rect_count: rects.len() as u32,
            flags: flags.bits(),
            stencil,
            color,
            depth,
            _pad: 0,
        };
        self.queue(Queue::Normal, bytes_of(&op), bytemuck::cast_slice(rects));
    }

    pub fn blt(
        &self,
        dst: &Resource,
        dst_rect: &RectI,
        src: &Resource,
        src_rect: &RectI,
        flags: u32,
    ) {
        let op = BltOp {
            opcode: Opcode::Blt as u32,
            flags,
            dst: addr_of(Some(dst)),
            src: addr_of(Some(src)),
            dst_rect: *dst_rect,
            src_rect: *src_rect,
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
    }

    pub fn color_fill(&self, surface: &Resource, rect: Option<&RectI>, color: Color) {
        let op = ColorFillOp {
            opcode: Opcode::ColorFill as u32,
            has_rect: rect.is_some() as u32,
            surface: addr_of(Some(surface)),
            rect: rect.copied().unwrap_or_default(),
            color,
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
    }

    /// A range of `buffer` is about to be rewritten; the consumer forwards
    /// this to the backend so cached copies can be dropped.
    pub fn invalidate_buffer_range(&self, buffer: &Resource, offset: u64, size: u64) {
        let op = InvalidateBufferRangeOp {
            opcode: Opcode::InvalidateBufferRange as u32,
            _pad: 0,
            buffer: addr_of(Some(buffer)),
            offset,
            size,
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
    }

    /// Begin a query. Ordered with surrounding draws on the normal channel.
    pub fn issue_query(&self, query: &Resource, flags: QueryFlags) {
        let op = IssueQueryOp {
            opcode: Opcode::IssueQuery as u32,
            flags: flags.bits(),
            query: addr_of(Some(query)),
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
    }

    /// Present `swapchain`.
    ///
    /// Returns as soon as the record is queued unless a present is already in
    /// flight; then it spins until the in-flight count drops back to one, so
    /// the producer can never run more than one frame ahead of the display
    /// pipeline.
    pub fn present(&self, swapchain: &Resource, src_rect: Option<&RectI>, dst_rect: Option<&RectI>, flags: u32) {
        let mut rect_mask = 0;
        if src_rect.is_some() {
            rect_mask |= PRESENT_SRC_RECT;
        }
        if dst_rect.is_some() {
            rect_mask |= PRESENT_DST_RECT;
        }
        let op = PresentOp {
            opcode: Opcode::Present as u32,
            flags,
            swapchain: addr_of(Some(swapchain)),
            src_rect: src_rect.copied().unwrap_or_default(),
            dst_rect: dst_rect.copied().unwrap_or_default(),
            rect_mask,
            _pad: 0,
        };
        self.pending_presents.fetch_add(1, Ordering::AcqRel);
        self.queue(Queue::Normal, bytes_of(&op), &[]);
        let pending = &self.pending_presents;
        spin_wait(|| pending.load(Ordering::Acquire) <= 1);
    }

    /// In-flight presents, at most one after [`present`](Self::present)
    /// returns.
    pub fn pending_presents(&self) -> u32 {
        self.pending_presents.load(Ordering::Acquire)
    }

    // --- synchronous round-trips ---

    /// Wait until everything queued on the normal channel so far has been
    /// dispatched. The fence rides the normal channel, so it orders behind
    /// queued work.
    pub fn flush_and_wait(&self) {
        let fence = Fence::new();
        let op = FenceOp {
            opcode: Opcode::Fence as u32,
            _pad: 0,
            fence: fence.addr(),
        };
        // The record refers to `fence` by address; this frame outlives the
        // consumer's access because we spin right here until it signals.
        self.queue(Queue::Normal, bytes_of(&op), &[]);
        fence.wait();
    }

    /// Drain the stream and the device behind it; returns once the backend
    /// reports idle.
    pub fn finish(&self) {
        let op = FinishOp {
            opcode: Opcode::Finish as u32,
        };
        self.queue(Queue::Normal, bytes_of(&op), &[]);
        self.flush_and_wait();
    }

    /// Poll a query's result. `None` means not ready yet; poll again.
    ///
    /// Rides the priority channel: a saturated normal channel cannot delay
    /// the round-trip. Ordering against normal-channel work (such as the
    /// matching [`issue_query`](Self::issue_query)) is the caller's to
    /// establish, with [`flush_and_wait`](Self::flush_and_wait) if needed.
    pub fn get_query_data(&self, query: &Resource, flags: QueryFlags) -> Option<u64> {
        let slot = QuerySlot::new();
        let op = GetQueryDataOp {
            opcode: Opcode::GetQueryData as u32,
            flags: flags.bits(),
            query: addr_of(Some(query)),
            slot: slot.addr(),
        };
        self.queue(Queue::Priority, bytes_of(&op), &[]);
        slot.fence.wait();
        (slot.status.load(Ordering::Relaxed) == QUERY_STATUS_READY)
            .then(|| slot.value.load(Ordering::Relaxed))
    }

    /// Map `size` bytes of `resource` at `offset`, returning the backend's
    /// opaque mapping token. Rides the priority channel; see
    /// [`get_query_data`](Self::get_query_data) for the ordering caveat.
    pub fn map(
        &self,
        resource: &Resource,
        offset: u64,
        size: u64,
        flags: MapFlags,
    ) -> Result<u64, MapError> {
        let slot = MapSlot::new();
        let op = MapOp {
            opcode: Opcode::Map as u32,
            flags: flags.bits(),
            resource: addr_of(Some(resource)),
            offset,
            size,
            slot: slot.addr(),
        };
        self.queue(Queue::Priority, bytes_of(&op), &[]);
        slot.fence.wait();
        match slot.status.load(Ordering::Relaxed) {
            MAP_STATUS_OK => Ok(slot.token.load(Ordering::Relaxed)),
            code => Err(MapError::from_code(code).unwrap_or(MapError::Unmappable)),
        }
    }

    pub fn unmap(&self, resource: &Resource) -> Result<(), MapError> {
        let slot = MapSlot::new();
        let op = UnmapOp {
            opcode: Opcode::Unmap as u32,
            _pad: 0,
            resource: addr_of(Some(resource)),
            slot: slot.addr(),
        };
        self.queue(Queue::Priority, bytes_of(&op), &[]);
        slot.fence.wait();
        match slot.status.load(Ordering::Relaxed) {
            MAP_STATUS_OK => Ok(()),
            code => Err(MapError::from_code(code).unwrap_or(MapError::Unmappable)),
        }
    }

    // --- lifecycle ---

    /// Stop the stream and recover the final replicated state. In
    /// multi-threaded mode this emits the terminal stop record and joins the
    /// worker; nothing may be queued afterwards.
    pub fn shutdown(mut self) -> DeviceState {
        self.shutdown_inner().expect("stream already shut down")
    }

    fn shutdown_inner(&mut self) -> Option<DeviceState> {
        match self.mode.take()? {
            ModeState::SingleThreaded { machine, .. } => {
                Some(machine.into_inner().into_state())
            }
            ModeState::MultiThreaded { queues, worker } => {
                let op = StopOp {
                    opcode: Opcode::Stop as u32,
                };
                let bytes = bytes_of(&op);
                let buf = queues.normal.require_space(bytes.len());
                buf.copy_from_slice(bytes);
                queues.normal.submit(bytes.len());
                Some(worker.join().expect("command stream worker panicked"))
            }
        }
    }
}

impl<B: Backend> Drop for CommandStream<B> {
    fn drop(&mut self) {
        let _ = self.shutdown_inner();
    }
}
