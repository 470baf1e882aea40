//! Record dispatch and the consumer worker loop.
//!
//! Dispatch is an exhaustive match over [`Opcode`]: each arm decodes its
//! fixed record, applies the effect to the replicated state and/or the
//! backend, and returns the exact encoded size so the loop can advance the
//! read cursor past variable-length records without look-ahead.
//!
//! Channel policy (deterministic): the priority channel is fully drained
//! before every normal-channel record and re-checked after each one,
//! so a saturated normal channel can never starve a priority round-trip.
//! Pending priority records are still honored after a stop record; nothing
//! on the normal channel may follow one.

use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytemuck::{pod_read_unaligned, Pod};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::backend::{Backend, DrawParams, StateBinding};
use crate::channel::Channel;
use crate::fence::{Fence, MapSlot, QuerySlot, MAP_STATUS_OK, QUERY_STATUS_NOT_READY, QUERY_STATUS_READY};
use crate::op::*;
use crate::resource::{rebind, ResourceRef};
use crate::state::{
    DeviceState, LightEntry, MAX_CLIP_PLANES, MAX_RENDER_TARGETS, MAX_SAMPLERS,
    MAX_SHADER_CONSTS, MAX_STREAMS, MAX_TEXTURE_STAGES, RENDER_STATE_COUNT,
    SAMPLER_STATE_COUNT, TEXTURE_STAGE_STATE_COUNT, TRANSFORM_COUNT,
};
use crate::stream::Queues;
use crate::types::{
    ClearFlags, IndexFormat, MapError, MapFlags, PrimitiveType, QueryFlags, RectI, ShaderType,
};

/// Internal-protocol violations. These can only be produced by an
/// encoding/dispatch mismatch, never by API misuse; there is no recovery.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub(crate) enum ProtocolError {
    #[error("unknown opcode {opcode:#06x}")]
    UnknownOpcode { opcode: u32 },
    #[error("truncated record: need {need} bytes, {have} readable")]
    Truncated { need: usize, have: usize },
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Control {
    Continue,
    Stop,
}

fn decode<T: Pod>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let need = core::mem::size_of::<T>();
    if bytes.len() < need {
        return Err(ProtocolError::Truncated {
            need,
            have: bytes.len(),
        });
    }
    Ok(pod_read_unaligned(&bytes[..need]))
}

fn payload<'a>(bytes: &'a [u8], base: usize, len: usize) -> Result<&'a [u8], ProtocolError> {
    let need = base + len;
    if bytes.len() < need {
        return Err(ProtocolError::Truncated {
            need,
            have: bytes.len(),
        });
    }
    Ok(&bytes[base..need])
}

/// Resolve a record's resource address field.
///
/// # Safety of the deref helpers below
///
/// Addresses queued in records point at objects the producer keeps alive
/// for the duration of the round-trip (fences, slots) or for as long as
/// records referencing them are in flight (resources); see the module docs
/// in `op.rs`.
fn resource_at(addr: u64) -> Option<ResourceRef> {
    ResourceRef::from_addr(addr)
}

pub(crate) struct StateMachine<B> {
    state: DeviceState,
    backend: B,
    pending_presents: Arc<AtomicU32>,
}

impl<B: Backend> StateMachine<B> {
    pub(crate) fn new(backend: B, pending_presents: Arc<AtomicU32>) -> Self {
        Self {
            state: DeviceState::new(),
            backend,
            pending_presents,
        }
    }

    pub(crate) fn into_state(self) -> DeviceState {
        self.state
    }

    /// Decode and apply the record at the start of `bytes`, returning its
    /// encoded size.
    pub(crate) fn dispatch(&mut self, bytes: &[u8]) -> Result<(usize, Control), ProtocolError> {
        let raw: u32 = decode(bytes)?;
        let Some(opcode) = Opcode::from_u32(raw) else {
            return Err(ProtocolError::UnknownOpcode { opcode: raw });
        };

        let size = match opcode {
            Opcode::Nop => core::mem::size_of::<NopOp>(),
            Opcode::Skip => {
                let op: SkipOp = decode(bytes)?;
                op.size as usize
            }
            Opcode::Stop => {
                return Ok((core::mem::size_of::<StopOp>(), Control::Stop));
            }
            Opcode::Fence => {
                let op: FenceOp = decode(bytes)?;
                // SAFETY: the producer spins on this fence until we signal.
                let fence = unsafe { &*(op.fence as usize as *const Fence) };
                fence.signal();
                core::mem::size_of::<FenceOp>()
            }
            Opcode::Present => self.exec_present(decode(bytes)?),
            Opcode::Clear => self.exec_clear(bytes)?,
            Opcode::Draw => {
                let op: DrawOp = decode(bytes)?;
                let params = DrawParams {
                    start_idx: op.start_idx,
                    index_count: op.index_count,
                    start_instance: op.start_instance,
                    instance_count: op.instance_count,
                    indexed: op.indexed != 0,
                };
                self.backend.draw(&self.state, &params);
                core::mem::size_of::<DrawOp>()
            }
            Opcode::Blt => self.exec_blt(decode(bytes)?),
            Opcode::ColorFill => self.exec_color_fill(decode(bytes)?),
            Opcode::SetRenderTarget => {
                let op: SetRenderTargetOp = decode(bytes)?;
                let index = op.index as usize;
                if index < MAX_RENDER_TARGETS {
                    rebind(&mut self.state.render_targets[index], resource_at(op.target));
                    self.backend.invalidate(StateBinding::Framebuffer);
                } else {
                    warn!(index, "render target index out of range");
                }
                core::mem::size_of::<SetRenderTargetOp>()
            }
            Opcode::SetDepthStencil => {
                let op: SetDepthStencilOp = decode(bytes)?;
                rebind(&mut self.state.depth_stencil, resource_at(op.surface));
                self.backend.invalidate(StateBinding::Framebuffer);
                core::mem::size_of::<SetDepthStencilOp>()
            }
            Opcode::SetViewport => {
                let op: SetViewportOp = decode(bytes)?;
                self.state.viewport = op.viewport;
                self.backend.invalidate(StateBinding::Viewport);
                core::mem::size_of::<SetViewportOp>()
            }
            Opcode::SetScissorRect => {
                let op: SetScissorRectOp = decode(bytes)?;
                self.state.scissor_rect = op.rect;
                self.backend.invalidate(StateBinding::ScissorRect);
                core::mem::size_of::<SetScissorRectOp>()
            }
            Opcode::SetRenderState => {
                let op: SetRenderStateOp = decode(bytes)?;
                if (op.state as usize) < RENDER_STATE_COUNT {
                    self.state.render_states[op.state as usize] = op.value;
                    self.backend.invalidate(StateBinding::RenderState(op.state));
                } else {
                    warn!(state = op.state, "render state out of range");
                }
                core::mem::size_of::<SetRenderStateOp>()
            }
            Opcode::SetTextureStageState => {
                let op: SetTextureStageStateOp = decode(bytes)?;
                if (op.stage as usize) < MAX_TEXTURE_STAGES
                    && (op.state as usize) < TEXTURE_STAGE_STATE_COUNT
                {
                    self.state.texture_stage_states[op.stage as usize][op.state as usize] =
                        op.value;
                    self.backend.invalidate(StateBinding::TextureStage {
                        stage: op.stage,
                        state: op.state,
                    });
                } else {
                    warn!(stage = op.stage, state = op.state, "texture stage state out of range");
                }
                core::mem::size_of::<SetTextureStageStateOp>()
            }
            Opcode::SetSamplerState => {
                let op: SetSamplerStateOp = decode(bytes)?;
                if (op.sampler as usize) < MAX_SAMPLERS
                    && (op.state as usize) < SAMPLER_STATE_COUNT
                {
                    self.state.sampler_states[op.sampler as usize][op.state as usize] = op.value;
                    self.backend.invalidate(StateBinding::Sampler(op.sampler));
                } else {
                    warn!(sampler = op.sampler, state = op.state, "sampler state out of range");
                }
                core::mem::size_of::<SetSamplerStateOp>()
            }
            Opcode::SetTexture => {
                let op: SetTextureOp = decode(bytes)?;
                let stage = op.stage as usize;
                if stage < MAX_SAMPLERS {
                    rebind(&mut self.state.textures[stage], resource_at(op.texture));
                    self.backend.invalidate(StateBinding::Sampler(op.stage));
                } else {
                    warn!(stage = op.stage, "texture stage out of range");
                }
                core::mem::size_of::<SetTextureOp>()
            }
            Opcode::SetVertexShader => {
                let op: SetShaderOp = decode(bytes)?;
                self.state.vertex_shader = resource_at(op.shader);
                self.backend.invalidate(StateBinding::Shader(ShaderType::Vertex));
                core::mem::size_of::<SetShaderOp>()
            }
            Opcode::SetPixelShader => {
                let op: SetShaderOp = decode(bytes)?;
                self.state.pixel_shader = resource_at(op.shader);
                self.backend.invalidate(StateBinding::Shader(ShaderType::Pixel));
                core::mem::size_of::<SetShaderOp>()
            }
            Opcode::SetVsConstsF => self.exec_set_consts_f(bytes, ShaderType::Vertex)?,
            Opcode::SetPsConstsF => self.exec_set_consts_f(bytes, ShaderType::Pixel)?,
            Opcode::SetTransform => {
                let op: SetTransformOp = decode(bytes)?;
                if (op.state as usize) < TRANSFORM_COUNT {
                    self.state.transforms[op.state as usize] = op.matrix;
                    self.backend.invalidate(StateBinding::Transform(op.state));
                } else {
                    warn!(state = op.state, "transform state out of range");
                }
                core::mem::size_of::<SetTransformOp>()
            }
            Opcode::SetClipPlane => {
                let op: SetClipPlaneOp = decode(bytes)?;
                if (op.plane_idx as usize) < MAX_CLIP_PLANES {
                    self.state.clip_planes[op.plane_idx as usize] = op.plane;
                    self.backend.invalidate(StateBinding::ClipPlane(op.plane_idx));
                } else {
                    warn!(plane = op.plane_idx, "clip plane index out of range");
                }
                core::mem::size_of::<SetClipPlaneOp>()
            }
            Opcode::SetMaterial => {
                let op: SetMaterialOp = decode(bytes)?;
                self.state.material = op.material;
                self.backend.invalidate(StateBinding::Material);
                core::mem::size_of::<SetMaterialOp>()
            }
            Opcode::SetLight => {
                let op: SetLightOp = decode(bytes)?;
                let entry = self
                    .state
                    .lights
                    .entry(op.light_idx)
                    .or_insert_with(LightEntry::default);
                entry.light = op.light;
                self.backend.invalidate(StateBinding::Light(op.light_idx));
                core::mem::size_of::<SetLightOp>()
            }
            Opcode::SetLightEnable => {
                let op: SetLightEnableOp = decode(bytes)?;
                let entry = self
                    .state
                    .lights
                    .entry(op.light_idx)
                    .or_insert_with(LightEntry::default);
                entry.enabled = op.enable != 0;
                self.backend.invalidate(StateBinding::Light(op.light_idx));
                core::mem::size_of::<SetLightEnableOp>()
            }
            Opcode::SetVertexDeclaration => {
                let op: SetVertexDeclarationOp = decode(bytes)?;
                self.state.vertex_declaration = resource_at(op.declaration);
                self.backend.invalidate(StateBinding::VertexDeclaration);
                core::mem::size_of::<SetVertexDeclarationOp>()
            }
            Opcode::SetStreamSource => {
                let op: SetStreamSourceOp = decode(bytes)?;
                let index = op.stream_idx as usize;
                if index < MAX_STREAMS {
                    let stream = &mut self.state.streams[index];
                    rebind(&mut stream.buffer, resource_at(op.buffer));
                    stream.offset = op.offset;
                    stream.stride = op.stride;
                    self.backend.invalidate(StateBinding::StreamSource(op.stream_idx));
                } else {
                    warn!(stream = op.stream_idx, "stream index out of range");
                }
                core::mem::size_of::<SetStreamSourceOp>()
            }
            Opcode::SetStreamSourceFreq => {
                let op: SetStreamSourceFreqOp = decode(bytes)?;
                let index = op.stream_idx as usize;
                if index < MAX_STREAMS {
                    let stream = &mut self.state.streams[index];
                    stream.frequency = op.frequency;
                    stream.flags = op.flags;
                    self.backend
                        .invalidate(StateBinding::StreamSourceFreq(op.stream_idx));
                } else {
                    warn!(stream = op.stream_idx, "stream index out of range");
                }
                core::mem::size_of::<SetStreamSourceFreqOp>()
            }
            Opcode::SetIndexBuffer => {
                let op: SetIndexBufferOp = decode(bytes)?;
                rebind(&mut self.state.index_buffer, resource_at(op.buffer));
                self.state.index_format =
                    IndexFormat::from_u32(op.format).unwrap_or_default();
                self.backend.invalidate(StateBinding::IndexBuffer);
                core::mem::size_of::<SetIndexBufferOp>()
            }
            Opcode::SetBaseVertexIndex => {
                let op: SetBaseVertexIndexOp = decode(bytes)?;
                self.state.base_vertex_index = op.base_vertex_index;
                self.backend.invalidate(StateBinding::BaseVertexIndex);
                core::mem::size_of::<SetBaseVertexIndexOp>()
            }
            Opcode::SetPrimitiveType => {
                let op: SetPrimitiveTypeOp = decode(bytes)?;
                match PrimitiveType::from_u32(op.primitive_type) {
                    Some(primitive) => {
                        self.state.primitive_type = primitive;
                        self.backend.invalidate(StateBinding::PrimitiveType);
                    }
                    None => warn!(value = op.primitive_type, "unknown primitive type"),
                }
                core::mem::size_of::<SetPrimitiveTypeOp>()
            }
            Opcode::ResetState => {
                self.state.reset();
                core::mem::size_of::<ResetStateOp>()
            }
            Opcode::IssueQuery => {
                let op: IssueQueryOp = decode(bytes)?;
                match resource_at(op.query) {
                    // SAFETY: in-flight liveness contract.
                    Some(query) => self
                        .backend
                        .issue_query(unsafe { query.resource() }, QueryFlags::from_bits_retain(op.flags)),
                    None => warn!("issue_query with null query"),
                }
                core::mem::size_of::<IssueQueryOp>()
            }
            Opcode::GetQueryData => self.exec_get_query_data(decode(bytes)?),
            Opcode::Map => self.exec_map(decode(bytes)?),
            Opcode::Unmap => self.exec_unmap(decode(bytes)?),
            Opcode::InvalidateBufferRange => {
                let op: InvalidateBufferRangeOp = decode(bytes)?;
                match resource_at(op.buffer) {
                    // SAFETY: in-flight liveness contract.
                    Some(buffer) => self.backend.invalidate_buffer_range(
                        unsafe { buffer.resource() },
                        op.offset,
                        op.size,
                    ),
                    None => warn!("invalidate_buffer_range with null buffer"),
                }
                core::mem::size_of::<InvalidateBufferRangeOp>()
            }
            Opcode::Finish => {
                self.backend.finish();
                core::mem::size_of::<FinishOp>()
            }
        };

        Ok((size, Control::Continue))
    }

    fn exec_present(&mut self, op: PresentOp) -> usize {
        match resource_at(op.swapchain) {
            Some(swapchain) => {
                let src = (op.rect_mask & PRESENT_SRC_RECT != 0).then_some(&op.src_rect);
                let dst = (op.rect_mask & PRESENT_DST_RECT != 0).then_some(&op.dst_rect);
                // SAFETY: in-flight liveness contract.
                self.backend
                    .present(&self.state, unsafe { swapchain.resource() }, src, dst, op.flags);
            }
            None => warn!("present with null swapchain"),
        }
        // Releases the producer-side present throttle; must happen even when
        // the present itself was dropped.
        self.pending_presents.fetch_sub(1, Ordering::Release);
        core::mem::size_of::<PresentOp>()
    }

    fn exec_clear(&mut self, bytes: &[u8]) -> Result<usize, ProtocolError> {
        let op: ClearOp = decode(bytes)?;
        let base = core::mem::size_of::<ClearOp>();
        let rect_bytes = payload(
            bytes,
            base,
            op.rect_count as usize * core::mem::size_of::<RectI>(),
        )?;
        let rects: Vec<RectI> = rect_bytes
            .chunks_exact(core::mem::size_of::<RectI>())
            .map(pod_read_unaligned)
            .collect();
        self.backend.clear(
            &self.state,
            &rects,
            ClearFlags::from_bits_retain(op.flags),
            op.color,
            op.depth,
            op.stencil,
        );
        Ok(ClearOp::encoded_size(op.rect_count))
    }

    fn exec_set_consts_f(
        &mut self,
        bytes: &[u8],
        shader: ShaderType,
    ) -> Result<usize, ProtocolError> {
        let op: SetConstsFOp = decode(bytes)?;
        let base = core::mem::size_of::<SetConstsFOp>();
        let consts = payload(
            bytes,
            base,
            op.vec4_count as usize * core::mem::size_of::<[f32; 4]>(),
        )?;
        let start = op.start_register as usize;
        let count = op.vec4_count as usize;
        if start + count <= MAX_SHADER_CONSTS {
            let registers = match shader {
                ShaderType::Vertex => &mut self.state.vs_consts_f[start..start + count],
                ShaderType::Pixel => &mut self.state.ps_consts_f[start..start + count],
            };
            for (dst, src) in registers
                .iter_mut()
                .zip(consts.chunks_exact(core::mem::size_of::<[f32; 4]>()))
            {
                *dst = pod_read_unaligned(src);
            }
            self.backend.invalidate(StateBinding::ShaderConstants {
                shader,
                start_register: op.start_register,
                vec4_count: op.vec4_count,
            });
        } else {
            warn!(start = op.start_register, count = op.vec4_count, "constant range out of range");
        }
        Ok(SetConstsFOp::encoded_size(op.vec4_count))
    }

    fn exec_blt(&mut self, op: BltOp) -> usize {
        match (resource_at(op.dst), resource_at(op.src)) {
            (Some(dst), Some(src)) => {
                // SAFETY: in-flight liveness contract.
                self.backend.blt(
                    unsafe { dst.resource() },
                    &op.dst_rect,
                    unsafe { src.resource() },
                    &op.src_rect,
                    op.flags,
                );
            }
            _ => warn!("blt with null surface"),
        }
        core::mem::size_of::<BltOp>()
    }

    fn exec_color_fill(&mut self, op: ColorFillOp) -> usize {
        match resource_at(op.surface) {
            Some(surface) => {
                let rect = (op.has_rect != 0).then_some(&op.rect);
                // SAFETY: in-flight liveness contract.
                self.backend
                    .color_fill(unsafe { surface.resource() }, rect, op.color);
            }
            None => warn!("color_fill with null surface"),
        }
        core::mem::size_of::<ColorFillOp>()
    }

    fn exec_get_query_data(&mut self, op: GetQueryDataOp) -> usize {
        // SAFETY: the producer spins on the slot's fence until we signal.
        let slot = unsafe { &*(op.slot as usize as *const QuerySlot) };
        match resource_at(op.query) {
            Some(query) => {
                // SAFETY: in-flight liveness contract.
                let result = self
                    .backend
                    .read_query(unsafe { query.resource() }, QueryFlags::from_bits_retain(op.flags));
                match result {
                    Some(value) => {
                        slot.value.store(value, Ordering::Relaxed);
                        slot.status.store(QUERY_STATUS_READY, Ordering::Relaxed);
                    }
                    None => slot.status.store(QUERY_STATUS_NOT_READY, Ordering::Relaxed),
                }
            }
            None => {
                warn!("get_query_data with null query");
                slot.status.store(QUERY_STATUS_NOT_READY, Ordering::Relaxed);
            }
        }
        slot.fence.signal();
        core::mem::size_of::<GetQueryDataOp>()
    }

    fn exec_map(&mut self, op: MapOp) -> usize {
        // SAFETY: the producer spins on the slot's fence until we signal.
        let slot = unsafe { &*(op.slot as usize as *const MapSlot) };
        let result = match resource_at(op.resource) {
            // SAFETY: in-flight liveness contract.
            Some(resource) => self.backend.map(
                unsafe { resource.resource() },
                op.offset,
                op.size,
                MapFlags::from_bits_retain(op.flags),
            ),
            None => {
                warn!("map with null resource");
                Err(MapError::Unmappable)
            }
        };
        match result {
            Ok(token) => {
                slot.token.store(token, Ordering::Relaxed);
                slot.status.store(MAP_STATUS_OK, Ordering::Relaxed);
            }
            Err(err) => slot.status.store(err.to_code(), Ordering::Relaxed),
        }
        slot.fence.signal();
        core::mem::size_of::<MapOp>()
    }

    fn exec_unmap(&mut self, op: UnmapOp) -> usize {
        // SAFETY: the producer spins on the slot's fence until we signal.
        let slot = unsafe { &*(op.slot as usize as *const MapSlot) };
        let result = match resource_at(op.resource) {
            // SAFETY: in-flight liveness contract.
            Some(resource) => self.backend.unmap(unsafe { resource.resource() }),
            None => {
                warn!("unmap with null resource");
                Err(MapError::Unmappable)
            }
        };
        match result {
            Ok(()) => slot.status.store(MAP_STATUS_OK, Ordering::Relaxed),
            Err(err) => slot.status.store(err.to_code(), Ordering::Relaxed),
        }
        slot.fence.signal();
        core::mem::size_of::<UnmapOp>()
    }
}

enum Step {
    Progress,
    Idle,
    Stop,
    Fatal,
}

fn step<B: Backend>(machine: &mut StateMachine<B>, chan: &Channel) -> Step {
    let Some(bytes) = chan.peek() else {
        return Step::Idle;
    };
    match machine.dispatch(bytes) {
        Ok((size, Control::Continue)) => {
            chan.release(size);
            Step::Progress
        }
        Ok((size, Control::Stop)) => {
            chan.release(size);
            Step::Stop
        }
        Err(err) => {
            error!(%err, "protocol corruption; aborting command stream worker");
            Step::Fatal
        }
    }
}

pub(crate) fn run<B: Backend>(mut machine: StateMachine<B>, queues: Arc<Queues>) -> DeviceState {
    debug!("command stream worker running");
    let mut idle_spins = 0u32;
    'run: loop {
        loop {
            match step(&mut machine, &queues.priority) {
                Step::Progress => continue,
                Step::Idle => break,
                Step::Stop | Step::Fatal => break 'run,
            }
        }
        match step(&mut machine, &queues.normal) {
            Step::Progress => idle_spins = 0,
            Step::Idle => {
                idle_spins = idle_spins.wrapping_add(1);
                if idle_spins % 1024 == 0 {
                    std::thread::yield_now();
                } else {
                    core::hint::spin_loop();
                }
            }
            Step::Stop => {
                // Pending priority round-trips are honored before exit.
                while let Step::Progress = step(&mut machine, &queues.priority) {}
                break 'run;
            }
            Step::Fatal => break 'run,
        }
    }
    debug!("command stream worker stopped");
    machine.into_state()
}
