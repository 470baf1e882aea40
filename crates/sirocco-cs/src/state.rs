//! Replicated pipeline state.
//!
//! The consumer-owned mirror of all render state. Only command handlers
//! mutate it; producers observe it indirectly through synchronous
//! round-trips, or wholesale via [`crate::CommandStream::shutdown`].

use hashbrown::HashMap;

use crate::resource::ResourceRef;
use crate::types::{IndexFormat, Light, Material, Matrix, PrimitiveType, RectI, Viewport};

pub const MAX_RENDER_TARGETS: usize = 8;
pub const MAX_STREAMS: usize = 16;
pub const MAX_TEXTURE_STAGES: usize = 8;
pub const MAX_SAMPLERS: usize = 16;
pub const MAX_CLIP_PLANES: usize = 8;
pub const MAX_SHADER_CONSTS: usize = 256;
pub const RENDER_STATE_COUNT: usize = 256;
pub const TEXTURE_STAGE_STATE_COUNT: usize = 32;
pub const SAMPLER_STATE_COUNT: usize = 16;
pub const TRANSFORM_COUNT: usize = 256;

/// One vertex stream binding.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StreamSource {
    pub buffer: Option<ResourceRef>,
    pub offset: u32,
    pub stride: u32,
    pub frequency: u32,
    pub flags: u32,
}

/// A light plus its enable bit. Entries are created on first touch; enabling
/// a light that was never set gets the default light, as the immediate path
/// does.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LightEntry {
    pub light: Light,
    pub enabled: bool,
}

#[derive(Debug, PartialEq)]
pub struct DeviceState {
    pub render_states: Box<[u32; RENDER_STATE_COUNT]>,
    pub texture_stage_states: Box<[[u32; TEXTURE_STAGE_STATE_COUNT]; MAX_TEXTURE_STAGES]>,
    pub sampler_states: Box<[[u32; SAMPLER_STATE_COUNT]; MAX_SAMPLERS]>,
    pub textures: [Option<ResourceRef>; MAX_SAMPLERS],
    pub vertex_shader: Option<ResourceRef>,
    pub pixel_shader: Option<ResourceRef>,
    pub vs_consts_f: Box<[[f32; 4]; MAX_SHADER_CONSTS]>,
    pub ps_consts_f: Box<[[f32; 4]; MAX_SHADER_CONSTS]>,
    pub transforms: Box<[Matrix; TRANSFORM_COUNT]>,
    pub clip_planes: [[f32; 4]; MAX_CLIP_PLANES],
    pub material: Material,
    pub lights: HashMap<u32, LightEntry>,
    pub streams: [StreamSource; MAX_STREAMS],
    pub index_buffer: Option<ResourceRef>,
    pub index_format: IndexFormat,
    pub vertex_declaration: Option<ResourceRef>,
    pub viewport: Viewport,
    pub scissor_rect: RectI,
    pub render_targets: [Option<ResourceRef>; MAX_RENDER_TARGETS],
    pub depth_stencil: Option<ResourceRef>,
    pub base_vertex_index: u32,
    pub primitive_type: PrimitiveType,
}

impl DeviceState {
    /// Neutral startup state: identity transforms, white diffuse material,
    /// everything else zeroed/unbound. API-level default state values are the
    /// device layer's business; the mirror only has to match what the
    /// handlers replay into it.
    pub fn new() -> Self {
        Self {
            render_states: Box::new([0; RENDER_STATE_COUNT]),
            texture_stage_states: Box::new([[0; TEXTURE_STAGE_STATE_COUNT]; MAX_TEXTURE_STAGES]),
            sampler_states: Box::new([[0; SAMPLER_STATE_COUNT]; MAX_SAMPLERS]),
            textures: [None; MAX_SAMPLERS],
            vertex_shader: None,
            pixel_shader: None,
            vs_consts_f: Box::new([[0.0; 4]; MAX_SHADER_CONSTS]),
            ps_consts_f: Box::new([[0.0; 4]; MAX_SHADER_CONSTS]),
            transforms: Box::new([Matrix::IDENTITY; TRANSFORM_COUNT]),
            clip_planes: [[0.0; 4]; MAX_CLIP_PLANES],
            material: Material {
                diffuse: crate::types::Color::WHITE,
                ..Material::default()
            },
            lights: HashMap::new(),
            streams: [StreamSource::default(); MAX_STREAMS],
            index_buffer: None,
            index_format: IndexFormat::default(),
            vertex_declaration: None,
            viewport: Viewport::default(),
            scissor_rect: RectI::default(),
            render_targets: [None; MAX_RENDER_TARGETS],
            depth_stencil: None,
            base_vertex_index: 0,
            primitive_type: PrimitiveType::default(),
        }
    }

    /// Wholesale reset, releasing every binding the mirror holds.
    pub(crate) fn reset(&mut self) {
        for slot in &mut self.textures {
            crate::resource::rebind(slot, None);
        }
        for stream in &mut self.streams {
            crate::resource::rebind(&mut stream.buffer, None);
        }
        crate::resource::rebind(&mut self.index_buffer, None);
        for slot in &mut self.render_targets {
            crate::resource::rebind(slot, None);
        }
        crate::resource::rebind(&mut self.depth_stencil, None);
        *self = Self::new();
    }
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::new()
    }
}
