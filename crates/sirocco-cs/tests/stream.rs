use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use sirocco_cs::{
    Backend, ClearFlags, Color, CommandStream, CreateError, DeviceState, DrawParams,
    ExecutionMode, IndexFormat, Light, MapError, MapFlags, Material, Matrix, PrimitiveType,
    QueryFlags, RectI, Resource, ResourceKind, StateBinding, StreamConfig, Viewport, LIGHT_POINT,
};

#[derive(Default)]
struct Calls {
    invalidations: Mutex<Vec<StateBinding>>,
    draws: AtomicUsize,
    draws_at_read_query: AtomicUsize,
    clears: Mutex<Vec<(Vec<RectI>, ClearFlags)>>,
    presents: AtomicUsize,
    blts: AtomicUsize,
    fills: AtomicUsize,
    maps: AtomicUsize,
    unmaps: AtomicUsize,
    issued_queries: AtomicUsize,
    invalidated_ranges: Mutex<Vec<(u32, u64, u64)>>,
    finishes: AtomicUsize,
}

/// Records every backend call; optionally slows draws down (busy wait, so
/// timing does not depend on sleep granularity) and gates presents on a
/// channel permit.
struct TestBackend {
    calls: Arc<Calls>,
    draw_delay: Duration,
    present_gate: Option<Receiver<()>>,
}

fn backend() -> (TestBackend, Arc<Calls>) {
    let calls = Arc::new(Calls::default());
    (
        TestBackend {
            calls: calls.clone(),
            draw_delay: Duration::ZERO,
            present_gate: None,
        },
        calls,
    )
}

impl Backend for TestBackend {
    fn invalidate(&mut self, binding: StateBinding) {
        self.calls.invalidations.lock().unwrap().push(binding);
    }

    fn draw(&mut self, _state: &DeviceState, _params: &DrawParams) {
        if !self.draw_delay.is_zero() {
            let start = Instant::now();
            while start.elapsed() < self.draw_delay {
                core::hint::spin_loop();
            }
        }
        self.calls.draws.fetch_add(1, Ordering::SeqCst);
    }

    fn clear(
        &mut self,
        _state: &DeviceState,
        rects: &[RectI],
        flags: ClearFlags,
        _color: Color,
        _depth: f32,
        _stencil: u32,
    ) {
        self.calls.clears.lock().unwrap().push((rects.to_vec(), flags));
    }

    fn present(
        &mut self,
        _state: &DeviceState,
        _swapchain: &Resource,
        _src_rect: Option<&RectI>,
        _dst_rect: Option<&RectI>,
        _flags: u32,
    ) {
        if let Some(gate) = &self.present_gate {
            gate.recv().unwrap();
        }
        self.calls.presents.fetch_add(1, Ordering::SeqCst);
    }

    fn blt(
        &mut self,
        _dst: &Resource,
        _dst_rect: &RectI,
        _src: &Resource,
        _src_rect: &RectI,
        _flags: u32,
    ) {
        self.calls.blts.fetch_add(1, Ordering::SeqCst);
    }

    fn color_fill(&mut self, _surface: &Resource, _rect: Option<&RectI>, _color: Color) {
        self.calls.fills.fetch_add(1, Ordering::SeqCst);
    }

    fn map(
        &mut self,
        resource: &Resource,
        _offset: u64,
        _size: u64,
        _flags: MapFlags,
    ) -> Result<u64, MapError> {
        self.calls.maps.fetch_add(1, Ordering::SeqCst);
        Ok(0xA000_0000 | resource.id() as u64)
    }

    fn unmap(&mut self, _resource: &Resource) -> Result<(), MapError> {
        self.calls.unmaps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn issue_query(&mut self, _query: &Resource, _flags: QueryFlags) {
        self.calls.issued_queries.fetch_add(1, Ordering::SeqCst);
    }

    fn read_query(&mut self, _query: &Resource, _flags: QueryFlags) -> Option<u64> {
        self.calls
            .draws_at_read_query
            .store(self.calls.draws.load(Ordering::SeqCst), Ordering::SeqCst);
        Some(42)
    }

    fn invalidate_buffer_range(&mut self, buffer: &Resource, offset: u64, size: u64) {
        self.calls
            .invalidated_ranges
            .lock()
            .unwrap()
            .push((buffer.id(), offset, size));
    }

    fn finish(&mut self) {
        self.calls.finishes.fetch_add(1, Ordering::SeqCst);
    }
}

fn stream(mode: ExecutionMode) -> (CommandStream<TestBackend>, Arc<Calls>) {
    let (backend, calls) = backend();
    let cs = CommandStream::new(
        backend,
        StreamConfig {
            mode,
            ..StreamConfig::default()
        },
    )
    .unwrap();
    (cs, calls)
}

/// A representative battery of state-setting and action commands.
fn drive(cs: &CommandStream<TestBackend>, tex: &Resource, vb: &Resource, ib: &Resource, rt: &Resource) {
    cs.set_render_state(7, 1);
    cs.set_render_state(7, 2);
    cs.set_texture_stage_state(0, 3, 9);
    cs.set_sampler_state(2, 1, 4);
    cs.set_texture(0, Some(tex));
    cs.set_vs_consts_f(4, &[[1.0, 2.0, 3.0, 4.0], [5.0, 6.0, 7.0, 8.0]]);
    cs.set_ps_consts_f(0, &[[9.0, 9.0, 9.0, 9.0]]);
    cs.set_transform(2, &Matrix { m: [2.0; 16] });
    cs.set_clip_plane(1, [0.0, 1.0, 0.0, 0.5]);
    cs.set_material(&Material {
        diffuse: Color::WHITE,
        power: 8.0,
        ..Material::default()
    });
    cs.set_light(
        3,
        &Light {
            kind: LIGHT_POINT,
            range: 100.0,
            attenuation: [1.0, 0.1, 0.0],
            ..Light::default()
        },
    );
    cs.set_light_enable(3, true);
    cs.set_stream_source(0, Some(vb), 0, 32);
    cs.set_stream_source_freq(0, 4, 1);
    cs.set_index_buffer(Some(ib), IndexFormat::Uint32);
    cs.set_viewport(&Viewport {
        x: 0,
        y: 0,
        width: 640,
        height: 480,
        min_z: 0.0,
        max_z: 1.0,
    });
    cs.set_scissor_rect(&RectI::new(1, 2, 3, 4));
    cs.set_render_target(0, Some(rt));
    cs.set_depth_stencil(None);
    cs.set_base_vertex_index(5);
    cs.set_primitive_type(PrimitiveType::TriangleStrip);
    cs.draw(0, 3, 0, 1, false);
}

#[test]
fn single_and_multi_threaded_modes_converge() {
    let tex = Resource::new(1, ResourceKind::Texture);
    let vb = Resource::new(2, ResourceKind::Buffer);
    let ib = Resource::new(3, ResourceKind::Buffer);
    let rt = Resource::new(4, ResourceKind::Surface);

    let (st, _) = stream(ExecutionMode::SingleThreaded);
    drive(&st, &tex, &vb, &ib, &rt);
    let st_state = st.shutdown();

    let (mt, _) = stream(ExecutionMode::MultiThreaded);
    drive(&mt, &tex, &vb, &ib, &rt);
    let mt_state = mt.shutdown();

    assert_eq!(st_state, mt_state);
    assert_eq!(st_state.render_states[7], 2);
    assert_eq!(st_state.vs_consts_f[5], [5.0, 6.0, 7.0, 8.0]);
    assert_eq!(st_state.primitive_type, PrimitiveType::TriangleStrip);
    assert!(st_state.lights[&3].enabled);
}

#[test]
fn flush_observes_last_write_wins() {
    let (cs, calls) = stream(ExecutionMode::MultiThreaded);
    cs.set_render_state(100, 1);
    cs.set_render_state(100, 2);
    cs.flush_and_wait();

    let invalidations = calls.invalidations.lock().unwrap().clone();
    assert_eq!(
        invalidations
            .iter()
            .filter(|b| **b == StateBinding::RenderState(100))
            .count(),
        2
    );

    let state = cs.shutdown();
    assert_eq!(state.render_states[100], 2);
}

#[test]
fn variable_length_records_advance_correctly() {
    let (cs, calls) = stream(ExecutionMode::MultiThreaded);
    let rects = [
        RectI::new(0, 0, 1, 1),
        RectI::new(1, 1, 2, 2),
        RectI::new(2, 2, 3, 3),
        RectI::new(3, 3, 4, 4),
    ];
    cs.clear(&rects, ClearFlags::TARGET | ClearFlags::ZBUFFER, Color::TRANSPARENT_BLACK, 1.0, 0);
    cs.draw(0, 3, 0, 1, false);
    cs.flush_and_wait();

    let clears = calls.clears.lock().unwrap();
    assert_eq!(clears.len(), 1);
    assert_eq!(clears[0].0, rects.to_vec());
    assert_eq!(clears[0].1, ClearFlags::TARGET | ClearFlags::ZBUFFER);
    // The draw queued directly behind the variable-length clear decoded at
    // the right offset.
    assert_eq!(calls.draws.load(Ordering::SeqCst), 1);
}

#[test]
fn priority_round_trip_overtakes_saturated_normal_channel() {
    let query = Resource::new(9, ResourceKind::Query);
    let (mut backend, calls) = backend();
    backend.draw_delay = Duration::from_micros(20);
    let cs = CommandStream::new(backend, StreamConfig::default()).unwrap();

    const DRAWS: usize = 2000;
    for _ in 0..DRAWS {
        cs.draw(0, 3, 0, 1, false);
    }
    // The normal channel is saturated with tens of milliseconds of work; the
    // priority round-trip must come back long before it drains.
    assert_eq!(cs.get_query_data(&query, QueryFlags::empty()), Some(42));
    let pending = calls.draws_at_read_query.load(Ordering::SeqCst);
    assert!(
        pending < DRAWS,
        "query readback waited for the whole normal backlog ({pending} draws)"
    );

    cs.flush_and_wait();
    assert_eq!(calls.draws.load(Ordering::SeqCst), DRAWS);
    drop(cs);
}

#[test]
fn present_backpressure_limits_inflight_frames() {
    let swapchain = Resource::new(5, ResourceKind::SwapChain);
    let (mut backend, calls) = backend();
    let (permit, gate) = mpsc::channel();
    backend.present_gate = Some(gate);
    let cs = CommandStream::new(backend, StreamConfig::default()).unwrap();

    // First present: queued without waiting, one frame in flight.
    cs.present(&swapchain, None, None, 0);
    assert_eq!(cs.pending_presents(), 1);

    let hold = Duration::from_millis(50);
    let unblocker = std::thread::spawn(move || {
        std::thread::sleep(hold);
        permit.send(()).unwrap();
        permit.send(()).unwrap();
    });

    // Second present: must wait for the first to complete worker-side.
    let start = Instant::now();
    cs.present(&swapchain, None, None, 0);
    assert!(
        start.elapsed() >= hold,
        "second present did not wait for the first"
    );
    assert!(cs.pending_presents() <= 1);

    unblocker.join().unwrap();
    cs.flush_and_wait();
    assert_eq!(calls.presents.load(Ordering::SeqCst), 2);
    assert_eq!(cs.pending_presents(), 0);
    drop(cs);
}

#[test]
fn bind_counts_track_rebinds() {
    let a = Resource::new(1, ResourceKind::Texture);
    let b = Resource::new(2, ResourceKind::Texture);
    let vb = Resource::new(3, ResourceKind::Buffer);
    let (cs, _) = stream(ExecutionMode::MultiThreaded);

    cs.set_texture(0, Some(&a));
    cs.flush_and_wait();
    assert_eq!(a.bind_count(), 1);

    cs.set_texture(0, Some(&b));
    cs.flush_and_wait();
    assert_eq!(a.bind_count(), 0);
    assert_eq!(b.bind_count(), 1);

    cs.set_texture(0, None);
    cs.flush_and_wait();
    assert_eq!(b.bind_count(), 0);

    cs.set_stream_source(0, Some(&vb), 0, 16);
    cs.flush_and_wait();
    assert_eq!(vb.bind_count(), 1);
    cs.reset_state();
    cs.flush_and_wait();
    assert_eq!(vb.bind_count(), 0);
}

#[test]
fn map_and_query_round_trips() {
    let buffer = Resource::new(11, ResourceKind::Buffer);
    let query = Resource::new(12, ResourceKind::Query);
    let (cs, calls) = stream(ExecutionMode::MultiThreaded);

    let token = cs.map(&buffer, 0, 64, MapFlags::WRITE | MapFlags::DISCARD).unwrap();
    assert_eq!(token, 0xA000_0000 | buffer.id() as u64);
    cs.unmap(&buffer).unwrap();

    cs.invalidate_buffer_range(&buffer, 128, 256);
    cs.issue_query(&query, QueryFlags::empty());
    assert_eq!(cs.get_query_data(&query, QueryFlags::FLUSH), Some(42));
    cs.flush_and_wait();

    assert_eq!(calls.maps.load(Ordering::SeqCst), 1);
    assert_eq!(calls.unmaps.load(Ordering::SeqCst), 1);
    assert_eq!(calls.issued_queries.load(Ordering::SeqCst), 1);
    assert_eq!(
        calls.invalidated_ranges.lock().unwrap().as_slice(),
        &[(11, 128, 256)]
    );
}

#[test]
fn single_threaded_mode_dispatches_inline() {
    let (cs, calls) = stream(ExecutionMode::SingleThreaded);

    cs.set_render_state(3, 7);
    // No flush: inline dispatch already ran on this thread.
    assert_eq!(
        calls.invalidations.lock().unwrap().as_slice(),
        &[StateBinding::RenderState(3)]
    );

    cs.draw(0, 3, 0, 1, false);
    assert_eq!(calls.draws.load(Ordering::SeqCst), 1);

    let state = cs.shutdown();
    assert_eq!(state.render_states[3], 7);
}

#[test]
fn reset_state_restores_defaults() {
    let tex = Resource::new(1, ResourceKind::Texture);
    let vb = Resource::new(2, ResourceKind::Buffer);
    let ib = Resource::new(3, ResourceKind::Buffer);
    let rt = Resource::new(4, ResourceKind::Surface);
    let (cs, _) = stream(ExecutionMode::MultiThreaded);

    drive(&cs, &tex, &vb, &ib, &rt);
    cs.reset_state();
    cs.flush_and_wait();

    let state = cs.shutdown();
    assert_eq!(state, DeviceState::default());
    assert_eq!(tex.bind_count(), 0);
    assert_eq!(rt.bind_count(), 0);
}

#[test]
fn blt_and_color_fill_reach_the_backend() {
    let src = Resource::new(21, ResourceKind::Surface);
    let dst = Resource::new(22, ResourceKind::Surface);
    let (cs, calls) = stream(ExecutionMode::MultiThreaded);

    cs.blt(&dst, &RectI::new(0, 0, 64, 64), &src, &RectI::new(0, 0, 64, 64), 0);
    cs.color_fill(&dst, Some(&RectI::new(0, 0, 8, 8)), Color::WHITE);
    cs.color_fill(&dst, None, Color::TRANSPARENT_BLACK);
    cs.finish();

    assert_eq!(calls.blts.load(Ordering::SeqCst), 1);
    assert_eq!(calls.fills.load(Ordering::SeqCst), 2);
    assert_eq!(calls.finishes.load(Ordering::SeqCst), 1);
}

#[test]
fn rejects_bad_channel_capacity() {
    let (backend, _) = backend();
    let result = CommandStream::new(
        backend,
        StreamConfig {
            normal_capacity: 1000,
            ..StreamConfig::default()
        },
    );
    assert!(matches!(
        result,
        Err(CreateError::InvalidCapacity { which: "normal", .. })
    ));
}
