//! Latch GPU memory simulator
//!
//! Drives the allocator with a streaming workload: meshes are spawned,
//! animated, grown and despawned every frame while a rayon pool of
//! consumers resolves every live mesh, the way render threads would.
//!
//! Usage: `latch-gpumem-sim [config.json|-] [frames]`

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use latch_gpumem::{
    init, CommitOutcome, Consumers, GpuBackend, GpuMemConfig, GpuMemError, GpuMemResult, Handle,
    Producer, Read, ResourceKind, Residency,
};
use rayon::prelude::*;
use tracing::{debug, info, warn};

const DEFAULT_FRAMES: u64 = 600;
const REPORT_EVERY: u64 = 60;
/// Handles resolved by one reader, i.e. one command list.
const CONSUMER_BATCH: usize = 32;
const MAX_SEGMENTS: u32 = 2048;

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct Vertex {
    position: [f32; 3],
    uv: [f32; 2],
}

/// A ring of `segments` vertices around `center`.
fn ring(center: Vec3, radius: f32, segments: u32, phase: f32) -> Vec<Vertex> {
    (0..segments)
        .map(|i| {
            let t = i as f32 / segments as f32;
            let angle = t * std::f32::consts::TAU + phase;
            let offset = Vec3::new(angle.cos(), angle.sin(), 0.0) * radius;
            let uv = Vec2::new(t, 0.5 + 0.5 * angle.sin());
            Vertex {
                position: (center + offset).to_array(),
                uv: uv.to_array(),
            }
        })
        .collect()
}

fn fan_indices(segments: u32) -> Vec<u32> {
    (1..segments.saturating_sub(1))
        .flat_map(|i| [0, i, i + 1])
        .collect()
}

/// xorshift64*; deterministic so runs are comparable.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn range(&mut self, lo: u64, hi: u64) -> u64 {
        lo + self.next() % (hi - lo)
    }

    fn unit(&mut self) -> f32 {
        (self.next() >> 40) as f32 / (1u64 << 24) as f32
    }
}

struct Mesh {
    vertices: Handle,
    indices: Handle,
    center: Vec3,
    radius: f32,
    segments: u32,
    animated: bool,
    expires_at: u64,
}

struct Scene {
    meshes: Vec<Mesh>,
    rng: Rng,
    spawned: u64,
    despawned: u64,
}

impl Scene {
    fn new(seed: u64) -> Self {
        Self {
            meshes: Vec::new(),
            rng: Rng(seed | 1),
            spawned: 0,
            despawned: 0,
        }
    }

    fn handles(&self) -> Vec<Handle> {
        self.meshes
            .iter()
            .flat_map(|m| [m.vertices, m.indices])
            .collect()
    }

    /// One frame of producer work.
    fn step<B: GpuBackend>(&mut self, producer: &mut Producer<B>, frame: u64) -> Result<()> {
        let mut i = 0;
        while i < self.meshes.len() {
            if self.meshes[i].expires_at <= frame {
                let mesh = self.meshes.swap_remove(i);
                producer.discard(mesh.vertices)?;
                producer.discard(mesh.indices)?;
                self.despawned += 1;
            } else {
                i += 1;
            }
        }

        let phase = frame as f32 * 0.05;
        for mesh in self.meshes.iter().filter(|m| m.animated) {
            let vertices = ring(mesh.center, mesh.radius, mesh.segments, phase);
            let updated = producer.update(mesh.vertices, bytemuck::cast_slice(&vertices));
            skip_out_of_memory(updated, frame, "animate")?;
        }

        if !self.meshes.is_empty() && self.rng.range(0, 8) == 0 {
            let pick = self.rng.range(0, self.meshes.len() as u64) as usize;
            let mesh = &mut self.meshes[pick];
            if mesh.segments < MAX_SEGMENTS {
                let old_len = (mesh.segments as usize * std::mem::size_of::<Vertex>()) as u64;
                mesh.segments *= 2;
                let vertices = ring(mesh.center, mesh.radius, mesh.segments, phase);
                let indices = fan_indices(mesh.segments);
                let len = std::mem::size_of_val(vertices.as_slice()) as u64;
                let grown = skip_out_of_memory(producer.resize(mesh.vertices, len), frame, "grow")?
                    && skip_out_of_memory(
                        producer.update(mesh.vertices, bytemuck::cast_slice(&vertices)),
                        frame,
                        "grow",
                    )?
                    && skip_out_of_memory(
                        producer.update(mesh.indices, bytemuck::cast_slice(&indices)),
                        frame,
                        "grow",
                    )?;
                if !grown {
                    mesh.segments /= 2;
                    // Shrinking never needs device memory.
                    producer.resize(mesh.vertices, old_len)?;
                }
            }
        }

        let spawns = self.rng.range(2, 6);
        for _ in 0..spawns {
            let static_mesh = frame % 120 == 0;
            let segments = self.rng.range(16, 513) as u32;
            let center = Vec3::new(self.rng.unit(), self.rng.unit(), 0.0) * 100.0;
            let residency = if static_mesh { Residency::LongLived } else { Residency::Transient };
            let expires_at = if static_mesh {
                u64::MAX
            } else {
                frame + self.rng.range(30, 240)
            };
            if let Some(mesh) = self.spawn(producer, center, segments, residency, expires_at)? {
                self.meshes.push(Mesh {
                    animated: !static_mesh && self.rng.range(0, 4) == 0,
                    ..mesh
                });
                self.spawned += 1;
            }
        }
        Ok(())
    }

    fn spawn<B: GpuBackend>(
        &mut self,
        producer: &mut Producer<B>,
        center: Vec3,
        segments: u32,
        residency: Residency,
        expires_at: u64,
    ) -> Result<Option<Mesh>> {
        let radius = 1.0 + self.rng.unit() * 4.0;
        let vertices = ring(center, radius, segments, 0.0);
        let indices = fan_indices(segments);
        let vertex_handle =
            match producer.create_with(ResourceKind::Vertex, bytemuck::cast_slice(&vertices), residency) {
                Ok(handle) => handle,
                Err(GpuMemError::OutOfDeviceMemory { .. }) => {
                    warn!(segments, "out of device memory, skipping spawn");
                    return Ok(None);
                }
                Err(err) => return Err(err.into()),
            };
        let index_handle =
            match producer.create_with(ResourceKind::Index, bytemuck::cast_slice(&indices), residency) {
                Ok(handle) => handle,
                Err(GpuMemError::OutOfDeviceMemory { .. }) => {
                    producer.discard(vertex_handle)?;
                    warn!(segments, "out of device memory, skipping spawn");
                    return Ok(None);
                }
                Err(err) => return Err(err.into()),
            };
        Ok(Some(Mesh {
            vertices: vertex_handle,
            indices: index_handle,
            center,
            radius,
            segments,
            animated: false,
            expires_at,
        }))
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Reads {
    ready: usize,
    skipped: usize,
    bytes: u64,
}

impl Reads {
    fn merge(self, other: Self) -> Self {
        Self {
            ready: self.ready + other.ready,
            skipped: self.skipped + other.skipped,
            bytes: self.bytes + other.bytes,
        }
    }
}

/// Resolve every handle from parallel readers, one per batch.
fn consume<B: GpuBackend>(consumers: &Consumers<B>, handles: &[Handle]) -> Reads {
    handles
        .par_chunks(CONSUMER_BATCH)
        .map(|batch| {
            let mut reader = consumers.reader();
            let mut reads = Reads::default();
            for &handle in batch {
                match reader.try_read(handle) {
                    Read::Ready(view) => {
                        reads.ready += 1;
                        reads.bytes += view.size;
                    }
                    Read::Skip(_) => reads.skipped += 1,
                }
            }
            let frame = reader.finish();
            consumers.submit_frame(frame);
            reads
        })
        .reduce(Reads::default, Reads::merge)
}

/// `Ok(false)` when the device ran out of memory; the frame goes on without
/// that change.
fn skip_out_of_memory(result: GpuMemResult<()>, frame: u64, what: &str) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(GpuMemError::OutOfDeviceMemory { .. }) => {
            warn!(frame, what, "out of device memory, skipping");
            Ok(false)
        }
        Err(err) => Err(err.into()),
    }
}

fn simulate<B: GpuBackend>(config: GpuMemConfig, backend: B, frames: u64) -> Result<()> {
    let (mut producer, consumers) = init(config, backend)?;
    let mut scene = Scene::new(0x5eed_1a7c);
    let mut last_report = None;

    for frame in 0..frames {
        let handles = scene.handles();
        let (reads, stepped) = rayon::join(
            || consume(&consumers, &handles),
            || scene.step(&mut producer, frame),
        );
        stepped?;
        let report = producer.end_frame();
        if let CommitOutcome::Deferred(reason) = report.commit {
            debug!(frame, ?reason, "commit deferred");
        }
        if frame % REPORT_EVERY == 0 {
            let stats = report.stats;
            info!(
                frame,
                committed = stats.committed_frame,
                chunks = stats.chunks,
                blocks = stats.blocks,
                handles = stats.handles,
                resident_kib = stats.resident_bytes / 1024,
                occupied_kib = stats.occupied_bytes / 1024,
                ready = reads.ready,
                skipped = reads.skipped,
                read_kib = reads.bytes / 1024,
                relocations = report.defrag.relocations,
                "frame"
            );
        }
        last_report = Some(report);
    }

    producer.check_invariants().map_err(anyhow::Error::msg)?;
    if let Some(report) = last_report {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    for (name, value) in producer.counters().iter() {
        info!(counter = name, value, "total");
    }
    let peak_chunks = producer
        .ledger()
        .history("chunks")
        .into_iter()
        .map(|(_, chunks)| chunks)
        .max()
        .unwrap_or(0);
    info!(
        spawned = scene.spawned,
        despawned = scene.despawned,
        live = scene.meshes.len(),
        peak_chunks,
        typical_request = producer.defragmenter().typical_request(),
        "simulation finished"
    );
    Ok(())
}

fn load_config(path: &str) -> Result<GpuMemConfig> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    GpuMemConfig::from_json_str(&text).with_context(|| format!("parsing {path}"))
}

#[cfg(feature = "wgpu")]
fn wgpu_backend() -> Result<latch_gpumem::WgpuBackend> {
    use std::sync::Arc;

    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::default(),
        compatible_surface: None,
        force_fallback_adapter: false,
    }))
    .context("no suitable GPU adapter")?;
    let (device, queue) = pollster::block_on(adapter.request_device(
        &wgpu::DeviceDescriptor {
            label: Some("latch_gpumem_sim"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::default(),
        },
        None,
    ))
    .context("failed to create device")?;
    info!(adapter = ?adapter.get_info().name, "using wgpu backend");
    Ok(latch_gpumem::WgpuBackend::new(Arc::new(device), Arc::new(queue)))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) if path != "-" => load_config(&path)?,
        _ => GpuMemConfig::default(),
    };
    let frames = args
        .next()
        .map(|arg| arg.parse::<u64>())
        .transpose()
        .context("frame count must be an integer")?
        .unwrap_or(DEFAULT_FRAMES);

    info!("Latch GPU memory simulator v{}", latch_gpumem::VERSION);

    #[cfg(feature = "wgpu")]
    let backend = wgpu_backend()?;
    #[cfg(not(feature = "wgpu"))]
    let backend = latch_gpumem::HostBackend::new();

    simulate(config, backend, frames)
}
