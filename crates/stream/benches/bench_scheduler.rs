use std::hint::black_box;
use std::sync::Arc;
use std::time::Instant;

use glam::{IVec3, Vec3};
use voxelcore_common::{BlockKey, PeerId};
use voxelcore_kernel::{HeightmapTerrain, TerrainParams, World, WorldConfig};
use voxelcore_mesh::DebugMeshSink;
use voxelcore_stream::{StreamConfig, StreamingScheduler, WorkerPool, desired_leaves};

fn make_world() -> World {
    let source = Arc::new(HeightmapTerrain::new(TerrainParams::default()));
    World::new(WorldConfig::default(), source, PeerId::new()).expect("default config is valid")
}

fn stream_config(view_radius: f32) -> StreamConfig {
    StreamConfig {
        view_radius,
        lod0_radius: view_radius / 4.0,
        dispatch_budget: 64,
        max_in_flight: 128,
        ..StreamConfig::default()
    }
}

fn bench_desired_leaves(view_radius: f32, iterations: usize) {
    let config = stream_config(view_radius);
    let world_config = WorldConfig::default();
    let start = Instant::now();
    let mut count = 0;
    for i in 0..iterations {
        let viewer = Vec3::new(i as f32, 0.0, 8.0);
        count = black_box(desired_leaves(black_box(&[viewer]), &config, &world_config)).len();
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / iterations as u32;
    println!(
        "  desired leaves (r={view_radius}, {count} leaves, {iterations} iters): {per_iter:?}/iter, total {elapsed:?}"
    );
}

fn bench_initial_load(view_radius: f32, pool: WorkerPool, label: &str) {
    let mut world = make_world();
    let mut scheduler = StreamingScheduler::with_pool(stream_config(view_radius), pool);
    let mut sink = DebugMeshSink::new();
    let viewer = Vec3::new(0.0, 0.0, 8.0);

    let start = Instant::now();
    let report = scheduler.run_until_idle(&mut world, &[viewer], 100_000);
    let elapsed = start.elapsed();
    scheduler.flush_to(&mut sink);
    println!(
        "  initial load {label} (r={view_radius}): {} ticks, {}/{} ready, {} meshes, {} tris, {elapsed:?}",
        scheduler.current_tick(),
        report.ready,
        report.needed,
        sink.len(),
        sink.triangle_count()
    );
}

fn bench_walk(view_radius: f32, steps: usize) {
    let mut world = make_world();
    let pool = WorkerPool::new(0).expect("worker pool");
    let mut scheduler = StreamingScheduler::with_pool(stream_config(view_radius), pool);
    scheduler.run_until_idle(&mut world, &[Vec3::new(0.0, 0.0, 8.0)], 100_000);

    let start = Instant::now();
    for i in 0..steps {
        let viewer = Vec3::new(i as f32 * 2.0, 0.0, 8.0);
        black_box(scheduler.tick(&mut world, black_box(&[viewer])));
    }
    let elapsed = start.elapsed();
    let per_tick = elapsed / steps as u32;
    println!(
        "  walk (r={view_radius}, {steps} ticks): {per_tick:?}/tick, avg frame {:?}, max frame {:?}, {} nodes",
        scheduler.timer().average(),
        scheduler.timer().max(),
        world.octree().node_count()
    );
}

fn bench_edit_remesh(iterations: usize) {
    let mut world = make_world();
    let mut scheduler = StreamingScheduler::inline(stream_config(48.0));
    let viewer = Vec3::new(0.0, 0.0, 8.0);
    scheduler.run_until_idle(&mut world, &[viewer], 100_000);

    let start = Instant::now();
    for i in 0..iterations {
        let p = IVec3::new((i % 16) as i32, 0, 4);
        let edit = voxelcore_kernel::VoxelEdit::set(p, voxelcore_common::Voxel((i % 7 + 1) as u8));
        world.record(edit).expect("edit applies");
        scheduler.run_until_idle(&mut world, &[viewer], 100);
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / iterations as u32;
    let key = BlockKey::containing(IVec3::new(0, 0, 4), 0, world.edge());
    println!(
        "  edit + remesh ({iterations} iters): {per_iter:?}/iter, block rev {}",
        world.block(key).map_or(0, |b| b.revision())
    );
}

fn main() {
    println!("=== Streaming Scheduler Benchmarks ===\n");

    println!("LOD selection:");
    bench_desired_leaves(64.0, 1000);
    bench_desired_leaves(192.0, 100);
    bench_desired_leaves(512.0, 10);

    println!("\nInitial load:");
    bench_initial_load(64.0, WorkerPool::inline(), "inline");
    bench_initial_load(64.0, WorkerPool::new(0).expect("worker pool"), "pooled");
    bench_initial_load(192.0, WorkerPool::new(0).expect("worker pool"), "pooled");

    println!("\nViewer walk:");
    bench_walk(96.0, 200);

    println!("\nEdit then re-mesh:");
    bench_edit_remesh(100);

    println!("\n=== Done ===");
}
