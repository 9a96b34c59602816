use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use glam::{IVec3, Vec3};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use voxelcore_common::{PeerId, Voxel, VoxelRegion};
use voxelcore_kernel::generator::splitmix64;
use voxelcore_kernel::{FlatPlane, HeightmapTerrain, VoxelEdit, VoxelSource, World, WorldConfig};
use voxelcore_mesh::DebugMeshSink;
use voxelcore_persist::{WorldStore, list_worlds};
use voxelcore_stream::{StreamConfig, StreamingScheduler};
use voxelcore_sync::{Editor, Frame, Replica, encode_frames};

#[derive(Parser)]
#[command(name = "voxelcore", about = "CLI tool for voxelcore worlds")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON file with `world` and `stream` settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print crate info and the effective configuration
    Info,
    /// Stream a world around one viewer and report the result
    Generate {
        #[arg(short, long, value_enum, default_value = "terrain")]
        generator: GeneratorKind,
        /// Viewer position as x,y,z
        #[arg(long, default_value = "0,0,48", value_parser = parse_vec3)]
        viewer: Vec3,
        /// Maximum scheduler ticks
        #[arg(short, long, default_value = "10000")]
        ticks: u64,
        /// Worker threads (overrides the config file)
        #[arg(long)]
        threads: Option<usize>,
        /// List every resident mesh
        #[arg(long)]
        meshes: bool,
    },
    /// Replicate random edits between peers over the wire format and check
    /// that every replica ends in the same state
    Converge {
        #[arg(short, long, default_value = "3")]
        peers: usize,
        #[arg(short, long, default_value = "64")]
        edits: usize,
        /// Seed for edit positions and delivery order
        #[arg(short, long, default_value = "7")]
        seed: u64,
    },
    /// Generate a world, apply edits and save it
    Save {
        dir: PathBuf,
        #[arg(short, long, default_value = "world")]
        name: String,
        #[arg(short, long, value_enum, default_value = "terrain")]
        generator: GeneratorKind,
        /// Number of random box edits
        #[arg(short, long, default_value = "16")]
        edits: usize,
        /// Undo this many of the edits before saving
        #[arg(long, default_value = "0")]
        undo: usize,
    },
    /// Load a saved world and report what was restored
    Load {
        dir: PathBuf,
        /// Also stream around this viewer after loading (x,y,z)
        #[arg(long, value_parser = parse_vec3)]
        stream: Option<Vec3>,
    },
    /// Check the integrity chain and every block record of a saved world
    Verify { dir: PathBuf },
    /// List saved worlds in a directory, most recently played first
    List { dir: PathBuf },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum GeneratorKind {
    Flat,
    Terrain,
}

impl GeneratorKind {
    fn source(self) -> Arc<dyn VoxelSource> {
        match self {
            Self::Flat => Arc::new(FlatPlane::default()),
            Self::Terrain => Arc::new(HeightmapTerrain::default()),
        }
    }

    fn from_source_name(name: &str) -> anyhow::Result<Self> {
        match name {
            "flat" => Ok(Self::Flat),
            "heightmap" => Ok(Self::Terrain),
            other => bail!("world was generated by unknown source {other:?}"),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct CliConfig {
    world: WorldConfig,
    stream: StreamConfig,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<CliConfig> {
    let Some(path) = path else {
        return Ok(CliConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: CliConfig = serde_json::from_str(&text)
        .with_context(|| format!("parsing config {}", path.display()))?;
    config.world.validate()?;
    Ok(config)
}

fn parse_vec3(s: &str) -> Result<Vec3, String> {
    let parts: Vec<f32> = s
        .split(',')
        .map(|p| p.trim().parse::<f32>().map_err(|e| format!("{p:?}: {e}")))
        .collect::<Result<_, _>>()?;
    match parts.as_slice() {
        [x, y, z] => Ok(Vec3::new(*x, *y, *z)),
        _ => Err(format!("expected x,y,z, got {s:?}")),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Info => {
            println!("voxelcore v{}", env!("CARGO_PKG_VERSION"));
            println!("common: {}", voxelcore_common::crate_info());
            println!("kernel: {}", voxelcore_kernel::crate_info());
            println!("mesh: {}", voxelcore_mesh::crate_info());
            println!("stream: {}", voxelcore_stream::crate_info());
            println!("persist: {}", voxelcore_persist::crate_info());
            println!("sync: {}", voxelcore_sync::crate_info());
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Generate {
            generator,
            viewer,
            ticks,
            threads,
            meshes,
        } => generate(&config, generator, viewer, ticks, threads, meshes)?,
        Commands::Converge { peers, edits, seed } => converge(&config, peers, edits, seed)?,
        Commands::Save {
            dir,
            name,
            generator,
            edits,
            undo,
        } => save(&config, &dir, &name, generator, edits, undo)?,
        Commands::Load { dir, stream } => load(&config, &dir, stream)?,
        Commands::Verify { dir } => {
            let store = WorldStore::open(&dir)?;
            store.verify_integrity()?;
            let scan = store.scan_blocks()?;
            println!(
                "integrity chain OK: {} entries, {} block records valid",
                store.integrity().entries.len(),
                scan.valid.len()
            );
            for (key, err) in &scan.corrupt {
                println!("  corrupt {key}: {err}");
            }
            if !scan.corrupt.is_empty() {
                bail!("{} corrupt block records", scan.corrupt.len());
            }
        }
        Commands::List { dir } => {
            let worlds = list_worlds(&dir)?;
            if worlds.is_empty() {
                println!("no worlds in {}", dir.display());
            }
            for w in worlds {
                println!(
                    "{:<20} seed={:<8} last_played={} created={} {}",
                    w.name,
                    w.seed,
                    w.last_played_ms,
                    w.created_ms,
                    w.path.display()
                );
            }
        }
    }

    Ok(())
}

fn generate(
    config: &CliConfig,
    generator: GeneratorKind,
    viewer: Vec3,
    ticks: u64,
    threads: Option<usize>,
    meshes: bool,
) -> anyhow::Result<()> {
    let mut world = World::new(config.world.clone(), generator.source(), PeerId::new())?;
    let mut stream = config.stream.clone();
    if let Some(threads) = threads {
        stream.worker_threads = threads;
    }
    let mut scheduler = StreamingScheduler::new(stream)?;
    let mut sink = DebugMeshSink::new();

    let start = Instant::now();
    let report = scheduler.run_until_idle(&mut world, &[viewer], ticks);
    let elapsed = start.elapsed();
    scheduler.flush_to(&mut sink);

    let stats = scheduler.stats();
    println!(
        "streamed {}/{} blocks in {} ticks ({elapsed:?}, avg tick {:?})",
        report.ready,
        report.needed,
        scheduler.current_tick(),
        scheduler.timer().average()
    );
    println!(
        "generated={} meshed={} failed={} nodes={} meshes={} triangles={}",
        stats.generated,
        stats.meshed,
        stats.failed,
        world.octree().node_count(),
        sink.len(),
        sink.triangle_count()
    );
    if meshes {
        print!("{}", sink.render());
    }
    Ok(())
}

/// Deterministic pseudo-random stream for edit positions and delivery order.
struct Mix(u64);

impl Mix {
    fn next(&mut self) -> u64 {
        self.0 = splitmix64(self.0);
        self.0
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n.max(1)
    }

    fn offset(&mut self, span: i32) -> i32 {
        self.below(span as u64) as i32 - span / 2
    }
}

fn converge(config: &CliConfig, peers: usize, edits: usize, seed: u64) -> anyhow::Result<()> {
    if !(2..=255).contains(&peers) {
        bail!("converge needs between 2 and 255 peers, got {peers}");
    }
    let ids: Vec<PeerId> = (0..peers)
        .map(|i| PeerId::from_bytes([i as u8 + 1; 16]))
        .collect();
    let index: BTreeMap<PeerId, usize> = ids.iter().enumerate().map(|(i, p)| (*p, i)).collect();
    let world_config = WorldConfig {
        required_peers: ids.clone(),
        ..config.world.clone()
    };
    let mut worlds = ids
        .iter()
        .map(|id| World::new(world_config.clone(), Arc::new(FlatPlane::default()), *id))
        .collect::<Result<Vec<_>, _>>()?;
    let mut replicas: Vec<Replica> = ids.iter().map(|id| Replica::new(*id)).collect();

    let mut mail: Vec<(usize, usize, Vec<u8>)> = Vec::new();
    for i in 0..peers {
        for j in 0..peers {
            if i != j {
                let hello = replicas[i].connect(&worlds[i], ids[j]);
                mail.push((i, j, hello.encode()?));
            }
        }
    }

    let mut rng = Mix(seed);
    for _ in 0..edits {
        let who = rng.below(peers as u64) as usize;
        let p = IVec3::new(rng.offset(24), rng.offset(24), rng.offset(8));
        let value = Voxel(1 + rng.below(10) as u8);
        worlds[who].record(VoxelEdit::set(p, value))?;
    }

    let (mut frames, mut bytes, mut rounds) = (0usize, 0usize, 0usize);
    loop {
        for (i, replica) in replicas.iter_mut().enumerate() {
            for (to, frame) in replica.outbound(&worlds[i]) {
                let j = index.get(&to).copied().context("outbound frame for unknown peer")?;
                mail.push((i, j, frame.encode()?));
            }
        }
        if mail.is_empty() {
            break;
        }
        rounds += 1;
        // Seeded Fisher-Yates: links deliver out of order.
        for k in (1..mail.len()).rev() {
            let m = rng.below(k as u64 + 1) as usize;
            mail.swap(k, m);
        }
        for (from, to, payload) in std::mem::take(&mut mail) {
            frames += 1;
            bytes += payload.len();
            let (replies, _) = replicas[to].ingest_bytes(&mut worlds[to], ids[from], &payload)?;
            // Acks go to every peer so each replica can compact every origin.
            let (acks, direct): (Vec<Frame>, Vec<Frame>) =
                replies.into_iter().partition(|f| matches!(f, Frame::Ack(_)));
            if !acks.is_empty() {
                let encoded = encode_frames(&acks)?;
                for peer in (0..peers).filter(|p| *p != to) {
                    mail.push((to, peer, encoded.clone()));
                }
            }
            if !direct.is_empty() {
                mail.push((to, from, encode_frames(&direct)?));
            }
        }
    }
    println!("delivered {frames} frames ({bytes} bytes) in {rounds} rounds");

    let mut hashes = Vec::with_capacity(peers);
    for (id, world) in ids.iter().zip(worlds.iter_mut()) {
        let folded = world.compact_all()?;
        let hash = world.state_hash();
        println!(
            "  {id}: state={hash:#018x} folded={folded} log={}",
            world.edit_log().len()
        );
        hashes.push(hash);
    }
    if hashes.windows(2).any(|w| w[0] != w[1]) {
        bail!("replicas diverged");
    }
    println!("all {peers} replicas converged");
    Ok(())
}

fn save(
    config: &CliConfig,
    dir: &Path,
    name: &str,
    generator: GeneratorKind,
    edits: usize,
    undo: usize,
) -> anyhow::Result<()> {
    let mut world = World::new(config.world.clone(), generator.source(), PeerId::new())?;
    let mut editor = Editor::new();
    let mut rng = Mix(world.config().seed);
    for _ in 0..edits {
        let min = IVec3::new(rng.offset(64), rng.offset(64), rng.offset(64));
        let size = IVec3::new(
            1 + rng.below(6) as i32,
            1 + rng.below(6) as i32,
            1 + rng.below(6) as i32,
        );
        let value = if rng.below(3) == 0 {
            Voxel::AIR
        } else {
            Voxel(1 + rng.below(10) as u8)
        };
        editor.apply(&mut world, VoxelEdit::fill(VoxelRegion::new(min, min + size), value))?;
    }
    for _ in 0..undo {
        if editor.undo(&mut world)?.is_none() {
            break;
        }
    }

    let mut store = WorldStore::open(dir)?;
    let report = store.save_world(&world, name)?;
    println!(
        "saved {name:?} to {}: {} blocks, {} records, segment {}, {} leaves, state={:#018x}",
        dir.display(),
        report.blocks,
        report.records,
        report.segment,
        report.topology,
        world.state_hash()
    );
    Ok(())
}

fn load(config: &CliConfig, dir: &Path, stream: Option<Vec3>) -> anyhow::Result<()> {
    let store = WorldStore::open(dir)?;
    let manifest = store.manifest()?;
    let generator = GeneratorKind::from_source_name(&manifest.generator)?;
    let (mut world, report) = store.load_world(generator.source())?;
    println!(
        "loaded {:?}: {} blocks, {} records, {} nodes, state={:#018x}",
        report.name,
        report.loaded,
        report.records,
        report.nodes,
        world.state_hash()
    );
    for (key, err) in &report.corrupt {
        println!("  regenerated corrupt block {key}: {err}");
    }
    for key in &report.missing {
        println!("  missing block record {key}");
    }

    if let Some(viewer) = stream {
        let mut scheduler = StreamingScheduler::new(config.stream.clone())?;
        let tick = scheduler.run_until_idle(&mut world, &[viewer], 10_000);
        println!(
            "streamed {}/{} blocks in {} ticks",
            tick.ready,
            tick.needed,
            scheduler.current_tick()
        );
    }
    Ok(())
}
