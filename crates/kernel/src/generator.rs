use std::fmt;
use std::sync::Arc;

use glam::IVec3;
use noise::{Fbm, MultiFractal, NoiseFn, OpenSimplex};
use voxelcore_common::{BlockKey, Material, Voxel};

use crate::block::{VoxelBlock, volume};
use crate::error::CorruptBlockError;

/// Pluggable field capability: maps a world coordinate and seed to a voxel.
///
/// Implementations must be deterministic and free of shared mutable state;
/// they are called concurrently from worker threads.
pub trait VoxelSource: Send + Sync {
    fn sample(&self, coord: IVec3, seed: u64) -> Voxel;

    fn name(&self) -> &str {
        "custom"
    }
}

/// A seeded voxel source, aware of LOD spacing.
#[derive(Clone)]
pub struct Generator {
    source: Arc<dyn VoxelSource>,
    seed: u64,
}

impl fmt::Debug for Generator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generator")
            .field("source", &self.source.name())
            .field("seed", &self.seed)
            .finish()
    }
}

impl Generator {
    pub fn new(source: Arc<dyn VoxelSource>, seed: u64) -> Self {
        Self { source, seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    /// Sample the cell at `lod` containing `coord`. Coarse cells are sampled
    /// at their minimum corner.
    pub fn sample(&self, coord: IVec3, lod: u8) -> Voxel {
        let spacing = 1 << lod;
        let aligned = IVec3::new(
            coord.x.div_euclid(spacing),
            coord.y.div_euclid(spacing),
            coord.z.div_euclid(spacing),
        ) * spacing;
        self.source.sample(aligned, self.seed)
    }

    /// Samples for the whole block at `key`, in block index order.
    pub fn samples_for(&self, key: BlockKey, edge: u32) -> Vec<Voxel> {
        let origin = key.origin(edge);
        let spacing = key.spacing();
        let e = edge as i32;
        let mut out = Vec::with_capacity(volume(edge));
        for z in 0..e {
            for y in 0..e {
                for x in 0..e {
                    let p = origin + IVec3::new(x, y, z) * spacing;
                    out.push(self.source.sample(p, self.seed));
                }
            }
        }
        out
    }

    pub fn fill(&self, block: &mut VoxelBlock) -> Result<(), CorruptBlockError> {
        block.install_samples(self.samples_for(block.key(), block.edge()))
    }
}

/// Solid below a horizontal plane.
#[derive(Debug, Clone, Copy)]
pub struct FlatPlane {
    /// First air layer; everything with `z < height` is solid.
    pub height: i32,
    pub material: Voxel,
}

impl Default for FlatPlane {
    fn default() -> Self {
        Self {
            height: 0,
            material: Voxel(1),
        }
    }
}

impl VoxelSource for FlatPlane {
    fn sample(&self, coord: IVec3, _seed: u64) -> Voxel {
        if coord.z < self.height {
            self.material
        } else {
            Voxel::AIR
        }
    }

    fn name(&self) -> &str {
        "flat"
    }
}

/// Parameters for [`HeightmapTerrain`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TerrainParams {
    pub noise_seed: u32,
    pub frequency: f64,
    pub octaves: usize,
    /// Height of the surface where noise is -1.
    pub base_height: f64,
    /// Height range covered by noise in [-1, 1].
    pub height_scale: f64,
    /// Columns whose surface is at or below this height get sand tops.
    pub sea_level: i32,
    /// Dirt layers below the top voxel before stone.
    pub dirt_depth: i32,
}

impl Default for TerrainParams {
    fn default() -> Self {
        Self {
            noise_seed: 1337,
            frequency: 0.05,
            octaves: 3,
            base_height: 25.6,
            height_scale: 76.8,
            sea_level: 30,
            dirt_depth: 3,
        }
    }
}

/// Noise heightmap terrain: grass over dirt over stone, sand near sea level.
///
/// The world seed offsets the noise domain so one source serves any seed.
pub struct HeightmapTerrain {
    params: TerrainParams,
    noise: Fbm<OpenSimplex>,
}

impl HeightmapTerrain {
    pub fn new(params: TerrainParams) -> Self {
        let noise = Fbm::<OpenSimplex>::new(params.noise_seed)
            .set_octaves(params.octaves)
            .set_frequency(params.frequency);
        Self { params, noise }
    }

    pub fn params(&self) -> &TerrainParams {
        &self.params
    }

    /// Height of the topmost solid voxel in the column at `(x, y)`.
    pub fn surface_height(&self, x: i32, y: i32, seed: u64) -> i32 {
        let (ox, oy) = seed_offset(seed);
        let n = self.noise.get([x as f64 + ox, y as f64 + oy]).clamp(-1.0, 1.0);
        let h = (n + 1.0) * 0.5 * self.params.height_scale + self.params.base_height;
        h.floor() as i32
    }
}

impl Default for HeightmapTerrain {
    fn default() -> Self {
        Self::new(TerrainParams::default())
    }
}

impl VoxelSource for HeightmapTerrain {
    fn sample(&self, coord: IVec3, seed: u64) -> Voxel {
        let top = self.surface_height(coord.x, coord.y, seed);
        if coord.z > top {
            return Voxel::AIR;
        }
        let depth = top - coord.z;
        let material = if depth == 0 {
            if top <= self.params.sea_level {
                Material::Sand
            } else {
                Material::Grass
            }
        } else if depth <= self.params.dirt_depth {
            Material::Dirt
        } else {
            Material::Stone
        };
        material.into()
    }

    fn name(&self) -> &str {
        "heightmap"
    }
}

/// Map a seed to a stable offset in noise space.
fn seed_offset(seed: u64) -> (f64, f64) {
    let a = splitmix64(seed);
    let b = splitmix64(a);
    ((a % 100_000) as f64 * 1.37, (b % 100_000) as f64 * 1.37)
}

/// Splitmix64 step: a fast, well-distributed deterministic mixer.
pub fn splitmix64(mut state: u64) -> u64 {
    state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_plane_splits_at_height() {
        let g = Generator::new(Arc::new(FlatPlane::default()), 0);
        assert_eq!(g.sample(IVec3::new(5, 5, -1), 0), Voxel(1));
        assert_eq!(g.sample(IVec3::new(5, 5, 0), 0), Voxel::AIR);
    }

    #[test]
    fn sample_is_deterministic() {
        let g = Generator::new(Arc::new(HeightmapTerrain::default()), 42);
        for i in 0..64 {
            let p = IVec3::new(i * 7 - 100, i * 3, 20 + i % 40);
            assert_eq!(g.sample(p, 0), g.sample(p, 0));
            assert_eq!(g.sample(p, 2), g.sample(p, 2));
        }
    }

    #[test]
    fn independent_generators_agree() {
        let a = Generator::new(Arc::new(HeightmapTerrain::default()), 7);
        let b = Generator::new(Arc::new(HeightmapTerrain::default()), 7);
        let key = BlockKey::new(0, IVec3::new(1, -1, 2));
        assert_eq!(a.samples_for(key, 8), b.samples_for(key, 8));
    }

    #[test]
    fn seeds_change_terrain() {
        let t = HeightmapTerrain::default();
        let differs = (0..50).any(|i| t.surface_height(i * 11, i * 5, 1) != t.surface_height(i * 11, i * 5, 2));
        assert!(differs);
    }

    #[test]
    fn coarse_sample_uses_cell_corner() {
        let g = Generator::new(Arc::new(FlatPlane::default()), 0);
        // At LOD 2 the cell covering z = -3..0 starts at z = -4: solid.
        assert_eq!(g.sample(IVec3::new(0, 0, -1), 2), Voxel(1));
        // The cell covering z = 0..4 starts at 0: air.
        assert_eq!(g.sample(IVec3::new(0, 0, 3), 2), Voxel::AIR);
    }

    #[test]
    fn terrain_layers_top_down() {
        let t = HeightmapTerrain::default();
        let top = t.surface_height(10, 10, 0);
        let at = |z| t.sample(IVec3::new(10, 10, z), 0);
        assert!(at(top + 1).is_air());
        assert!(matches!(Material::try_from(at(top)), Ok(Material::Grass | Material::Sand)));
        assert_eq!(at(top - 1), Material::Dirt.into());
        assert_eq!(at(top - 10), Material::Stone.into());
    }

    #[test]
    fn fill_installs_full_block() {
        let g = Generator::new(Arc::new(FlatPlane::default()), 0);
        let mut b = VoxelBlock::new(BlockKey::new(0, IVec3::new(0, 0, -1)), 4);
        g.fill(&mut b).unwrap();
        assert!(b.is_generated());
        assert!(b.samples().iter().all(|v| *v == Voxel(1)));
    }
}
