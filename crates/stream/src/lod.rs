use std::collections::BTreeMap;

use glam::{IVec3, Vec3};
use voxelcore_common::{BlockKey, VoxelRegion};
use voxelcore_kernel::WorldConfig;

use crate::budget::StreamConfig;

/// Coarsest LOD acceptable at `distance`: 0 inside `lod0_radius`, one level
/// per doubling beyond it, capped at `max_lod`.
pub fn lod_for_distance(distance: f32, lod0_radius: f32, max_lod: u8) -> u8 {
    let mut lod = 0;
    let mut radius = lod0_radius.max(f32::EPSILON);
    while distance >= radius && lod < max_lod {
        lod += 1;
        radius *= 2.0;
    }
    lod
}

/// Distance from the nearest viewer to any point of `key`'s region.
pub fn viewer_distance(key: BlockKey, edge: u32, viewers: &[Vec3]) -> f32 {
    let region = key.region(edge);
    viewers
        .iter()
        .map(|v| region.distance_squared(*v))
        .fold(f32::INFINITY, f32::min)
        .sqrt()
}

/// Root keys whose region lies within `radius` of some viewer.
pub fn roots_near(viewers: &[Vec3], radius: f32, edge: u32, max_lod: u8) -> Vec<BlockKey> {
    let mut out = Vec::new();
    for viewer in viewers {
        let lo = (*viewer - Vec3::splat(radius)).floor().as_ivec3();
        let hi = (*viewer + Vec3::splat(radius)).ceil().as_ivec3() + IVec3::ONE;
        let bounds = VoxelRegion::new(lo, hi);
        let a = BlockKey::containing(bounds.min, max_lod, edge).coord();
        let b = BlockKey::containing(bounds.max - IVec3::ONE, max_lod, edge).coord();
        for z in a.z..=b.z {
            for y in a.y..=b.y {
                for x in a.x..=b.x {
                    let key = BlockKey::new(max_lod, IVec3::new(x, y, z));
                    if viewer_distance(key, edge, &[*viewer]) <= radius {
                        out.push(key);
                    }
                }
            }
        }
    }
    out.sort();
    out.dedup();
    out
}

/// Leaves the viewers want, keyed to their distance: each root in range is
/// refined until a node's LOD is acceptable for its distance. Keys outside
/// the world bounds are never wanted.
pub fn desired_leaves(
    viewers: &[Vec3],
    config: &StreamConfig,
    world: &WorldConfig,
) -> BTreeMap<BlockKey, f32> {
    let (edge, max_lod) = (world.block_edge, world.max_lod);
    let mut out = BTreeMap::new();
    let mut stack = roots_near(viewers, config.view_radius, edge, max_lod);
    while let Some(key) = stack.pop() {
        if !world.admits_block(key) {
            continue;
        }
        let distance = viewer_distance(key, edge, viewers);
        if distance > config.view_radius {
            continue;
        }
        let wanted = lod_for_distance(distance, config.lod0_radius, max_lod);
        match key.children() {
            Some(children) if key.lod > wanted => stack.extend(children),
            _ => {
                out.insert(key, distance);
            }
        }
    }
    out
}
