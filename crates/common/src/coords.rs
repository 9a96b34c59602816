use glam::{IVec3, Vec3};
use serde::{Deserialize, Serialize};

/// Address of a block: its LOD level and grid coordinate at that level.
///
/// A block at `lod` spans `edge << lod` world units per axis and its origin
/// is `coord * (edge << lod)`. Field order gives a deterministic `Ord`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct BlockKey {
    pub lod: u8,
    pub z: i32,
    pub y: i32,
    pub x: i32,
}

impl BlockKey {
    pub fn new(lod: u8, coord: IVec3) -> Self {
        Self {
            lod,
            x: coord.x,
            y: coord.y,
            z: coord.z,
        }
    }

    pub fn coord(&self) -> IVec3 {
        IVec3::new(self.x, self.y, self.z)
    }

    /// World units between adjacent samples at this key's LOD.
    pub fn spacing(&self) -> i32 {
        1 << self.lod
    }

    /// World units spanned by the block along one axis.
    pub fn extent(&self, edge: u32) -> i32 {
        (edge as i32) << self.lod
    }

    pub fn origin(&self, edge: u32) -> IVec3 {
        self.coord() * self.extent(edge)
    }

    pub fn region(&self, edge: u32) -> VoxelRegion {
        let min = self.origin(edge);
        VoxelRegion::new(min, min + IVec3::splat(self.extent(edge)))
    }

    /// Key of the block at `lod` containing world position `p`.
    pub fn containing(p: IVec3, lod: u8, edge: u32) -> Self {
        let extent = (edge as i32) << lod;
        Self::new(
            lod,
            IVec3::new(
                p.x.div_euclid(extent),
                p.y.div_euclid(extent),
                p.z.div_euclid(extent),
            ),
        )
    }

    pub fn parent(&self) -> Self {
        Self::new(
            self.lod + 1,
            IVec3::new(
                self.x.div_euclid(2),
                self.y.div_euclid(2),
                self.z.div_euclid(2),
            ),
        )
    }

    /// The eight children in octant order (bit 0 = x, bit 1 = y, bit 2 = z).
    /// Returns `None` at LOD 0.
    pub fn children(&self) -> Option<[BlockKey; 8]> {
        if self.lod == 0 {
            return None;
        }
        let base = self.coord() * 2;
        Some(std::array::from_fn(|i| {
            BlockKey::new(self.lod - 1, base + octant_offset(i))
        }))
    }

    /// Neighbouring key at the same LOD across `face`.
    pub fn neighbor(&self, face: Face) -> Self {
        Self::new(self.lod, self.coord() + face.normal())
    }

    /// World-space centre, used for distance priorities.
    pub fn center(&self, edge: u32) -> Vec3 {
        let half = self.extent(edge) as f32 * 0.5;
        self.origin(edge).as_vec3() + Vec3::splat(half)
    }
}

impl std::fmt::Display for BlockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}({}, {}, {})", self.lod, self.x, self.y, self.z)
    }
}

pub fn octant_offset(i: usize) -> IVec3 {
    IVec3::new((i & 1) as i32, ((i >> 1) & 1) as i32, ((i >> 2) & 1) as i32)
}

/// Axis-aligned box of world voxel positions, `min` inclusive, `max` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoxelRegion {
    pub min: IVec3,
    pub max: IVec3,
}

impl VoxelRegion {
    pub fn new(min: IVec3, max: IVec3) -> Self {
        Self { min, max }
    }

    /// Region holding exactly one voxel.
    pub fn single(p: IVec3) -> Self {
        Self::new(p, p + IVec3::ONE)
    }

    pub fn is_empty(&self) -> bool {
        self.max.x <= self.min.x || self.max.y <= self.min.y || self.max.z <= self.min.z
    }

    /// Extent along each axis, or `None` when an axis spans more than
    /// `i32::MAX` voxels.
    pub fn size(&self) -> Option<IVec3> {
        let span = |lo: i32, hi: i32| hi.checked_sub(lo).map(|d| d.max(0));
        Some(IVec3::new(
            span(self.min.x, self.max.x)?,
            span(self.min.y, self.max.y)?,
            span(self.min.z, self.max.z)?,
        ))
    }

    /// Voxel count, or `None` if it does not fit in `usize`.
    pub fn checked_volume(&self) -> Option<usize> {
        let s = self.size()?;
        (s.x as usize)
            .checked_mul(s.y as usize)?
            .checked_mul(s.z as usize)
    }

    /// Voxel count, saturating at `usize::MAX`.
    pub fn volume(&self) -> usize {
        self.checked_volume().unwrap_or(usize::MAX)
    }

    /// Whether every voxel of `other` lies inside this region.
    pub fn contains_region(&self, other: &VoxelRegion) -> bool {
        other.is_empty() || (other.min.cmpge(self.min).all() && other.max.cmple(self.max).all())
    }

    pub fn contains(&self, p: IVec3) -> bool {
        p.cmpge(self.min).all() && p.cmplt(self.max).all()
    }

    pub fn intersects(&self, other: &VoxelRegion) -> bool {
        self.min.cmplt(other.max).all() && other.min.cmplt(self.max).all()
    }

    /// Positions in x-fastest, z-slowest order; matches the value layout of
    /// edit records.
    pub fn positions(&self) -> impl Iterator<Item = IVec3> + '_ {
        let (min, max) = (self.min, self.max);
        (min.z..max.z).flat_map(move |z| {
            (min.y..max.y).flat_map(move |y| (min.x..max.x).map(move |x| IVec3::new(x, y, z)))
        })
    }

    /// Squared distance from `p` to the closest point of the region.
    pub fn distance_squared(&self, p: Vec3) -> f32 {
        let lo = self.min.as_vec3();
        let hi = self.max.as_vec3();
        let clamped = p.clamp(lo, hi);
        clamped.distance_squared(p)
    }
}

/// The six block faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Face {
    PosX,
    NegX,
    PosY,
    NegY,
    PosZ,
    NegZ,
}

impl Face {
    pub const ALL: [Face; 6] = [
        Face::PosX,
        Face::NegX,
        Face::PosY,
        Face::NegY,
        Face::PosZ,
        Face::NegZ,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Axis index: 0 = x, 1 = y, 2 = z.
    pub fn axis(self) -> usize {
        self.index() / 2
    }

    pub fn is_positive(self) -> bool {
        self.index() % 2 == 0
    }

    pub fn normal(self) -> IVec3 {
        let mut n = IVec3::ZERO;
        n[self.axis()] = if self.is_positive() { 1 } else { -1 };
        n
    }

    /// In-plane axes `(u, v)`, cyclic after the normal axis so that
    /// `u x v` points along the positive normal axis.
    pub fn plane_axes(self) -> (usize, usize) {
        let a = self.axis();
        ((a + 1) % 3, (a + 2) % 3)
    }

    pub fn opposite(self) -> Face {
        match self {
            Face::PosX => Face::NegX,
            Face::NegX => Face::PosX,
            Face::PosY => Face::NegY,
            Face::NegY => Face::PosY,
            Face::PosZ => Face::NegZ,
            Face::NegZ => Face::PosZ,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_origin_scales_with_lod() {
        let k = BlockKey::new(2, IVec3::new(1, -1, 0));
        assert_eq!(k.extent(16), 64);
        assert_eq!(k.origin(16), IVec3::new(64, -64, 0));
        assert_eq!(k.spacing(), 4);
    }

    #[test]
    fn containing_handles_negative_positions() {
        let k = BlockKey::containing(IVec3::new(-1, 0, 15), 0, 16);
        assert_eq!(k.coord(), IVec3::new(-1, 0, 0));
        let k = BlockKey::containing(IVec3::new(-17, 0, 16), 0, 16);
        assert_eq!(k.coord(), IVec3::new(-2, 0, 1));
    }

    #[test]
    fn children_partition_parent() {
        let parent = BlockKey::new(1, IVec3::new(-1, 2, 0));
        let children = parent.children().unwrap();
        let region = parent.region(8);
        let mut volume = 0;
        for c in children {
            assert_eq!(c.parent(), parent);
            let r = c.region(8);
            assert!(region.contains(r.min));
            assert!(region.contains(r.max - IVec3::ONE));
            volume += r.volume();
        }
        assert_eq!(volume, region.volume());
        assert!(BlockKey::new(0, IVec3::ZERO).children().is_none());
    }

    #[test]
    fn region_positions_are_x_fastest() {
        let r = VoxelRegion::new(IVec3::ZERO, IVec3::new(2, 2, 1));
        let ps: Vec<IVec3> = r.positions().collect();
        assert_eq!(
            ps,
            vec![
                IVec3::new(0, 0, 0),
                IVec3::new(1, 0, 0),
                IVec3::new(0, 1, 0),
                IVec3::new(1, 1, 0)
            ]
        );
        assert_eq!(r.volume(), 4);
    }

    #[test]
    fn extreme_regions_do_not_overflow() {
        let r = VoxelRegion::new(IVec3::new(i32::MIN, 0, 0), IVec3::new(i32::MAX, 1, 1));
        assert_eq!(r.size(), None);
        assert_eq!(r.checked_volume(), None);
        assert_eq!(r.volume(), usize::MAX);

        let wide = VoxelRegion::new(IVec3::splat(-(1 << 30)), IVec3::splat((1 << 30) - 1));
        assert_eq!(wide.size(), Some(IVec3::splat(i32::MAX)));
        assert_eq!(wide.checked_volume(), None);
    }

    #[test]
    fn region_containment() {
        let outer = VoxelRegion::new(IVec3::splat(-4), IVec3::splat(4));
        assert!(outer.contains_region(&VoxelRegion::new(IVec3::splat(-4), IVec3::ZERO)));
        assert!(!outer.contains_region(&VoxelRegion::new(IVec3::ZERO, IVec3::splat(5))));
        assert!(outer.contains_region(&VoxelRegion::new(IVec3::splat(9), IVec3::splat(9))));
    }

    #[test]
    fn region_intersection_is_half_open() {
        let a = VoxelRegion::new(IVec3::ZERO, IVec3::splat(4));
        let b = VoxelRegion::new(IVec3::splat(4), IVec3::splat(8));
        let c = VoxelRegion::new(IVec3::splat(3), IVec3::splat(5));
        assert!(!a.intersects(&b));
        assert!(a.intersects(&c));
        assert!(b.intersects(&c));
    }

    #[test]
    fn region_distance_is_zero_inside() {
        let r = VoxelRegion::new(IVec3::ZERO, IVec3::splat(10));
        assert_eq!(r.distance_squared(Vec3::splat(5.0)), 0.0);
        assert_eq!(r.distance_squared(Vec3::new(13.0, 5.0, 5.0)), 9.0);
    }

    #[test]
    fn face_plane_axes_are_right_handed() {
        for f in Face::ALL {
            let (u, v) = f.plane_axes();
            let mut eu = IVec3::ZERO;
            let mut ev = IVec3::ZERO;
            eu[u] = 1;
            ev[v] = 1;
            let n = eu.as_vec3().cross(ev.as_vec3());
            let mut axis = glam::Vec3::ZERO;
            axis[f.axis()] = 1.0;
            assert_eq!(n, axis);
            assert_eq!(f.opposite().opposite(), f);
            assert_eq!(f.normal(), -f.opposite().normal());
        }
    }
}
