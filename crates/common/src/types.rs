use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a replicating peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub Uuid);

impl PeerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build a peer id from raw bytes (wire decoding, tests).
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.0.to_string();
        f.write_str(&s[..8])
    }
}

/// A single voxel sample: a material id where 0 is air.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Voxel(pub u8);

impl Voxel {
    pub const AIR: Voxel = Voxel(0);

    pub fn is_air(self) -> bool {
        self.0 == 0
    }

    pub fn is_solid(self) -> bool {
        self.0 != 0
    }
}

impl From<Material> for Voxel {
    fn from(m: Material) -> Self {
        Voxel(m as u8)
    }
}

/// Named materials. The first five ids are stable on disk and on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Material {
    Air = 0,
    Dirt = 1,
    Grass = 2,
    Stone = 3,
    Sand = 4,
    Wood = 5,
    Water = 6,
    Gravel = 7,
    Snow = 8,
    Log = 9,
    Leaves = 10,
}

impl Material {
    pub const ALL: [Material; 11] = [
        Material::Air,
        Material::Dirt,
        Material::Grass,
        Material::Stone,
        Material::Sand,
        Material::Wood,
        Material::Water,
        Material::Gravel,
        Material::Snow,
        Material::Log,
        Material::Leaves,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Material::Air => "air",
            Material::Dirt => "dirt",
            Material::Grass => "grass",
            Material::Stone => "stone",
            Material::Sand => "sand",
            Material::Wood => "wood",
            Material::Water => "water",
            Material::Gravel => "gravel",
            Material::Snow => "snow",
            Material::Log => "log",
            Material::Leaves => "leaves",
        }
    }
}

impl TryFrom<Voxel> for Material {
    type Error = u8;

    fn try_from(v: Voxel) -> Result<Self, Self::Error> {
        Material::ALL.get(v.0 as usize).copied().ok_or(v.0)
    }
}

/// Identity of the last writer of a voxel.
///
/// Ordered by logical timestamp, then by peer id, which makes "greater stamp
/// wins" a total last-writer-wins rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WriteStamp {
    pub timestamp: u64,
    pub peer: PeerId,
}

impl WriteStamp {
    pub fn new(timestamp: u64, peer: PeerId) -> Self {
        Self { timestamp, peer }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_uniqueness() {
        let a = PeerId::new();
        let b = PeerId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn voxel_air_is_not_solid() {
        assert!(Voxel::AIR.is_air());
        assert!(!Voxel::AIR.is_solid());
        assert!(Voxel::from(Material::Stone).is_solid());
    }

    #[test]
    fn material_roundtrip_through_voxel() {
        for m in Material::ALL {
            assert_eq!(Material::try_from(Voxel::from(m)), Ok(m));
        }
        assert_eq!(Material::try_from(Voxel(200)), Err(200));
    }

    #[test]
    fn write_stamp_orders_by_time_then_peer() {
        let low = PeerId::from_bytes([1; 16]);
        let high = PeerId::from_bytes([2; 16]);
        assert!(WriteStamp::new(2, low) > WriteStamp::new(1, high));
        assert!(WriteStamp::new(5, high) > WriteStamp::new(5, low));
    }
}
