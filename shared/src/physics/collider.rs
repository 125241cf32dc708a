//! Chunk-indexed static colliders.
//!
//! Colliders are axis-aligned boxes bucketed by the chunk containing their center. A body only
//! tests the colliders of its own chunk and the 8 neighbors. Chunk lists change only through
//! `load_chunk`/`unload_chunk`/`insert`/`remove`, which the world never calls mid-step.

use std::collections::HashMap;

use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use super::body::BodyHandle;

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }

    pub fn from_center_half_extents(center: Vec3, half_extents: Vec3) -> Self {
        Self {
            min: center - half_extents,
            max: center + half_extents,
        }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn half_extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x < other.max.x
            && self.max.x > other.min.x
            && self.min.y < other.max.y
            && self.max.y > other.min.y
            && self.min.z < other.max.z
            && self.max.z > other.min.z
    }

    pub fn contains(&self, point: Vec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }

    /// Whether the XZ footprint contains the point.
    pub fn contains_xz(&self, x: f32, z: f32) -> bool {
        x >= self.min.x && x <= self.max.x && z >= self.min.z && z <= self.max.z
    }

    /// Penetration depth of `self` into `other` along each axis (positive when overlapping).
    pub fn overlap(&self, other: &Aabb) -> Vec3 {
        Vec3::new(
            (self.max.x - other.min.x).min(other.max.x - self.min.x),
            (self.max.y - other.min.y).min(other.max.y - self.min.y),
            (self.max.z - other.min.z).min(other.max.z - self.min.z),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColliderId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Collider {
    pub id: ColliderId,
    pub bounds: Aabb,
    /// Body this collider belongs to; that body never collides with it.
    pub owner: Option<BodyHandle>,
}

/// Chunk coordinate (integer grid position)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub x: i32,
    pub z: i32,
}

impl ChunkKey {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    pub fn from_world(pos: Vec3, chunk_size: f32) -> Self {
        Self {
            x: (pos.x / chunk_size).floor() as i32,
            z: (pos.z / chunk_size).floor() as i32,
        }
    }

    /// This chunk and its 8 neighbors.
    pub fn neighborhood(self) -> impl Iterator<Item = ChunkKey> {
        (-1..=1).flat_map(move |dx| (-1..=1).map(move |dz| ChunkKey::new(self.x + dx, self.z + dz)))
    }
}

/// Collider lists per chunk, plus a per-step list of moving colliders (vehicle chassis).
#[derive(Debug, Default)]
pub struct ColliderIndex {
    chunk_size: f32,
    chunks: HashMap<ChunkKey, Vec<Collider>>,
    dynamic: Vec<Collider>,
    next_id: u32,
}

impl ColliderIndex {
    pub fn new(chunk_size: f32) -> Self {
        Self {
            chunk_size,
            ..Default::default()
        }
    }

    pub fn chunk_size(&self) -> f32 {
        self.chunk_size
    }

    pub fn key_for(&self, pos: Vec3) -> ChunkKey {
        ChunkKey::from_world(pos, self.chunk_size)
    }

    fn allocate(&mut self) -> ColliderId {
        let id = ColliderId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    /// Replace the collider list of a chunk. Returns the ids assigned, in input order.
    pub fn load_chunk(&mut self, key: ChunkKey, boxes: impl IntoIterator<Item = Aabb>) -> Vec<ColliderId> {
        let mut list = Vec::new();
        for bounds in boxes {
            let id = self.allocate();
            list.push(Collider {
                id,
                bounds,
                owner: None,
            });
        }
        let ids = list.iter().map(|c| c.id).collect();
        self.chunks.insert(key, list);
        ids
    }

    /// Drop a chunk's colliders. Unloading an unknown chunk is a no-op.
    pub fn unload_chunk(&mut self, key: ChunkKey) -> usize {
        self.chunks.remove(&key).map(|list| list.len()).unwrap_or(0)
    }

    pub fn is_loaded(&self, key: ChunkKey) -> bool {
        self.chunks.contains_key(&key)
    }

    /// Add one static collider to the chunk containing its center.
    pub fn insert(&mut self, bounds: Aabb, owner: Option<BodyHandle>) -> ColliderId {
        let id = self.allocate();
        let key = self.key_for(bounds.center());
        self.chunks.entry(key).or_default().push(Collider { id, bounds, owner });
        id
    }

    pub fn remove(&mut self, id: ColliderId) -> bool {
        for list in self.chunks.values_mut() {
            if let Some(i) = list.iter().position(|c| c.id == id) {
                list.swap_remove(i);
                return true;
            }
        }
        false
    }

    /// Replace the moving collider list. Called between steps only.
    pub fn set_dynamic(&mut self, colliders: Vec<Collider>) {
        self.dynamic = colliders;
    }

    /// Colliders that may touch a body at `pos`.
    pub fn nearby(&self, pos: Vec3) -> Vec<Collider> {
        let key = self.key_for(pos);
        let mut out: Vec<Collider> = key
            .neighborhood()
            .filter_map(|k| self.chunks.get(&k))
            .flat_map(|list| list.iter().copied())
            .collect();
        let reach = self.chunk_size * 1.5;
        out.extend(
            self.dynamic
                .iter()
                .filter(|c| (c.bounds.center() - pos).length() <= reach + c.bounds.half_extents().length())
                .copied(),
        );
        out
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn len(&self) -> usize {
        self.chunks.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box(center: Vec3) -> Aabb {
        Aabb::from_center_half_extents(center, Vec3::splat(0.5))
    }

    #[test]
    fn overlap_depths() {
        let a = unit_box(Vec3::ZERO);
        let b = unit_box(Vec3::new(0.8, 0.0, 0.0));
        assert!(a.intersects(&b));
        let o = a.overlap(&b);
        assert!((o.x - 0.2).abs() < 1e-6);
        assert!((o.y - 1.0).abs() < 1e-6);
    }

    #[test]
    fn nearby_covers_neighbor_chunks_only() {
        let mut index = ColliderIndex::new(32.0);
        index.insert(unit_box(Vec3::new(40.0, 0.0, 5.0)), None);
        index.insert(unit_box(Vec3::new(200.0, 0.0, 5.0)), None);
        let near = index.nearby(Vec3::new(10.0, 0.0, 10.0));
        assert_eq!(near.len(), 1);
        assert!((near[0].bounds.center().x - 40.0).abs() < 1e-6);
    }

    #[test]
    fn load_and_unload_chunks() {
        let mut index = ColliderIndex::new(32.0);
        let key = ChunkKey::new(0, 0);
        let ids = index.load_chunk(key, [unit_box(Vec3::splat(4.0)), unit_box(Vec3::splat(8.0))]);
        assert_eq!(ids.len(), 2);
        assert!(index.is_loaded(key));
        assert_eq!(index.len(), 2);
        assert_eq!(index.unload_chunk(key), 2);
        assert_eq!(index.unload_chunk(key), 0);
        assert!(index.is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let mut index = ColliderIndex::new(32.0);
        let id = index.insert(unit_box(Vec3::ZERO), None);
        assert!(index.remove(id));
        assert!(!index.remove(id));
    }

    #[test]
    fn negative_coordinates_floor() {
        assert_eq!(ChunkKey::from_world(Vec3::new(-0.1, 0.0, -32.1), 32.0), ChunkKey::new(-1, -2));
        assert_eq!(ChunkKey::new(0, 0).neighborhood().count(), 9);
    }
}
