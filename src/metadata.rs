//! Framing metadata for a loaded model: bounds, centers and extent.

use crate::scene::{NodeKind, SceneGraph};
use glam::{Mat4, Vec3};

/// Axis-aligned bounding box. `EMPTY` is the identity for `merge`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub const EMPTY: Aabb = Aabb { min: Vec3::splat(f32::INFINITY), max: Vec3::splat(f32::NEG_INFINITY) };

    pub fn from_min_max(min: Vec3, max: Vec3) -> Self {
        Self { min: min.min(max), max: min.max(max) }
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    pub fn center(&self) -> Vec3 {
        if self.is_empty() {
            Vec3::ZERO
        } else {
            (self.min + self.max) * 0.5
        }
    }

    pub fn size(&self) -> Vec3 {
        if self.is_empty() {
            Vec3::ZERO
        } else {
            self.max - self.min
        }
    }

    pub fn volume(&self) -> f32 {
        let size = self.size();
        size.x * size.y * size.z
    }

    pub fn merge(&self, other: &Aabb) -> Self {
        Self { min: self.min.min(other.min), max: self.max.max(other.max) }
    }

    /// Box enclosing the eight transformed corners.
    pub fn transform(&self, matrix: &Mat4) -> Self {
        if self.is_empty() {
            return *self;
        }
        let mut out = Aabb::EMPTY;
        for i in 0..8 {
            let corner = Vec3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            );
            let p = matrix.transform_point3(corner);
            out.min = out.min.min(p);
            out.max = out.max.max(p);
        }
        out
    }

    pub fn translated(&self, offset: Vec3) -> Self {
        if self.is_empty() {
            return *self;
        }
        Self { min: self.min + offset, max: self.max + offset }
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Aabb::EMPTY
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingSphere {
    pub center: Vec3,
    pub radius: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ModelMetadata {
    /// World-space box as authored, before recentering.
    pub bounding_box: Aabb,
    pub bounding_sphere: BoundingSphere,
    pub center: Vec3,
    pub center_of_mass: Vec3,
    pub dimensions: Vec3,
    pub max_dimension: f32,
    /// Translation applied to the graph by recentering (`-center`).
    pub recenter_offset: Vec3,
}

impl ModelMetadata {
    pub fn recentered_box(&self) -> Aabb {
        self.bounding_box.translated(self.recenter_offset)
    }

    pub fn is_empty(&self) -> bool {
        self.bounding_box.is_empty()
    }
}

/// World-space boxes of every draw, one per mesh or per instance.
pub fn mesh_boxes(graph: &SceneGraph) -> Vec<Aabb> {
    let mut boxes = Vec::new();
    graph.walk(|node, world| match &node.kind {
        NodeKind::Empty => {}
        NodeKind::Mesh(mesh) => {
            let bounds = mesh.geometry.bounds();
            boxes.push(Aabb::from_min_max(bounds.min, bounds.max).transform(&world));
        }
        NodeKind::Instanced(instanced) => {
            let bounds = instanced.geometry.bounds();
            let local = Aabb::from_min_max(bounds.min, bounds.max);
            for instance in instanced.world_instances(world) {
                boxes.push(local.transform(&instance));
            }
        }
    });
    boxes
}

pub fn world_bounds(graph: &SceneGraph) -> Aabb {
    mesh_boxes(graph).iter().fold(Aabb::EMPTY, |acc, b| acc.merge(b))
}

/// Pure metadata computation; does not move the graph.
pub fn compute(graph: &SceneGraph) -> ModelMetadata {
    let boxes = mesh_boxes(graph);
    let bounding_box = boxes.iter().fold(Aabb::EMPTY, |acc, b| acc.merge(b));
    let center = bounding_box.center();
    let dimensions = bounding_box.size();
    let max_dimension = dimensions.max_element();
    let radius = dimensions.length() * 0.5;

    let mut total_volume = 0.0f32;
    let mut weighted = Vec3::ZERO;
    for mesh_box in &boxes {
        let volume = mesh_box.volume();
        total_volume += volume;
        weighted += mesh_box.center() * volume;
    }
    // Flat models have no volume to weight by.
    let center_of_mass = if total_volume > 0.0 { weighted / total_volume } else { center };

    ModelMetadata {
        bounding_box,
        bounding_sphere: BoundingSphere { center, radius },
        center,
        center_of_mass,
        dimensions,
        max_dimension,
        recenter_offset: -center,
    }
}

/// Computes metadata and moves the graph so its box center sits at the origin.
pub fn compute_and_recenter(graph: &mut SceneGraph) -> ModelMetadata {
    let metadata = compute(graph);
    if !metadata.is_empty() {
        graph.apply_root_transform(Mat4::from_translation(metadata.recenter_offset));
    }
    metadata
}
