use parking_lot::Mutex;
use std::fmt;
use uuid::Uuid;

#[cfg(feature = "wgpu_backend")]
mod wgpu_residency;

#[cfg(feature = "wgpu_backend")]
pub use wgpu_residency::{GpuGeometry, GpuInstances, GpuMaterial, GpuTexture, WgpuResidency};

/// Identity of a CPU-side resource that may have a GPU counterpart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(Uuid);

impl ResourceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// A GPU allocation the cache is responsible for freeing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GpuResource {
    Geometry(ResourceId),
    Material(ResourceId),
    Texture(ResourceId),
    InstanceBuffer(ResourceId),
}

impl GpuResource {
    pub fn id(self) -> ResourceId {
        match self {
            GpuResource::Geometry(id)
            | GpuResource::Material(id)
            | GpuResource::Texture(id)
            | GpuResource::InstanceBuffer(id) => id,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            GpuResource::Geometry(_) => "geometry",
            GpuResource::Material(_) => "material",
            GpuResource::Texture(_) => "texture",
            GpuResource::InstanceBuffer(_) => "instance buffer",
        }
    }
}

/// Seam between the cache and whatever owns device memory.
///
/// `release` is called exactly once per resource, after the last model in a
/// session referencing it has been disposed. Releasing a resource that was
/// never uploaded must be a no-op.
pub trait GpuResidency: Send + Sync {
    fn release(&self, resource: GpuResource);
}

/// Residency tracker for runs without a device. Records every release.
#[derive(Default)]
pub struct HeadlessResidency {
    released: Mutex<Vec<GpuResource>>,
}

impl HeadlessResidency {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn released(&self) -> Vec<GpuResource> {
        self.released.lock().clone()
    }

    pub fn release_count(&self, resource: GpuResource) -> usize {
        self.released.lock().iter().filter(|r| **r == resource).count()
    }

    pub fn total_released(&self) -> usize {
        self.released.lock().len()
    }
}

impl GpuResidency for HeadlessResidency {
    fn release(&self, resource: GpuResource) {
        log::trace!("released {} {}", resource.label(), resource.id());
        self.released.lock().push(resource);
    }
}
