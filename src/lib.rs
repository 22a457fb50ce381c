pub mod camera3d;
pub mod config;
pub mod error;
pub mod gpu;
pub mod instancer;
pub mod loader;
pub mod logging;
pub mod material;
pub mod mesh;
pub mod metadata;
pub mod registry;
pub mod scene;
pub mod signature;

pub use camera3d::{AutoRotate, AutoRotateSignal, CameraFit, CameraPlacement, ViewCommand};
pub use config::{CacheConfig, CacheConfigOverrides};
pub use error::{FetchError, LoadError, OptimizeError};
pub use gpu::{GpuResidency, GpuResource, HeadlessResidency, ResourceId};
pub use instancer::{InstancePool, Instancer, OptimizeStats, Optimized};
pub use loader::{DirectorySource, LoadFuture, ModelSource};
pub use material::{Material, MaterialClass, MaterialClassifier};
pub use mesh::Geometry;
pub use metadata::{Aabb, BoundingSphere, ModelMetadata};
pub use registry::{CacheRegistry, LoadedModel, SessionKey, SessionStats};
pub use scene::{SceneGraph, SceneNode};
pub use signature::GeometrySignature;
