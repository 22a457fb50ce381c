use super::{GpuResidency, GpuResource, ResourceId};
use crate::material::{Material, Texture, TextureSlot};
use crate::mesh::Geometry;
use crate::scene::{InstancedMeshNode, NodeKind, SceneGraph};
use anyhow::{bail, Context, Result};
use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use wgpu::util::DeviceExt;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct MaterialUniform {
    base_color_factor: [f32; 4],
    emissive_factor: [f32; 4],
    params: [f32; 4],        // metallic, roughness, normal_scale, alpha_cutoff
    texture_flags: [f32; 4], // base_color, metallic_roughness, normal, emissive
}

pub struct GpuGeometry {
    pub vertex_buffer: wgpu::Buffer,
    pub index_buffer: wgpu::Buffer,
    pub index_count: u32,
}

pub struct GpuTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub srgb: bool,
}

pub struct GpuMaterial {
    pub uniform_buffer: wgpu::Buffer,
    pub textures: Vec<(TextureSlot, Arc<GpuTexture>)>,
}

pub struct GpuInstances {
    pub buffer: wgpu::Buffer,
    pub count: u32,
}

#[derive(Default)]
struct Resident {
    geometries: HashMap<ResourceId, Arc<GpuGeometry>>,
    materials: HashMap<ResourceId, Arc<GpuMaterial>>,
    textures: HashMap<ResourceId, Arc<GpuTexture>>,
    instances: HashMap<ResourceId, Arc<GpuInstances>>,
}

/// Uploads cache resources on first use and destroys them when the cache
/// releases them.
pub struct WgpuResidency {
    device: wgpu::Device,
    queue: wgpu::Queue,
    resident: Mutex<Resident>,
}

impl WgpuResidency {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self { device, queue, resident: Mutex::new(Resident::default()) }
    }

    /// Device without a surface, for offline processing and tests.
    pub async fn headless() -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .context("Failed to request headless adapter")?;
        let device_desc = wgpu::DeviceDescriptor {
            label: Some("Mesh Cache Device"),
            required_features: wgpu::Features::empty(),
            required_limits: adapter.limits(),
            experimental_features: wgpu::ExperimentalFeatures::default(),
            memory_hints: wgpu::MemoryHints::default(),
            trace: wgpu::Trace::default(),
        };
        let (device, queue) =
            adapter.request_device(&device_desc).await.context("Failed to request headless device")?;
        Ok(Self::new(device, queue))
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn resident_count(&self) -> usize {
        let resident = self.resident.lock();
        resident.geometries.len() + resident.materials.len() + resident.textures.len() + resident.instances.len()
    }

    pub fn is_resident(&self, resource: GpuResource) -> bool {
        let resident = self.resident.lock();
        match resource {
            GpuResource::Geometry(id) => resident.geometries.contains_key(&id),
            GpuResource::Material(id) => resident.materials.contains_key(&id),
            GpuResource::Texture(id) => resident.textures.contains_key(&id),
            GpuResource::InstanceBuffer(id) => resident.instances.contains_key(&id),
        }
    }

    pub fn ensure_geometry(&self, geometry: &Geometry) -> Result<Arc<GpuGeometry>> {
        if let Some(gpu) = self.resident.lock().geometries.get(&geometry.id()) {
            return Ok(gpu.clone());
        }
        if geometry.indices().is_empty() {
            bail!("Geometry {} has no indices", geometry.id());
        }
        let vertex_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Mesh Vertex Buffer"),
            contents: bytemuck::cast_slice(geometry.vertices()),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Mesh Index Buffer"),
            contents: bytemuck::cast_slice(geometry.indices()),
            usage: wgpu::BufferUsages::INDEX,
        });
        let gpu =
            Arc::new(GpuGeometry { vertex_buffer, index_buffer, index_count: geometry.indices().len() as u32 });
        Ok(self.resident.lock().geometries.entry(geometry.id()).or_insert(gpu).clone())
    }

    pub fn ensure_texture(&self, texture: &Texture, srgb: bool) -> Result<Arc<GpuTexture>> {
        if let Some(gpu) = self.resident.lock().textures.get(&texture.id()) {
            return Ok(gpu.clone());
        }
        let (width, height) = (texture.width(), texture.height());
        if width == 0 || height == 0 {
            bail!("Texture {} has zero extent", texture.id());
        }
        let format = if srgb { wgpu::TextureFormat::Rgba8UnormSrgb } else { wgpu::TextureFormat::Rgba8Unorm };
        let size = wgpu::Extent3d { width, height, depth_or_array_layers: 1 };
        let gpu_texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Material Texture"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let (pixel_data, padded_row_bytes) = prepare_texture_upload(texture.data(), width, height);
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &gpu_texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            pixel_data.as_ref(),
            wgpu::TexelCopyBufferLayout { offset: 0, bytes_per_row: Some(padded_row_bytes), rows_per_image: Some(height) },
            size,
        );
        let view = gpu_texture.create_view(&wgpu::TextureViewDescriptor::default());
        let gpu = Arc::new(GpuTexture { texture: gpu_texture, view, srgb });
        Ok(self.resident.lock().textures.entry(texture.id()).or_insert(gpu).clone())
    }

    pub fn ensure_material(&self, material: &Material) -> Result<Arc<GpuMaterial>> {
        if let Some(gpu) = self.resident.lock().materials.get(&material.id()) {
            return Ok(gpu.clone());
        }
        let definition = material.definition();
        let mut textures = Vec::with_capacity(definition.textures.len());
        let mut flags = [0.0f32; 4];
        let mut normal_scale = 1.0;
        for binding in &definition.textures {
            let gpu = self
                .ensure_texture(&binding.texture, binding.slot.srgb())
                .with_context(|| format!("Failed to upload texture for material '{}'", material.name()))?;
            let flag = match binding.slot {
                TextureSlot::BaseColor => 0,
                TextureSlot::MetallicRoughness => 1,
                TextureSlot::Normal => {
                    normal_scale = binding.scale;
                    2
                }
                TextureSlot::Emissive => 3,
            };
            flags[flag] = 1.0;
            textures.push((binding.slot, gpu));
        }
        let [er, eg, eb] = definition.emissive_factor;
        let uniform = MaterialUniform {
            base_color_factor: definition.base_color_factor,
            emissive_factor: [er, eg, eb, 1.0],
            params: [
                definition.metallic_factor,
                definition.roughness_factor,
                normal_scale,
                definition.alpha_cutoff.unwrap_or(0.5),
            ],
            texture_flags: flags,
        };
        let uniform_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Material Uniform Buffer"),
            contents: bytemuck::bytes_of(&uniform),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let gpu = Arc::new(GpuMaterial { uniform_buffer, textures });
        Ok(self.resident.lock().materials.entry(material.id()).or_insert(gpu).clone())
    }

    /// Uploads the instance buffer of `node`, whose world transform is `world`.
    pub fn ensure_instances(&self, node: &InstancedMeshNode, world: Mat4) -> Result<Arc<GpuInstances>> {
        if let Some(gpu) = self.resident.lock().instances.get(&node.id) {
            return Ok(gpu.clone());
        }
        if node.instances.is_empty() {
            bail!("Instanced node {} has no instances", node.id);
        }
        let matrices = instance_matrices(node, world);
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Instance Transform Buffer"),
            contents: bytemuck::cast_slice(&matrices),
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
        });
        let gpu = Arc::new(GpuInstances { buffer, count: node.instances.len() as u32 });
        Ok(self.resident.lock().instances.entry(node.id).or_insert(gpu).clone())
    }

    /// Uploads everything `graph` draws with. Returns the number of draws prepared.
    pub fn upload_graph(&self, graph: &SceneGraph) -> Result<usize> {
        let mut draws = Vec::new();
        graph.walk(|node, world| match &node.kind {
            NodeKind::Empty => {}
            NodeKind::Mesh(mesh) => draws.push((mesh.geometry.clone(), mesh.material.clone(), None)),
            NodeKind::Instanced(instanced) => {
                draws.push((instanced.geometry.clone(), instanced.material.clone(), Some((instanced, world))))
            }
        });
        for (geometry, material, instanced) in &draws {
            self.ensure_geometry(geometry)?;
            self.ensure_material(material)?;
            if let Some((instanced, world)) = instanced {
                self.ensure_instances(instanced, *world)?;
            }
        }
        Ok(draws.len())
    }
}

impl GpuResidency for WgpuResidency {
    fn release(&self, resource: GpuResource) {
        let mut resident = self.resident.lock();
        match resource {
            GpuResource::Geometry(id) => {
                if let Some(gpu) = resident.geometries.remove(&id) {
                    gpu.vertex_buffer.destroy();
                    gpu.index_buffer.destroy();
                }
            }
            GpuResource::Material(id) => {
                if let Some(gpu) = resident.materials.remove(&id) {
                    gpu.uniform_buffer.destroy();
                }
            }
            GpuResource::Texture(id) => {
                if let Some(gpu) = resident.textures.remove(&id) {
                    gpu.texture.destroy();
                }
            }
            GpuResource::InstanceBuffer(id) => {
                if let Some(gpu) = resident.instances.remove(&id) {
                    gpu.buffer.destroy();
                }
            }
        }
        log::trace!("destroyed {} {}", resource.label(), resource.id());
    }
}

fn instance_matrices(node: &InstancedMeshNode, world: Mat4) -> Vec<[[f32; 4]; 4]> {
    node.world_instances(world).map(|m| m.to_cols_array_2d()).collect()
}

fn padded_bytes_per_row(width: u32) -> u32 {
    let unpadded = width.saturating_mul(4);
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    let remainder = unpadded % align;
    if remainder == 0 {
        unpadded
    } else {
        unpadded + align - remainder
    }
}

fn prepare_texture_upload(data: &[u8], width: u32, height: u32) -> (Cow<'_, [u8]>, u32) {
    let row_bytes = width.saturating_mul(4);
    let padded_row_bytes = padded_bytes_per_row(width);
    if padded_row_bytes == row_bytes {
        return (Cow::Borrowed(data), row_bytes);
    }
    let mut padded = vec![0u8; padded_row_bytes.saturating_mul(height) as usize];
    for row in 0..height {
        let src_start = (row_bytes * row) as usize;
        let src_end = src_start + row_bytes as usize;
        let dst_start = (padded_row_bytes * row) as usize;
        if src_end <= data.len() && dst_start + row_bytes as usize <= padded.len() {
            padded[dst_start..dst_start + row_bytes as usize].copy_from_slice(&data[src_start..src_end]);
        }
    }
    (Cow::Owned(padded), padded_row_bytes)
}
