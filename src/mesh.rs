use crate::error::OptimizeError;
use crate::gpu::ResourceId;
use crate::material::{AlphaMode, Material, MaterialDefinition, Texture, TextureBinding, TextureSlot};
use crate::scene::{MeshNode, NodeKind, SceneGraph, SceneNode};
use crate::signature;
use anyhow::{anyhow, bail, Context, Result};
use glam::{Mat4, Vec2, Vec3};
use gltf::mesh::Mode;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

const MAX_NODE_DEPTH: usize = 256;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MeshVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl MeshVertex {
    pub fn new(position: Vec3, normal: Vec3, uv: Vec2) -> Self {
        Self { position: position.to_array(), normal: normal.to_array(), uv: uv.to_array() }
    }

    #[cfg(feature = "wgpu_backend")]
    pub fn layout<'a>() -> wgpu::VertexBufferLayout<'a> {
        use std::mem;
        wgpu::VertexBufferLayout {
            array_stride: mem::size_of::<MeshVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute { offset: 0, shader_location: 0, format: wgpu::VertexFormat::Float32x3 },
                wgpu::VertexAttribute { offset: 12, shader_location: 1, format: wgpu::VertexFormat::Float32x3 },
                wgpu::VertexAttribute { offset: 24, shader_location: 2, format: wgpu::VertexFormat::Float32x2 },
            ],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeshBounds {
    pub min: Vec3,
    pub max: Vec3,
    pub center: Vec3,
    pub radius: f32,
}

/// Immutable triangle geometry. Shared between nodes through `Arc`.
#[derive(Debug)]
pub struct Geometry {
    id: ResourceId,
    vertices: Vec<MeshVertex>,
    indices: Vec<u32>,
    bounds: MeshBounds,
    digest: OnceLock<[u8; 32]>,
}

impl Geometry {
    pub fn new(vertices: Vec<MeshVertex>, indices: Vec<u32>) -> Self {
        let bounds = MeshBounds::from_vertices(&vertices);
        Self { id: ResourceId::new(), vertices, indices, bounds, digest: OnceLock::new() }
    }

    pub fn cube(size: f32) -> Self {
        let hs = size * 0.5;
        let positions = [
            Vec3::new(-hs, -hs, -hs),
            Vec3::new(hs, -hs, -hs),
            Vec3::new(hs, hs, -hs),
            Vec3::new(-hs, hs, -hs),
            Vec3::new(-hs, -hs, hs),
            Vec3::new(hs, -hs, hs),
            Vec3::new(hs, hs, hs),
            Vec3::new(-hs, hs, hs),
        ];
        let uv_quad = [Vec2::new(0.0, 0.0), Vec2::new(1.0, 0.0), Vec2::new(1.0, 1.0), Vec2::new(0.0, 1.0)];
        let mut vertices = Vec::with_capacity(24);
        let mut write_face = |corners: [usize; 4], normal: Vec3| {
            for (i, &corner) in corners.iter().enumerate() {
                vertices.push(MeshVertex::new(positions[corner], normal, uv_quad[i]));
            }
        };

        write_face([0, 3, 2, 1], Vec3::NEG_Z); // back
        write_face([4, 5, 6, 7], Vec3::Z); // front
        write_face([0, 4, 7, 3], Vec3::NEG_X); // left
        write_face([1, 2, 6, 5], Vec3::X); // right
        write_face([3, 7, 6, 2], Vec3::Y); // top
        write_face([0, 1, 5, 4], Vec3::NEG_Y); // bottom

        let mut indices = Vec::with_capacity(36);
        for face in 0..6 {
            let base = face * 4;
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        Self::new(vertices, indices)
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn vertices(&self) -> &[MeshVertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn bounds(&self) -> &MeshBounds {
        &self.bounds
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// blake3 digest over vertex and index buffers, computed on first use.
    pub fn content_digest(&self) -> &[u8; 32] {
        self.digest.get_or_init(|| signature::digest_buffers(&self.vertices, &self.indices))
    }

    pub fn validate(&self) -> Result<(), OptimizeError> {
        let malformed = |reason: String| OptimizeError::MalformedGeometry { geometry: self.id, reason };
        if self.indices.len() % 3 != 0 {
            return Err(malformed(format!("index count {} is not a multiple of 3", self.indices.len())));
        }
        if let Some(&index) = self.indices.iter().find(|&&index| index as usize >= self.vertices.len()) {
            return Err(malformed(format!("index {index} out of range for {} vertices", self.vertices.len())));
        }
        if self.vertices.iter().any(|v| !Vec3::from_array(v.position).is_finite()) {
            return Err(malformed("non-finite vertex position".to_string()));
        }
        Ok(())
    }
}

impl MeshBounds {
    pub fn from_vertices(vertices: &[MeshVertex]) -> Self {
        let mut min = Vec3::splat(f32::INFINITY);
        let mut max = Vec3::splat(f32::NEG_INFINITY);
        for vertex in vertices {
            let pos = Vec3::from_array(vertex.position);
            min = min.min(pos);
            max = max.max(pos);
        }
        if vertices.is_empty() {
            return MeshBounds { min: Vec3::ZERO, max: Vec3::ZERO, center: Vec3::ZERO, radius: 0.0 };
        }
        let center = (min + max) * 0.5;
        let mut radius: f32 = 0.0;
        for vertex in vertices {
            let pos = Vec3::from_array(vertex.position);
            radius = radius.max((pos - center).length());
        }
        MeshBounds { min, max, center, radius }
    }
}

/// Parses GLB or self-contained glTF bytes into a raw scene graph.
///
/// Nodes sharing a glTF mesh share the same `Arc<Geometry>`, and every glTF
/// material maps to exactly one `Arc<Material>`.
pub fn import_gltf_scene(bytes: &[u8], label: &str) -> Result<SceneGraph> {
    let (document, buffers, images) =
        gltf::import_slice(bytes).with_context(|| format!("Failed to import glTF from {label}"))?;

    let mut textures: HashMap<usize, Arc<Texture>> = HashMap::new();
    for texture in document.textures() {
        let source = texture.source();
        let image = images
            .get(source.index())
            .ok_or_else(|| anyhow!("Image index {} missing in {label}", source.index()))?;
        let pixels = convert_image_to_rgba(image)?;
        textures.insert(texture.index(), Arc::new(Texture::new(image.width, image.height, pixels)));
    }

    let mut materials: HashMap<usize, Arc<Material>> = HashMap::new();
    for (mat_index, material) in document.materials().enumerate() {
        let actual_index = material.index().unwrap_or(mat_index);
        let name = material.name().map(|s| s.to_string()).unwrap_or_else(|| format!("material_{mat_index}"));
        let pbr = material.pbr_metallic_roughness();

        let bind = |slot: TextureSlot, texture: gltf::Texture<'_>, tex_coord: u32, scale: f32| {
            textures.get(&texture.index()).map(|texture| TextureBinding {
                slot,
                texture: texture.clone(),
                tex_coord,
                scale,
            })
        };
        let mut bindings = Vec::new();
        if let Some(info) = pbr.base_color_texture() {
            bindings.extend(bind(TextureSlot::BaseColor, info.texture(), info.tex_coord(), 1.0));
        }
        if let Some(info) = pbr.metallic_roughness_texture() {
            bindings.extend(bind(TextureSlot::MetallicRoughness, info.texture(), info.tex_coord(), 1.0));
        }
        if let Some(info) = material.normal_texture() {
            bindings.extend(bind(TextureSlot::Normal, info.texture(), info.tex_coord(), info.scale()));
        }
        if let Some(info) = material.emissive_texture() {
            bindings.extend(bind(TextureSlot::Emissive, info.texture(), info.tex_coord(), 1.0));
        }

        let alpha_mode = match material.alpha_mode() {
            gltf::material::AlphaMode::Opaque => AlphaMode::Opaque,
            gltf::material::AlphaMode::Mask => AlphaMode::Mask,
            gltf::material::AlphaMode::Blend => AlphaMode::Blend,
        };
        let definition = MaterialDefinition {
            name,
            base_color_factor: pbr.base_color_factor(),
            metallic_factor: pbr.metallic_factor(),
            roughness_factor: pbr.roughness_factor(),
            emissive_factor: material.emissive_factor(),
            alpha_mode,
            alpha_cutoff: material.alpha_cutoff(),
            transmission_factor: material.transmission().map(|t| t.transmission_factor()),
            double_sided: material.double_sided(),
            textures: bindings,
        };
        materials.insert(actual_index, Arc::new(Material::new(definition)));
    }
    let default_material = Arc::new(Material::new(MaterialDefinition::default()));

    // One entry per glTF mesh: (geometry, material) for every triangle primitive.
    let mut meshes: HashMap<usize, Vec<(Arc<Geometry>, Arc<Material>)>> = HashMap::new();
    for mesh in document.meshes() {
        let mut primitives = Vec::new();
        for primitive in mesh.primitives() {
            if primitive.mode() != Mode::Triangles {
                continue;
            }
            let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|data| &**data));
            let positions: Vec<Vec3> = reader
                .read_positions()
                .ok_or_else(|| anyhow!("POSITION attribute missing in {label}"))?
                .map(Vec3::from_array)
                .collect();
            if positions.is_empty() {
                continue;
            }
            let indices: Vec<u32> = reader
                .read_indices()
                .map(|read| read.into_u32().collect())
                .unwrap_or_else(|| (0..positions.len() as u32).collect());
            let mut normals: Vec<Vec3> = reader
                .read_normals()
                .map(|it| it.map(Vec3::from_array).collect())
                .unwrap_or_default();
            if normals.len() != positions.len() || normals.iter().all(|n| n.length_squared() == 0.0) {
                normals = compute_normals(&positions, &indices);
            }
            let mut tex_coords: Vec<Vec2> = reader
                .read_tex_coords(0)
                .map(|coords| coords.into_f32().map(Vec2::from_array).collect())
                .unwrap_or_default();
            tex_coords.resize(positions.len(), Vec2::ZERO);

            let vertices = positions
                .iter()
                .zip(normals.iter())
                .zip(tex_coords.iter())
                .map(|((pos, normal), uv)| MeshVertex::new(*pos, normal.normalize_or_zero(), *uv))
                .collect();
            let material = primitive
                .material()
                .index()
                .and_then(|idx| materials.get(&idx).cloned())
                .unwrap_or_else(|| default_material.clone());
            primitives.push((Arc::new(Geometry::new(vertices, indices)), material));
        }
        meshes.insert(mesh.index(), primitives);
    }

    let root_nodes: Vec<gltf::Node<'_>> = match document.default_scene().or_else(|| document.scenes().next()) {
        Some(scene) => scene.nodes().collect(),
        None => {
            let mut is_child = vec![false; document.nodes().len()];
            for node in document.nodes() {
                for child in node.children() {
                    is_child[child.index()] = true;
                }
            }
            document.nodes().filter(|node| !is_child[node.index()]).collect()
        }
    };

    let mut roots = Vec::with_capacity(root_nodes.len());
    for node in root_nodes {
        roots.push(convert_node(&node, &meshes, 0)?);
    }
    let name = document.default_scene().and_then(|scene| scene.name().map(|s| s.to_string()));
    Ok(SceneGraph::new(name.or_else(|| Some(label.to_string())), roots))
}

fn convert_node(
    node: &gltf::Node<'_>,
    meshes: &HashMap<usize, Vec<(Arc<Geometry>, Arc<Material>)>>,
    depth: usize,
) -> Result<SceneNode> {
    if depth > MAX_NODE_DEPTH {
        bail!("Node hierarchy deeper than {MAX_NODE_DEPTH} levels (cycle?) at node {}", node.index());
    }
    let name = node.name().map(|s| s.to_string()).unwrap_or_else(|| format!("node_{}", node.index()));
    let transform = Mat4::from_cols_array_2d(&node.transform().matrix());

    let mut children = Vec::new();
    let mut kind = NodeKind::Empty;
    if let Some(primitives) = node.mesh().and_then(|mesh| meshes.get(&mesh.index())) {
        match primitives.as_slice() {
            [] => {}
            [(geometry, material)] => {
                kind = NodeKind::Mesh(MeshNode {
                    geometry: geometry.clone(),
                    material: material.clone(),
                    signature: None,
                });
            }
            many => {
                for (index, (geometry, material)) in many.iter().enumerate() {
                    children.push(SceneNode::mesh(
                        format!("{name}::{index}"),
                        Mat4::IDENTITY,
                        geometry.clone(),
                        material.clone(),
                    ));
                }
            }
        }
    }
    for child in node.children() {
        children.push(convert_node(&child, meshes, depth + 1)?);
    }
    Ok(SceneNode { name: Some(name), transform, kind, children })
}

fn convert_image_to_rgba(image: &gltf::image::Data) -> Result<Vec<u8>> {
    match image.format {
        gltf::image::Format::R8 => {
            let mut out = Vec::with_capacity(image.pixels.len() * 4);
            for &value in &image.pixels {
                out.extend_from_slice(&[value, value, value, 255]);
            }
            Ok(out)
        }
        gltf::image::Format::R8G8 => {
            let mut out = Vec::with_capacity(image.pixels.len() / 2 * 4);
            for chunk in image.pixels.chunks_exact(2) {
                out.extend_from_slice(&[chunk[0], chunk[1], 0, 255]);
            }
            Ok(out)
        }
        gltf::image::Format::R8G8B8 => {
            let mut out = Vec::with_capacity(image.pixels.len() / 3 * 4);
            for chunk in image.pixels.chunks_exact(3) {
                out.extend_from_slice(&[chunk[0], chunk[1], chunk[2], 255]);
            }
            Ok(out)
        }
        gltf::image::Format::R8G8B8A8 => Ok(image.pixels.clone()),
        other => bail!("Unsupported image format {:?}", other),
    }
}

fn compute_normals(positions: &[Vec3], indices: &[u32]) -> Vec<Vec3> {
    let mut normals = vec![Vec3::ZERO; positions.len()];
    for tri in indices.chunks(3) {
        if tri.len() < 3 {
            continue;
        }
        let (i0, i1, i2) = (tri[0] as usize, tri[1] as usize, tri[2] as usize);
        if i0 >= positions.len() || i1 >= positions.len() || i2 >= positions.len() {
            continue;
        }
        let normal = (positions[i1] - positions[i0]).cross(positions[i2] - positions[i0]);
        if normal.length_squared() > 0.0 {
            normals[i0] += normal;
            normals[i1] += normal;
            normals[i2] += normal;
        }
    }
    for normal in &mut normals {
        *normal = if normal.length_squared() > 0.0 { normal.normalize() } else { Vec3::Y };
    }
    normals
}
