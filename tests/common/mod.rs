#![allow(dead_code)]

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt};
use mesh_compare::{CacheConfig, CacheRegistry, FetchError, HeadlessResidency, ModelSource};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const GLB_MAGIC: u32 = 0x4654_6C67;
const CHUNK_JSON: u32 = 0x4E4F_534A;
const CHUNK_BIN: u32 = 0x004E_4942;

#[derive(Clone)]
pub struct GlbMaterial {
    pub name: String,
    pub base_color: [f32; 4],
    pub blend: bool,
    pub transmission: Option<f32>,
}

impl GlbMaterial {
    pub fn opaque(name: &str, base_color: [f32; 4]) -> Self {
        Self { name: name.to_string(), base_color, blend: false, transmission: None }
    }

    pub fn glass() -> Self {
        Self { name: "Glass".to_string(), base_color: [0.8, 0.9, 1.0, 0.25], blend: true, transmission: Some(0.9) }
    }
}

/// Writes a GLB whose nodes are unit cubes sharing one vertex/index buffer.
/// Every material gets its own glTF mesh, so each node's primitive is a
/// separate geometry in the imported scene.
pub struct GlbBuilder {
    materials: Vec<GlbMaterial>,
    cubes: Vec<([f32; 3], usize)>,
    half_extent: f32,
}

impl GlbBuilder {
    pub fn new() -> Self {
        Self { materials: vec![GlbMaterial::opaque("Paint", [0.8, 0.1, 0.1, 1.0])], cubes: Vec::new(), half_extent: 0.5 }
    }

    /// `count` cubes spaced two units apart along X, all using material 0.
    pub fn row(count: usize) -> Self {
        let mut builder = Self::new();
        for i in 0..count {
            builder = builder.cube([i as f32 * 2.0, 0.0, 0.0], 0);
        }
        builder
    }

    pub fn material(mut self, material: GlbMaterial) -> Self {
        self.materials.push(material);
        self
    }

    pub fn cube(mut self, translation: [f32; 3], material: usize) -> Self {
        self.cubes.push((translation, material));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let h = self.half_extent;
        let positions: [[f32; 3]; 8] = [
            [-h, -h, -h],
            [h, -h, -h],
            [h, h, -h],
            [-h, h, -h],
            [-h, -h, h],
            [h, -h, h],
            [h, h, h],
            [-h, h, h],
        ];
        let indices: [u32; 36] = [
            0, 2, 1, 0, 3, 2, // back
            4, 5, 6, 4, 6, 7, // front
            0, 1, 5, 0, 5, 4, // bottom
            3, 7, 6, 3, 6, 2, // top
            0, 4, 7, 0, 7, 3, // left
            1, 2, 6, 1, 6, 5, // right
        ];
        let mut bin = Vec::new();
        for position in positions {
            for value in position {
                bin.extend_from_slice(&value.to_le_bytes());
            }
        }
        let position_bytes = bin.len();
        for index in indices {
            bin.extend_from_slice(&index.to_le_bytes());
        }
        let index_bytes = bin.len() - position_bytes;

        let materials: Vec<_> = self
            .materials
            .iter()
            .map(|material_desc| {
                let mut material = json!({
                    "name": material_desc.name,
                    "pbrMetallicRoughness": {
                        "baseColorFactor": material_desc.base_color,
                        "metallicFactor": 0.0,
                        "roughnessFactor": 1.0
                    },
                    "alphaMode": if material_desc.blend { "BLEND" } else { "OPAQUE" }
                });
                if let Some(factor) = material_desc.transmission {
                    material["extensions"] = json!({ "KHR_materials_transmission": { "transmissionFactor": factor } });
                }
                material
            })
            .collect();
        let meshes: Vec<_> = (0..self.materials.len())
            .map(|material| json!({ "primitives": [{ "attributes": { "POSITION": 0 }, "indices": 1, "material": material }] }))
            .collect();
        let nodes: Vec<_> = self
            .cubes
            .iter()
            .enumerate()
            .map(|(i, (translation, material))| json!({ "name": format!("cube_{i}"), "mesh": material, "translation": translation }))
            .collect();
        let mut document = json!({
            "asset": { "version": "2.0" },
            "scene": 0,
            "scenes": [{ "nodes": (0..self.cubes.len()).collect::<Vec<_>>() }],
            "nodes": nodes,
            "meshes": meshes,
            "materials": materials,
            "buffers": [{ "byteLength": bin.len() }],
            "bufferViews": [
                { "buffer": 0, "byteOffset": 0, "byteLength": position_bytes, "target": 34962 },
                { "buffer": 0, "byteOffset": position_bytes, "byteLength": index_bytes, "target": 34963 }
            ],
            "accessors": [
                { "bufferView": 0, "componentType": 5126, "count": 8, "type": "VEC3", "min": [-h, -h, -h], "max": [h, h, h] },
                { "bufferView": 1, "componentType": 5125, "count": 36, "type": "SCALAR" }
            ]
        });
        if self.materials.iter().any(|material| material.transmission.is_some()) {
            document["extensionsUsed"] = json!(["KHR_materials_transmission"]);
        }

        let mut json_chunk = serde_json::to_vec(&document).expect("glTF json serializes");
        while json_chunk.len() % 4 != 0 {
            json_chunk.push(b' ');
        }
        while bin.len() % 4 != 0 {
            bin.push(0);
        }
        let total = 12 + 8 + json_chunk.len() + 8 + bin.len();
        let mut glb = Vec::with_capacity(total);
        glb.extend_from_slice(&GLB_MAGIC.to_le_bytes());
        glb.extend_from_slice(&2u32.to_le_bytes());
        glb.extend_from_slice(&(total as u32).to_le_bytes());
        glb.extend_from_slice(&(json_chunk.len() as u32).to_le_bytes());
        glb.extend_from_slice(&CHUNK_JSON.to_le_bytes());
        glb.extend_from_slice(&json_chunk);
        glb.extend_from_slice(&(bin.len() as u32).to_le_bytes());
        glb.extend_from_slice(&CHUNK_BIN.to_le_bytes());
        glb.extend_from_slice(&bin);
        glb
    }
}

/// In-memory model store that counts fetches and can fail or stall them.
#[derive(Default)]
pub struct MemorySource {
    files: Mutex<HashMap<String, Vec<u8>>>,
    fetches: Mutex<HashMap<String, usize>>,
    fail_next: Mutex<HashSet<String>>,
    gates: Mutex<HashMap<String, oneshot::Receiver<()>>>,
}

impl MemorySource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, path: &str, bytes: Vec<u8>) {
        self.files.lock().insert(path.to_string(), bytes);
    }

    pub fn fetch_count(&self, path: &str) -> usize {
        self.fetches.lock().get(path).copied().unwrap_or(0)
    }

    /// The next fetch of `path` reports an I/O error.
    pub fn fail_next(&self, path: &str) {
        self.fail_next.lock().insert(path.to_string());
    }

    /// The next fetch of `path` waits until the returned sender fires or drops.
    pub fn hold(&self, path: &str) -> oneshot::Sender<()> {
        let (sender, receiver) = oneshot::channel();
        self.gates.lock().insert(path.to_string(), receiver);
        sender
    }
}

impl ModelSource for MemorySource {
    fn fetch(&self, path: &str) -> BoxFuture<'static, Result<Vec<u8>, FetchError>> {
        *self.fetches.lock().entry(path.to_string()).or_insert(0) += 1;
        let result = if self.fail_next.lock().remove(path) {
            Err(FetchError::Io { path: path.to_string(), message: "connection reset".to_string() })
        } else {
            self.files.lock().get(path).cloned().ok_or_else(|| FetchError::NotFound(path.to_string()))
        };
        let gate = self.gates.lock().remove(path);
        async move {
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            result
        }
        .boxed()
    }
}

pub struct Harness {
    pub registry: CacheRegistry,
    pub source: Arc<MemorySource>,
    pub gpu: Arc<HeadlessResidency>,
}

pub fn harness() -> Harness {
    harness_with(CacheConfig::default())
}

pub fn harness_with(config: CacheConfig) -> Harness {
    mesh_compare::logging::init_for_tests();
    let source = MemorySource::new();
    let gpu = Arc::new(HeadlessResidency::new());
    let registry = CacheRegistry::new(config, source.clone(), gpu.clone());
    Harness { registry, source, gpu }
}
