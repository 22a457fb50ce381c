use crate::material::Material;
use crate::mesh::{Geometry, MeshVertex};
use std::fmt;

/// Content-derived identity of a mesh. Equal signatures mean the meshes are
/// interchangeable for instancing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeometrySignature([u8; 32]);

impl GeometrySignature {
    /// Identity of the geometry buffers alone.
    pub fn of_geometry(geometry: &Geometry) -> Self {
        Self(*geometry.content_digest())
    }

    /// Identity of geometry rendered with a particular material.
    pub fn of_mesh(geometry: &Geometry, material: &Material) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"mesh");
        hasher.update(geometry.content_digest());
        hasher.update(material.fingerprint().as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }
}

impl fmt::Debug for GeometrySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GeometrySignature({self})")
    }
}

impl fmt::Display for GeometrySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Hashes interleaved vertices (position, normal, uv) and indices. Each
/// section is prefixed with its element count so differently shaped buffers
/// with the same bytes never collide.
pub(crate) fn digest_buffers(vertices: &[MeshVertex], indices: &[u32]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"vertices");
    hasher.update(&(vertices.len() as u64).to_le_bytes());
    hasher.update(bytemuck::cast_slice(vertices));
    hasher.update(b"indices");
    hasher.update(&(indices.len() as u64).to_le_bytes());
    hasher.update(bytemuck::cast_slice(indices));
    *hasher.finalize().as_bytes()
}
