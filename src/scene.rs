use crate::gpu::{GpuResource, ResourceId};
use crate::material::Material;
use crate::mesh::Geometry;
use crate::signature::GeometrySignature;
use glam::Mat4;
use std::collections::HashSet;
use std::sync::Arc;

/// A plain draw: one geometry, one material, the node's world transform.
#[derive(Clone, Debug)]
pub struct MeshNode {
    pub geometry: Arc<Geometry>,
    pub material: Arc<Material>,
    /// Set once the instancer has registered this mesh in a session pool.
    pub signature: Option<GeometrySignature>,
}

/// One GPU instanced draw. Instance matrices are relative to the node's
/// world transform; `world_instances` places them in the scene.
#[derive(Clone, Debug)]
pub struct InstancedMeshNode {
    pub id: ResourceId,
    pub geometry: Arc<Geometry>,
    pub material: Arc<Material>,
    pub signature: GeometrySignature,
    pub instances: Vec<Mat4>,
}

impl InstancedMeshNode {
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn world_instances(&self, world: Mat4) -> impl Iterator<Item = Mat4> + '_ {
        self.instances.iter().map(move |instance| world * *instance)
    }
}

#[derive(Clone, Debug, Default)]
pub enum NodeKind {
    #[default]
    Empty,
    Mesh(MeshNode),
    Instanced(InstancedMeshNode),
}

#[derive(Clone, Debug)]
pub struct SceneNode {
    pub name: Option<String>,
    /// Local transform relative to the parent node.
    pub transform: Mat4,
    pub kind: NodeKind,
    pub children: Vec<SceneNode>,
}

impl SceneNode {
    pub fn group(name: impl Into<String>, children: Vec<SceneNode>) -> Self {
        Self { name: Some(name.into()), transform: Mat4::IDENTITY, kind: NodeKind::Empty, children }
    }

    pub fn mesh(name: impl Into<String>, transform: Mat4, geometry: Arc<Geometry>, material: Arc<Material>) -> Self {
        Self {
            name: Some(name.into()),
            transform,
            kind: NodeKind::Mesh(MeshNode { geometry, material, signature: None }),
            children: Vec::new(),
        }
    }

    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = transform;
        self
    }

    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }
}

/// A loaded model: a forest of nodes with local transforms.
#[derive(Clone, Debug, Default)]
pub struct SceneGraph {
    pub name: Option<String>,
    pub roots: Vec<SceneNode>,
}

impl SceneGraph {
    pub fn new(name: Option<String>, roots: Vec<SceneNode>) -> Self {
        Self { name, roots }
    }

    /// Visits every node depth-first together with its world transform.
    pub fn walk<'a, F>(&'a self, mut visit: F)
    where
        F: FnMut(&'a SceneNode, Mat4),
    {
        fn recurse<'a, F: FnMut(&'a SceneNode, Mat4)>(node: &'a SceneNode, parent: Mat4, visit: &mut F) {
            let world = parent * node.transform;
            visit(node, world);
            for child in &node.children {
                recurse(child, world, visit);
            }
        }
        for root in &self.roots {
            recurse(root, Mat4::IDENTITY, &mut visit);
        }
    }

    pub fn mesh_count(&self) -> usize {
        let mut count = 0;
        self.walk(|node, _| {
            if matches!(node.kind, NodeKind::Mesh(_)) {
                count += 1;
            }
        });
        count
    }

    pub fn instanced_nodes(&self) -> Vec<&InstancedMeshNode> {
        let mut nodes = Vec::new();
        self.walk(|node, _| {
            if let NodeKind::Instanced(instanced) = &node.kind {
                nodes.push(instanced);
            }
        });
        nodes
    }

    pub fn mesh_nodes(&self) -> Vec<(&SceneNode, &MeshNode, Mat4)> {
        let mut nodes = Vec::new();
        self.walk(|node, world| {
            if let NodeKind::Mesh(mesh) = &node.kind {
                nodes.push((node, mesh, world));
            }
        });
        nodes
    }

    /// Number of draw calls a renderer issues for this graph.
    pub fn draw_count(&self) -> usize {
        let mut count = 0;
        self.walk(|node, _| {
            if !matches!(node.kind, NodeKind::Empty) {
                count += 1;
            }
        });
        count
    }

    /// Every GPU resource referenced by the graph, each listed once, in
    /// traversal order.
    pub fn gpu_resources(&self) -> Vec<GpuResource> {
        let mut seen = HashSet::new();
        let mut resources = Vec::new();
        let mut push = |resource: GpuResource| {
            if seen.insert(resource) {
                resources.push(resource);
            }
        };
        self.walk(|node, _| {
            let (geometry, material, instance_buffer) = match &node.kind {
                NodeKind::Empty => return,
                NodeKind::Mesh(mesh) => (&mesh.geometry, &mesh.material, None),
                NodeKind::Instanced(instanced) => {
                    (&instanced.geometry, &instanced.material, Some(instanced.id))
                }
            };
            push(GpuResource::Geometry(geometry.id()));
            for resource in material.gpu_resources() {
                push(resource);
            }
            if let Some(id) = instance_buffer {
                push(GpuResource::InstanceBuffer(id));
            }
        });
        resources
    }

    /// Pre-multiplies every root transform, moving the whole model.
    pub fn apply_root_transform(&mut self, transform: Mat4) {
        for root in &mut self.roots {
            root.transform = transform * root.transform;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::MaterialDefinition;
    use glam::Vec3;

    fn cube_node(name: &str, offset: Vec3, geometry: &Arc<Geometry>, material: &Arc<Material>) -> SceneNode {
        SceneNode::mesh(name, Mat4::from_translation(offset), geometry.clone(), material.clone())
    }

    #[test]
    fn walk_composes_parent_transforms() {
        let geometry = Arc::new(Geometry::cube(1.0));
        let material = Arc::new(Material::new(MaterialDefinition::default()));
        let child = cube_node("child", Vec3::new(1.0, 0.0, 0.0), &geometry, &material);
        let parent = SceneNode::group("parent", vec![child]).with_transform(Mat4::from_translation(Vec3::Y));
        let graph = SceneGraph::new(None, vec![parent]);

        let meshes = graph.mesh_nodes();
        assert_eq!(meshes.len(), 1);
        let origin = meshes[0].2.transform_point3(Vec3::ZERO);
        assert!((origin - Vec3::new(1.0, 1.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn gpu_resources_are_listed_once() {
        let geometry = Arc::new(Geometry::cube(1.0));
        let material = Arc::new(Material::new(MaterialDefinition::default()));
        let roots = vec![
            cube_node("a", Vec3::ZERO, &geometry, &material),
            cube_node("b", Vec3::X, &geometry, &material),
        ];
        let graph = SceneGraph::new(None, roots);
        assert_eq!(
            graph.gpu_resources(),
            vec![GpuResource::Geometry(geometry.id()), GpuResource::Material(material.id())]
        );
        assert_eq!(graph.draw_count(), 2);
    }
}
