use crate::config::CacheConfig;
use crate::error::OptimizeError;
use crate::gpu::ResourceId;
use crate::material::{Material, MaterialClassifier};
use crate::mesh::Geometry;
use crate::scene::{InstancedMeshNode, MeshNode, NodeKind, SceneGraph, SceneNode};
use crate::signature::GeometrySignature;
use glam::Mat4;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

pub const INSTANCED_ROOT_NAME: &str = "instanced";

/// Canonical resources for one signature within a session.
#[derive(Clone, Debug)]
pub struct PrimaryEntry {
    pub geometry: Arc<Geometry>,
    pub material: Arc<Material>,
    /// Path whose resources became canonical, or the user it was handed to.
    pub owner: String,
    pub users: BTreeSet<String>,
}

/// Outcome of dropping one path from the pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolRelease {
    pub removed: usize,
    pub handed_off: usize,
}

/// Session-wide map from signature to the primary entry that owns it.
#[derive(Debug, Default)]
pub struct InstancePool {
    entries: HashMap<GeometrySignature, PrimaryEntry>,
}

impl InstancePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, signature: &GeometrySignature) -> Option<&PrimaryEntry> {
        self.entries.get(signature)
    }

    /// Returns the canonical resources for `signature`, registering `path` as
    /// a user. The supplied resources become canonical when the signature is new.
    pub fn acquire(
        &mut self,
        signature: GeometrySignature,
        path: &str,
        geometry: &Arc<Geometry>,
        material: &Arc<Material>,
    ) -> (Arc<Geometry>, Arc<Material>) {
        let entry = self.entries.entry(signature).or_insert_with(|| PrimaryEntry {
            geometry: geometry.clone(),
            material: material.clone(),
            owner: path.to_string(),
            users: BTreeSet::new(),
        });
        entry.users.insert(path.to_string());
        (entry.geometry.clone(), entry.material.clone())
    }

    pub fn signatures_used_by(&self, path: &str) -> Vec<GeometrySignature> {
        let mut signatures: Vec<_> =
            self.entries.iter().filter(|(_, entry)| entry.users.contains(path)).map(|(sig, _)| *sig).collect();
        signatures.sort();
        signatures
    }

    /// Removes `path` from every entry. Entries without users are deleted;
    /// entries owned by `path` pass to the first remaining user.
    pub fn release_path(&mut self, path: &str) -> PoolRelease {
        let mut outcome = PoolRelease::default();
        self.entries.retain(|signature, entry| {
            if !entry.users.remove(path) {
                return true;
            }
            match entry.users.iter().next() {
                None => {
                    log::trace!("pool entry {signature} dropped with last user '{path}'");
                    outcome.removed += 1;
                    false
                }
                Some(next) => {
                    if entry.owner == path {
                        log::trace!("pool entry {signature} handed from '{path}' to '{next}'");
                        entry.owner = next.clone();
                        outcome.handed_off += 1;
                    }
                    true
                }
            }
        });
        outcome
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OptimizeStats {
    pub source_meshes: usize,
    pub exempt_meshes: usize,
    pub instance_groups: usize,
    pub instanced_draws: usize,
    pub plain_draws: usize,
    /// The grouped pass was refused and only geometry dedup ran.
    pub degraded: bool,
}

impl OptimizeStats {
    pub fn draw_calls(&self) -> usize {
        self.instance_groups + self.plain_draws
    }
}

#[derive(Clone, Debug)]
pub struct Optimized {
    pub graph: SceneGraph,
    pub stats: OptimizeStats,
}

struct Group<'a> {
    signature: GeometrySignature,
    name: &'a str,
    geometry: &'a Arc<Geometry>,
    material: &'a Arc<Material>,
    transforms: Vec<Mat4>,
}

/// Rewrites scene graphs so repeated meshes render as instanced draws.
#[derive(Clone, Debug)]
pub struct Instancer {
    enabled: bool,
    classifier: MaterialClassifier,
}

impl Instancer {
    pub fn new(config: &CacheConfig) -> Self {
        Self { enabled: config.instancing.enabled, classifier: MaterialClassifier::new(&config.glass) }
    }

    pub fn classifier(&self) -> &MaterialClassifier {
        &self.classifier
    }

    /// Never fails: a graph the grouped pass refuses is geometry-deduplicated
    /// instead.
    pub fn optimize(&self, pool: &mut InstancePool, owner: &str, raw: &SceneGraph) -> Optimized {
        if !self.enabled {
            return self.dedup_only(raw, false);
        }
        match self.instance_grouped(pool, owner, raw) {
            Ok(optimized) => {
                log::debug!("optimized '{owner}': {:?}", optimized.stats);
                optimized
            }
            Err(err) => {
                log::warn!("instancing '{owner}' failed ({err}); falling back to geometry dedup");
                self.dedup_only(raw, true)
            }
        }
    }

    /// Groups mergeable meshes by signature. Validation happens before the
    /// pool is touched, so an error leaves the pool unchanged.
    pub fn instance_grouped(
        &self,
        pool: &mut InstancePool,
        owner: &str,
        raw: &SceneGraph,
    ) -> Result<Optimized, OptimizeError> {
        let mut stats = OptimizeStats::default();
        let mut groups: Vec<Group<'_>> = Vec::new();
        let mut by_signature: HashMap<GeometrySignature, usize> = HashMap::new();
        let mut failure: Option<OptimizeError> = None;

        raw.walk(|node, world| {
            if failure.is_some() {
                return;
            }
            let NodeKind::Mesh(mesh) = &node.kind else {
                return;
            };
            stats.source_meshes += 1;
            if !world.is_finite() {
                failure = Some(OptimizeError::NonFiniteTransform { node: node.label().to_string() });
                return;
            }
            if let Err(err) = mesh.geometry.validate() {
                failure = Some(err);
                return;
            }
            if self.classifier.is_exempt(&mesh.material) {
                stats.exempt_meshes += 1;
                return;
            }
            let signature = GeometrySignature::of_mesh(&mesh.geometry, &mesh.material);
            let index = *by_signature.entry(signature).or_insert_with(|| {
                groups.push(Group {
                    signature,
                    name: node.label(),
                    geometry: &mesh.geometry,
                    material: &mesh.material,
                    transforms: Vec::new(),
                });
                groups.len() - 1
            });
            groups[index].transforms.push(world);
        });
        if let Some(err) = failure {
            return Err(err);
        }

        let mut roots: Vec<SceneNode> = raw.roots.iter().filter_map(|root| self.strip_mergeable(root)).collect();

        let mut optimized_nodes = Vec::with_capacity(groups.len());
        for (index, group) in groups.into_iter().enumerate() {
            let (geometry, material) = pool.acquire(group.signature, owner, group.geometry, group.material);
            if group.transforms.len() > 1 {
                stats.instance_groups += 1;
                stats.instanced_draws += group.transforms.len();
                optimized_nodes.push(SceneNode {
                    name: Some(format!("{}_instances_{index}", group.name)),
                    transform: Mat4::IDENTITY,
                    kind: NodeKind::Instanced(InstancedMeshNode {
                        id: ResourceId::new(),
                        geometry,
                        material,
                        signature: group.signature,
                        instances: group.transforms,
                    }),
                    children: Vec::new(),
                });
            } else {
                optimized_nodes.push(SceneNode {
                    name: Some(group.name.to_string()),
                    transform: group.transforms.first().copied().unwrap_or(Mat4::IDENTITY),
                    kind: NodeKind::Mesh(MeshNode { geometry, material, signature: Some(group.signature) }),
                    children: Vec::new(),
                });
            }
        }
        if !optimized_nodes.is_empty() {
            roots.push(SceneNode::group(INSTANCED_ROOT_NAME, optimized_nodes));
        }

        let graph = SceneGraph::new(raw.name.clone(), roots);
        stats.plain_draws = graph.mesh_count();
        Ok(Optimized { graph, stats })
    }

    /// Structural copy without mergeable meshes. Nodes emptied by the removal
    /// are pruned; nodes that were empty leaves to begin with are kept.
    fn strip_mergeable(&self, node: &SceneNode) -> Option<SceneNode> {
        let mut lost_content = false;
        let kind = match &node.kind {
            NodeKind::Mesh(mesh) if !self.classifier.is_exempt(&mesh.material) => {
                lost_content = true;
                NodeKind::Empty
            }
            other => other.clone(),
        };
        let children: Vec<SceneNode> = node
            .children
            .iter()
            .filter_map(|child| {
                let stripped = self.strip_mergeable(child);
                lost_content |= stripped.is_none();
                stripped
            })
            .collect();
        if lost_content && matches!(kind, NodeKind::Empty) && children.is_empty() {
            return None;
        }
        Some(SceneNode { name: node.name.clone(), transform: node.transform, kind, children })
    }

    /// Shares one `Arc<Geometry>` between meshes with identical buffers. No
    /// instancing and no pool registration. Exempt meshes keep their own
    /// geometry.
    pub fn dedup_only(&self, raw: &SceneGraph, degraded: bool) -> Optimized {
        let mut graph = raw.clone();
        let mut canonical: HashMap<GeometrySignature, Arc<Geometry>> = HashMap::new();
        let mut stats = OptimizeStats { degraded, ..OptimizeStats::default() };
        for root in &mut graph.roots {
            visit_meshes_mut(root, &mut |mesh| {
                stats.source_meshes += 1;
                if self.classifier.is_exempt(&mesh.material) {
                    stats.exempt_meshes += 1;
                    return;
                }
                let signature = GeometrySignature::of_geometry(&mesh.geometry);
                let shared = canonical.entry(signature).or_insert_with(|| mesh.geometry.clone());
                if !Arc::ptr_eq(shared, &mesh.geometry) {
                    mesh.geometry = shared.clone();
                }
            });
        }
        stats.plain_draws = stats.source_meshes;
        log::debug!("geometry dedup kept {} of {} geometries", canonical.len(), stats.source_meshes);
        Optimized { graph, stats }
    }
}

fn visit_meshes_mut(node: &mut SceneNode, visit: &mut impl FnMut(&mut MeshNode)) {
    if let NodeKind::Mesh(mesh) = &mut node.kind {
        visit(mesh);
    }
    for child in &mut node.children {
        visit_meshes_mut(child, visit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::material::{AlphaMode, MaterialDefinition};
    use crate::mesh::MeshVertex;
    use glam::{Vec2, Vec3};

    fn opaque() -> Arc<Material> {
        Arc::new(Material::new(MaterialDefinition { name: "paint".into(), ..Default::default() }))
    }

    fn glass() -> Arc<Material> {
        Arc::new(Material::new(MaterialDefinition {
            name: "Window Glass".into(),
            base_color_factor: [1.0, 1.0, 1.0, 0.2],
            alpha_mode: AlphaMode::Blend,
            ..Default::default()
        }))
    }

    fn cubes(count: usize, material: &Arc<Material>) -> Vec<SceneNode> {
        (0..count)
            .map(|i| {
                SceneNode::mesh(
                    format!("cube_{i}"),
                    Mat4::from_translation(Vec3::new(i as f32 * 2.0, 0.0, 0.0)),
                    Arc::new(Geometry::cube(1.0)),
                    material.clone(),
                )
            })
            .collect()
    }

    fn instancer() -> Instancer {
        Instancer::new(&CacheConfig::default())
    }

    #[test]
    fn repeated_cubes_become_one_instanced_draw() {
        let graph = SceneGraph::new(None, vec![SceneNode::group("parts", cubes(4, &opaque()))]);
        let mut pool = InstancePool::new();
        let optimized = instancer().optimize(&mut pool, "a.glb", &graph);

        let instanced = optimized.graph.instanced_nodes();
        assert_eq!(instanced.len(), 1);
        assert_eq!(instanced[0].instance_count(), 4);
        assert_eq!(optimized.graph.mesh_count(), 0);
        assert_eq!(optimized.graph.roots.len(), 1, "emptied 'parts' group is pruned");
        assert_eq!(optimized.graph.roots[0].name.as_deref(), Some(INSTANCED_ROOT_NAME));
        assert_eq!(pool.len(), 1);
        assert_eq!(
            optimized.stats,
            OptimizeStats {
                source_meshes: 4,
                exempt_meshes: 0,
                instance_groups: 1,
                instanced_draws: 4,
                plain_draws: 0,
                degraded: false
            }
        );
    }

    #[test]
    fn single_mesh_keeps_world_transform() {
        let inner = cubes(1, &opaque());
        let parent = SceneNode::group("parent", inner).with_transform(Mat4::from_translation(Vec3::Y * 3.0));
        let graph = SceneGraph::new(None, vec![parent]);
        let optimized = instancer().optimize(&mut InstancePool::new(), "a.glb", &graph);

        assert!(optimized.graph.instanced_nodes().is_empty());
        let meshes = optimized.graph.mesh_nodes();
        assert_eq!(meshes.len(), 1);
        assert!(meshes[0].1.signature.is_some());
        let origin = meshes[0].2.transform_point3(Vec3::ZERO);
        assert!((origin - Vec3::new(0.0, 3.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn instance_matrices_include_parent_transforms() {
        let parent = SceneNode::group("parent", cubes(2, &opaque())).with_transform(Mat4::from_translation(Vec3::Z));
        let optimized = instancer().optimize(&mut InstancePool::new(), "a.glb", &SceneGraph::new(None, vec![parent]));
        let instances = &optimized.graph.instanced_nodes()[0].instances;
        assert!((instances[1].transform_point3(Vec3::ZERO) - Vec3::new(2.0, 0.0, 1.0)).length() < 1e-6);
    }

    #[test]
    fn glass_meshes_stay_in_place() {
        let mut roots = cubes(3, &opaque());
        roots.extend(cubes(2, &glass()));
        let optimized = instancer().optimize(&mut InstancePool::new(), "a.glb", &SceneGraph::new(None, roots));

        assert_eq!(optimized.stats.exempt_meshes, 2);
        assert_eq!(optimized.stats.instance_groups, 1);
        assert_eq!(optimized.stats.plain_draws, 2);
        let glass_left: Vec<_> = optimized.graph.mesh_nodes().into_iter().filter(|(_, mesh, _)| mesh.signature.is_none()).collect();
        assert_eq!(glass_left.len(), 2);
    }

    #[test]
    fn pool_shares_canonical_resources_across_paths() {
        let material = opaque();
        let first = SceneGraph::new(None, cubes(2, &material));
        let second = SceneGraph::new(None, cubes(3, &material));
        let mut pool = InstancePool::new();
        let a = instancer().optimize(&mut pool, "a.glb", &first);
        let b = instancer().optimize(&mut pool, "b.glb", &second);

        let a_node = a.graph.instanced_nodes()[0];
        let b_node = b.graph.instanced_nodes()[0];
        assert!(Arc::ptr_eq(&a_node.geometry, &b_node.geometry));
        assert!(Arc::ptr_eq(&a_node.material, &b_node.material));
        assert_ne!(a_node.id, b_node.id);

        let entry = pool.get(&a_node.signature).expect("entry");
        assert_eq!(entry.owner, "a.glb");
        assert_eq!(entry.users.len(), 2);

        let release = pool.release_path("a.glb");
        assert_eq!(release, PoolRelease { removed: 0, handed_off: 1 });
        assert_eq!(pool.get(&a_node.signature).expect("entry").owner, "b.glb");
        assert_eq!(pool.release_path("b.glb"), PoolRelease { removed: 1, handed_off: 0 });
        assert!(pool.is_empty());
    }

    #[test]
    fn non_finite_transform_falls_back_to_dedup() {
        let mut roots = cubes(3, &opaque());
        roots[1].transform = Mat4::from_translation(Vec3::new(f32::NAN, 0.0, 0.0));
        let mut pool = InstancePool::new();
        let optimized = instancer().optimize(&mut pool, "a.glb", &SceneGraph::new(None, roots));

        assert!(optimized.stats.degraded);
        assert!(pool.is_empty());
        assert!(optimized.graph.instanced_nodes().is_empty());
        let meshes = optimized.graph.mesh_nodes();
        assert_eq!(meshes.len(), 3);
        assert!(Arc::ptr_eq(&meshes[0].1.geometry, &meshes[2].1.geometry));
    }

    #[test]
    fn malformed_geometry_is_refused() {
        let vertices = vec![MeshVertex::new(Vec3::ZERO, Vec3::Z, Vec2::ZERO); 3];
        let broken = Arc::new(Geometry::new(vertices, vec![0, 1, 7]));
        let graph = SceneGraph::new(None, vec![SceneNode::mesh("broken", Mat4::IDENTITY, broken, opaque())]);
        let err = instancer().instance_grouped(&mut InstancePool::new(), "a.glb", &graph).unwrap_err();
        assert!(matches!(err, OptimizeError::MalformedGeometry { .. }));
    }

    #[test]
    fn disabled_instancing_only_dedups() {
        let mut config = CacheConfig::default();
        config.instancing.enabled = false;
        let mut pool = InstancePool::new();
        let optimized = Instancer::new(&config).optimize(&mut pool, "a.glb", &SceneGraph::new(None, cubes(5, &opaque())));
        assert!(!optimized.stats.degraded);
        assert_eq!(optimized.stats.plain_draws, 5);
        assert!(optimized.graph.instanced_nodes().is_empty());
        assert!(pool.is_empty());
    }

    #[test]
    fn geometry_dedup_leaves_glass_geometry_alone() {
        let mut roots = cubes(2, &opaque());
        roots.extend(cubes(2, &glass()));
        let optimized = instancer().dedup_only(&SceneGraph::new(None, roots), true);
        assert_eq!(optimized.stats.exempt_meshes, 2);
        let meshes = optimized.graph.mesh_nodes();
        assert!(Arc::ptr_eq(&meshes[0].1.geometry, &meshes[1].1.geometry));
        assert!(!Arc::ptr_eq(&meshes[2].1.geometry, &meshes[3].1.geometry));
        assert!(!Arc::ptr_eq(&meshes[0].1.geometry, &meshes[2].1.geometry));
    }

    #[test]
    fn untouched_empty_leaves_survive_stripping() {
        let mut roots = cubes(2, &opaque());
        roots.push(SceneNode::group("camera_anchor", Vec::new()));
        let optimized = instancer().optimize(&mut InstancePool::new(), "a.glb", &SceneGraph::new(None, roots));
        let names: Vec<_> = optimized.graph.roots.iter().map(|root| root.label().to_string()).collect();
        assert_eq!(names, vec!["camera_anchor".to_string(), INSTANCED_ROOT_NAME.to_string()]);
    }
}
