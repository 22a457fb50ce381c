use crate::config::CacheConfig;
use crate::gpu::{GpuResidency, GpuResource};
use crate::instancer::{InstancePool, Instancer, OptimizeStats, Optimized};
use crate::loader::{InFlight, LoadFuture, LoadJob, ModelSource};
use crate::metadata::{self, ModelMetadata};
use crate::scene::SceneGraph;
use futures::future::FutureExt;
use glam::Mat4;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Identifies one comparison. Sessions never share cached state.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A committed model. Shared read-only between every caller that loaded it.
#[derive(Debug)]
pub struct LoadedModel {
    pub path: String,
    /// Scene as imported, in its authored frame.
    pub raw: SceneGraph,
    /// Instanced and recentered scene, ready to draw.
    pub optimized: SceneGraph,
    pub metadata: ModelMetadata,
    pub stats: OptimizeStats,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub loaded: usize,
    pub in_flight: usize,
    pub requested: usize,
    pub pooled_signatures: usize,
    pub metadata_entries: usize,
    pub optimized_graphs: usize,
    pub resident_resources: usize,
}

pub(crate) struct CacheSession {
    key: SessionKey,
    pub(crate) loaded: HashMap<String, Arc<LoadedModel>>,
    pub(crate) in_flight: HashMap<String, InFlight>,
    pub(crate) requested: HashSet<String>,
    pub(crate) pool: InstancePool,
    metadata: HashMap<String, ModelMetadata>,
    /// Resources of graphs handed out by `CacheRegistry::optimize`, per path.
    optimized: HashMap<String, Vec<GpuResource>>,
    /// Number of live models referencing each resource.
    residency: HashMap<GpuResource, usize>,
    pub(crate) disposed: bool,
    next_ticket: u64,
}

impl CacheSession {
    fn new(key: SessionKey) -> Self {
        Self {
            key,
            loaded: HashMap::new(),
            in_flight: HashMap::new(),
            requested: HashSet::new(),
            pool: InstancePool::new(),
            metadata: HashMap::new(),
            optimized: HashMap::new(),
            residency: HashMap::new(),
            disposed: false,
            next_ticket: 0,
        }
    }

    fn issue_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    /// True while `ticket` is still the registered load for `path`.
    pub(crate) fn owns_flight(&self, path: &str, ticket: u64) -> bool {
        self.in_flight.get(path).is_some_and(|flight| flight.ticket == ticket)
    }

    /// Metadata for `path`, computed and cached on first request. Only the
    /// first computation moves the graph.
    fn metadata_for(&mut self, path: &str, graph: &mut SceneGraph) -> ModelMetadata {
        if let Some(cached) = self.metadata.get(path) {
            log::debug!("metadata hit for '{path}' in session '{}'", self.key);
            return *cached;
        }
        let computed = metadata::compute_and_recenter(graph);
        self.metadata.insert(path.to_string(), computed);
        computed
    }

    /// Like `metadata_for`, but a freshly loaded graph is always brought into
    /// the recentered frame, reusing cached metadata when present.
    pub(crate) fn measure_loaded(&mut self, path: &str, graph: &mut SceneGraph) -> ModelMetadata {
        if let Some(cached) = self.metadata.get(path).copied() {
            if !cached.is_empty() {
                graph.apply_root_transform(Mat4::from_translation(cached.recenter_offset));
            }
            return cached;
        }
        self.metadata_for(path, graph)
    }

    pub(crate) fn retain(&mut self, resources: impl IntoIterator<Item = GpuResource>) {
        for resource in resources {
            *self.residency.entry(resource).or_insert(0) += 1;
        }
    }

    fn release(&mut self, resources: impl IntoIterator<Item = GpuResource>, gpu: &dyn GpuResidency) -> usize {
        let mut freed = 0;
        for resource in resources {
            let Some(count) = self.residency.get_mut(&resource) else {
                continue;
            };
            *count -= 1;
            if *count == 0 {
                self.residency.remove(&resource);
                gpu.release(resource);
                freed += 1;
            }
        }
        freed
    }

    /// Drops every trace of `path`. Returns false when nothing was known.
    fn dispose_model(&mut self, path: &str, gpu: &dyn GpuResidency) -> bool {
        let was_requested = self.requested.remove(path);
        let was_in_flight = self.in_flight.remove(path).is_some();
        let had_metadata = self.metadata.remove(path).is_some();
        let pool = self.pool.release_path(path);
        let mut freed = 0;
        let optimized = self.optimized.remove(path);
        let was_optimized = optimized.is_some();
        if let Some(resources) = optimized {
            freed += self.release(resources, gpu);
        }
        let model = self.loaded.remove(path);
        let was_loaded = model.is_some();
        if let Some(model) = model {
            freed += self.release(model.optimized.gpu_resources(), gpu);
        }
        if !was_loaded && !was_optimized {
            return was_requested || was_in_flight || had_metadata || pool.removed + pool.handed_off > 0;
        }
        log::info!(
            "disposed '{path}' from session '{}': freed {freed} GPU resources, {} pool entries dropped, {} handed off",
            self.key,
            pool.removed,
            pool.handed_off
        );
        true
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            loaded: self.loaded.len(),
            in_flight: self.in_flight.len(),
            requested: self.requested.len(),
            pooled_signatures: self.pool.len(),
            metadata_entries: self.metadata.len(),
            optimized_graphs: self.optimized.len(),
            resident_resources: self.residency.len(),
        }
    }
}

/// Owns every comparison session and the collaborators they share.
pub struct CacheRegistry {
    config: CacheConfig,
    instancer: Arc<Instancer>,
    source: Arc<dyn ModelSource>,
    gpu: Arc<dyn GpuResidency>,
    sessions: Mutex<HashMap<SessionKey, Arc<Mutex<CacheSession>>>>,
}

impl CacheRegistry {
    pub fn new(config: CacheConfig, source: Arc<dyn ModelSource>, gpu: Arc<dyn GpuResidency>) -> Self {
        let instancer = Arc::new(Instancer::new(&config));
        Self { config, instancer, source, gpu, sessions: Mutex::new(HashMap::new()) }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn instancer(&self) -> &Instancer {
        &self.instancer
    }

    fn session(&self, key: &SessionKey) -> Option<Arc<Mutex<CacheSession>>> {
        self.sessions.lock().get(key).cloned()
    }

    fn session_or_open(&self, key: &SessionKey) -> Arc<Mutex<CacheSession>> {
        self.sessions
            .lock()
            .entry(key.clone())
            .or_insert_with(|| {
                log::debug!("opening session '{key}'");
                Arc::new(Mutex::new(CacheSession::new(key.clone())))
            })
            .clone()
    }

    pub fn open_session(&self, key: &SessionKey) {
        self.session_or_open(key);
    }

    pub fn has_session(&self, key: &SessionKey) -> bool {
        self.sessions.lock().contains_key(key)
    }

    pub fn session_keys(&self) -> Vec<SessionKey> {
        let mut keys: Vec<_> = self.sessions.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Loads `path` into `key`, opening the session if needed. Concurrent
    /// calls for the same path share one fetch; loaded paths resolve at once.
    pub fn load(&self, key: &SessionKey, path: &str) -> LoadFuture {
        let handle = self.session_or_open(key);
        let mut session = handle.lock();
        if let Some(model) = session.loaded.get(path) {
            log::debug!("cache hit for '{path}' in session '{key}'");
            return futures::future::ready(Ok(model.clone())).boxed().shared();
        }
        if let Some(flight) = session.in_flight.get(path) {
            log::debug!("joining in-flight load of '{path}' in session '{key}'");
            return flight.future.clone();
        }
        log::debug!("cache miss for '{path}' in session '{key}'");
        session.requested.insert(path.to_string());
        let ticket = session.issue_ticket();
        let future = LoadJob {
            session: Arc::downgrade(&handle),
            key: key.clone(),
            path: path.to_string(),
            ticket,
            source: self.source.clone(),
            instancer: self.instancer.clone(),
        }
        .into_future();
        session.in_flight.insert(path.to_string(), InFlight { ticket, future: future.clone() });
        future
    }

    pub fn loaded(&self, key: &SessionKey, path: &str) -> Option<Arc<LoadedModel>> {
        self.session(key)?.lock().loaded.get(path).cloned()
    }

    /// Instances `raw` against the session pool on behalf of `path`. The
    /// returned graph keeps its GPU resources resident until `path` is
    /// disposed; optimizing the same path again replaces the previous graph.
    pub fn optimize(&self, key: &SessionKey, path: &str, raw: &SceneGraph) -> Optimized {
        let handle = self.session_or_open(key);
        let mut session = handle.lock();
        let optimized = self.instancer.optimize(&mut session.pool, path, raw);
        let resources = optimized.graph.gpu_resources();
        session.retain(resources.iter().copied());
        if let Some(previous) = session.optimized.insert(path.to_string(), resources) {
            session.release(previous, self.gpu.as_ref());
        }
        optimized
    }

    /// Metadata for `path`, computed once per session. The first call
    /// recenters `graph`; later calls return the cached value untouched.
    pub fn compute_metadata(&self, key: &SessionKey, path: &str, graph: &mut SceneGraph) -> ModelMetadata {
        let handle = self.session_or_open(key);
        let mut session = handle.lock();
        session.metadata_for(path, graph)
    }

    /// Releases one model. Unknown sessions and paths are ignored.
    pub fn dispose(&self, key: &SessionKey, path: &str) -> bool {
        let Some(handle) = self.session(key) else {
            return false;
        };
        let mut session = handle.lock();
        session.dispose_model(path, self.gpu.as_ref())
    }

    /// Tears down a whole comparison. Pending loads for it resolve to
    /// `LoadError::SessionDisposed`. Safe to call repeatedly.
    pub fn dispose_session(&self, key: &SessionKey) -> bool {
        let Some(handle) = self.sessions.lock().remove(key) else {
            return false;
        };
        let mut session = handle.lock();
        let mut paths: Vec<String> = session.loaded.keys().chain(session.optimized.keys()).cloned().collect();
        paths.sort();
        paths.dedup();
        for path in &paths {
            session.dispose_model(path, self.gpu.as_ref());
        }
        let cancelled = session.in_flight.len();
        session.in_flight.clear();
        session.requested.clear();
        session.metadata.clear();
        session.pool.clear();
        let leftover: Vec<GpuResource> = session.residency.drain().map(|(resource, _)| resource).collect();
        for resource in leftover {
            self.gpu.release(resource);
        }
        session.disposed = true;
        log::info!("disposed session '{key}': {} models, {cancelled} pending loads cancelled", paths.len());
        true
    }

    pub fn session_stats(&self, key: &SessionKey) -> Option<SessionStats> {
        Some(self.session(key)?.lock().stats())
    }
}

impl Drop for CacheRegistry {
    fn drop(&mut self) {
        for key in self.session_keys() {
            self.dispose_session(&key);
        }
    }
}
