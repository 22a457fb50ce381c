//! Deduplicated asynchronous model loading.
//!
//! A load is a shared future registered in the session's in-flight table at
//! call time, so concurrent callers for the same path await one fetch. The
//! future holds only a weak handle to its session; a session disposed while
//! the fetch is outstanding discards the result.

use crate::error::{FetchError, LoadError};
use crate::instancer::{Instancer, Optimized};
use crate::mesh;
use crate::registry::{CacheSession, LoadedModel, SessionKey};
use crate::scene::SceneGraph;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Weak};

pub type LoadResult = Result<Arc<LoadedModel>, LoadError>;

/// Handle returned by `CacheRegistry::load`. Cloneable; every clone resolves
/// to the same model or the same error.
pub type LoadFuture = Shared<BoxFuture<'static, LoadResult>>;

/// Where model bytes come from.
pub trait ModelSource: Send + Sync {
    fn fetch(&self, path: &str) -> BoxFuture<'static, Result<Vec<u8>, FetchError>>;
}

/// Serves files below a root directory.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Joins `path` onto the root, refusing anything that could leave it.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, FetchError> {
        let relative = Path::new(path);
        if path.is_empty() {
            return Err(FetchError::InvalidPath(path.to_string()));
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(FetchError::InvalidPath(path.to_string()));
                }
            }
        }
        Ok(self.root.join(relative))
    }
}

impl ModelSource for DirectorySource {
    fn fetch(&self, path: &str) -> BoxFuture<'static, Result<Vec<u8>, FetchError>> {
        let result = self.resolve(path).and_then(|full| {
            fs::read(&full).map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => FetchError::NotFound(path.to_string()),
                _ => FetchError::Io { path: path.to_string(), message: err.to_string() },
            })
        });
        futures::future::ready(result).boxed()
    }
}

/// Registry entry for a load that has not committed yet.
#[derive(Clone)]
pub(crate) struct InFlight {
    pub ticket: u64,
    pub future: LoadFuture,
}

/// The fetch → parse → optimize → measure → commit pipeline for one path.
pub(crate) struct LoadJob {
    pub session: Weak<Mutex<CacheSession>>,
    pub key: SessionKey,
    pub path: String,
    pub ticket: u64,
    pub source: Arc<dyn ModelSource>,
    pub instancer: Arc<Instancer>,
}

impl LoadJob {
    pub fn into_future(self) -> LoadFuture {
        self.run().boxed().shared()
    }

    async fn run(self) -> LoadResult {
        log::info!("loading '{}' for session '{}'", self.path, self.key);
        let bytes = match self.source.fetch(&self.path).await {
            Ok(bytes) => bytes,
            Err(source) => return Err(self.abandon(LoadError::Fetch { path: self.path.clone(), source })),
        };
        let raw = match mesh::import_gltf_scene(&bytes, &self.path) {
            Ok(graph) => graph,
            Err(err) => {
                return Err(self.abandon(LoadError::Parse { path: self.path.clone(), message: format!("{err:#}") }))
            }
        };
        self.commit(raw)
    }

    fn disposed(&self) -> LoadError {
        LoadError::SessionDisposed { session: self.key.to_string(), path: self.path.clone() }
    }

    /// Forgets the request so a later `load` retries from scratch.
    fn abandon(&self, err: LoadError) -> LoadError {
        let Some(handle) = self.session.upgrade() else {
            return self.disposed();
        };
        let mut session = handle.lock();
        if session.disposed {
            return self.disposed();
        }
        if session.owns_flight(&self.path, self.ticket) {
            session.in_flight.remove(&self.path);
            session.requested.remove(&self.path);
        }
        log::warn!("{err}");
        err
    }

    fn commit(self, raw: SceneGraph) -> LoadResult {
        let Some(handle) = self.session.upgrade() else {
            log::debug!("discarding '{}': session '{}' is gone", self.path, self.key);
            return Err(self.disposed());
        };
        let mut session = handle.lock();
        if session.disposed {
            log::debug!("discarding '{}': session '{}' was disposed", self.path, self.key);
            return Err(self.disposed());
        }
        if !session.owns_flight(&self.path, self.ticket) {
            log::debug!("discarding '{}': load was cancelled", self.path);
            return Err(LoadError::Cancelled { path: self.path });
        }

        let Optimized { graph: mut optimized, stats } = self.instancer.optimize(&mut session.pool, &self.path, &raw);
        let metadata = session.measure_loaded(&self.path, &mut optimized);
        let model = Arc::new(LoadedModel { path: self.path.clone(), raw, optimized, metadata, stats });
        session.retain(model.optimized.gpu_resources());
        session.loaded.insert(self.path.clone(), model.clone());
        session.in_flight.remove(&self.path);
        log::info!(
            "loaded '{}' for session '{}': {} draws ({} instanced groups), max dimension {:.3}",
            self.path,
            self.key,
            model.stats.draw_calls(),
            model.stats.instance_groups,
            model.metadata.max_dimension
        );
        Ok(model)
    }
}
