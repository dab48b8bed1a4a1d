//! Dataset load pipeline
//!
//! A dataset resolves through zero or more unpack steps: each step fetches
//! the current target's bytes and hands them to the unpacker chosen by the
//! descriptor's type tag. Manifests redirect to another target; the
//! canonical Parquet encoding yields a [`Simulation`], which is finalized
//! exactly once before the pipeline returns it.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use trueno_layout::config::EngineConfig;
//! use trueno_layout::dataset::{DatasetDescriptor, DatasetPipeline, Fetcher, MemorySource};
//! use trueno_layout::device::DeviceContext;
//! use trueno_layout::storage::{CsrGraph, GraphFrame};
//!
//! # tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap().block_on(async {
//! let frame = GraphFrame::from_graph(CsrGraph::from_edges(3, &[(0, 1), (1, 2)])?)?;
//! let source = Arc::new(MemorySource::new());
//! source.insert("graph.parquet", frame.to_parquet_bytes()?);
//! source.insert("latest.json", r#"{"url": "graph.parquet"}"#);
//!
//! let pipeline = DatasetPipeline::new(
//!     DeviceContext::host(),
//!     Fetcher::new(source),
//!     EngineConfig::default(),
//! );
//! let sim = pipeline
//!     .load(DatasetDescriptor::new("latest.json").with_type("manifest"))
//!     .await?;
//! assert_eq!(sim.summary().unwrap().render_counts.edges, 2);
//! # Ok::<(), anyhow::Error>(())
//! # }).unwrap();
//! ```

pub mod fetch;
pub mod unpack;

pub use fetch::{CacheMiss, DatasetCache, DatasetSource, Fetcher, FsSource, MemorySource};
pub use unpack::{
    unpacker_for, ManifestUnpacker, ParquetUnpacker, UnpackContext, Unpacked, Unpacker, MANIFEST_TAG,
};

use crate::config::EngineConfig;
use crate::device::DeviceContext;
use crate::error::{LayoutError, Result};
use crate::simulation::Simulation;
use serde::Deserialize;
use std::sync::Arc;
use std::time::SystemTime;

/// Where a dataset lives and how it is encoded
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct DatasetDescriptor {
    /// Location understood by the [`DatasetSource`]
    pub url: String,
    /// Encoding tag (`manifest`; absent means canonical Parquet)
    #[serde(default, rename = "type")]
    pub type_tag: Option<String>,
}

impl DatasetDescriptor {
    /// Canonical-format descriptor for `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            type_tag: None,
        }
    }

    /// Set the type tag
    #[must_use]
    pub fn with_type(mut self, tag: impl Into<String>) -> Self {
        self.type_tag = Some(tag.into());
        self
    }

    /// Identity used for single-flight construction
    #[must_use]
    pub fn key(&self) -> String {
        match &self.type_tag {
            Some(tag) => format!("{tag}:{}", self.url),
            None => self.url.clone(),
        }
    }
}

/// A dataset still to be resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackTarget {
    /// Dataset to fetch next
    pub dataset: DatasetDescriptor,
    /// Cached bytes older than this are refetched
    pub since: Option<SystemTime>,
}

impl UnpackTarget {
    /// Target with no freshness requirement
    #[must_use]
    pub fn new(dataset: DatasetDescriptor) -> Self {
        Self {
            dataset,
            since: None,
        }
    }
}

/// Fetch → unpack loop → finalize
#[derive(Debug)]
pub struct DatasetPipeline {
    device: DeviceContext,
    fetcher: Fetcher,
    config: EngineConfig,
}

impl DatasetPipeline {
    /// Pipeline building simulations on `device`
    #[must_use]
    pub fn new(device: DeviceContext, fetcher: Fetcher, config: EngineConfig) -> Self {
        Self {
            device,
            fetcher,
            config,
        }
    }

    /// Open the configured backend and cache directory for `source`
    ///
    /// # Errors
    ///
    /// See [`DeviceContext::open`]
    pub async fn from_config(config: EngineConfig, source: Arc<dyn DatasetSource>) -> Result<Self> {
        let device = DeviceContext::open(config.backend).await?;
        let mut fetcher = Fetcher::new(source);
        if let Some(dir) = &config.cache_dir {
            fetcher = fetcher.with_cache(DatasetCache::new(dir));
        }
        Ok(Self::new(device, fetcher, config))
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Resolve `dataset` into a finalized simulation
    ///
    /// # Errors
    ///
    /// See [`DatasetPipeline::load_target`]
    pub async fn load(&self, dataset: DatasetDescriptor) -> Result<Simulation> {
        self.load_target(UnpackTarget::new(dataset)).await
    }

    /// Resolve `target` into a finalized simulation
    ///
    /// # Errors
    ///
    /// - `DatasetResolution` if a fetch or unpack fails, or the chain needs
    ///   more than `max_unpack_steps` steps
    /// - `Device` if building or finalizing the simulation fails
    pub async fn load_target(&self, mut target: UnpackTarget) -> Result<Simulation> {
        let origin = target.dataset.url.clone();
        let ctx = UnpackContext {
            device: &self.device,
            config: &self.config,
        };

        for step in 0..self.config.max_unpack_steps {
            let bytes = self.fetcher.fetch(&target).await?;
            tracing::debug!(
                step,
                url = %target.dataset.url,
                tag = target.dataset.type_tag.as_deref().unwrap_or("canonical"),
                bytes = bytes.len(),
                "unpacking"
            );
            match unpacker_for(&target.dataset).unpack(&target, bytes, ctx).await? {
                Unpacked::Loaded(simulation) => {
                    simulation.finalize(self.config.histogram_columns).await?;
                    return Ok(simulation);
                }
                Unpacked::Redirect(next) => target = next,
            }
        }
        Err(LayoutError::dataset(
            origin,
            format!(
                "not loaded after {} unpack steps",
                self.config.max_unpack_steps
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CsrGraph, GraphFrame};

    fn source_with_chain(links: usize) -> Arc<MemorySource> {
        let source = Arc::new(MemorySource::new());
        let frame = GraphFrame::from_graph(CsrGraph::from_edges(2, &[(0, 1)]).unwrap()).unwrap();
        source.insert("graph.parquet", frame.to_parquet_bytes().unwrap());
        for i in 0..links {
            let next = if i + 1 == links {
                r#"{"url": "graph.parquet"}"#.to_owned()
            } else {
                format!(r#"{{"url": "m{}", "type": "manifest"}}"#, i + 1)
            };
            source.insert(format!("m{i}"), next);
        }
        source
    }

    fn pipeline(source: Arc<MemorySource>, max_unpack_steps: usize) -> DatasetPipeline {
        let config = EngineConfig {
            max_unpack_steps,
            ..EngineConfig::default()
        };
        DatasetPipeline::new(DeviceContext::host(), Fetcher::new(source), config)
    }

    #[test]
    fn test_descriptor_key_includes_tag() {
        assert_eq!(DatasetDescriptor::new("a").key(), "a");
        assert_eq!(DatasetDescriptor::new("a").with_type("manifest").key(), "manifest:a");
    }

    #[tokio::test]
    async fn test_chain_loads_and_finalizes() {
        let sim = pipeline(source_with_chain(3), 16)
            .load(DatasetDescriptor::new("m0").with_type("manifest"))
            .await
            .unwrap();

        assert!(sim.summary().is_some());
        assert_eq!(sim.state().num_edges(), 1);
        assert_eq!(sim.key(), "graph.parquet");
        assert!(sim.finalize(4).await.is_err());
    }

    #[tokio::test]
    async fn test_chain_longer_than_cap_rejected() {
        // 3 manifests + the parquet file need 4 steps
        let err = pipeline(source_with_chain(3), 3)
            .load(DatasetDescriptor::new("m0").with_type("manifest"))
            .await
            .unwrap_err();
        assert!(matches!(err, LayoutError::DatasetResolution { ref dataset, .. } if dataset == "m0"));
    }

    #[tokio::test]
    async fn test_self_referencing_manifest_terminates() {
        let source = Arc::new(MemorySource::new());
        source.insert("loop", r#"{"url": "loop", "type": "manifest"}"#);

        let err = pipeline(source, 5)
            .load(DatasetDescriptor::new("loop").with_type("manifest"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not loaded after 5 unpack steps"));
    }

    #[tokio::test]
    async fn test_from_config_uses_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            cache_dir: Some(dir.path().to_path_buf()),
            ..EngineConfig::default()
        };
        let pipeline = DatasetPipeline::from_config(config, source_with_chain(1)).await.unwrap();

        pipeline
            .load(DatasetDescriptor::new("m0").with_type("manifest"))
            .await
            .unwrap();
        let cache = DatasetCache::new(dir.path());
        assert!(cache.get("m0", None).await.is_ok());
        assert!(cache.get("graph.parquet", None).await.is_ok());
    }
}
