//! Unpackers: raw dataset bytes → simulation or redirect

use super::{DatasetDescriptor, UnpackTarget};
use crate::config::EngineConfig;
use crate::device::DeviceContext;
use crate::error::{LayoutError, Result};
use crate::simulation::Simulation;
use crate::storage::GraphFrame;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};

/// Type tag of manifest (indirection) datasets
pub const MANIFEST_TAG: &str = "manifest";

/// Outcome of one unpack step
#[derive(Debug)]
pub enum Unpacked {
    /// Terminal: a built (not yet finalized) simulation
    Loaded(Simulation),
    /// Re-resolve this target
    Redirect(UnpackTarget),
}

/// Shared inputs of an unpack step
#[derive(Debug, Clone, Copy)]
pub struct UnpackContext<'a> {
    /// Device simulations are built on
    pub device: &'a DeviceContext,
    /// Algorithms and parameters for built simulations
    pub config: &'a EngineConfig,
}

/// One dataset encoding
pub trait Unpacker: Send + Sync {
    /// Decode `bytes` fetched for `target`
    fn unpack<'a>(
        &'a self,
        target: &'a UnpackTarget,
        bytes: Bytes,
        ctx: UnpackContext<'a>,
    ) -> BoxFuture<'a, Result<Unpacked>>;
}

/// Canonical Parquet datasets
#[derive(Debug, Default, Clone, Copy)]
pub struct ParquetUnpacker;

impl Unpacker for ParquetUnpacker {
    fn unpack<'a>(
        &'a self,
        target: &'a UnpackTarget,
        bytes: Bytes,
        ctx: UnpackContext<'a>,
    ) -> BoxFuture<'a, Result<Unpacked>> {
        async move {
            let url = &target.dataset.url;
            let frame = GraphFrame::from_parquet_bytes(bytes)
                .map_err(|e| LayoutError::dataset(url.as_str(), format!("{e:#}")))?;
            let simulation = Simulation::build(
                ctx.device,
                target.dataset.key(),
                frame,
                &ctx.config.algorithms,
                &ctx.config.params,
            )
            .await?;
            Ok(Unpacked::Loaded(simulation))
        }
        .boxed()
    }
}

/// JSON indirection: `{"url": "...", "type": "..."}`
#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestUnpacker;

impl Unpacker for ManifestUnpacker {
    fn unpack<'a>(
        &'a self,
        target: &'a UnpackTarget,
        bytes: Bytes,
        _ctx: UnpackContext<'a>,
    ) -> BoxFuture<'a, Result<Unpacked>> {
        async move {
            let next: DatasetDescriptor = serde_json::from_slice(&bytes).map_err(|e| {
                LayoutError::dataset(target.dataset.url.as_str(), format!("bad manifest: {e}"))
            })?;
            Ok(Unpacked::Redirect(UnpackTarget {
                dataset: next,
                since: target.since,
            }))
        }
        .boxed()
    }
}

/// Unpacker for a descriptor's type tag
///
/// Absent or unrecognized tags fall back to the canonical format.
#[must_use]
pub fn unpacker_for(dataset: &DatasetDescriptor) -> &'static dyn Unpacker {
    match dataset.type_tag.as_deref() {
        Some(MANIFEST_TAG) => &ManifestUnpacker,
        _ => &ParquetUnpacker,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CsrGraph;

    fn ctx<'a>(device: &'a DeviceContext, config: &'a EngineConfig) -> UnpackContext<'a> {
        UnpackContext { device, config }
    }

    #[tokio::test]
    async fn test_manifest_redirects_and_keeps_since() {
        let (device, config) = (DeviceContext::host(), EngineConfig::default());
        let target = UnpackTarget {
            dataset: DatasetDescriptor::new("index.json").with_type(MANIFEST_TAG),
            since: Some(std::time::SystemTime::UNIX_EPOCH),
        };
        let bytes = Bytes::from_static(br#"{"url": "graph.parquet"}"#);

        let Unpacked::Redirect(next) = unpacker_for(&target.dataset)
            .unpack(&target, bytes, ctx(&device, &config))
            .await
            .unwrap()
        else {
            panic!("expected redirect");
        };
        assert_eq!(next.dataset, DatasetDescriptor::new("graph.parquet"));
        assert_eq!(next.since, target.since);
    }

    #[tokio::test]
    async fn test_bad_manifest() {
        let (device, config) = (DeviceContext::host(), EngineConfig::default());
        let target = UnpackTarget::new(DatasetDescriptor::new("m").with_type(MANIFEST_TAG));

        let err = ManifestUnpacker
            .unpack(&target, Bytes::from_static(b"not json"), ctx(&device, &config))
            .await
            .unwrap_err();
        assert!(matches!(err, LayoutError::DatasetResolution { .. }));
    }

    #[tokio::test]
    async fn test_unknown_tag_uses_parquet() {
        let (device, config) = (DeviceContext::host(), EngineConfig::default());
        let frame = GraphFrame::from_graph(CsrGraph::from_edges(2, &[(0, 1)]).unwrap()).unwrap();
        let target = UnpackTarget::new(DatasetDescriptor::new("g").with_type("arrow-ipc"));

        let unpacked = unpacker_for(&target.dataset)
            .unpack(
                &target,
                Bytes::from(frame.to_parquet_bytes().unwrap()),
                ctx(&device, &config),
            )
            .await
            .unwrap();
        let Unpacked::Loaded(sim) = unpacked else {
            panic!("expected loaded simulation");
        };
        assert_eq!(sim.state().num_points(), 2);
        assert!(sim.summary().is_none());
    }
}
