//! Host-side dataset storage
//!
//! Provides the CSR adjacency, the [`GraphFrame`] dataframe the engine loads
//! from, and (feature `storage`) the Parquet canonical dataset encoding.

pub mod csr;
pub mod frame;

#[cfg(feature = "storage")]
pub mod parquet;

pub use csr::{CsrGraph, PointId};
pub use frame::{Column, ColumnData, ColumnType, ElementKind, GraphFrame};
