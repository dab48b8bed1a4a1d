//! Kernel catalog
//!
//! Every kernel the engine compiles is declared here once: its ordered
//! argument signature, the WGSL source used by the GPU backend, and the host
//! reference implementation used by the CPU backend.
//!
//! # Argument layout
//!
//! Scalars are packed, in declaration order, into one uniform block at
//! `@binding(0)` (4 bytes each, padded to 16). Buffer arguments follow at
//! `@binding(1..)` in declaration order. The WGSL `Params` struct of each
//! shader must list the scalars in the same order as its [`ArgDecl`]s.

mod host;

use crate::device::HostKernelFn;
use crate::error::{LayoutError, Result};

/// Scalar argument type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    /// 32-bit float
    F32,
    /// 32-bit unsigned integer
    U32,
}

/// Buffer access declared by a kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Read-only storage
    Read,
    /// Read-write storage
    ReadWrite,
}

/// Kernel argument type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    /// Scalar packed into the uniform block
    Scalar(ScalarKind),
    /// Opaque device buffer reference
    Buffer(Access),
}

/// One declared kernel argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgDecl {
    /// Argument name (as used by `Kernel::set`)
    pub name: &'static str,
    /// Argument type
    pub ty: ArgType,
    /// Bindable through a layout parameter set
    pub tunable: bool,
}

/// Physics parameter, bound by `configure`
const fn param_arg(name: &'static str) -> ArgDecl {
    ArgDecl {
        name,
        ty: ArgType::Scalar(ScalarKind::F32),
        tunable: true,
    }
}

const fn f32_arg(name: &'static str) -> ArgDecl {
    ArgDecl {
        name,
        ty: ArgType::Scalar(ScalarKind::F32),
        tunable: false,
    }
}

const fn u32_arg(name: &'static str) -> ArgDecl {
    ArgDecl {
        name,
        ty: ArgType::Scalar(ScalarKind::U32),
        tunable: false,
    }
}

const fn read_buf(name: &'static str) -> ArgDecl {
    ArgDecl {
        name,
        ty: ArgType::Buffer(Access::Read),
        tunable: false,
    }
}

const fn write_buf(name: &'static str) -> ArgDecl {
    ArgDecl {
        name,
        ty: ArgType::Buffer(Access::ReadWrite),
        tunable: false,
    }
}

/// Source of one compilable kernel
#[derive(Debug)]
pub struct KernelSource {
    /// Kernel name (source id)
    pub name: &'static str,
    /// WGSL entry point
    pub entry_point: &'static str,
    /// Ordered argument signature
    pub args: &'static [ArgDecl],
    /// WGSL compute shader
    pub wgsl: &'static str,
    /// Host reference implementation
    pub host: HostKernelFn,
}

impl KernelSource {
    /// Scalar arguments in declaration order
    pub fn scalars(&self) -> impl Iterator<Item = &ArgDecl> {
        self.args
            .iter()
            .filter(|a| matches!(a.ty, ArgType::Scalar(_)))
    }

    /// Arguments a parameter set may bind
    pub fn tunables(&self) -> impl Iterator<Item = &ArgDecl> {
        self.args.iter().filter(|a| a.tunable)
    }

    /// Buffer arguments in declaration order
    pub fn buffers(&self) -> impl Iterator<Item = &ArgDecl> {
        self.args
            .iter()
            .filter(|a| matches!(a.ty, ArgType::Buffer(_)))
    }
}

/// Workgroup size shared by every WGSL shader in this catalog
pub const WORKGROUP_SIZE: u32 = 256;

/// Shared argument name: number of points the dispatch covers
pub const NUM_POINTS: &str = "num_points";

/// Rectangle selection (inclusive on all four bounds)
pub static SELECT_RECTANGLE: KernelSource = KernelSource {
    name: "select_rectangle",
    entry_point: "select_rectangle",
    args: &[
        f32_arg("top"),
        f32_arg("left"),
        f32_arg("bottom"),
        f32_arg("right"),
        u32_arg(NUM_POINTS),
        read_buf("positions"),
        write_buf("mask"),
    ],
    wgsl: include_str!("shaders/select_rectangle.wgsl"),
    host: host::select_rectangle,
};

/// Circle selection against a pre-squared radius
pub static SELECT_CIRCLE: KernelSource = KernelSource {
    name: "select_circle",
    entry_point: "select_circle",
    args: &[
        f32_arg("center_x"),
        f32_arg("center_y"),
        f32_arg("radius_squared"),
        u32_arg(NUM_POINTS),
        read_buf("positions"),
        write_buf("mask"),
    ],
    wgsl: include_str!("shaders/select_circle.wgsl"),
    host: host::select_circle,
};

/// All-pairs repulsion plus gravity toward the origin
pub static POINT_FORCES: KernelSource = KernelSource {
    name: "point_forces",
    entry_point: "point_forces",
    args: &[
        param_arg("repulsion"),
        param_arg("gravity"),
        u32_arg(NUM_POINTS),
        read_buf("positions"),
        write_buf("forces"),
    ],
    wgsl: include_str!("shaders/point_forces.wgsl"),
    host: host::point_forces,
};

/// Springs along forward and backward edges, integrated into next positions
pub static INTEGRATE_EDGES: KernelSource = KernelSource {
    name: "integrate_edges",
    entry_point: "integrate_edges",
    args: &[
        param_arg("stiffness"),
        param_arg("step_size"),
        u32_arg(NUM_POINTS),
        read_buf("positions"),
        read_buf("forces"),
        read_buf("forward_offsets"),
        read_buf("forward_destinations"),
        read_buf("backward_offsets"),
        read_buf("backward_sources"),
        write_buf("next_positions"),
    ],
    wgsl: include_str!("shaders/integrate_edges.wgsl"),
    host: host::integrate_edges,
};

/// Springs along forward edges only
pub static EDGE_SPRING: KernelSource = KernelSource {
    name: "edge_spring",
    entry_point: "edge_spring",
    args: &[
        param_arg("stiffness"),
        param_arg("step_size"),
        u32_arg(NUM_POINTS),
        read_buf("positions"),
        read_buf("forward_offsets"),
        read_buf("forward_destinations"),
        write_buf("next_positions"),
    ],
    wgsl: include_str!("shaders/edge_spring.wgsl"),
    host: host::edge_spring,
};

/// Every kernel in the catalog
pub static CATALOG: [&KernelSource; 5] = [
    &SELECT_RECTANGLE,
    &SELECT_CIRCLE,
    &POINT_FORCES,
    &INTEGRATE_EDGES,
    &EDGE_SPRING,
];

/// Look up a kernel source by name
///
/// # Errors
///
/// Returns `UnrecognizedConfiguration` for names not in the catalog
pub fn lookup(name: &str) -> Result<&'static KernelSource> {
    CATALOG
        .iter()
        .copied()
        .find(|k| k.name == name)
        .ok_or_else(|| LayoutError::unrecognized("kernel", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_lookup_known_and_unknown() {
        assert_eq!(lookup("select_circle").unwrap().name, "select_circle");
        assert!(matches!(
            lookup("bitonic_sort"),
            Err(LayoutError::UnrecognizedConfiguration { kind: "kernel", .. })
        ));
    }

    #[test]
    fn test_argument_names_unique_per_kernel() {
        for source in CATALOG {
            let names: HashSet<_> = source.args.iter().map(|a| a.name).collect();
            assert_eq!(names.len(), source.args.len(), "{}", source.name);
        }
    }

    #[test]
    fn test_every_kernel_writes_exactly_one_buffer() {
        for source in CATALOG {
            let writable = source
                .buffers()
                .filter(|a| a.ty == ArgType::Buffer(Access::ReadWrite))
                .count();
            assert_eq!(writable, 1, "{}", source.name);
        }
    }

    #[test]
    fn test_only_physics_scalars_are_tunable() {
        for source in CATALOG {
            for arg in source.tunables() {
                assert_eq!(arg.ty, ArgType::Scalar(ScalarKind::F32), "{}", source.name);
                assert_ne!(arg.name, NUM_POINTS);
            }
        }
        assert_eq!(SELECT_RECTANGLE.tunables().count(), 0);
        let names: Vec<_> = POINT_FORCES.tunables().map(|a| a.name).collect();
        assert_eq!(names, ["repulsion", "gravity"]);
    }

    #[test]
    fn test_wgsl_declares_entry_point_and_bindings() {
        for source in CATALOG {
            assert!(
                source.wgsl.contains(&format!("fn {}(", source.entry_point)),
                "{} missing entry point",
                source.name
            );
            for (i, _) in source.buffers().enumerate() {
                let binding = format!("@binding({})", i + 1);
                assert!(source.wgsl.contains(&binding), "{} missing {binding}", source.name);
            }
        }
    }
}
