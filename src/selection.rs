//! Spatial selection against committed positions
//!
//! A selection yields a mask with one byte per point (`1` selected, `0` not).
//! Each shape owns one [`SelectionKernel`] whose mask buffer is allocated
//! lazily and reused while large enough. Bindings and the mask are shared,
//! so concurrent selections of one shape run one at a time.
//!
//! Failures surface at two levels: [`Kernel::exec`] reports the device
//! failure (naming the kernel), and [`SelectionKernel::select`] wraps any
//! device failure of the whole operation in [`LayoutError::Selection`].

use crate::device::{BufferDeps, DeviceBuffer, DeviceContext};
use crate::error::{DeviceOperationFailure, LayoutError, Result};
use crate::kernel::{ArgValue, Kernel};
use crate::kernels::{KernelSource, NUM_POINTS, SELECT_CIRCLE, SELECT_RECTANGLE};
use crate::state::{BufferPool, SimulationState, POINT_POSITIONS};
use std::str::FromStr;
use tokio::sync::Mutex;

const MASK: &str = "mask";

/// Selection shape family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectionKind {
    /// Axis-aligned rectangle
    Rectangle,
    /// Circle
    Circle,
}

impl SelectionKind {
    /// Shape name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Rectangle => "rectangle",
            Self::Circle => "circle",
        }
    }

    fn source(self) -> &'static KernelSource {
        match self {
            Self::Rectangle => &SELECT_RECTANGLE,
            Self::Circle => &SELECT_CIRCLE,
        }
    }
}

impl FromStr for SelectionKind {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rectangle" | "rect" | "box" => Ok(Self::Rectangle),
            "circle" => Ok(Self::Circle),
            _ => Err(LayoutError::unrecognized("selection shape", s)),
        }
    }
}

/// A concrete selection region
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SelectionShape {
    /// `left ≤ x ≤ right` and `top ≤ y ≤ bottom`
    Rectangle {
        /// Smallest y
        top: f32,
        /// Smallest x
        left: f32,
        /// Largest y
        bottom: f32,
        /// Largest x
        right: f32,
    },
    /// `dx² + dy² ≤ radius_squared`
    Circle {
        /// Center x
        center_x: f32,
        /// Center y
        center_y: f32,
        /// Squared radius
        radius_squared: f32,
    },
}

impl SelectionShape {
    /// Rectangle from its bounds
    #[must_use]
    pub const fn rectangle(top: f32, left: f32, bottom: f32, right: f32) -> Self {
        Self::Rectangle {
            top,
            left,
            bottom,
            right,
        }
    }

    /// Circle from its center and (unsquared) radius
    #[must_use]
    pub fn circle(center_x: f32, center_y: f32, radius: f32) -> Self {
        Self::Circle {
            center_x,
            center_y,
            radius_squared: radius * radius,
        }
    }

    /// Shape family
    #[must_use]
    pub const fn kind(&self) -> SelectionKind {
        match self {
            Self::Rectangle { .. } => SelectionKind::Rectangle,
            Self::Circle { .. } => SelectionKind::Circle,
        }
    }

    /// Host reference predicate (inclusive on every boundary)
    #[must_use]
    pub fn contains(&self, [x, y]: [f32; 2]) -> bool {
        match *self {
            Self::Rectangle {
                top,
                left,
                bottom,
                right,
            } => left <= x && x <= right && top <= y && y <= bottom,
            Self::Circle {
                center_x,
                center_y,
                radius_squared,
            } => {
                let (dx, dy) = (x - center_x, y - center_y);
                dx * dx + dy * dy <= radius_squared
            }
        }
    }

    fn scalars(&self) -> Vec<(&'static str, ArgValue)> {
        match *self {
            Self::Rectangle {
                top,
                left,
                bottom,
                right,
            } => vec![
                ("top", ArgValue::F32(top)),
                ("left", ArgValue::F32(left)),
                ("bottom", ArgValue::F32(bottom)),
                ("right", ArgValue::F32(right)),
            ],
            Self::Circle {
                center_x,
                center_y,
                radius_squared,
            } => vec![
                ("center_x", ArgValue::F32(center_x)),
                ("center_y", ArgValue::F32(center_y)),
                ("radius_squared", ArgValue::F32(radius_squared)),
            ],
        }
    }
}

/// Selection kernel for one shape family, with its lazily sized mask
#[derive(Debug)]
pub struct SelectionKernel {
    kind: SelectionKind,
    kernel: Kernel,
    masks: BufferPool,
    // Held from binding until the mask is read back
    dispatch: Mutex<()>,
}

impl SelectionKernel {
    /// Compile the kernel for `kind`
    ///
    /// # Errors
    ///
    /// Returns `Device` if compilation fails
    pub fn new(device: &DeviceContext, kind: SelectionKind) -> Result<Self> {
        Ok(Self {
            kind,
            kernel: Kernel::compile(device, kind.source())?,
            masks: BufferPool::new(device.clone()),
            dispatch: Mutex::new(()),
        })
    }

    /// Shape family
    #[must_use]
    pub fn kind(&self) -> SelectionKind {
        self.kind
    }

    /// Underlying kernel (for runtime reports)
    #[must_use]
    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Mask buffer for `num_points` points, reused while large enough
    ///
    /// # Errors
    ///
    /// Returns `DeviceOperationFailure` if allocation fails
    pub async fn mask(&self, num_points: usize) -> std::result::Result<DeviceBuffer, DeviceOperationFailure> {
        self.masks.acquire(MASK, num_points, 1).await
    }

    /// Device allocations made for masks so far
    #[must_use]
    pub fn mask_allocations(&self) -> u64 {
        self.masks.allocations()
    }

    /// Select among the committed positions of `state`
    ///
    /// # Errors
    ///
    /// - `InvalidState` if positions are not installed or `shape` belongs to
    ///   another family
    /// - `Selection` wrapping any device failure
    pub async fn select(&self, state: &SimulationState, shape: &SelectionShape) -> Result<Vec<u8>> {
        let positions = state.current(POINT_POSITIONS)?;
        let num_points = u32::try_from(state.num_points())
            .map_err(|_| LayoutError::InvalidState("point count exceeds u32".into()))?;
        self.select_in(&positions, num_points, shape).await
    }

    /// Select among the first `num_points` points of `positions`
    ///
    /// # Errors
    ///
    /// Same as [`SelectionKernel::select`]
    pub async fn select_in(
        &self,
        positions: &DeviceBuffer,
        num_points: u32,
        shape: &SelectionShape,
    ) -> Result<Vec<u8>> {
        if shape.kind() != self.kind {
            return Err(LayoutError::InvalidState(format!(
                "{} shape given to {} selection",
                shape.kind().name(),
                self.kind.name()
            )));
        }
        let wrap = |source: DeviceOperationFailure| LayoutError::Selection {
            shape: self.kind.name(),
            source,
        };

        let _dispatch = self.dispatch.lock().await;
        let n = num_points as usize;
        let mask = self.mask(n).await.map_err(wrap)?;

        let mut args = shape.scalars();
        args.push((NUM_POINTS, ArgValue::U32(num_points)));
        args.push(("positions", ArgValue::from(positions)));
        args.push((MASK, ArgValue::from(&mask)));
        self.kernel.set(args)?;

        self.kernel
            .exec(num_points, BufferDeps::new().read(positions).write(&mask))
            .await
            .map_err(wrap)?;

        let mut out = vec![0_u8; n];
        mask.read(&mut out).await.map_err(wrap)?;
        tracing::trace!(shape = self.kind.name(), num_points, "selection complete");
        Ok(out)
    }
}

/// One selection kernel per shape family
#[derive(Debug)]
pub struct Selections {
    rectangle: SelectionKernel,
    circle: SelectionKernel,
}

impl Selections {
    /// Compile both selection kernels
    ///
    /// # Errors
    ///
    /// Returns `Device` if compilation fails
    pub fn new(device: &DeviceContext) -> Result<Self> {
        Ok(Self {
            rectangle: SelectionKernel::new(device, SelectionKind::Rectangle)?,
            circle: SelectionKernel::new(device, SelectionKind::Circle)?,
        })
    }

    /// Kernel for `kind`
    #[must_use]
    pub fn get(&self, kind: SelectionKind) -> &SelectionKernel {
        match kind {
            SelectionKind::Rectangle => &self.rectangle,
            SelectionKind::Circle => &self.circle,
        }
    }

    /// Run the kernel matching `shape`
    ///
    /// # Errors
    ///
    /// See [`SelectionKernel::select`]
    pub async fn select(&self, state: &SimulationState, shape: &SelectionShape) -> Result<Vec<u8>> {
        self.get(shape.kind()).select(state, shape).await
    }

    /// Both kernels, for runtime reports
    #[must_use]
    pub fn kernels(&self) -> [&Kernel; 2] {
        [self.rectangle.kernel(), self.circle.kernel()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceOp;

    async fn state_with(points: &[[f32; 2]]) -> SimulationState {
        let state = SimulationState::new(DeviceContext::host());
        state.install_positions(points).await.unwrap();
        state
    }

    #[test]
    fn test_circle_constructor_squares_radius() {
        let shape = SelectionShape::circle(5.0, 5.0, 2.0);
        assert_eq!(
            shape,
            SelectionShape::Circle {
                center_x: 5.0,
                center_y: 5.0,
                radius_squared: 4.0
            }
        );
        assert!(shape.contains([7.0, 5.0]));
        assert!(!shape.contains([7.01, 5.0]));
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("Rect".parse::<SelectionKind>().unwrap(), SelectionKind::Rectangle);
        assert!(matches!(
            "lasso".parse::<SelectionKind>(),
            Err(LayoutError::UnrecognizedConfiguration { kind: "selection shape", .. })
        ));
    }

    #[tokio::test]
    async fn test_rectangle_bounds_inclusive() {
        let state = state_with(&[
            [0.0, 5.0],
            [10.0, 5.0],
            [5.0, 0.0],
            [5.0, 10.0],
            [10.5, 5.0],
            [5.0, -0.5],
        ])
        .await;
        let selections = Selections::new(state.device()).unwrap();

        let mask = selections
            .select(&state, &SelectionShape::rectangle(0.0, 0.0, 10.0, 10.0))
            .await
            .unwrap();
        assert_eq!(mask, vec![1, 1, 1, 1, 0, 0]);
    }

    #[tokio::test]
    async fn test_circle_boundary_inclusive() {
        let state = state_with(&[[7.0, 5.0], [5.0, 3.0], [7.5, 5.0], [5.0, 5.0]]).await;
        let selections = Selections::new(state.device()).unwrap();

        let mask = selections
            .select(&state, &SelectionShape::circle(5.0, 5.0, 2.0))
            .await
            .unwrap();
        assert_eq!(mask, vec![1, 1, 0, 1]);
    }

    #[tokio::test]
    async fn test_mask_reused_until_points_grow() {
        let selection =
            SelectionKernel::new(&DeviceContext::host(), SelectionKind::Rectangle).unwrap();

        let first = selection.mask(100).await.unwrap();
        assert_eq!(first.byte_len(), 100);
        assert!(selection.mask(50).await.unwrap().same_as(&first));
        assert_eq!(selection.mask_allocations(), 1);

        let grown = selection.mask(150).await.unwrap();
        assert!(!grown.same_as(&first));
        assert_eq!(grown.byte_len(), 150);
        assert_eq!(selection.mask_allocations(), 2);
    }

    #[tokio::test]
    async fn test_smaller_selection_returns_exact_length() {
        let selection =
            SelectionKernel::new(&DeviceContext::host(), SelectionKind::Circle).unwrap();
        let big = state_with(&[[0.0, 0.0]; 8]).await;
        let small = state_with(&[[0.0, 0.0], [9.0, 9.0]]).await;

        let shape = SelectionShape::circle(0.0, 0.0, 1.0);
        assert_eq!(selection.select(&big, &shape).await.unwrap().len(), 8);
        assert_eq!(selection.select(&small, &shape).await.unwrap(), vec![1, 0]);
        assert_eq!(selection.mask_allocations(), 1);
    }

    #[tokio::test]
    async fn test_kernel_failure_wrapped_at_selection_level() {
        let device = DeviceContext::host();
        let selection = SelectionKernel::new(&device, SelectionKind::Rectangle).unwrap();
        let positions = device.create_buffer("positions", 8).await.unwrap();

        // One point stored, three requested
        let err = selection
            .select_in(&positions, 3, &SelectionShape::rectangle(0.0, 0.0, 1.0, 1.0))
            .await
            .unwrap_err();

        match &err {
            LayoutError::Selection { shape, source } => {
                assert_eq!(*shape, "rectangle");
                assert_eq!(source.op, DeviceOp::Execute);
                assert_eq!(source.name, "select_rectangle");
            }
            other => panic!("expected selection error, got {other:?}"),
        }
        assert!(err.device_failure().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_selections_keep_their_own_masks() {
        #[allow(clippy::cast_precision_loss)]
        let points: Vec<[f32; 2]> = (0..20_000).map(|i| [i as f32, 0.0]).collect();
        let state = state_with(&points).await;
        let selection =
            SelectionKernel::new(state.device(), SelectionKind::Rectangle).unwrap();
        let low = SelectionShape::rectangle(-1.0, 0.0, 1.0, 9_999.0);
        let high = SelectionShape::rectangle(-1.0, 10_000.0, 1.0, 20_000.0);

        for _ in 0..20 {
            let (a, b) = tokio::join!(selection.select(&state, &low), selection.select(&state, &high));
            let (a, b) = (a.unwrap(), b.unwrap());
            assert!(a[..10_000].iter().all(|&m| m == 1) && a[10_000..].iter().all(|&m| m == 0));
            assert!(b[..10_000].iter().all(|&m| m == 0) && b[10_000..].iter().all(|&m| m == 1));
        }
        assert_eq!(selection.mask_allocations(), 1);
    }

    #[tokio::test]
    async fn test_wrong_family_rejected() {
        let state = state_with(&[[0.0, 0.0]]).await;
        let selection =
            SelectionKernel::new(state.device(), SelectionKind::Rectangle).unwrap();

        let err = selection
            .select(&state, &SelectionShape::circle(0.0, 0.0, 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, LayoutError::InvalidState(_)));
    }
}
