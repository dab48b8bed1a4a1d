//! Integration tests for trueno-layout
//!
//! Exercises the engine end to end on the host backend: selection masks,
//! double-buffered ticks and parameter fan-out.

use trueno_layout::device::DeviceContext;
use trueno_layout::layout::{LayoutKind, ParamSet, ParamValue};
use trueno_layout::selection::{SelectionKernel, SelectionKind, SelectionShape, Selections};
use trueno_layout::state::{SimulationState, POINT_POSITIONS};
use trueno_layout::storage::{CsrGraph, GraphFrame};
use trueno_layout::{ArgValue, Simulation};

/// Deterministic scatter over `[-5, 15)²` (simple LCG for reproducibility)
fn scatter(n: usize) -> Vec<[f32; 2]> {
    let mut rng_state = 12345_u64;
    let mut next = move || {
        rng_state = rng_state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        #[allow(clippy::cast_precision_loss)]
        let unit = (rng_state >> 40) as f32 / (1_u64 << 24) as f32;
        -5.0 + 20.0 * unit
    };
    (0..n).map(|_| [next(), next()]).collect()
}

async fn state_with(points: &[[f32; 2]]) -> SimulationState {
    let state = SimulationState::new(DeviceContext::host());
    state.install_positions(points).await.unwrap();
    state
}

#[tokio::test]
async fn test_rectangle_over_ten_thousand_points() {
    let mut points = scatter(10_000);
    // Boundary points are inside
    points[0] = [0.0, 0.0];
    points[1] = [10.0, 10.0];
    points[2] = [0.0, 10.0];
    points[3] = [10.0, 5.0];
    points[4] = [10.000_1, 5.0];

    let state = state_with(&points).await;
    let selections = Selections::new(state.device()).unwrap();
    let rect = SelectionShape::rectangle(0.0, 0.0, 10.0, 10.0);

    let mask = selections.select(&state, &rect).await.unwrap();

    assert_eq!(mask.len(), 10_000);
    for (i, [x, y]) in points.iter().enumerate() {
        let expected = (0.0..=10.0).contains(x) && (0.0..=10.0).contains(y);
        assert_eq!(mask[i] == 1, expected, "point {i} at ({x}, {y})");
        assert!(mask[i] <= 1);
    }
    assert_eq!(&mask[..5], &[1, 1, 1, 1, 0]);
}

#[tokio::test]
async fn test_circle_radius_two_selects_distance_two() {
    let shape = SelectionShape::circle(5.0, 5.0, 2.0);
    let SelectionShape::Circle { radius_squared, .. } = shape else {
        panic!("circle constructor built {shape:?}");
    };
    assert_eq!(radius_squared, 4.0);

    let state = state_with(&[[7.0, 5.0], [5.0, 7.0], [3.0, 5.0], [7.0, 7.0], [5.0, 5.0]]).await;
    let kernel = SelectionKernel::new(state.device(), SelectionKind::Circle).unwrap();

    assert_eq!(kernel.select(&state, &shape).await.unwrap(), vec![1, 1, 1, 0, 1]);
    assert!(matches!(
        kernel.kernel().binding("radius_squared"),
        Some(ArgValue::F32(r)) if r == 4.0
    ));
}

#[tokio::test]
async fn test_selection_reads_committed_positions() {
    let graph = CsrGraph::from_edges(2, &[(0, 1)]).unwrap();
    let frame = GraphFrame::new(graph, vec![[0.0, 0.0], [10.0, 0.0]], Vec::new()).unwrap();
    let params = ParamSet::new()
        .with("stiffness", ParamValue::F32(0.5))
        .with("step_size", ParamValue::F32(1.0));
    let sim = Simulation::build(&DeviceContext::host(), "pair", frame, &[LayoutKind::EdgeSpring], &params)
        .await
        .unwrap();
    sim.finalize(0).await.unwrap();

    let near_origin = SelectionShape::circle(0.0, 0.0, 1.0);
    assert_eq!(sim.select(&near_origin).await.unwrap(), vec![1, 0]);

    // Point 0 moves halfway to point 1
    sim.tick().await.unwrap();
    assert_eq!(sim.state().read_positions().await.unwrap()[0], [5.0, 0.0]);
    assert_eq!(sim.select(&near_origin).await.unwrap(), vec![0, 0]);
    assert_eq!(
        sim.select(&SelectionShape::circle(5.0, 0.0, 0.5)).await.unwrap(),
        vec![1, 0]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_selections_on_one_simulation() {
    let points = scatter(5_000);
    let graph = CsrGraph::from_edges(points.len(), &[]).unwrap();
    let frame = GraphFrame::new(graph, points.clone(), Vec::new()).unwrap();
    let sim =
        Simulation::build(&DeviceContext::host(), "scatter", frame, &[LayoutKind::EdgeSpring], &ParamSet::new())
            .await
            .unwrap();
    sim.finalize(0).await.unwrap();

    let left = SelectionShape::rectangle(-5.0, -5.0, 15.0, 4.9);
    let right = SelectionShape::rectangle(-5.0, 5.0, 15.0, 15.0);
    let disc = SelectionShape::circle(5.0, 5.0, 3.0);

    for _ in 0..10 {
        let (a, b, c) = tokio::join!(sim.select(&left), sim.select(&right), sim.select(&disc));
        for (shape, mask) in [(left, a.unwrap()), (right, b.unwrap()), (disc, c.unwrap())] {
            assert_eq!(mask.len(), points.len());
            for (m, p) in mask.iter().zip(&points) {
                assert_eq!(*m == 1, shape.contains(*p), "{shape:?} at {p:?}");
            }
        }
    }
}

#[tokio::test]
async fn test_swap_is_self_inverse() {
    let state = state_with(&[[1.0, 2.0], [3.0, 4.0]]).await;
    let (current, next) = (
        state.current(POINT_POSITIONS).unwrap(),
        state.next(POINT_POSITIONS).unwrap(),
    );

    state.swap_buffers();
    assert!(state.current(POINT_POSITIONS).unwrap().same_as(&next));
    assert!(state.next(POINT_POSITIONS).unwrap().same_as(&current));

    state.swap_buffers();
    assert!(state.current(POINT_POSITIONS).unwrap().same_as(&current));
    assert!(state.next(POINT_POSITIONS).unwrap().same_as(&next));
}

#[tokio::test]
async fn test_configure_never_binds_foreign_keys() {
    let graph = CsrGraph::from_edges(3, &[(0, 1), (1, 2), (2, 0)]).unwrap();
    let sim = Simulation::build(
        &DeviceContext::host(),
        "triangle",
        GraphFrame::from_graph(graph).unwrap(),
        &[LayoutKind::ForceDirected, LayoutKind::EdgeSpring],
        &ParamSet::new(),
    )
    .await
    .unwrap();

    let params = ParamSet::new()
        .with("repulsion", ParamValue::F32(3.0))
        .with("stiffness", ParamValue::F32(0.7))
        .with("temperature", ParamValue::F32(1.0));
    sim.configure(&params).unwrap();

    for algorithm in sim.algorithms() {
        for kernel in algorithm.kernels() {
            for (name, value) in params.iter() {
                let ParamValue::F32(expected) = value else { unreachable!() };
                match kernel.binding(name) {
                    Some(ArgValue::F32(bound)) => {
                        assert!(kernel.accepts(name), "{} bound foreign `{name}`", kernel.name());
                        assert_eq!(bound, expected);
                    }
                    None => assert!(!kernel.accepts(name)),
                    Some(other) => panic!("{}.{name} bound to {other:?}", kernel.name()),
                }
            }
        }
    }
}

#[tokio::test]
async fn test_configure_cannot_override_dispatch_size() {
    let graph = CsrGraph::from_edges(4, &[(1, 0)]).unwrap();
    let frame = GraphFrame::new(
        graph,
        vec![[0.0, 0.0], [0.0, 2.0], [5.0, 5.0], [6.0, 6.0]],
        Vec::new(),
    )
    .unwrap();
    let params = ParamSet::new()
        .with("stiffness", ParamValue::F32(0.5))
        .with("step_size", ParamValue::F32(1.0));
    let sim = Simulation::build(&DeviceContext::host(), "quad", frame, &[LayoutKind::EdgeSpring], &params)
        .await
        .unwrap();
    sim.finalize(0).await.unwrap();

    for bogus in [1, 100] {
        sim.configure(&ParamSet::new().with("num_points", ParamValue::U32(bogus)))
            .unwrap();
    }
    let kernel = &sim.algorithms()[0].kernels()[0];
    assert!(matches!(kernel.binding("num_points"), Some(ArgValue::U32(4))));

    // Point 1 is past the first point and still moves
    sim.tick().await.unwrap();
    let positions = sim.state().read_positions().await.unwrap();
    assert_eq!(positions[1], [0.0, 1.0]);
    assert_eq!(positions[3], [6.0, 6.0]);
}

#[tokio::test]
async fn test_force_directed_run_stays_finite() {
    let sim = Simulation::build(
        &DeviceContext::host(),
        "ring",
        GraphFrame::from_graph(
            CsrGraph::from_edges(16, &(0..16).map(|i: u32| (i, (i + 1) % 16)).collect::<Vec<_>>())
                .unwrap(),
        )
        .unwrap(),
        &[LayoutKind::ForceDirected],
        &ParamSet::new(),
    )
    .await
    .unwrap();
    sim.finalize(0).await.unwrap();

    assert_eq!(sim.run(25).await.unwrap(), 25);
    let positions = sim.state().read_positions().await.unwrap();
    assert!(positions.iter().flatten().all(|v| v.is_finite()));

    sim.refresh_host_mirrors().await.unwrap();
    let bounds = sim.state().mirrors().bounds().unwrap();
    assert!(positions.iter().all(|p| bounds.contains(*p)));
    assert_eq!(sim.runtime_stats().get("point_forces").unwrap().calls, 25);
}
