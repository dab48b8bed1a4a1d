//! Host reference implementations of the catalog kernels
//!
//! Each function mirrors its WGSL counterpart work-item for work-item.

use crate::device::{HostArgs, HostOutputs};

const SOFTENING: f32 = 1e-4;

fn check_len(name: &str, len: usize, needed: usize) -> Result<(), String> {
    if len < needed {
        return Err(format!("buffer `{name}` holds {len} elements, need {needed}"));
    }
    Ok(())
}

/// Work items that fall inside both the dispatch and the point count
fn active_points(args: &HostArgs) -> Result<usize, String> {
    let n = args.u32("num_points")?;
    Ok(args.global_size().min(n) as usize)
}

pub(super) fn select_rectangle(args: &HostArgs, out: &mut HostOutputs) -> Result<(), String> {
    let (top, left) = (args.f32("top")?, args.f32("left")?);
    let (bottom, right) = (args.f32("bottom")?, args.f32("right")?);
    let n = active_points(args)?;

    let positions = args.vec2s("positions")?;
    check_len("positions", positions.len(), n)?;
    let mask = out.bytes_mut("mask")?;
    check_len("mask", mask.len(), n)?;

    for (m, [x, y]) in mask.iter_mut().zip(positions).take(n) {
        let inside = left <= *x && *x <= right && top <= *y && *y <= bottom;
        *m = u8::from(inside);
    }
    Ok(())
}

pub(super) fn select_circle(args: &HostArgs, out: &mut HostOutputs) -> Result<(), String> {
    let (cx, cy) = (args.f32("center_x")?, args.f32("center_y")?);
    let r2 = args.f32("radius_squared")?;
    let n = active_points(args)?;

    let positions = args.vec2s("positions")?;
    check_len("positions", positions.len(), n)?;
    let mask = out.bytes_mut("mask")?;
    check_len("mask", mask.len(), n)?;

    for (m, [x, y]) in mask.iter_mut().zip(positions).take(n) {
        let (dx, dy) = (x - cx, y - cy);
        *m = u8::from(dx * dx + dy * dy <= r2);
    }
    Ok(())
}

pub(super) fn point_forces(args: &HostArgs, out: &mut HostOutputs) -> Result<(), String> {
    let repulsion = args.f32("repulsion")?;
    let gravity = args.f32("gravity")?;
    let n = active_points(args)?;
    let total = args.u32("num_points")? as usize;

    let positions = args.vec2s("positions")?;
    check_len("positions", positions.len(), total)?;
    let forces = out.vec2s_mut("forces")?;
    check_len("forces", forces.len(), n)?;

    for i in 0..n {
        let [px, py] = positions[i];
        let mut f = [-gravity * px, -gravity * py];
        for (j, [qx, qy]) in positions.iter().enumerate().take(total) {
            if i == j {
                continue;
            }
            let (dx, dy) = (px - qx, py - qy);
            let d2 = dx * dx + dy * dy + SOFTENING;
            f[0] += repulsion * dx / d2;
            f[1] += repulsion * dy / d2;
        }
        forces[i] = f;
    }
    Ok(())
}

fn spring_sum(
    positions: &[[f32; 2]],
    offsets: &[u32],
    neighbors: &[u32],
    i: usize,
) -> Result<[f32; 2], String> {
    let (start, end) = (offsets[i] as usize, offsets[i + 1] as usize);
    check_len("neighbors", neighbors.len(), end)?;
    let [px, py] = positions[i];
    let mut acc = [0.0_f32, 0.0_f32];
    for &j in &neighbors[start..end] {
        let [qx, qy] = *positions
            .get(j as usize)
            .ok_or_else(|| format!("edge endpoint {j} out of range"))?;
        acc[0] += qx - px;
        acc[1] += qy - py;
    }
    Ok(acc)
}

pub(super) fn integrate_edges(args: &HostArgs, out: &mut HostOutputs) -> Result<(), String> {
    let stiffness = args.f32("stiffness")?;
    let step = args.f32("step_size")?;
    let n = active_points(args)?;

    let positions = args.vec2s("positions")?;
    let forces = args.vec2s("forces")?;
    let fwd_offsets = args.u32s("forward_offsets")?;
    let fwd = args.u32s("forward_destinations")?;
    let bwd_offsets = args.u32s("backward_offsets")?;
    let bwd = args.u32s("backward_sources")?;
    check_len("positions", positions.len(), n)?;
    check_len("forces", forces.len(), n)?;
    check_len("forward_offsets", fwd_offsets.len(), n + 1)?;
    check_len("backward_offsets", bwd_offsets.len(), n + 1)?;

    let next = out.vec2s_mut("next_positions")?;
    check_len("next_positions", next.len(), n)?;

    for i in 0..n {
        let out_pull = spring_sum(positions, fwd_offsets, fwd, i)?;
        let in_pull = spring_sum(positions, bwd_offsets, bwd, i)?;
        let [px, py] = positions[i];
        let fx = forces[i][0] + stiffness * (out_pull[0] + in_pull[0]);
        let fy = forces[i][1] + stiffness * (out_pull[1] + in_pull[1]);
        next[i] = [px + step * fx, py + step * fy];
    }
    Ok(())
}

pub(super) fn edge_spring(args: &HostArgs, out: &mut HostOutputs) -> Result<(), String> {
    let stiffness = args.f32("stiffness")?;
    let step = args.f32("step_size")?;
    let n = active_points(args)?;

    let positions = args.vec2s("positions")?;
    let offsets = args.u32s("forward_offsets")?;
    let destinations = args.u32s("forward_destinations")?;
    check_len("positions", positions.len(), n)?;
    check_len("forward_offsets", offsets.len(), n + 1)?;

    let next = out.vec2s_mut("next_positions")?;
    check_len("next_positions", next.len(), n)?;

    for i in 0..n {
        let pull = spring_sum(positions, offsets, destinations, i)?;
        let [px, py] = positions[i];
        next[i] = [
            px + step * stiffness * pull[0],
            py + step * stiffness * pull[1],
        ];
    }
    Ok(())
}
