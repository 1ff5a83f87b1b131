//! Cell classification and per-cell supporting planes
use super::{
    grid::Grid,
    types::{Corner, Edge},
};
use crate::solver::Plane;
use nalgebra::Vector3;

/// Classification of a background grid cell
///
/// A boundary cell is also an interior cell, which is why there's no separate
/// flag for it; use [`CellKind::is_interior`] to check for either.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CellKind {
    /// Every corner is at or below the isosurface cutoff
    Exterior,
    /// Every corner is above the isosurface cutoff
    Interior,
    /// Some corners are above the cutoff and some are not
    Boundary,
}

impl CellKind {
    /// Checks whether any corner of the cell is inside
    pub fn is_interior(self) -> bool {
        !matches!(self, CellKind::Exterior)
    }

    /// Checks whether the cell straddles the surface
    pub fn is_boundary(self) -> bool {
        matches!(self, CellKind::Boundary)
    }
}

/// Returns the node multi-index of a cell corner
fn corner_node(cell: [usize; 3], c: Corner) -> [usize; 3] {
    let o = c.offset();
    [cell[0] + o[0], cell[1] + o[1], cell[2] + o[2]]
}

/// Returns the implicit value at each corner of a cell
pub fn corner_values(grid: &Grid, phi: &[f64], cell: [usize; 3]) -> [f64; 8] {
    let mut out = [0.0; 8];
    for c in Corner::iter() {
        out[c.index()] = phi[grid.node_index(&corner_node(cell, c))];
    }
    out
}

/// Classifies every cell in the grid
///
/// A corner is inside if its implicit value is strictly positive.
pub fn classify(grid: &Grid, phi: &[f64]) -> Vec<CellKind> {
    (0..grid.cell_count())
        .map(|i| {
            let ijk = grid.cell_ijk(i);
            let c = corner_values(grid, phi, [ijk[0], ijk[1], ijk[2]]);
            let inside = c.iter().filter(|v| **v > 0.0).count();
            match inside {
                0 => CellKind::Exterior,
                8 => CellKind::Interior,
                _ => CellKind::Boundary,
            }
        })
        .collect()
}

/// User-provided half-spaces that clip the reconstructed body
///
/// Each plane keeps the region `n · (x - p) <= 0`.  Grid nodes outside any
/// plane are forced to the exterior, and surface crossings on edges leading to
/// those nodes are taken from the plane itself.
#[derive(Clone, Debug, Default)]
pub struct Clipping<'p> {
    planes: &'p [Plane<3>],
    /// Index of the first plane excluding each node, if any
    nodes: Vec<Option<usize>>,
}

impl<'p> Clipping<'p> {
    /// Finds the nodes of `grid` excluded by any of the given planes
    pub fn new(grid: &Grid, planes: &'p [Plane<3>], tolerance: f64) -> Self {
        if planes.is_empty() {
            return Self::default();
        }
        let nodes = (0..grid.node_count())
            .map(|i| {
                let p = Vector3::from_iterator(
                    grid.node_position(&grid.node_ijk(i)),
                );
                planes
                    .iter()
                    .position(|b| b.normal.dot(&(p - b.point)) > tolerance)
            })
            .collect();
        Self { planes, nodes }
    }

    /// Returns the plane excluding the given node, if any
    pub fn plane_for(&self, node: usize) -> Option<&'p Plane<3>> {
        self.nodes
            .get(node)
            .copied()
            .flatten()
            .map(|i| &self.planes[i])
    }

    /// Checks whether the given node is excluded
    pub fn is_clipped(&self, node: usize) -> bool {
        self.nodes.get(node).is_some_and(|n| n.is_some())
    }
}

/// Gradient of the trilinear interpolant of a cell's corner values
fn trilinear_gradient(
    corners: &[f64; 8],
    lo: &Vector3<f64>,
    size: &Vector3<f64>,
    p: &Vector3<f64>,
) -> Vector3<f64> {
    let u = Vector3::from_fn(|d, _| {
        if size[d] > 0.0 {
            ((p[d] - lo[d]) / size[d]).clamp(0.0, 1.0)
        } else {
            0.0
        }
    });
    let mut g = Vector3::zeros();
    for c in Corner::iter() {
        let o = c.offset();
        for d in (0..3).filter(|d| size[*d] > 0.0) {
            let mut w = if o[d] == 1 { 1.0 } else { -1.0 };
            for a in (0..3).filter(|a| *a != d) {
                w *= if o[a] == 1 { u[a] } else { 1.0 - u[a] };
            }
            g[d] += corners[c.index()] * w / size[d];
        }
    }
    g
}

/// Builds the supporting planes of a boundary cell
///
/// There's one plane for each cell edge with a sign change.  The plane point
/// is the linear zero crossing along the edge, and the normal is the outward
/// direction `-∇φ` of the trilinear interpolant at that point.
pub fn cell_planes(
    grid: &Grid,
    phi: &[f64],
    cell: [usize; 3],
    clipping: &Clipping,
) -> Vec<Plane<3>> {
    let corners = corner_values(grid, phi, cell);
    let pos = |c: Corner| {
        Vector3::from_iterator(grid.node_position(&corner_node(cell, c)))
    };
    let lo = pos(Corner::new(0));
    let size = pos(Corner::new(7)) - lo;

    let mut out = vec![];
    for e in Edge::iter() {
        let (a, b) = (e.start, e.end());
        let (fa, fb) = (corners[a.index()], corners[b.index()]);
        if (fa > 0.0) == (fb > 0.0) {
            continue;
        }
        let (inside, outside) = if fa > 0.0 { (a, b) } else { (b, a) };
        let xi = pos(inside);
        let xo = pos(outside);

        let outside_node = grid.node_index(&corner_node(cell, outside));
        if let Some(plane) = clipping.plane_for(outside_node) {
            let dir = xo - xi;
            let denom = plane.normal.dot(&dir);
            if denom > 0.0 {
                let t = plane.normal.dot(&(plane.point - xi)) / denom;
                if (0.0..=1.0).contains(&t) {
                    out.push(Plane {
                        point: xi + dir * t,
                        normal: plane.normal,
                    });
                    continue;
                }
            }
        }

        let t = fa / (fa - fb);
        let point = pos(a) + (pos(b) - pos(a)) * t;
        let grad = trilinear_gradient(&corners, &lo, &size, &point);
        let norm = grad.norm();
        let normal = if norm.is_finite() && norm > 0.0 {
            -grad / norm
        } else {
            let mut n = Vector3::zeros();
            n[e.axis.index()] = if outside == b { 1.0 } else { -1.0 };
            n
        };
        out.push(Plane { point, normal });
    }
    out
}
