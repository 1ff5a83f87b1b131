//! Dual surface extraction
use super::{grid::Grid, types::Axis};
use nalgebra::Vector3;

/// An indexed triangle mesh of the reconstructed surface
#[derive(Clone, Default, Debug)]
pub struct Mesh {
    /// Triangles, as indexes into [`self.vertices`](Self::vertices)
    pub triangles: Vec<Vector3<usize>>,
    /// Vertex positions
    pub vertices: Vec<Vector3<f64>>,
}

impl Mesh {
    /// Returns the corners of the given triangle
    pub fn triangle(&self, i: usize) -> [Vector3<f64>; 3] {
        let t = self.triangles[i];
        [self.vertices[t.x], self.vertices[t.y], self.vertices[t.z]]
    }

    /// Returns the area-weighted normal of a triangle
    ///
    /// The vector has length equal to twice the triangle's area.
    pub fn scaled_normal(&self, i: usize) -> Vector3<f64> {
        let [a, b, c] = self.triangle(i);
        (b - a).cross(&(c - a))
    }

    /// Returns the total surface area
    pub fn area(&self) -> f64 {
        (0..self.triangles.len())
            .map(|i| self.scaled_normal(i).norm() / 2.0)
            .sum()
    }

    /// Returns the signed volume enclosed by the mesh
    ///
    /// This is only meaningful if the mesh is closed; with outward-facing
    /// triangles, the result is positive.
    pub fn signed_volume(&self) -> f64 {
        (0..self.triangles.len())
            .map(|i| {
                let [a, b, c] = self.triangle(i);
                a.dot(&b.cross(&c)) / 6.0
            })
            .sum()
    }
}

/// Builds the dual surface from per-cell boundary vertices
///
/// `cell_vertex` maps each cell to an index in `vertices`, with `usize::MAX`
/// used as a marker for cells without a vertex.
///
/// Every grid edge with a sign change in `phi` is shared by four cells, all of
/// which are boundary cells; their vertices form a quad, which we split into
/// two triangles wound so that the normal points from the inside node to the
/// outside node.
pub fn extract(
    grid: &Grid,
    phi: &[f64],
    cell_vertex: &[usize],
    vertices: Vec<Vector3<f64>>,
) -> Mesh {
    let mut out = Mesh {
        triangles: vec![],
        vertices,
    };
    for axis in Axis::iter() {
        add_quads_along(grid, phi, cell_vertex, axis, &mut out);
    }
    out
}

fn add_quads_along(
    grid: &Grid,
    phi: &[f64],
    cell_vertex: &[usize],
    t: Axis,
    out: &mut Mesh,
) {
    let u = t.next();
    let v = u.next();
    let (t, u, v) = (t.index(), u.index(), v.index());
    for start in 0..grid.node_count() {
        let a = grid.node_ijk(start);
        if a[t] + 1 >= grid.nodes_along(t) {
            continue;
        }
        let mut b = a.clone();
        b[t] += 1;
        let inside_a = phi[start] > 0.0;
        let inside_b = phi[grid.node_index(&b)] > 0.0;
        if inside_a == inside_b {
            continue;
        }
        if a[u] == 0 || a[v] == 0 {
            // Unreachable when padding nodes are exterior
            debug_assert!(false, "sign change on the grid boundary");
            continue;
        }

        // Cells around the edge, counter-clockwise about +t
        let mut quad = [0; 4];
        let offsets = [(1, 1), (0, 1), (0, 0), (1, 0)];
        for (q, (du, dv)) in quad.iter_mut().zip(offsets) {
            let mut cell = a.clone();
            cell[u] -= du;
            cell[v] -= dv;
            *q = cell_vertex[grid.cell_index(&cell)];
        }
        if quad.contains(&usize::MAX) {
            debug_assert!(false, "missing boundary vertex");
            continue;
        }
        if !inside_a {
            quad.reverse();
        }
        out.triangles.push(Vector3::new(quad[0], quad[1], quad[2]));
        out.triangles.push(Vector3::new(quad[0], quad[2], quad[3]));
    }
}
