//! Padded background grid
use crate::Error;

/// Axis-aligned background grid with one padding node on each side
///
/// Along each axis, there are `count + 1` evenly spaced interior nodes spanning
/// the bounding box, plus a padding node on each end, for `count + 3` nodes
/// and `count + 2` cells.  Cells and nodes are addressed by multi-index and
/// linearized row-major (the first axis varies slowest).
#[derive(Clone, Debug)]
pub struct Grid {
    axes: Vec<Vec<f64>>,
}

impl Grid {
    /// Builds a grid over the box `[lower, upper]`
    ///
    /// Padding nodes are pushed outwards by `relative_delta * delta +
    /// absolute_tolerance`, where `delta` is the interior node spacing.
    pub fn new(
        lower: &[f64],
        upper: &[f64],
        counts: &[usize],
        relative_delta: f64,
        absolute_tolerance: f64,
    ) -> Result<Self, Error> {
        if lower.len() != counts.len() || upper.len() != counts.len() {
            return Err(Error::InvalidInput(format!(
                "grid bounds have dimension {} / {}, expected {}",
                lower.len(),
                upper.len(),
                counts.len()
            )));
        }
        let mut axes = Vec::with_capacity(counts.len());
        for ((&lo, &hi), &n) in lower.iter().zip(upper).zip(counts) {
            if n == 0 {
                return Err(Error::Configuration(
                    "discretization count must be positive".into(),
                ));
            }
            if !(lo <= hi) {
                return Err(Error::InvalidInput(format!(
                    "invalid grid bounds [{lo}, {hi}]"
                )));
            }
            let delta = (hi - lo) / n as f64;
            let pad = relative_delta * delta + absolute_tolerance;
            let mut axis = Vec::with_capacity(n + 3);
            axis.push(lo - pad);
            // The last interior node is exactly `hi`, so that every point is
            // within an interior cell
            axis.extend((0..n).map(|j| lo + j as f64 * delta));
            axis.push(hi);
            axis.push(hi + pad);
            axes.push(axis);
        }
        Ok(Self { axes })
    }

    /// Returns the spatial dimension
    pub fn dim(&self) -> usize {
        self.axes.len()
    }

    /// Returns node coordinates along the given axis
    pub fn axis(&self, d: usize) -> &[f64] {
        &self.axes[d]
    }

    /// Returns the number of interior cells along the given axis
    pub fn count(&self, d: usize) -> usize {
        self.axes[d].len() - 3
    }

    /// Returns the number of nodes along the given axis
    pub fn nodes_along(&self, d: usize) -> usize {
        self.axes[d].len()
    }

    /// Returns the number of cells along the given axis
    pub fn cells_along(&self, d: usize) -> usize {
        self.axes[d].len() - 1
    }

    /// Returns the total number of nodes
    pub fn node_count(&self) -> usize {
        self.axes.iter().map(|a| a.len()).product()
    }

    /// Returns the total number of cells
    pub fn cell_count(&self) -> usize {
        self.axes.iter().map(|a| a.len() - 1).product()
    }

    /// Linearizes a node multi-index
    pub fn node_index(&self, ijk: &[usize]) -> usize {
        debug_assert_eq!(ijk.len(), self.dim());
        ijk.iter()
            .zip(&self.axes)
            .fold(0, |acc, (i, a)| acc * a.len() + i)
    }

    /// Linearizes a cell multi-index
    pub fn cell_index(&self, ijk: &[usize]) -> usize {
        debug_assert_eq!(ijk.len(), self.dim());
        ijk.iter()
            .zip(&self.axes)
            .fold(0, |acc, (i, a)| acc * (a.len() - 1) + i)
    }

    /// Converts a linear node index back into a multi-index
    pub fn node_ijk(&self, mut index: usize) -> Vec<usize> {
        let mut out = vec![0; self.dim()];
        for d in (0..self.dim()).rev() {
            let n = self.nodes_along(d);
            out[d] = index % n;
            index /= n;
        }
        out
    }

    /// Converts a linear cell index back into a multi-index
    pub fn cell_ijk(&self, mut index: usize) -> Vec<usize> {
        let mut out = vec![0; self.dim()];
        for d in (0..self.dim()).rev() {
            let n = self.cells_along(d);
            out[d] = index % n;
            index /= n;
        }
        out
    }

    /// Returns the position of a node
    pub fn node_position(&self, ijk: &[usize]) -> Vec<f64> {
        ijk.iter().zip(&self.axes).map(|(i, a)| a[*i]).collect()
    }

    /// Returns the lower and upper corners of a cell
    pub fn cell_bounds(&self, ijk: &[usize]) -> (Vec<f64>, Vec<f64>) {
        let lo = ijk.iter().zip(&self.axes).map(|(i, a)| a[*i]).collect();
        let hi =
            ijk.iter().zip(&self.axes).map(|(i, a)| a[*i + 1]).collect();
        (lo, hi)
    }

    /// Checks whether a cell lies within the bounding box of the points
    pub fn is_interior_cell(&self, ijk: &[usize]) -> bool {
        ijk.iter()
            .enumerate()
            .all(|(d, i)| *i >= 1 && *i <= self.count(d))
    }

    /// Checks whether a node is on the padding layer
    pub fn is_padding_node(&self, ijk: &[usize]) -> bool {
        ijk.iter()
            .enumerate()
            .any(|(d, i)| *i == 0 || *i == self.nodes_along(d) - 1)
    }

    /// Iterates over the multi-indices of interior cells
    pub fn interior_cells(&self) -> impl Iterator<Item = Vec<usize>> + '_ {
        let total: usize = (0..self.dim()).map(|d| self.count(d)).product();
        (0..total).map(move |mut index| {
            let mut out = vec![0; self.dim()];
            for d in (0..self.dim()).rev() {
                let n = self.count(d);
                out[d] = index % n + 1;
                index /= n;
            }
            out
        })
    }

    /// Returns the center of the grid's interior region
    pub fn center(&self) -> Vec<f64> {
        self.axes
            .iter()
            .map(|a| (a[1] + a[a.len() - 2]) / 2.0)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn padding() {
        let lower = [0.0, -1.0, 2.0];
        let upper = [1.0, 1.0, 2.5];
        let g = Grid::new(&lower, &upper, &[2, 4, 1], 0.5, 1e-9).unwrap();
        assert_eq!(g.dim(), 3);
        assert_eq!(g.axis(0).len(), 5);
        assert_eq!(g.axis(1).len(), 7);
        assert_eq!(g.axis(2).len(), 4);
        assert_eq!(g.node_count(), 5 * 7 * 4);
        assert_eq!(g.cell_count(), 4 * 6 * 3);

        let x = g.axis(0);
        assert_eq!(x[1], 0.0);
        assert_eq!(x[2], 0.5);
        assert_eq!(x[3], 1.0);
        approx::assert_relative_eq!(x[0], -0.25 - 1e-9, epsilon = 1e-12);
        approx::assert_relative_eq!(x[4], 1.25 + 1e-9, epsilon = 1e-12);
        for a in 0..3 {
            let v = g.axis(a);
            assert!(v.windows(2).all(|w| w[0] < w[1]), "axis {a} unsorted");
        }
    }

    #[test]
    fn degenerate_axis() {
        // A flat point cloud still gets padding nodes on either side
        let g = Grid::new(&[0.0], &[0.0], &[1], 1e-3, 1e-9).unwrap();
        assert_eq!(g.axis(0), &[-1e-9, 0.0, 0.0, 1e-9]);
    }

    #[test]
    fn indexing() {
        let g = Grid::new(&[0.0; 3], &[1.0; 3], &[2, 3, 4], 0.0, 1e-9)
            .unwrap();
        for i in 0..g.cell_count() {
            let ijk = g.cell_ijk(i);
            assert_eq!(g.cell_index(&ijk), i);
        }
        for i in 0..g.node_count() {
            let ijk = g.node_ijk(i);
            assert_eq!(g.node_index(&ijk), i);
        }
        assert_eq!(g.node_index(&[1, 0, 0]), 6 * 7);
        assert_eq!(g.cell_index(&[0, 1, 0]), 6);

        let interior: Vec<Vec<usize>> = g.interior_cells().collect();
        assert_eq!(interior.len(), 2 * 3 * 4);
        assert!(interior.iter().all(|c| g.is_interior_cell(c)));
        assert!(!g.is_interior_cell(&[0, 1, 1]));
        assert!(!g.is_interior_cell(&[3, 1, 1]));
        assert!(g.is_padding_node(&[4, 1, 1]));
        assert!(!g.is_padding_node(&[3, 4, 5]));
    }
}
