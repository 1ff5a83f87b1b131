//! Rasterization of per-point values onto the background grid
use super::{grid::Grid, types::Corner};
use crate::{
    Error, config::ThreadPool, kdtree::KdTree, reconstruction::Reconstruction,
};
use log::trace;
use rayon::prelude::*;

/// Running per-node sums and contribution counts
///
/// Each worker gets its own accumulator; they are merged at the end, so no
/// node is ever written from two threads.
struct Accumulator {
    sum: Vec<f64>,
    count: Vec<u32>,
    scratch: Vec<usize>,
}

impl Accumulator {
    fn new(nodes: usize) -> Self {
        Self {
            sum: vec![0.0; nodes],
            count: vec![0; nodes],
            scratch: vec![],
        }
    }

    fn merge(mut self, other: Self) -> Self {
        for (a, b) in self.sum.iter_mut().zip(other.sum) {
            *a += b;
        }
        for (a, b) in self.count.iter_mut().zip(other.count) {
            *a += b;
        }
        self
    }

    /// Adds every point within the given cell to its nearest corner(s)
    fn add_cell(
        &mut self,
        base: &Reconstruction,
        tree: &KdTree,
        grid: &Grid,
        cell: [usize; 3],
        tolerance: f64,
    ) {
        let (lo, hi) = grid.cell_bounds(&cell);
        self.scratch.clear();
        tree.range_query_into(&lo, &hi, &mut self.scratch);

        for &p in &self.scratch {
            let pos = tree.point(p);
            let mut dist = [0.0; 8];
            for c in Corner::iter() {
                let offset = c.offset();
                dist[c.index()] = (0..3)
                    .map(|d| {
                        (pos[d] - grid.axis(d)[cell[d] + offset[d]]).powi(2)
                    })
                    .sum::<f64>()
                    .sqrt();
            }
            let min = dist.iter().cloned().fold(f64::INFINITY, f64::min);
            let v = base.value(p);
            for c in Corner::iter() {
                if dist[c.index()] <= min + tolerance {
                    let offset = c.offset();
                    let node = grid.node_index(&[
                        cell[0] + offset[0],
                        cell[1] + offset[1],
                        cell[2] + offset[2],
                    ]);
                    self.sum[node] += v;
                    self.count[node] += 1;
                }
            }
        }
    }
}

/// Rasterizes the implicit function onto the nodes of the grid
///
/// Every point contributes its value to the nearest corner of each interior
/// cell containing it (or to every corner tied for nearest within
/// `tolerance`).  Node values are the mean of their contributions; nodes
/// without any contributions are left at zero.
pub fn rasterize(
    base: &Reconstruction,
    grid: &Grid,
    tolerance: f64,
    threads: Option<&ThreadPool>,
) -> Result<Vec<f64>, Error> {
    if grid.dim() != 3 {
        return Err(Error::UnsupportedDimension(grid.dim()));
    }
    let tree = base.tree()?;

    let cells: Vec<[usize; 3]> = grid
        .interior_cells()
        .map(|c| [c[0], c[1], c[2]])
        .collect();
    let nodes = grid.node_count();
    let acc = match threads {
        None => cells.iter().fold(Accumulator::new(nodes), |mut acc, c| {
            acc.add_cell(base, tree, grid, *c, tolerance);
            acc
        }),
        Some(pool) => pool.run(|| {
            cells
                .par_iter()
                .fold(
                    || Accumulator::new(nodes),
                    |mut acc, c| {
                        acc.add_cell(base, tree, grid, *c, tolerance);
                        acc
                    },
                )
                .reduce(|| Accumulator::new(nodes), Accumulator::merge)
        }),
    };

    let touched = acc.count.iter().filter(|c| **c > 0).count();
    trace!("rasterized onto {touched} / {nodes} nodes");
    Ok(acc
        .sum
        .into_iter()
        .zip(acc.count)
        .map(|(s, c)| if c > 0 { s / c as f64 } else { 0.0 })
        .collect())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{Config, ReconstructionKind};

    fn base<'a>(pts: &'a [f64], dim: usize) -> Reconstruction<'a> {
        let mut r = Reconstruction::new(
            Config::new(ReconstructionKind::DualContouring),
            dim,
        )
        .unwrap();
        r.load_points(pts).unwrap();
        r.evaluate().unwrap();
        r
    }

    #[test]
    fn single_point_on_node() {
        let pts = [0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let r = base(&pts, 3);
        let g = Grid::new(&[0.0; 3], &[1.0; 3], &[1; 3], 1e-3, 1e-9).unwrap();
        let values = rasterize(&r, &g, 1e-9, None).unwrap();
        assert_eq!(values.len(), 4 * 4 * 4);

        assert_eq!(values[g.node_index(&[1, 1, 1])], 1.0);
        assert_eq!(values[g.node_index(&[2, 2, 2])], 1.0);
        assert_eq!(values[g.node_index(&[1, 2, 1])], 0.0);
        assert_eq!(values[g.node_index(&[0, 0, 0])], 0.0);
        let nonzero = values.iter().filter(|v| **v != 0.0).count();
        assert_eq!(nonzero, 2);
    }

    #[test]
    fn averaging() {
        let pts = [
            0.1, 0.1, 0.1, //
            0.2, 0.0, 0.1, //
            0.9, 0.9, 0.8, //
            0.5, 0.5, 0.5, //
        ];
        let f = [1.0, 3.0, 5.0, 7.0];
        let mut raw = crate::config::RawConfig {
            kind: Some("dual_contouring".to_owned()),
            ..Default::default()
        };
        raw.interpolation.kind = Some("from_vector".to_owned());
        let mut r =
            Reconstruction::new(Config::from_raw(&raw).unwrap(), 3).unwrap();
        r.load_points(&pts).unwrap();
        r.load_function(&f).unwrap();
        r.evaluate().unwrap();

        let g = Grid::new(&[0.0; 3], &[1.0; 3], &[1; 3], 1e-3, 1e-9).unwrap();
        let values = rasterize(&r, &g, 1e-9, None).unwrap();

        // The center point is equidistant from every corner
        assert_eq!(values[g.node_index(&[1, 1, 1])], (1.0 + 3.0 + 7.0) / 3.0);
        assert_eq!(values[g.node_index(&[2, 2, 2])], (5.0 + 7.0) / 2.0);
        assert_eq!(values[g.node_index(&[2, 1, 2])], 7.0);
    }

    #[test]
    fn parallel_matches_serial() {
        use rand::{Rng, SeedableRng, rngs::StdRng};
        let mut rng = StdRng::seed_from_u64(5);
        let pts: Vec<f64> =
            (0..3000).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let r = base(&pts, 3);
        let g = Grid::new(
            r.lower_bounds().unwrap(),
            r.upper_bounds().unwrap(),
            &[6; 3],
            1e-3,
            1e-9,
        )
        .unwrap();
        let serial = rasterize(&r, &g, 1e-9, None).unwrap();
        let pool = ThreadPool::Custom(
            rayon::ThreadPoolBuilder::new()
                .num_threads(4)
                .build()
                .unwrap(),
        );
        let parallel = rasterize(&r, &g, 1e-9, Some(&pool)).unwrap();
        assert_eq!(serial.len(), parallel.len());
        for (a, b) in serial.iter().zip(&parallel) {
            approx::assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn only_3d() {
        let pts = [0.0, 0.0, 1.0, 1.0];
        let r = base(&pts, 2);
        let g = Grid::new(&[0.0; 2], &[1.0; 2], &[1; 2], 1e-3, 1e-9).unwrap();
        assert!(matches!(
            rasterize(&r, &g, 1e-9, None),
            Err(Error::UnsupportedDimension(2))
        ));
    }
}
