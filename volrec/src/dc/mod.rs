//! Dual contouring reconstruction
//!
//! The pipeline runs in fixed stages, each gated on the one before it:
//!
//! - Build a padded background [`Grid`] over the point cloud's bounding box
//! - Rasterize per-point values onto the grid nodes
//! - Classify every cell as exterior, interior, or boundary ([`CellKind`])
//! - Place one vertex in each boundary cell by solving a box-constrained
//!   least-squares problem against the cell's supporting planes
//! - Connect boundary vertices across sign-changing grid edges to build a
//!   closed surface [`Mesh`]
//!
//! The resulting surface is used for volume and surface integration of
//! per-point quantities.
use crate::{
    Error,
    config::{Config, DiscretizationCount, RawConfig, ThreadPool},
    error::ResultExt,
    reconstruction::Reconstruction,
    solver::{BoundaryVertexSolver, Plane, SolverSettings},
};
use log::{debug, warn};
use nalgebra::Vector3;
use rayon::prelude::*;

mod cell;
mod grid;
mod integrate;
mod mesh;
mod raster;
pub mod types;

pub use cell::CellKind;
pub use grid::Grid;
pub use mesh::Mesh;

use cell::Clipping;
use integrate::Quadrature;

/// Output of a successful reconstruction
struct Reconstructed {
    counts: Vec<usize>,
    grid: Grid,
    values: Vec<f64>,
    kinds: Vec<CellKind>,
    boundary_ids: Vec<usize>,
    /// Surface mesh, whose vertices are the boundary vertices (in the same
    /// order as `boundary_ids`)
    mesh: Mesh,
    quadrature: Quadrature,
}

/// Dual contouring reconstruction of a point cloud
pub struct DualContouring<'a> {
    base: Reconstruction<'a>,
    bounding_planes: Vec<Plane<3>>,
    state: Option<Reconstructed>,
}

impl<'a> DualContouring<'a> {
    /// Builds a new (empty) reconstruction in the given dimension
    pub fn new(config: Config, dim: usize) -> Result<Self, Error> {
        Ok(Self {
            base: Reconstruction::new(config, dim)?,
            bounding_planes: vec![],
            state: None,
        })
    }

    /// Returns the shared reconstruction state
    pub fn base(&self) -> &Reconstruction<'a> {
        &self.base
    }

    /// Loads a flat buffer of points, discarding any previous results
    pub fn load_points(&mut self, points: &'a [f64]) -> Result<(), Error> {
        self.state = None;
        self.base.load_points(points)
    }

    /// Loads one function value per point, discarding any previous results
    pub fn load_function(&mut self, values: &'a [f64]) -> Result<(), Error> {
        self.state = None;
        self.base.load_function(values)
    }

    /// Sets the thread pool used by parallel stages
    pub fn set_threads(&mut self, threads: Option<&'a ThreadPool>) {
        self.base.set_threads(threads)
    }

    /// Adds half-spaces that clip the reconstructed body
    ///
    /// `points` and `normals` are flat buffers of 3D vectors; each pair keeps
    /// the region `n · (x - p) <= 0`.  Previous results are discarded, so
    /// [`evaluate`](Self::evaluate) must be called again.
    pub fn add_bounding_planes(
        &mut self,
        points: &[f64],
        normals: &[f64],
    ) -> Result<(), Error> {
        if self.base.dim() != 3 {
            return Err(Error::InvalidInput(
                "bounding planes require 3D data".into(),
            ));
        }
        if points.len() != normals.len() || points.len() % 3 != 0 {
            return Err(Error::InvalidInput(format!(
                "mismatched bounding plane buffers ({} points, {} normals)",
                points.len(),
                normals.len()
            )));
        }
        let mut planes = Vec::with_capacity(points.len() / 3);
        for (p, n) in points.chunks_exact(3).zip(normals.chunks_exact(3)) {
            let normal = Vector3::from_column_slice(n);
            let norm = normal.norm();
            if !(norm.is_finite() && norm > 0.0) {
                return Err(Error::InvalidInput(format!(
                    "invalid bounding plane normal {n:?}"
                )));
            }
            planes.push(Plane {
                point: Vector3::from_column_slice(p),
                normal: normal / norm,
            });
        }
        self.bounding_planes.extend(planes);
        self.state = None;
        Ok(())
    }

    /// Runs the full reconstruction
    pub fn evaluate(&mut self) -> Result<(), Error> {
        self.state = None;
        self.base.evaluate()?;

        let cfg = self.base.config();
        let tol = cfg.absolute_tolerance();
        let threads = self.base.threads();
        let counts = cfg
            .resolve_discretization(self.base.dim(), self.base.n_points())?;
        let grid = Grid::new(
            self.base.lower_bounds()?,
            self.base.upper_bounds()?,
            &counts,
            cfg.exterior_relative_delta(),
            tol,
        )?;
        debug!("built {counts:?} background grid");

        let mut values = raster::rasterize(&self.base, &grid, tol, threads)
            .with_context(|| "while rasterizing the implicit function")?;

        // Padding nodes and clipped nodes are always exterior
        let clipping = Clipping::new(&grid, &self.bounding_planes, tol);
        let cutoff = cfg.isosurface_cutoff();
        let phi: Vec<f64> = values
            .iter_mut()
            .enumerate()
            .map(|(i, v)| {
                let clipped = clipping.is_clipped(i);
                if clipped {
                    *v = 0.0;
                }
                let phi = *v - cutoff;
                if clipped || grid.is_padding_node(&grid.node_ijk(i)) {
                    phi.min(0.0)
                } else {
                    phi
                }
            })
            .collect();

        let kinds = cell::classify(&grid, &phi);
        let boundary_ids: Vec<usize> = kinds
            .iter()
            .enumerate()
            .filter(|(_, k)| k.is_boundary())
            .map(|(i, _)| i)
            .collect();
        debug!(
            "classified {} cells ({} boundary)",
            kinds.len(),
            boundary_ids.len()
        );

        let vertices = self
            .boundary_vertices(&grid, &phi, &clipping, &boundary_ids)
            .with_context(|| "while computing boundary vertices")?;

        let mut cell_vertex = vec![usize::MAX; grid.cell_count()];
        for (v, c) in boundary_ids.iter().enumerate() {
            cell_vertex[*c] = v;
        }
        let mesh = mesh::extract(&grid, &phi, &cell_vertex, vertices);
        debug!("extracted surface with {} triangles", mesh.triangles.len());

        let quadrature = Quadrature::new(&self.base, &grid, &mesh)?;
        self.state = Some(Reconstructed {
            counts,
            grid,
            values,
            kinds,
            boundary_ids,
            mesh,
            quadrature,
        });
        Ok(())
    }

    /// Solves for one vertex per boundary cell
    fn boundary_vertices(
        &self,
        grid: &Grid,
        phi: &[f64],
        clipping: &Clipping,
        boundary_ids: &[usize],
    ) -> Result<Vec<Vector3<f64>>, Error> {
        let cfg = self.base.config();
        let settings = SolverSettings {
            tolerance: cfg.absolute_tolerance(),
            max_iterations: cfg.max_iterations(),
        };
        let fallback = cfg.centroid_fallback();

        let solve = |cell: &usize| -> Result<Vector3<f64>, Error> {
            let ijk = grid.cell_ijk(*cell);
            let ijk = [ijk[0], ijk[1], ijk[2]];
            let planes = cell::cell_planes(grid, phi, ijk, clipping);
            let solver = BoundaryVertexSolver::new(&planes)
                .with_context(|| format!("boundary cell {cell}"))?;
            let (lo, hi) = grid.cell_bounds(&ijk);
            let lb = Vector3::from_column_slice(&lo);
            let ub = Vector3::from_column_slice(&hi);
            match solver.solve(&lb, &ub, &settings) {
                Ok(v) => Ok(v.pos),
                Err(e @ Error::SolveFailure(..)) if fallback => {
                    warn!("boundary cell {cell}: {e}; using its mass point");
                    let m = solver.mass_point();
                    Ok(Vector3::from_fn(|i, _| m[i].clamp(lb[i], ub[i])))
                }
                Err(e) => {
                    Err(e).with_context(|| format!("boundary cell {cell}"))
                }
            }
        };

        match self.base.threads() {
            None => boundary_ids.iter().map(solve).collect(),
            Some(pool) => {
                pool.run(|| boundary_ids.par_iter().map(&solve).collect())
            }
        }
    }

    fn state(&self) -> Result<&Reconstructed, Error> {
        self.state
            .as_ref()
            .ok_or(Error::NotReady("reconstruction has not been evaluated"))
    }

    /// Returns the background grid
    pub fn grid(&self) -> Result<&Grid, Error> {
        Ok(&self.state()?.grid)
    }

    /// Returns the number of interior cells along each axis
    pub fn discretization(&self) -> Result<&[usize], Error> {
        Ok(&self.state()?.counts)
    }

    /// Returns rasterized values at each grid node
    pub fn node_values(&self) -> Result<&[f64], Error> {
        Ok(&self.state()?.values)
    }

    /// Returns the classification of every cell
    pub fn cell_kinds(&self) -> Result<&[CellKind], Error> {
        Ok(&self.state()?.kinds)
    }

    /// Returns the classification of a single cell
    pub fn cell_kind(&self, cell: usize) -> Result<CellKind, Error> {
        let kinds = self.cell_kinds()?;
        kinds.get(cell).copied().ok_or(Error::IndexOutOfRange {
            index: cell,
            len: kinds.len(),
        })
    }

    /// Returns the indices of boundary cells, in ascending order
    pub fn boundary_ids(&self) -> Result<&[usize], Error> {
        Ok(&self.state()?.boundary_ids)
    }

    /// Returns boundary vertices as a flat coordinate buffer
    ///
    /// Vertices are in the same order as [`boundary_ids`](Self::boundary_ids).
    pub fn boundary_points(&self) -> Result<Vec<f64>, Error> {
        Ok(self
            .state()?
            .mesh
            .vertices
            .iter()
            .flat_map(|v| v.iter().copied())
            .collect())
    }

    /// Returns the reconstructed surface
    pub fn surface(&self) -> Result<&Mesh, Error> {
        Ok(&self.state()?.mesh)
    }

    /// Exports the active configuration, with defaults filled in
    ///
    /// After a successful [`evaluate`](Self::evaluate), this includes the
    /// resolved discretization count.
    pub fn export_configuration(&self) -> RawConfig {
        let mut out = self.base.config().to_raw();
        if let Some(s) = &self.state {
            out.interpolation.discretization_count =
                Some(DiscretizationCount::PerAxis(s.counts.clone()));
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{RawInterpolation, ReconstructionKind};
    use rand::{Rng, SeedableRng, rngs::StdRng};

    const OUTER_RADIUS: f64 = 1.26;

    fn config(interpolation: RawInterpolation) -> Config {
        Config::from_raw(&RawConfig {
            kind: Some("dual_contouring".to_owned()),
            interpolation,
        })
        .unwrap()
    }

    fn from_vector(count: usize) -> Config {
        config(RawInterpolation {
            kind: Some("from_vector".to_owned()),
            discretization_count: Some(DiscretizationCount::Uniform(count)),
            ..Default::default()
        })
    }

    /// Returns 1000 points inside the unit sphere (with value 1) and 1000
    /// points in a shell of similar volume outside of it (with value 0)
    fn sphere_cloud(seed: u64) -> (Vec<f64>, Vec<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut points = vec![];
        let mut values = vec![];
        for (inside, lo, hi) in [(true, 0.0, 1.0), (false, 1.0, OUTER_RADIUS)] {
            let mut n = 0;
            while n < 1000 {
                let p: [f64; 3] = std::array::from_fn(|_| {
                    rng.gen_range(-OUTER_RADIUS..OUTER_RADIUS)
                });
                let r = p.iter().map(|v| v * v).sum::<f64>().sqrt();
                if r >= lo && r < hi {
                    points.extend(p);
                    values.push(if inside { 1.0 } else { 0.0 });
                    n += 1;
                }
            }
        }
        (points, values)
    }

    /// Returns an 11×11×11 lattice over the unit cube
    fn lattice() -> Vec<f64> {
        let mut out = vec![];
        for i in 0..=10 {
            for j in 0..=10 {
                for k in 0..=10 {
                    out.extend([i, j, k].map(|v| v as f64 * 0.1));
                }
            }
        }
        out
    }

    #[test]
    fn not_ready() {
        let mut dc = DualContouring::new(from_vector(4), 3).unwrap();
        assert!(matches!(dc.evaluate(), Err(Error::NotReady(..))));
        assert!(matches!(dc.grid(), Err(Error::NotReady(..))));
        assert!(matches!(dc.boundary_ids(), Err(Error::NotReady(..))));
        assert!(matches!(dc.surface(), Err(Error::NotReady(..))));
        assert!(matches!(
            dc.perform_volume_integration(&[], 1),
            Err(Error::NotReady(..))
        ));
        assert!(matches!(
            dc.get_surface_subdomains(0.1),
            Err(Error::NotReady(..))
        ));
    }

    #[test]
    fn unsupported_dimension() {
        let pts = [0.0, 0.0, 1.0, 1.0, 0.5, 0.25];
        let cfg = Config::new(ReconstructionKind::DualContouring);
        let mut dc = DualContouring::new(cfg, 2).unwrap();
        dc.load_points(&pts).unwrap();
        let err = dc.evaluate().unwrap_err();
        assert!(matches!(err.root(), Error::UnsupportedDimension(2)));
    }

    #[test]
    fn bad_discretization() {
        let pts = lattice();
        let cfg = config(RawInterpolation {
            discretization_count: Some(DiscretizationCount::PerAxis(vec![
                3, 4,
            ])),
            ..Default::default()
        });
        let mut dc = DualContouring::new(cfg, 3).unwrap();
        dc.load_points(&pts).unwrap();
        assert!(matches!(dc.evaluate(), Err(Error::Configuration(..))));
    }

    #[test]
    fn lattice_cube() {
        let pts = lattice();
        let cfg = config(RawInterpolation {
            discretization_count: Some(DiscretizationCount::Uniform(10)),
            ..Default::default()
        });
        let mut dc = DualContouring::new(cfg, 3).unwrap();
        dc.load_points(&pts).unwrap();
        dc.evaluate().unwrap();

        let grid = dc.grid().unwrap();
        let values = dc.node_values().unwrap();
        for i in 0..grid.node_count() {
            let ijk = grid.node_ijk(i);
            let expected = if grid.is_padding_node(&ijk) { 0.0 } else { 1.0 };
            assert_eq!(values[i], expected, "bad value at node {ijk:?}");
        }

        let volume = dc.perform_volume_integration(&[1.0; 1331], 1).unwrap();
        approx::assert_relative_eq!(volume[0], 1.0, epsilon = 5e-3);
        let area = dc.surface().unwrap().area();
        approx::assert_relative_eq!(area, 6.0, epsilon = 5e-3);
    }

    #[test]
    fn bounding_planes() {
        let pts = lattice();
        let cfg = config(RawInterpolation {
            discretization_count: Some(DiscretizationCount::Uniform(10)),
            ..Default::default()
        });
        let mut dc = DualContouring::new(cfg, 3).unwrap();
        dc.load_points(&pts).unwrap();
        assert!(matches!(
            dc.add_bounding_planes(&[0.0, 0.0, 0.55], &[0.0, 0.0]),
            Err(Error::InvalidInput(..))
        ));
        assert!(matches!(
            dc.add_bounding_planes(&[0.0, 0.0, 0.55], &[0.0, 0.0, 0.0]),
            Err(Error::InvalidInput(..))
        ));
        dc.add_bounding_planes(&[0.0, 0.0, 0.55], &[0.0, 0.0, 2.0])
            .unwrap();
        dc.evaluate().unwrap();

        let volume = dc.perform_volume_integration(&[1.0; 1331], 1).unwrap();
        approx::assert_relative_eq!(volume[0], 0.55, epsilon = 5e-3);

        let grid = dc.grid().unwrap();
        for (i, v) in dc.node_values().unwrap().iter().enumerate() {
            if grid.node_position(&grid.node_ijk(i))[2] > 0.56 {
                assert_eq!(*v, 0.0);
            }
        }
    }

    #[test]
    fn sphere() {
        let (pts, f) = sphere_cloud(12345);
        let mut dc = DualContouring::new(from_vector(10), 3).unwrap();
        dc.load_points(&pts).unwrap();
        dc.load_function(&f).unwrap();
        dc.evaluate().unwrap();

        // Every input point is strictly within the padded grid
        let grid = dc.grid().unwrap();
        for p in pts.chunks_exact(3) {
            for (d, v) in p.iter().enumerate() {
                let axis = grid.axis(d);
                assert!(axis[0] < *v && *v < axis[axis.len() - 1]);
            }
        }

        // Boundary cells should be concentrated around the unit sphere
        let ids = dc.boundary_ids().unwrap();
        assert!(!ids.is_empty());
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        let h = 2.0 * OUTER_RADIUS / 10.0;
        let near = ids
            .iter()
            .filter(|c| {
                let (lo, hi) = grid.cell_bounds(&grid.cell_ijk(**c));
                let r = (0..3)
                    .map(|d| ((lo[d] + hi[d]) / 2.0).powi(2))
                    .sum::<f64>()
                    .sqrt();
                (r - 1.0).abs() < 2.0 * h
            })
            .count();
        assert!(
            near as f64 > 0.8 * ids.len() as f64,
            "only {near} / {} boundary cells are near the sphere",
            ids.len()
        );

        // Every boundary vertex is within its cell, and no cell is both
        // boundary and exterior
        let points = dc.boundary_points().unwrap();
        assert_eq!(points.len(), ids.len() * 3);
        for (c, p) in ids.iter().zip(points.chunks_exact(3)) {
            assert!(dc.cell_kind(*c).unwrap().is_interior());
            let (lo, hi) = grid.cell_bounds(&grid.cell_ijk(*c));
            for d in 0..3 {
                assert!(p[d] >= lo[d] && p[d] <= hi[d]);
            }
        }
        assert!(matches!(
            dc.cell_kind(grid.cell_count()),
            Err(Error::IndexOutOfRange { .. })
        ));

        let ones = vec![1.0; 2000];
        let volume = dc.perform_volume_integration(&ones, 1).unwrap()[0];
        let expected = 4.0 / 3.0 * std::f64::consts::PI;
        assert!(
            (volume - expected).abs() < 0.1 * expected,
            "volume {volume} is too far from {expected}"
        );
        approx::assert_relative_eq!(
            volume,
            dc.surface().unwrap().signed_volume(),
            epsilon = 1e-9
        );
    }

    #[test]
    fn translated_sphere() {
        let (pts, f) = sphere_cloud(12345);
        let ones = vec![1.0; 2000];
        let volume = |pts: &[f64]| {
            let mut dc = DualContouring::new(from_vector(10), 3).unwrap();
            dc.load_points(pts).unwrap();
            dc.load_function(&f).unwrap();
            dc.evaluate().unwrap();
            dc.perform_volume_integration(&ones, 1).unwrap()[0]
        };
        let expected = volume(&pts);
        for shift in [1e3, 1e5] {
            let moved: Vec<f64> = pts.iter().map(|v| v + shift).collect();
            let v = volume(&moved);
            assert!(
                (v - expected).abs() < 1e-4 * expected,
                "volume {v} at shift {shift}, expected {expected}"
            );
        }
    }

    #[test]
    fn zero_cutoff() {
        let (pts, f) = sphere_cloud(12345);
        let cfg = config(RawInterpolation {
            kind: Some("from_vector".to_owned()),
            discretization_count: Some(DiscretizationCount::Uniform(10)),
            isosurface_cutoff: Some(0.0),
            ..Default::default()
        });
        let mut dc = DualContouring::new(cfg, 3).unwrap();
        dc.load_points(&pts).unwrap();
        dc.load_function(&f).unwrap();
        dc.evaluate().unwrap();
        assert!(!dc.boundary_ids().unwrap().is_empty());
    }

    #[test]
    fn single_point() {
        let pts = [0.5, 0.5, 0.5];
        let cfg = Config::new(ReconstructionKind::DualContouring);
        let mut dc = DualContouring::new(cfg, 3).unwrap();
        dc.load_points(&pts).unwrap();
        dc.evaluate().unwrap();
        assert_eq!(dc.discretization().unwrap(), [1; 3]);
        for v in dc.boundary_points().unwrap() {
            assert!((v - 0.5).abs() < 1e-6, "vertex coordinate {v}");
        }
    }

    #[test]
    fn parallel_matches_serial() {
        let (pts, f) = sphere_cloud(777);
        let pool = ThreadPool::Custom(
            rayon::ThreadPoolBuilder::new()
                .num_threads(4)
                .build()
                .unwrap(),
        );
        let mut serial = DualContouring::new(from_vector(8), 3).unwrap();
        serial.load_points(&pts).unwrap();
        serial.load_function(&f).unwrap();
        serial.evaluate().unwrap();

        let mut parallel = DualContouring::new(from_vector(8), 3).unwrap();
        parallel.load_points(&pts).unwrap();
        parallel.load_function(&f).unwrap();
        parallel.set_threads(Some(&pool));
        parallel.evaluate().unwrap();

        assert_eq!(
            serial.boundary_ids().unwrap(),
            parallel.boundary_ids().unwrap()
        );
        let ones = vec![1.0; 2000];
        approx::assert_relative_eq!(
            serial.perform_volume_integration(&ones, 1).unwrap()[0],
            parallel.perform_volume_integration(&ones, 1).unwrap()[0],
            epsilon = 1e-9
        );
    }

    #[test]
    fn solver_failure() {
        let (pts, f) = sphere_cloud(4);
        let strict = |fallback| {
            config(RawInterpolation {
                kind: Some("from_vector".to_owned()),
                discretization_count: Some(DiscretizationCount::Uniform(6)),
                absolute_tolerance: Some(1e-300),
                max_iterations: Some(1),
                centroid_fallback: Some(fallback),
                ..Default::default()
            })
        };

        let mut dc = DualContouring::new(strict(false), 3).unwrap();
        dc.load_points(&pts).unwrap();
        dc.load_function(&f).unwrap();
        let err = dc.evaluate().unwrap_err();
        assert!(matches!(err.root(), Error::SolveFailure(..)), "{err:?}");
        assert!(matches!(dc.surface(), Err(Error::NotReady(..))));

        let mut dc = DualContouring::new(strict(true), 3).unwrap();
        dc.load_points(&pts).unwrap();
        dc.load_function(&f).unwrap();
        dc.evaluate().unwrap();
        assert!(!dc.surface().unwrap().triangles.is_empty());
    }

    #[test]
    fn export() {
        let pts = lattice();
        let mut dc = DualContouring::new(
            Config::new(ReconstructionKind::DualContouring),
            3,
        )
        .unwrap();
        let raw = dc.export_configuration();
        assert_eq!(raw.interpolation.discretization_count, None);

        dc.load_points(&pts).unwrap();
        dc.evaluate().unwrap();
        let raw = dc.export_configuration();
        assert_eq!(
            raw.interpolation.discretization_count,
            Some(DiscretizationCount::PerAxis(vec![11; 3]))
        );
        assert_eq!(dc.discretization().unwrap(), [11; 3]);
        let cfg = Config::from_raw(&raw).unwrap();
        assert_eq!(cfg.kind(), dc.base().config().kind());
    }
}
