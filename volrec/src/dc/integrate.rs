//! Volume and surface integration over the reconstructed body
//!
//! Integrands are defined by per-point values.  The value at any location is
//! the value of the nearest input point, so each quadrature sample only needs
//! to know which point it is closest to; that's computed once after the
//! surface is built and reused by every integral.
use super::{DualContouring, grid::Grid, mesh::Mesh};
use crate::{
    Error, config::ThreadPool, kdtree::KdTree,
    reconstruction::Reconstruction,
};
use log::debug;
use nalgebra::Vector3;
use rayon::prelude::*;

/// Quadrature sample on a surface triangle
#[derive(Copy, Clone, Debug)]
struct SurfaceSample {
    area: f64,
    /// Unit outward normal
    normal: Vector3<f64>,
    centroid: Vector3<f64>,
    nearest: usize,
}

impl SurfaceSample {
    /// Returns `n_i f_ij` for a row-major `3 × m` tensor
    fn flux(&self, f: &[f64], m: usize, j: usize) -> f64 {
        (0..3).map(|i| self.normal[i] * f[i * m + j]).sum()
    }
}

/// Quadrature sample on a tetrahedron of the volume
#[derive(Copy, Clone, Debug)]
struct VolumeSample {
    /// Signed volume
    volume: f64,
    centroid: Vector3<f64>,
    nearest: usize,
}

/// Cached single-point quadrature for the reconstructed body
///
/// The volume is decomposed into a fan of tetrahedra, connecting the center
/// of the grid to each surface triangle.  For a closed surface, signed
/// volumes of the tetrahedra sum to the enclosed volume, no matter where the
/// fan's apex lies.
#[derive(Clone, Debug, Default)]
pub(super) struct Quadrature {
    surface: Vec<SurfaceSample>,
    volume: Vec<VolumeSample>,
}

impl Quadrature {
    pub fn new(
        base: &Reconstruction,
        grid: &Grid,
        mesh: &Mesh,
    ) -> Result<Self, Error> {
        let tree = base.tree()?;
        let apex = Vector3::from_column_slice(&grid.center());
        let sample = |i: usize| sample_triangle(tree, mesh, &apex, i);
        let n = mesh.triangles.len();
        let (surface, volume) =
            par_map(base.threads(), n, sample).into_iter().unzip();
        debug!("built quadrature over {n} triangles");
        Ok(Self { surface, volume })
    }
}

fn sample_triangle(
    tree: &KdTree,
    mesh: &Mesh,
    apex: &Vector3<f64>,
    i: usize,
) -> (SurfaceSample, VolumeSample) {
    // The tree is never empty once a reconstruction has been evaluated
    let nearest = |p: &Vector3<f64>| {
        tree.nearest(p.as_slice()).map_or(0, |(i, _)| i)
    };
    let [a, b, c] = mesh.triangle(i);
    let n = (b - a).cross(&(c - a));
    let len = n.norm();
    let centroid = (a + b + c) / 3.0;
    let surface = SurfaceSample {
        area: len / 2.0,
        normal: if len > 0.0 { n / len } else { Vector3::zeros() },
        centroid,
        nearest: nearest(&centroid),
    };

    let (a, b, c) = (a - apex, b - apex, c - apex);
    let centroid = apex + (a + b + c) / 4.0;
    let volume = VolumeSample {
        volume: a.dot(&b.cross(&c)) / 6.0,
        centroid,
        nearest: nearest(&centroid),
    };
    (surface, volume)
}

/// Maps over `0..n`, in parallel if a thread pool is provided
fn par_map<T: Send, F>(threads: Option<&ThreadPool>, n: usize, f: F) -> Vec<T>
where
    F: Fn(usize) -> T + Sync + Send,
{
    match threads {
        None => (0..n).map(f).collect(),
        Some(pool) => pool.run(|| (0..n).into_par_iter().map(f).collect()),
    }
}

/// Checks that `values` has `width` entries per point
fn check_values(values: &[f64], width: usize, n: usize) -> Result<(), Error> {
    if width == 0 {
        return Err(Error::InvalidInput("value width must be positive".into()));
    }
    if values.len() != n * width {
        return Err(Error::InvalidInput(format!(
            "expected {} values ({n} points with width {width}), got {}",
            n * width,
            values.len()
        )));
    }
    Ok(())
}

fn check_origin(origin: &[f64]) -> Result<Vector3<f64>, Error> {
    if origin.len() != 3 {
        return Err(Error::InvalidInput(format!(
            "origin must have 3 coordinates, got {}",
            origin.len()
        )));
    }
    Ok(Vector3::from_column_slice(origin))
}

/// Flux tensors are stored as `3 × m` blocks, returning `m`
fn flux_columns(width: usize) -> Result<usize, Error> {
    if width % 3 != 0 {
        return Err(Error::InvalidInput(format!(
            "flux width {width} is not a multiple of 3"
        )));
    }
    Ok(width / 3)
}

/// Builds a per-point mask from an optional list of point indices
fn subset_mask(
    subset: Option<&[usize]>,
    n: usize,
) -> Result<Option<Vec<bool>>, Error> {
    let Some(subset) = subset else {
        return Ok(None);
    };
    let mut mask = vec![false; n];
    for &i in subset {
        *mask.get_mut(i).ok_or(Error::IndexOutOfRange { index: i, len: n })? =
            true;
    }
    Ok(Some(mask))
}

impl DualContouring<'_> {
    /// Returns surface samples, filtered by an optional point subset
    fn surface_samples(
        &self,
        subset: Option<&[usize]>,
    ) -> Result<impl Iterator<Item = &SurfaceSample>, Error> {
        let q = &self.state()?.quadrature;
        let mask = subset_mask(subset, self.base.n_points())?;
        Ok(q.surface
            .iter()
            .filter(move |s| mask.as_ref().is_none_or(|m| m[s.nearest])))
    }

    fn volume_samples(&self) -> Result<&[VolumeSample], Error> {
        Ok(&self.state()?.quadrature.volume)
    }

    /// Integrates per-point values over the reconstructed volume
    ///
    /// `values` holds `width` entries per point; the result has `width`
    /// entries.
    pub fn perform_volume_integration(
        &self,
        values: &[f64],
        width: usize,
    ) -> Result<Vec<f64>, Error> {
        let samples = self.volume_samples()?;
        check_values(values, width, self.base.n_points())?;
        let mut out = vec![0.0; width];
        for s in samples {
            let f = &values[s.nearest * width..][..width];
            for (o, v) in out.iter_mut().zip(f) {
                *o += s.volume * v;
            }
        }
        Ok(out)
    }

    /// Integrates `f_j (x - origin)_k` over the reconstructed volume
    ///
    /// The result has `3 * width` entries, stored at index `j * 3 + k`.
    pub fn perform_relative_position_volume_integration(
        &self,
        values: &[f64],
        width: usize,
        origin: &[f64],
    ) -> Result<Vec<f64>, Error> {
        let samples = self.volume_samples()?;
        check_values(values, width, self.base.n_points())?;
        let origin = check_origin(origin)?;
        let mut out = vec![0.0; 3 * width];
        for s in samples {
            let f = &values[s.nearest * width..][..width];
            let r = s.centroid - origin;
            for (j, v) in f.iter().enumerate() {
                for k in 0..3 {
                    out[j * 3 + k] += s.volume * v * r[k];
                }
            }
        }
        Ok(out)
    }

    /// Integrates per-point values over the reconstructed surface
    ///
    /// If `subset` is provided, only surface regions closest to one of the
    /// listed points contribute.
    pub fn perform_surface_integration(
        &self,
        values: &[f64],
        width: usize,
        subset: Option<&[usize]>,
    ) -> Result<Vec<f64>, Error> {
        let samples = self.surface_samples(subset)?;
        check_values(values, width, self.base.n_points())?;
        let mut out = vec![0.0; width];
        for s in samples {
            let f = &values[s.nearest * width..][..width];
            for (o, v) in out.iter_mut().zip(f) {
                *o += s.area * v;
            }
        }
        Ok(out)
    }

    /// Integrates `f_j x_k` over the reconstructed surface
    ///
    /// The result has `3 * width` entries, stored at index `j * 3 + k`.
    pub fn perform_position_weighted_surface_integration(
        &self,
        values: &[f64],
        width: usize,
        subset: Option<&[usize]>,
    ) -> Result<Vec<f64>, Error> {
        let samples = self.surface_samples(subset)?;
        check_values(values, width, self.base.n_points())?;
        let mut out = vec![0.0; 3 * width];
        for s in samples {
            let f = &values[s.nearest * width..][..width];
            for (j, v) in f.iter().enumerate() {
                for k in 0..3 {
                    out[j * 3 + k] += s.area * v * s.centroid[k];
                }
            }
        }
        Ok(out)
    }

    /// Integrates the flux `n_i f_ij` through the reconstructed surface
    ///
    /// Each point's values form a `3 × m` tensor stored row-major (so `width`
    /// must be a multiple of 3); the result has `m` entries.
    pub fn perform_surface_flux_integration(
        &self,
        values: &[f64],
        width: usize,
        subset: Option<&[usize]>,
    ) -> Result<Vec<f64>, Error> {
        let samples = self.surface_samples(subset)?;
        check_values(values, width, self.base.n_points())?;
        let m = flux_columns(width)?;
        let mut out = vec![0.0; m];
        for s in samples {
            let f = &values[s.nearest * width..][..width];
            for (j, o) in out.iter_mut().enumerate() {
                let flux = s.flux(f, m, j);
                *o += s.area * flux;
            }
        }
        Ok(out)
    }

    /// Integrates `n_i f_ij (x - origin)_k` through the reconstructed surface
    ///
    /// Values are laid out as in
    /// [`perform_surface_flux_integration`](Self::perform_surface_flux_integration);
    /// the result has `3 * m` entries, stored at index `j * 3 + k`.
    pub fn perform_relative_position_surface_flux_integration(
        &self,
        values: &[f64],
        width: usize,
        origin: &[f64],
        subset: Option<&[usize]>,
    ) -> Result<Vec<f64>, Error> {
        let samples = self.surface_samples(subset)?;
        check_values(values, width, self.base.n_points())?;
        let m = flux_columns(width)?;
        let origin = check_origin(origin)?;
        let mut out = vec![0.0; 3 * m];
        for s in samples {
            let f = &values[s.nearest * width..][..width];
            let r = s.centroid - origin;
            for j in 0..m {
                let flux = s.flux(f, m, j);
                for k in 0..3 {
                    out[j * 3 + k] += s.area * flux * r[k];
                }
            }
        }
        Ok(out)
    }

    /// Partitions surface points into compact subdomains
    ///
    /// Surface points are the input points nearest to the reconstructed
    /// surface.  Seeds are picked greedily, so that no two seeds are within
    /// `target_spacing` of each other, then every surface point joins the
    /// subdomain of its nearest seed.
    ///
    /// Returns the size of each subdomain and the concatenated point indices
    /// of every subdomain (each in ascending order).
    pub fn get_surface_subdomains(
        &self,
        target_spacing: f64,
    ) -> Result<(Vec<usize>, Vec<usize>), Error> {
        let q = &self.state()?.quadrature;
        if !(target_spacing.is_finite() && target_spacing > 0.0) {
            return Err(Error::InvalidInput(format!(
                "target spacing must be positive, got {target_spacing}"
            )));
        }
        let tree = self.base.tree()?;

        let mut surface: Vec<usize> =
            q.surface.iter().map(|s| s.nearest).collect();
        surface.sort_unstable();
        surface.dedup();

        let mut is_seed = vec![false; tree.len()];
        let mut seeds = vec![];
        for &p in &surface {
            let near = tree.within_radius(tree.point(p), target_spacing);
            if near.iter().all(|i| !is_seed[*i]) {
                is_seed[p] = true;
                seeds.push(p);
            }
        }
        if seeds.is_empty() {
            return Ok((vec![], vec![]));
        }

        let coords: Vec<f64> =
            seeds.iter().flat_map(|s| tree.point(*s)).copied().collect();
        let seed_tree = KdTree::new(&coords, tree.dim())?;
        let mut groups = vec![vec![]; seeds.len()];
        for &p in &surface {
            if let Some((s, _)) = seed_tree.nearest(tree.point(p)) {
                groups[s].push(p);
            }
        }
        debug!(
            "split {} surface points into {} subdomains",
            surface.len(),
            seeds.len()
        );
        let sizes = groups.iter().map(|g| g.len()).collect();
        Ok((sizes, groups.concat()))
    }
}
