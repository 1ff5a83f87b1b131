//! Shared reconstruction state and the reconstruction factory
use crate::{
    Error,
    config::{Config, Interpolation, ReconstructionKind, ThreadPool},
    dc::DualContouring,
    kdtree::KdTree,
};
use log::debug;

/// State shared by every reconstruction algorithm
///
/// This borrows the point buffer (and optional function buffer) for its
/// lifetime, owns a [`KdTree`] built over the points, and resolves the
/// bounding box and interpolation policy.
///
/// The lifecycle is [`load_points`](Self::load_points), then optionally
/// [`load_function`](Self::load_function), then
/// [`evaluate`](Self::evaluate).  Loading new points discards every later
/// stage.
pub struct Reconstruction<'a> {
    config: Config,
    dim: usize,
    points: Option<&'a [f64]>,
    function: Option<&'a [f64]>,
    tree: Option<KdTree<'a>>,
    bounds: Option<(Vec<f64>, Vec<f64>)>,
    threads: Option<&'a ThreadPool>,
}

impl<'a> Reconstruction<'a> {
    /// Builds a new (empty) reconstruction in the given dimension
    pub fn new(config: Config, dim: usize) -> Result<Self, Error> {
        if dim == 0 {
            return Err(Error::InvalidInput("dimension must be > 0".into()));
        }
        Ok(Self {
            config,
            dim,
            points: None,
            function: None,
            tree: None,
            bounds: None,
            threads: None,
        })
    }

    /// Loads a flat buffer of `dim`-tuples and builds the spatial index
    pub fn load_points(&mut self, points: &'a [f64]) -> Result<(), Error> {
        if points.is_empty() {
            return Err(Error::InvalidInput("point buffer is empty".into()));
        }
        if points.len() % self.dim != 0 {
            return Err(Error::InvalidInput(format!(
                "point buffer length {} is not a multiple of dimension {}",
                points.len(),
                self.dim
            )));
        }
        let tree = KdTree::new(points, self.dim)?;
        debug!(
            "built kd-tree over {} points (max depth {})",
            tree.len(),
            tree.max_depth()
        );
        self.points = Some(points);
        self.tree = Some(tree);
        self.function = None;
        self.bounds = None;
        Ok(())
    }

    /// Loads one function value per point
    pub fn load_function(&mut self, values: &'a [f64]) -> Result<(), Error> {
        let n = self.n_points();
        if self.points.is_none() {
            return Err(Error::NotReady("points must be loaded first"));
        }
        if values.len() != n {
            return Err(Error::InvalidInput(format!(
                "function has {} values, expected one per point ({n})",
                values.len()
            )));
        }
        self.function = Some(values);
        self.bounds = None;
        Ok(())
    }

    /// Resolves the interpolation policy and computes the bounding box
    pub fn evaluate(&mut self) -> Result<(), Error> {
        let tree = self
            .tree
            .as_ref()
            .ok_or(Error::NotReady("points must be loaded first"))?;
        if self.config.interpolation() == Interpolation::FromVector
            && self.function.is_none()
        {
            return Err(Error::Configuration(
                "from_vector interpolation requires a loaded function".into(),
            ));
        }
        let lower: Vec<f64> =
            (0..self.dim).map(|d| tree.min_along(d)).collect();
        let upper: Vec<f64> =
            (0..self.dim).map(|d| tree.max_along(d)).collect();
        debug!("bounding box is {lower:?} to {upper:?}");
        self.bounds = Some((lower, upper));
        Ok(())
    }

    /// Checks whether [`evaluate`](Self::evaluate) has succeeded
    pub fn is_evaluated(&self) -> bool {
        self.bounds.is_some()
    }

    /// Returns the value of the implicit function at the given point
    pub fn function_value(&self, i: usize) -> Result<f64, Error> {
        if self.points.is_none() {
            return Err(Error::NotReady("points must be loaded first"));
        }
        let len = self.n_points();
        if i >= len {
            return Err(Error::IndexOutOfRange { index: i, len });
        }
        match (self.config.interpolation(), self.function) {
            (Interpolation::Constant(v), _) => Ok(v),
            (Interpolation::FromVector, Some(f)) => Ok(f[i]),
            (Interpolation::FromVector, None) => {
                Err(Error::NotReady("function must be loaded first"))
            }
        }
    }

    /// Unchecked version of [`function_value`](Self::function_value)
    ///
    /// Under the `from_vector` policy, points read as zero until a function
    /// is loaded; [`evaluate`](Self::evaluate) refuses to run without one.
    ///
    /// # Panics
    /// If `i` is out of range
    pub(crate) fn value(&self, i: usize) -> f64 {
        match self.config.interpolation() {
            Interpolation::Constant(v) => v,
            Interpolation::FromVector => {
                self.function.map(|f| f[i]).unwrap_or(0.0)
            }
        }
    }

    /// Returns the lower corner of the bounding box
    pub fn lower_bounds(&self) -> Result<&[f64], Error> {
        self.bounds
            .as_ref()
            .map(|(lo, _)| lo.as_slice())
            .ok_or(Error::NotReady("bounds are not computed until evaluate"))
    }

    /// Returns the upper corner of the bounding box
    pub fn upper_bounds(&self) -> Result<&[f64], Error> {
        self.bounds
            .as_ref()
            .map(|(_, hi)| hi.as_slice())
            .ok_or(Error::NotReady("bounds are not computed until evaluate"))
    }

    /// Returns the loaded point buffer
    pub fn points(&self) -> Result<&'a [f64], Error> {
        self.points
            .ok_or(Error::NotReady("points must be loaded first"))
    }

    /// Returns the loaded function buffer, if any
    pub fn function(&self) -> Option<&'a [f64]> {
        self.function
    }

    /// Returns the spatial index
    pub fn tree(&self) -> Result<&KdTree<'a>, Error> {
        self.tree
            .as_ref()
            .ok_or(Error::NotReady("points must be loaded first"))
    }

    /// Returns the number of loaded points (0 if none are loaded)
    pub fn n_points(&self) -> usize {
        self.points.map(|p| p.len() / self.dim).unwrap_or(0)
    }

    /// Returns the spatial dimension
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Returns the active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Sets the thread pool used by parallel stages
    ///
    /// If this is `None` (the default), every stage runs on the calling
    /// thread.
    pub fn set_threads(&mut self, threads: Option<&'a ThreadPool>) {
        self.threads = threads;
    }

    /// Returns the thread pool used by parallel stages
    pub fn threads(&self) -> Option<&'a ThreadPool> {
        self.threads
    }
}

////////////////////////////////////////////////////////////////////////////////

/// A reconstruction algorithm, selected by [`ReconstructionKind`]
pub enum Reconstructor<'a> {
    /// Dual contouring on a padded background grid
    DualContouring(DualContouring<'a>),
}

impl<'a> Reconstructor<'a> {
    /// Builds a reconstruction of the kind named in the configuration
    pub fn create(config: Config, dim: usize) -> Result<Self, Error> {
        match config.kind() {
            ReconstructionKind::DualContouring => {
                Ok(Self::DualContouring(DualContouring::new(config, dim)?))
            }
        }
    }

    /// Returns the shared reconstruction state
    pub fn base(&self) -> &Reconstruction<'a> {
        match self {
            Self::DualContouring(dc) => dc.base(),
        }
    }

    /// Loads a flat buffer of points
    pub fn load_points(&mut self, points: &'a [f64]) -> Result<(), Error> {
        match self {
            Self::DualContouring(dc) => dc.load_points(points),
        }
    }

    /// Loads one function value per point
    pub fn load_function(&mut self, values: &'a [f64]) -> Result<(), Error> {
        match self {
            Self::DualContouring(dc) => dc.load_function(values),
        }
    }

    /// Sets the thread pool used by parallel stages
    pub fn set_threads(&mut self, threads: Option<&'a ThreadPool>) {
        match self {
            Self::DualContouring(dc) => dc.set_threads(threads),
        }
    }

    /// Runs the full reconstruction
    pub fn evaluate(&mut self) -> Result<(), Error> {
        match self {
            Self::DualContouring(dc) => dc.evaluate(),
        }
    }

    /// Returns the implicit function value at the given point
    pub fn function_value(&self, i: usize) -> Result<f64, Error> {
        self.base().function_value(i)
    }

    /// Returns the lower corner of the bounding box
    pub fn lower_bounds(&self) -> Result<&[f64], Error> {
        self.base().lower_bounds()
    }

    /// Returns the upper corner of the bounding box
    pub fn upper_bounds(&self) -> Result<&[f64], Error> {
        self.base().upper_bounds()
    }

    /// Integrates per-point values over the reconstructed volume
    pub fn perform_volume_integration(
        &self,
        values: &[f64],
        width: usize,
    ) -> Result<Vec<f64>, Error> {
        match self {
            Self::DualContouring(dc) => {
                dc.perform_volume_integration(values, width)
            }
        }
    }

    /// Integrates per-point values times relative position over the volume
    pub fn perform_relative_position_volume_integration(
        &self,
        values: &[f64],
        width: usize,
        origin: &[f64],
    ) -> Result<Vec<f64>, Error> {
        match self {
            Self::DualContouring(dc) => dc
                .perform_relative_position_volume_integration(
                    values, width, origin,
                ),
        }
    }

    /// Integrates per-point values over the reconstructed surface
    pub fn perform_surface_integration(
        &self,
        values: &[f64],
        width: usize,
        subset: Option<&[usize]>,
    ) -> Result<Vec<f64>, Error> {
        match self {
            Self::DualContouring(dc) => {
                dc.perform_surface_integration(values, width, subset)
            }
        }
    }

    /// Integrates per-point values times position over the surface
    pub fn perform_position_weighted_surface_integration(
        &self,
        values: &[f64],
        width: usize,
        subset: Option<&[usize]>,
    ) -> Result<Vec<f64>, Error> {
        match self {
            Self::DualContouring(dc) => dc
                .perform_position_weighted_surface_integration(
                    values, width, subset,
                ),
        }
    }

    /// Integrates the flux of per-point tensors through the surface
    pub fn perform_surface_flux_integration(
        &self,
        values: &[f64],
        width: usize,
        subset: Option<&[usize]>,
    ) -> Result<Vec<f64>, Error> {
        match self {
            Self::DualContouring(dc) => {
                dc.perform_surface_flux_integration(values, width, subset)
            }
        }
    }

    /// Integrates flux times relative position through the surface
    pub fn perform_relative_position_surface_flux_integration(
        &self,
        values: &[f64],
        width: usize,
        origin: &[f64],
        subset: Option<&[usize]>,
    ) -> Result<Vec<f64>, Error> {
        match self {
            Self::DualContouring(dc) => dc
                .perform_relative_position_surface_flux_integration(
                    values, width, origin, subset,
                ),
        }
    }

    /// Partitions the surface points into subdomains
    pub fn get_surface_subdomains(
        &self,
        target_spacing: f64,
    ) -> Result<(Vec<usize>, Vec<usize>), Error> {
        match self {
            Self::DualContouring(dc) => {
                dc.get_surface_subdomains(target_spacing)
            }
        }
    }
}
