//! Reconstruction configuration
//!
//! Configuration arrives as a [`RawConfig`], which mirrors the key-value map
//! used by callers and may be deserialized from any `serde` format.  It is
//! validated once into an immutable [`Config`], with defaults resolved.
use crate::Error;
use serde::{Deserialize, Serialize};

/// Thread pool to use for parallel stages
pub enum ThreadPool {
    /// User-provided pool
    Custom(rayon::ThreadPool),
    /// Global Rayon pool
    Global,
}

impl ThreadPool {
    /// Runs a function across the thread pool
    pub fn run<F: FnOnce() -> V + Send, V: Send>(&self, f: F) -> V {
        match self {
            ThreadPool::Custom(p) => p.install(f),
            ThreadPool::Global => f(),
        }
    }

    /// Returns the number of threads in the pool
    pub fn thread_count(&self) -> usize {
        match self {
            ThreadPool::Custom(p) => p.current_num_threads(),
            ThreadPool::Global => rayon::current_num_threads(),
        }
    }
}

/// Available reconstruction algorithms
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    strum::EnumString,
    strum::Display,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum ReconstructionKind {
    /// Dual contouring on a padded background grid
    DualContouring,
}

/// Selector for the source of per-point function values
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    strum::EnumString,
    strum::Display,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum InterpolationKind {
    /// Every point has the same value
    Constant,
    /// Values are taken from the loaded function buffer
    FromVector,
}

/// Resolved interpolation policy
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Interpolation {
    /// Every point has the given value
    Constant(f64),
    /// Values are taken from the loaded function buffer
    FromVector,
}

impl Interpolation {
    /// Returns the selector for this policy
    pub fn kind(&self) -> InterpolationKind {
        match self {
            Interpolation::Constant(..) => InterpolationKind::Constant,
            Interpolation::FromVector => InterpolationKind::FromVector,
        }
    }
}

/// Number of background grid cells along each axis
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DiscretizationCount {
    /// The same count on every axis
    Uniform(usize),
    /// One count per axis
    PerAxis(Vec<usize>),
}

/// Raw configuration map, before validation
///
/// Every field is optional; missing fields are filled with defaults when
/// converting to a [`Config`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawConfig {
    /// Reconstruction algorithm, e.g. `"dual_contouring"`
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Interpolation settings
    #[serde(default)]
    pub interpolation: RawInterpolation,
}

/// The `interpolation` block of a [`RawConfig`]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawInterpolation {
    /// Either `"constant"` or `"from_vector"`
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Value used by the `constant` policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constant_value: Option<f64>,
    /// Cells per axis, either a single value or one per axis
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discretization_count: Option<DiscretizationCount>,
    /// Padding cell size, relative to the interior cell size
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exterior_relative_delta: Option<f64>,
    /// Grid values above this cutoff are inside
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isosurface_cutoff: Option<f64>,
    /// Absolute tolerance used for padding, tie-breaking, and convergence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub absolute_tolerance: Option<f64>,
    /// Iteration cap for the boundary vertex solver
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<usize>,
    /// Fall back to the mass point if the vertex solver fails
    #[serde(skip_serializing_if = "Option::is_none")]
    pub centroid_fallback: Option<bool>,
}

/// Default value for [`Interpolation::Constant`]
pub const DEFAULT_CONSTANT_VALUE: f64 = 1.0;
/// Default for [`Config::exterior_relative_delta`]
pub const DEFAULT_EXTERIOR_RELATIVE_DELTA: f64 = 1e-3;
/// Default for [`Config::isosurface_cutoff`]
pub const DEFAULT_ISOSURFACE_CUTOFF: f64 = 0.5;
/// Default for [`Config::absolute_tolerance`]
pub const DEFAULT_ABSOLUTE_TOLERANCE: f64 = 1e-9;
/// Default for [`Config::max_iterations`]
pub const DEFAULT_MAX_ITERATIONS: usize = 50;

/// Validated, immutable configuration
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    kind: ReconstructionKind,
    interpolation: Interpolation,
    discretization_count: Option<DiscretizationCount>,
    exterior_relative_delta: f64,
    isosurface_cutoff: f64,
    absolute_tolerance: f64,
    max_iterations: usize,
    centroid_fallback: bool,
}

impl Config {
    /// Builds a configuration with every optional value set to its default
    pub fn new(kind: ReconstructionKind) -> Self {
        Self {
            kind,
            interpolation: Interpolation::Constant(DEFAULT_CONSTANT_VALUE),
            discretization_count: None,
            exterior_relative_delta: DEFAULT_EXTERIOR_RELATIVE_DELTA,
            isosurface_cutoff: DEFAULT_ISOSURFACE_CUTOFF,
            absolute_tolerance: DEFAULT_ABSOLUTE_TOLERANCE,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            centroid_fallback: false,
        }
    }

    /// Validates a raw configuration map
    pub fn from_raw(raw: &RawConfig) -> Result<Self, Error> {
        let kind = raw.kind.as_deref().ok_or_else(|| {
            Error::Configuration("missing reconstruction type".into())
        })?;
        let kind = kind.parse::<ReconstructionKind>().map_err(|_| {
            Error::Configuration(format!("unknown reconstruction type '{kind}'"))
        })?;
        let mut out = Self::new(kind);

        let i = &raw.interpolation;
        let interp_kind = match i.kind.as_deref() {
            None => InterpolationKind::Constant,
            Some(s) => s.parse::<InterpolationKind>().map_err(|_| {
                Error::Configuration(format!(
                    "unknown interpolation type '{s}'"
                ))
            })?,
        };
        out.interpolation = match interp_kind {
            InterpolationKind::Constant => {
                let v = i.constant_value.unwrap_or(DEFAULT_CONSTANT_VALUE);
                if !v.is_finite() {
                    return Err(Error::Configuration(format!(
                        "constant_value must be finite, got {v}"
                    )));
                }
                Interpolation::Constant(v)
            }
            InterpolationKind::FromVector => Interpolation::FromVector,
        };

        if let Some(d) = &i.discretization_count {
            let counts: &[usize] = match d {
                DiscretizationCount::Uniform(n) => std::slice::from_ref(n),
                DiscretizationCount::PerAxis(v) => v,
            };
            if counts.is_empty() {
                return Err(Error::Configuration(
                    "discretization_count must not be empty".into(),
                ));
            }
            if counts.contains(&0) {
                return Err(Error::Configuration(
                    "discretization_count must be positive".into(),
                ));
            }
            out.discretization_count = Some(d.clone());
        }

        if let Some(v) = i.exterior_relative_delta {
            if !(v.is_finite() && v >= 0.0) {
                return Err(Error::Configuration(format!(
                    "exterior_relative_delta must be >= 0, got {v}"
                )));
            }
            out.exterior_relative_delta = v;
        }
        if let Some(v) = i.isosurface_cutoff {
            if !v.is_finite() {
                return Err(Error::Configuration(format!(
                    "isosurface_cutoff must be finite, got {v}"
                )));
            }
            out.isosurface_cutoff = v;
        }
        if let Some(v) = i.absolute_tolerance {
            if !(v.is_finite() && v > 0.0) {
                return Err(Error::Configuration(format!(
                    "absolute_tolerance must be > 0, got {v}"
                )));
            }
            out.absolute_tolerance = v;
        }
        if let Some(v) = i.max_iterations {
            if v == 0 {
                return Err(Error::Configuration(
                    "max_iterations must be > 0".into(),
                ));
            }
            out.max_iterations = v;
        }
        if let Some(v) = i.centroid_fallback {
            out.centroid_fallback = v;
        }
        if let Interpolation::Constant(v) = out.interpolation {
            if v <= out.isosurface_cutoff {
                return Err(Error::Configuration(format!(
                    "constant_value {v} is not above isosurface_cutoff {}, \
                     so no point can be inside",
                    out.isosurface_cutoff
                )));
            }
        }
        Ok(out)
    }

    /// Exports the configuration, with every default filled in
    pub fn to_raw(&self) -> RawConfig {
        let constant_value = match self.interpolation {
            Interpolation::Constant(v) => Some(v),
            Interpolation::FromVector => None,
        };
        RawConfig {
            kind: Some(self.kind.to_string()),
            interpolation: RawInterpolation {
                kind: Some(self.interpolation.kind().to_string()),
                constant_value,
                discretization_count: self.discretization_count.clone(),
                exterior_relative_delta: Some(self.exterior_relative_delta),
                isosurface_cutoff: Some(self.isosurface_cutoff),
                absolute_tolerance: Some(self.absolute_tolerance),
                max_iterations: Some(self.max_iterations),
                centroid_fallback: Some(self.centroid_fallback),
            },
        }
    }

    /// Resolves the number of cells along each axis
    ///
    /// If no count was configured, this defaults to the cube root of the
    /// number of points (rounded, and at least 1) on every axis.
    pub fn resolve_discretization(
        &self,
        dim: usize,
        n_points: usize,
    ) -> Result<Vec<usize>, Error> {
        match &self.discretization_count {
            None => {
                let n = (n_points as f64).cbrt().round().max(1.0) as usize;
                Ok(vec![n; dim])
            }
            Some(DiscretizationCount::Uniform(n)) => Ok(vec![*n; dim]),
            Some(DiscretizationCount::PerAxis(v)) => {
                if v.len() != dim {
                    Err(Error::Configuration(format!(
                        "discretization_count has {} entries, expected {dim}",
                        v.len()
                    )))
                } else {
                    Ok(v.clone())
                }
            }
        }
    }

    /// Returns the reconstruction algorithm
    pub fn kind(&self) -> ReconstructionKind {
        self.kind
    }
    /// Returns the interpolation policy
    pub fn interpolation(&self) -> Interpolation {
        self.interpolation
    }
    /// Returns the configured discretization, if any
    pub fn discretization_count(&self) -> Option<&DiscretizationCount> {
        self.discretization_count.as_ref()
    }
    /// Padding cell size, relative to the interior cell size
    pub fn exterior_relative_delta(&self) -> f64 {
        self.exterior_relative_delta
    }
    /// Grid values strictly above this cutoff are inside
    pub fn isosurface_cutoff(&self) -> f64 {
        self.isosurface_cutoff
    }
    /// Absolute tolerance for padding, tie-breaking, and convergence
    pub fn absolute_tolerance(&self) -> f64 {
        self.absolute_tolerance
    }
    /// Iteration cap for the boundary vertex solver
    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }
    /// Whether failed vertex solves fall back to the mass point
    pub fn centroid_fallback(&self) -> bool {
        self.centroid_fallback
    }
}

impl TryFrom<RawConfig> for Config {
    type Error = Error;
    fn try_from(raw: RawConfig) -> Result<Self, Error> {
        Self::from_raw(&raw)
    }
}
