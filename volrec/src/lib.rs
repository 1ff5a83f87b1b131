//! Volrec reconstructs a volume from a scattered point cloud, then integrates
//! per-point quantities over that volume and its boundary surface.
//!
//! Each point carries a scalar **function value**, either a constant or one
//! value per point.  Points are rasterized onto a padded background grid;
//! grid nodes whose value exceeds an **isosurface cutoff** are inside the
//! reconstructed body, and everything else is outside.
//!
//! # Reconstruction
//! A reconstruction moves through a fixed lifecycle:
//!
//! - Build it from a validated [`Config`] and a spatial dimension
//! - Load a flat buffer of point coordinates
//! - Optionally, load one function value per point
//! - [`evaluate`](Reconstructor::evaluate) it
//!
//! Calling an operation before its prerequisites returns
//! [`Error::NotReady`].  Loading new points or values discards any previous
//! results.
//!
//! ```
//! use volrec::{Config, ReconstructionKind, Reconstructor};
//!
//! // A 5×5×5 lattice over the unit cube
//! let mut pts = vec![];
//! for i in 0..5 {
//!     for j in 0..5 {
//!         for k in 0..5 {
//!             pts.extend([i, j, k].map(|v| v as f64 / 4.0));
//!         }
//!     }
//! }
//!
//! let cfg = Config::new(ReconstructionKind::DualContouring);
//! let mut r = Reconstructor::create(cfg, 3)?;
//! r.load_points(&pts)?;
//! r.evaluate()?;
//!
//! let ones = vec![1.0; 125];
//! let volume = r.perform_volume_integration(&ones, 1)?;
//! assert!(volume[0] > 0.0);
//! # Ok::<(), volrec::Error>(())
//! ```
//!
//! # Dual contouring
//! The only reconstruction algorithm is [dual contouring](crate::dc), which
//! places one vertex in each grid cell that straddles the surface, using the
//! [`BoundaryVertexSolver`](crate::solver::BoundaryVertexSolver) to fit it to
//! the cell's supporting planes while staying within the cell.
//!
//! # Integration
//! Integrals take a flat buffer with `width` values per point.  The
//! integrand at any location is the value of the nearest input point;
//! surface integrals may be restricted to regions nearest to a subset of
//! points, e.g. one of the subdomains from
//! [`get_surface_subdomains`](Reconstructor::get_surface_subdomains).
//!
//! # Parallelism
//! Rasterization, boundary vertex solving, and quadrature setup run across a
//! [`ThreadPool`](crate::config::ThreadPool) if one is provided with
//! [`set_threads`](Reconstructor::set_threads), and on the calling thread
//! otherwise.
#![warn(missing_docs)]

mod error;
pub use error::{Error, ResultExt};

pub mod config;
pub mod dc;
pub mod kdtree;
pub mod reconstruction;
pub mod solver;

pub use config::{Config, ReconstructionKind};
pub use reconstruction::{Reconstruction, Reconstructor};
