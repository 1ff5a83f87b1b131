//! Box-constrained vertex placement
//!
//! Each boundary cell carries a set of supporting planes.  The boundary vertex
//! minimizes the squared plane distances (plus a small pull towards the mass
//! point of the plane points) subject to staying within the cell.
//!
//! The bounds are expressed with squared slack variables, so the KKT
//! conditions become a square nonlinear system in `5 * D` unknowns
//! `X = [x, s, t, λ_ub, λ_lb]`:
//!
//! ```text
//! ∇f(x) + λ_ub - λ_lb = 0
//!          2 λ_ub ⊙ s = 0
//!         -2 λ_lb ⊙ t = 0
//!        ub - x - s^2 = 0
//!        x - lb - t^2 = 0
//! ```
//!
//! which is solved with Newton's method.
//!
//! Because the objective is quadratic, the box-constrained minimizer can be
//! found exactly by enumerating active sets, and this is used as the
//! starting point.  In most cells it already satisfies the KKT conditions to
//! within rounding, so no Newton steps are taken; the iteration only does
//! work when the warm start is inaccurate (e.g. for badly conditioned plane
//! sets).  Convergence is judged relative to the magnitude of the problem, so
//! results don't depend on where the cloud sits in space.
use crate::Error;
use log::trace;
use nalgebra::{DMatrix, DVector, SMatrix, SVector};

/// Relative weight of the pull towards the mass point, per plane
const MASS_POINT_WEIGHT: f64 = 1e-6;

/// Relative size of the multipliers seeded on degenerate bounds
const MULTIPLIER_SEED: f64 = 1e-8;

/// A supporting plane, given as a point on the plane and its unit normal
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Plane<const D: usize> {
    /// Point on the plane
    pub point: SVector<f64, D>,
    /// Outward-facing unit normal
    pub normal: SVector<f64, D>,
}

/// Tuning for the Newton iteration
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SolverSettings {
    /// Convergence threshold on the residual norm, relative to the scale
    /// of the problem (see [`BoundaryVertexSolver::residual_scale`])
    pub tolerance: f64,
    /// Maximum number of Newton steps
    pub max_iterations: usize,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            tolerance: crate::config::DEFAULT_ABSOLUTE_TOLERANCE,
            max_iterations: crate::config::DEFAULT_MAX_ITERATIONS,
        }
    }
}

/// Result of a successful solve
#[derive(Copy, Clone, Debug)]
pub struct BoundaryVertex<const D: usize> {
    /// Vertex position, within `[lb, ub]`
    pub pos: SVector<f64, D>,
    /// Number of Newton steps taken after the warm start
    pub iterations: usize,
    /// Final residual norm
    pub residual: f64,
}

/// Solver for a box-constrained plane-fitting problem
///
/// The objective is quadratic, `f(x) = ½ xᵀ H x - bᵀ x + c`, so we store
/// the Hessian and linear term directly.
#[derive(Clone, Debug)]
pub struct BoundaryVertexSolver<const D: usize> {
    hessian: SMatrix<f64, D, D>,
    rhs: SVector<f64, D>,
    constant: f64,
    mass_point: SVector<f64, D>,
}

/// Bound state of a single axis during the warm start
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Active {
    Free,
    Lower,
    Upper,
}

impl<const D: usize> BoundaryVertexSolver<D> {
    /// Builds a solver from a set of supporting planes
    ///
    /// Normals are normalized here; returns an error if there are no planes
    /// or if any normal is degenerate.
    pub fn new(planes: &[Plane<D>]) -> Result<Self, Error> {
        if planes.is_empty() {
            return Err(Error::Configuration(
                "boundary vertex requires at least one supporting plane".into(),
            ));
        }
        let mut ata = SMatrix::<f64, D, D>::zeros();
        let mut atb = SVector::<f64, D>::zeros();
        let mut btb = 0.0;
        let mut mass_point = SVector::<f64, D>::zeros();
        for p in planes {
            let norm = p.normal.norm();
            if !(norm.is_finite() && norm > 0.0) {
                return Err(Error::InvalidInput(format!(
                    "invalid plane normal {:?}",
                    p.normal.as_slice()
                )));
            }
            let n = p.normal / norm;
            let d = n.dot(&p.point);
            ata += n * n.transpose();
            atb += n * d;
            btb += d * d;
            mass_point += p.point;
        }
        mass_point /= planes.len() as f64;

        let eps = MASS_POINT_WEIGHT * planes.len() as f64;
        let hessian = (ata + SMatrix::<f64, D, D>::identity() * eps) * 2.0;
        let rhs = (atb + mass_point * eps) * 2.0;
        let constant = btb + eps * mass_point.norm_squared();
        Ok(Self {
            hessian,
            rhs,
            constant,
            mass_point,
        })
    }

    /// Returns the mean of the plane points
    pub fn mass_point(&self) -> SVector<f64, D> {
        self.mass_point
    }

    /// Evaluates the objective function
    pub fn objective(&self, x: &SVector<f64, D>) -> f64 {
        0.5 * x.dot(&(self.hessian * x)) - self.rhs.dot(x) + self.constant
    }

    /// Evaluates the objective's gradient
    pub fn gradient(&self, x: &SVector<f64, D>) -> SVector<f64, D> {
        self.hessian * x - self.rhs
    }

    /// Evaluates the KKT residual and its Jacobian
    ///
    /// `state` has `5 * D` entries, laid out as `[x, s, t, λ_ub, λ_lb]`.
    pub fn residual(
        &self,
        state: &DVector<f64>,
        lb: &SVector<f64, D>,
        ub: &SVector<f64, D>,
    ) -> (DVector<f64>, DMatrix<f64>) {
        assert_eq!(state.len(), 5 * D);
        let x = SVector::<f64, D>::from_fn(|i, _| state[i]);
        let s = |i: usize| state[D + i];
        let t = |i: usize| state[2 * D + i];
        let lu = |i: usize| state[3 * D + i];
        let ll = |i: usize| state[4 * D + i];

        let g = self.gradient(&x);
        let mut r = DVector::zeros(5 * D);
        let mut j = DMatrix::zeros(5 * D, 5 * D);
        for i in 0..D {
            r[i] = g[i] + lu(i) - ll(i);
            r[D + i] = 2.0 * lu(i) * s(i);
            r[2 * D + i] = -2.0 * ll(i) * t(i);
            r[3 * D + i] = ub[i] - x[i] - s(i).powi(2);
            r[4 * D + i] = x[i] - lb[i] - t(i).powi(2);

            for k in 0..D {
                j[(i, k)] = self.hessian[(i, k)];
            }
            j[(i, 3 * D + i)] = 1.0;
            j[(i, 4 * D + i)] = -1.0;

            j[(D + i, D + i)] = 2.0 * lu(i);
            j[(D + i, 3 * D + i)] = 2.0 * s(i);

            j[(2 * D + i, 2 * D + i)] = -2.0 * ll(i);
            j[(2 * D + i, 4 * D + i)] = -2.0 * t(i);

            j[(3 * D + i, i)] = -1.0;
            j[(3 * D + i, D + i)] = -2.0 * s(i);

            j[(4 * D + i, i)] = 1.0;
            j[(4 * D + i, 2 * D + i)] = -2.0 * t(i);
        }
        (r, j)
    }

    /// Solves for the boundary vertex within `[lb, ub]`
    ///
    /// The Newton iteration is seeded with the exact solution of the
    /// box-constrained quadratic program, found by checking every
    /// combination of active bounds.
    pub fn solve(
        &self,
        lb: &SVector<f64, D>,
        ub: &SVector<f64, D>,
        settings: &SolverSettings,
    ) -> Result<BoundaryVertex<D>, Error> {
        if let Some(i) = (0..D).find(|i| !(lb[*i] <= ub[*i])) {
            return Err(Error::InvalidInput(format!(
                "lower bound {} exceeds upper bound {} on axis {i}",
                lb[i], ub[i]
            )));
        }
        let x = self.warm_start(lb, ub);
        let err = self.projected_gradient(&x, lb, ub).norm();
        if err < settings.tolerance * self.residual_scale(&x, lb, ub) {
            return Ok(BoundaryVertex {
                pos: x,
                iterations: 0,
                residual: err,
            });
        }
        let state = self.kkt_state(&x, lb, ub);
        self.newton(state, lb, ub, settings)
    }

    /// Returns `x - clamp(x - ∇f(x))`, which is zero at the box minimizer
    pub fn projected_gradient(
        &self,
        x: &SVector<f64, D>,
        lb: &SVector<f64, D>,
        ub: &SVector<f64, D>,
    ) -> SVector<f64, D> {
        let g = self.gradient(x);
        SVector::<f64, D>::from_fn(|i, _| {
            x[i] - (x[i] - g[i]).clamp(lb[i], ub[i])
        })
    }

    /// Returns the magnitude of the terms in the KKT residual at `x`
    ///
    /// Rounding error in the residual grows with this value, so tolerances
    /// are multiplied by it.
    pub fn residual_scale(
        &self,
        x: &SVector<f64, D>,
        lb: &SVector<f64, D>,
        ub: &SVector<f64, D>,
    ) -> f64 {
        1.0 + self.hessian.norm() * x.norm()
            + self.rhs.norm()
            + lb.norm().max(ub.norm())
    }

    /// Runs Newton's method from the given `5 * D` state vector
    pub fn newton(
        &self,
        mut state: DVector<f64>,
        lb: &SVector<f64, D>,
        ub: &SVector<f64, D>,
        settings: &SolverSettings,
    ) -> Result<BoundaryVertex<D>, Error> {
        let mut iterations = 0;
        loop {
            let (r, j) = self.residual(&state, lb, ub);
            let norm = r.norm();
            let x = SVector::<f64, D>::from_fn(|i, _| state[i]);
            if !norm.is_finite() {
                return Err(Error::SolveFailure(
                    "residual is not finite".into(),
                ));
            }
            if norm < settings.tolerance * self.residual_scale(&x, lb, ub) {
                return Ok(BoundaryVertex {
                    pos: x,
                    iterations,
                    residual: norm,
                });
            }
            if iterations == settings.max_iterations {
                return Err(Error::SolveFailure(format!(
                    "no convergence after {iterations} iterations \
                     (residual {norm:e})"
                )));
            }
            let step = j.lu().solve(&-r).ok_or_else(|| {
                Error::SolveFailure("singular KKT jacobian".into())
            })?;
            if step.iter().any(|v| !v.is_finite()) {
                return Err(Error::SolveFailure("singular KKT jacobian".into()));
            }
            state += step;
            iterations += 1;
            trace!("newton step {iterations}: residual {norm:e}");
        }
    }

    /// Builds a full KKT state vector from a primal point
    ///
    /// Slacks are chosen to satisfy the bound equations exactly, and
    /// multipliers are chosen to cancel the gradient on active bounds.
    ///
    /// A bound with both zero slack and zero multiplier would leave an empty
    /// row in the Jacobian, so such bounds get a small positive multiplier
    /// on both sides of the axis (leaving the stationarity row unchanged).
    /// Zero-width axes also get small slacks, since otherwise both of their
    /// bound rows only depend on `x`.
    pub fn kkt_state(
        &self,
        x: &SVector<f64, D>,
        lb: &SVector<f64, D>,
        ub: &SVector<f64, D>,
    ) -> DVector<f64> {
        let g = self.gradient(x);
        let seed = MULTIPLIER_SEED * (1.0 + self.hessian.norm());
        let mut state = DVector::zeros(5 * D);
        for i in 0..D {
            let xi = x[i].clamp(lb[i], ub[i]);
            let (s, t) = if ub[i] > lb[i] {
                ((ub[i] - xi).sqrt(), (xi - lb[i]).sqrt())
            } else {
                (seed.sqrt(), seed.sqrt())
            };
            let mut lu = if s <= t { (-g[i]).max(0.0) } else { 0.0 };
            let mut ll = if t <= s { g[i].max(0.0) } else { 0.0 };
            if s.max(lu) <= seed || t.max(ll) <= seed {
                lu += seed;
                ll += seed;
            }
            state[i] = xi;
            state[D + i] = s;
            state[2 * D + i] = t;
            state[3 * D + i] = lu;
            state[4 * D + i] = ll;
        }
        state
    }

    /// Finds the exact minimizer within the box by active-set enumeration
    ///
    /// Every axis is either free, clamped to its lower bound, or clamped to
    /// its upper bound.  For each of the `3^D` combinations, we minimize over
    /// the free axes; the feasible candidate with the lowest objective is the
    /// constrained minimizer (the objective is strictly convex).
    fn warm_start(
        &self,
        lb: &SVector<f64, D>,
        ub: &SVector<f64, D>,
    ) -> SVector<f64, D> {
        let mut best: Option<(f64, SVector<f64, D>)> = None;
        let mut active = [Active::Free; D];
        for mut code in 0..3usize.pow(D as u32) {
            for a in active.iter_mut() {
                *a = match code % 3 {
                    0 => Active::Free,
                    1 => Active::Lower,
                    _ => Active::Upper,
                };
                code /= 3;
            }
            let Some(x) = self.reduced_solve(&active, lb, ub) else {
                continue;
            };
            let feasible = (0..D).all(|i| {
                let slop = 1e-12 * (1.0 + lb[i].abs().max(ub[i].abs()));
                x[i] >= lb[i] - slop && x[i] <= ub[i] + slop
            });
            if !feasible {
                continue;
            }
            let err = self.objective(&x);
            if best.is_none_or(|(e, _)| err < e) {
                best = Some((err, x));
            }
        }
        // The all-lower corner is always feasible, so this never falls back
        best.map(|(_, x)| x).unwrap_or(*lb)
    }

    /// Minimizes the objective over the free axes, with other axes fixed
    fn reduced_solve(
        &self,
        active: &[Active; D],
        lb: &SVector<f64, D>,
        ub: &SVector<f64, D>,
    ) -> Option<SVector<f64, D>> {
        let mut x = SVector::<f64, D>::zeros();
        let mut free = Vec::with_capacity(D);
        for i in 0..D {
            match active[i] {
                Active::Free => free.push(i),
                Active::Lower => x[i] = lb[i],
                Active::Upper => x[i] = ub[i],
            }
        }
        if free.is_empty() {
            return Some(x);
        }
        let m = DMatrix::from_fn(free.len(), free.len(), |a, b| {
            self.hessian[(free[a], free[b])]
        });
        let rhs = DVector::from_fn(free.len(), |a, _| {
            let i = free[a];
            let fixed: f64 = (0..D)
                .filter(|k| active[*k] != Active::Free)
                .map(|k| self.hessian[(i, k)] * x[k])
                .sum();
            self.rhs[i] - fixed
        });
        let sol = m.cholesky()?.solve(&rhs);
        for (a, i) in free.iter().enumerate() {
            x[*i] = sol[a];
        }
        Some(x)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Vector2, Vector3};

    fn plane3(point: [f64; 3], normal: [f64; 3]) -> Plane<3> {
        Plane {
            point: Vector3::from(point),
            normal: Vector3::from(normal),
        }
    }

    #[test]
    fn no_planes() {
        assert!(matches!(
            BoundaryVertexSolver::<3>::new(&[]),
            Err(Error::Configuration(..))
        ));
        assert!(matches!(
            BoundaryVertexSolver::new(&[plane3([0.0; 3], [0.0; 3])]),
            Err(Error::InvalidInput(..))
        ));
    }

    #[test]
    fn bad_bounds() {
        let s =
            BoundaryVertexSolver::new(&[plane3([0.0; 3], [1.0, 0.0, 0.0])])
                .unwrap();
        let r = s.solve(
            &Vector3::new(0.0, 1.0, 0.0),
            &Vector3::new(1.0, 0.0, 1.0),
            &SolverSettings::default(),
        );
        assert!(matches!(r, Err(Error::InvalidInput(..))));
    }

    #[test]
    fn jacobian_matches_finite_differences() {
        let s = BoundaryVertexSolver::new(&[
            plane3([0.1, 0.2, 0.3], [1.0, 0.2, 0.0]),
            plane3([0.4, 0.1, 0.0], [0.0, 1.0, 0.5]),
            plane3([0.3, 0.3, 0.6], [0.3, -0.2, 1.0]),
        ])
        .unwrap();
        let lb = Vector3::new(-1.0, -0.5, 0.0);
        let ub = Vector3::new(1.0, 2.0, 1.5);
        let state = DVector::from_fn(15, |i, _| 0.1 + 0.37 * i as f64);
        let (r0, j) = s.residual(&state, &lb, &ub);

        let h = 1e-6;
        for col in 0..15 {
            let mut p = state.clone();
            p[col] += h;
            let (r1, _) = s.residual(&p, &lb, &ub);
            let fd = (r1 - &r0) / h;
            for row in 0..15 {
                assert!(
                    (fd[row] - j[(row, col)]).abs() < 1e-4,
                    "mismatch at ({row}, {col}): {} vs {}",
                    fd[row],
                    j[(row, col)]
                );
            }
        }
    }

    #[test]
    fn sphere_tangent_planes() {
        let axis = Vector3::new(1.0, 1.0, 1.0).normalize();
        let u = Vector3::new(1.0, -1.0, 0.0).normalize();
        let v = axis.cross(&u);
        let theta = 0.05f64;
        let planes: Vec<Plane<3>> = (0..8)
            .map(|k| {
                let phi = std::f64::consts::TAU * k as f64 / 8.0;
                let p = axis * theta.cos()
                    + (u * phi.cos() + v * phi.sin()) * theta.sin();
                Plane {
                    point: p,
                    normal: p,
                }
            })
            .collect();
        let s = BoundaryVertexSolver::new(&planes).unwrap();
        let lb = axis.add_scalar(-0.1);
        let ub = axis.add_scalar(0.1);
        let out = s.solve(&lb, &ub, &SolverSettings::default()).unwrap();
        assert!(
            (out.pos - axis).norm() < 1e-2,
            "expected {axis:?}, got {:?}",
            out.pos
        );
        for i in 0..3 {
            assert!(out.pos[i] >= lb[i] && out.pos[i] <= ub[i]);
        }
    }

    #[test]
    fn clamped_to_box() {
        let s = BoundaryVertexSolver::new(&[
            plane3([2.0, 0.0, 0.0], [1.0, 0.0, 0.0]),
            plane3([0.0, 0.5, 0.0], [0.0, 1.0, 0.0]),
            plane3([0.0, 0.0, 0.5], [0.0, 0.0, 1.0]),
        ])
        .unwrap();
        let lb = Vector3::zeros();
        let ub = Vector3::new(1.0, 1.0, 1.0);
        let out = s.solve(&lb, &ub, &SolverSettings::default()).unwrap();
        assert!(out.pos.x <= 1.0);
        assert_relative_eq!(out.pos.x, 1.0, epsilon = 1e-9);
        assert_relative_eq!(out.pos.y, 0.5, epsilon = 1e-4);
        assert_relative_eq!(out.pos.z, 0.5, epsilon = 1e-4);
    }

    #[test]
    fn newton_from_cold_start() {
        let s = BoundaryVertexSolver::new(&[
            Plane {
                point: Vector2::new(0.3, 0.0),
                normal: Vector2::new(1.0, 0.0),
            },
            Plane {
                point: Vector2::new(0.0, 0.6),
                normal: Vector2::new(0.0, 1.0),
            },
        ])
        .unwrap();
        let lb = Vector2::zeros();
        let ub = Vector2::new(1.0, 1.0);

        // Start at the center of the box with zero multipliers
        let mut state = DVector::zeros(10);
        for i in 0..2 {
            state[i] = 0.5;
            state[2 + i] = 0.5f64.sqrt();
            state[4 + i] = 0.5f64.sqrt();
        }
        let out = s
            .newton(state, &lb, &ub, &SolverSettings::default())
            .unwrap();
        assert!(out.iterations > 0);
        assert_relative_eq!(out.pos.x, 0.3, epsilon = 1e-4);
        assert_relative_eq!(out.pos.y, 0.6, epsilon = 1e-4);
    }

    #[test]
    fn iteration_cap() {
        let s = BoundaryVertexSolver::new(&[Plane {
            point: Vector2::new(0.3, 0.3),
            normal: Vector2::new(1.0, 1.0),
        }])
        .unwrap();
        let lb = Vector2::zeros();
        let ub = Vector2::new(1.0, 1.0);
        let state = DVector::from_element(10, 0.5);
        let settings = SolverSettings {
            max_iterations: 1,
            ..Default::default()
        };
        assert!(matches!(
            s.newton(state, &lb, &ub, &settings),
            Err(Error::SolveFailure(..))
        ));
    }

    #[test]
    fn far_from_origin() {
        let planes = [
            plane3([0.3, 0.0, 0.0], [1.0, 0.1, 0.0]),
            plane3([0.0, 0.6, 0.0], [0.0, 1.0, 0.2]),
            plane3([0.0, 0.0, 0.45], [0.1, 0.0, 1.0]),
        ];
        let lb = Vector3::zeros();
        let ub = Vector3::new(1.0, 1.0, 1.0);
        let near = BoundaryVertexSolver::new(&planes)
            .unwrap()
            .solve(&lb, &ub, &SolverSettings::default())
            .unwrap();
        for shift in [1e3, 1e5, 1e6] {
            let offset = Vector3::from_element(shift);
            let moved: Vec<Plane<3>> = planes
                .iter()
                .map(|p| Plane {
                    point: p.point + offset,
                    normal: p.normal,
                })
                .collect();
            let far = BoundaryVertexSolver::new(&moved)
                .unwrap()
                .solve(
                    &(lb + offset),
                    &(ub + offset),
                    &SolverSettings::default(),
                )
                .unwrap();
            assert!(
                ((far.pos - offset) - near.pos).norm() < 1e-6 * shift,
                "shift {shift}: {:?} vs {:?}",
                far.pos - offset,
                near.pos
            );
        }
    }

    #[test]
    fn zero_width_box() {
        let s = BoundaryVertexSolver::new(&[
            plane3([0.2, 0.0, 0.0], [1.0, 0.0, 0.0]),
            plane3([0.0, 0.7, 0.0], [0.0, 1.0, 0.0]),
        ])
        .unwrap();
        let p = Vector3::new(0.5, 0.5, 0.5);
        let out = s.solve(&p, &p, &SolverSettings::default()).unwrap();
        assert_eq!(out.pos, p);

        let lb = Vector3::new(0.0, 0.0, 0.5);
        let ub = Vector3::new(1.0, 1.0, 0.5);
        let out = s.solve(&lb, &ub, &SolverSettings::default()).unwrap();
        assert_relative_eq!(out.pos.x, 0.2, epsilon = 1e-4);
        assert_relative_eq!(out.pos.y, 0.7, epsilon = 1e-4);
        assert_eq!(out.pos.z, 0.5);
    }

    #[test]
    fn degenerate_bounds_are_seeded() {
        // The optimum sits exactly on the upper x bound with zero gradient,
        // and the y and z axes rest on their lower bounds with zero gradient
        let s = BoundaryVertexSolver::new(&[plane3(
            [1.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
        )])
        .unwrap();
        let lb = Vector3::zeros();
        let ub = Vector3::new(1.0, 1.0, 1.0);
        let x = Vector3::new(1.0, 0.0, 0.0);
        let (r, j) = s.residual(&s.kkt_state(&x, &lb, &ub), &lb, &ub);
        assert!(j.clone().lu().is_invertible());
        assert!(r.norm() < 1e-6);

        // Zero-width axes as well
        let (_, j) = s.residual(&s.kkt_state(&x, &x, &x), &x, &x);
        assert!(j.lu().is_invertible());

        // Newton converges from the seeded state
        let out = s
            .newton(s.kkt_state(&x, &lb, &ub), &lb, &ub, &Default::default())
            .unwrap();
        assert_relative_eq!(out.pos.x, 1.0, epsilon = 1e-6);
    }
}
