//! Spatial index over a borrowed point buffer
//!
//! The tree is stored as an arena of [`Node`] objects, each of which owns a
//! single point (by index into the flat coordinate buffer).  Points are split
//! along the axis with the largest spread, with the median point stored in the
//! node itself and in neither subtree.
use crate::Error;
use ordered_float::OrderedFloat;

/// A single node in a [`KdTree`]
#[derive(Copy, Clone, Debug)]
struct Node {
    /// Index of the point owned by this node
    index: usize,
    /// Split axis
    axis: usize,
    /// Distance from the root
    depth: usize,
    /// Arena index of the subtree with `coord[axis] <= self[axis]`
    left: Option<usize>,
    /// Arena index of the subtree with `coord[axis] >= self[axis]`
    right: Option<usize>,
}

/// Immutable KD-tree over a flat buffer of `dim`-tuples
///
/// The point buffer is borrowed (not copied), so it must outlive the tree.
/// Duplicate points are allowed and are indexed independently.
#[derive(Clone, Debug)]
pub struct KdTree<'a> {
    points: &'a [f64],
    dim: usize,
    nodes: Vec<Node>,
    root: usize,
}

impl<'a> KdTree<'a> {
    /// Builds a tree over every point in the buffer
    pub fn new(points: &'a [f64], dim: usize) -> Result<Self, Error> {
        if dim == 0 {
            return Err(Error::InvalidInput("dimension must be > 0".into()));
        }
        let owned: Vec<usize> = (0..points.len() / dim).collect();
        Self::build(points, dim, owned)
    }

    /// Builds a tree over the given subset of points
    ///
    /// `owned` contains point indices, i.e. point `i` has coordinates
    /// `points[i * dim..(i + 1) * dim]`.
    pub fn build(
        points: &'a [f64],
        dim: usize,
        mut owned: Vec<usize>,
    ) -> Result<Self, Error> {
        if dim == 0 {
            return Err(Error::InvalidInput("dimension must be > 0".into()));
        }
        if points.len() % dim != 0 {
            return Err(Error::InvalidInput(format!(
                "buffer length {} is not a multiple of dimension {dim}",
                points.len()
            )));
        }
        if owned.is_empty() {
            return Err(Error::InvalidInput(
                "cannot build a tree with no points".into(),
            ));
        }
        let n = points.len() / dim;
        if let Some(i) = owned.iter().find(|i| **i >= n) {
            return Err(Error::InvalidInput(format!(
                "point index {i} is out of range for {n} points"
            )));
        }

        let mut out = Self {
            points,
            dim,
            nodes: Vec::with_capacity(owned.len()),
            root: 0,
        };
        out.root = out.build_node(&mut owned, 0);
        Ok(out)
    }

    /// Recursively builds a node, returning its index in the arena
    fn build_node(&mut self, owned: &mut [usize], depth: usize) -> usize {
        let axis = if owned.len() == 1 {
            0
        } else {
            self.widest_axis(owned)
        };
        let points = self.points;
        let dim = self.dim;
        owned.sort_by_key(|i| OrderedFloat(points[i * dim + axis]));

        let mid = owned.len() / 2;
        let slot = self.nodes.len();
        self.nodes.push(Node {
            index: owned[mid],
            axis,
            depth,
            left: None,
            right: None,
        });
        let (lo, hi) = owned.split_at_mut(mid);
        let hi = &mut hi[1..];
        if !lo.is_empty() {
            let left = self.build_node(lo, depth + 1);
            self.nodes[slot].left = Some(left);
        }
        if !hi.is_empty() {
            let right = self.build_node(hi, depth + 1);
            self.nodes[slot].right = Some(right);
        }
        slot
    }

    /// Returns the axis with the largest spread (first one on ties)
    fn widest_axis(&self, owned: &[usize]) -> usize {
        let mut best = (0, f64::NEG_INFINITY);
        for d in 0..self.dim {
            let (lo, hi) = owned.iter().map(|i| self.coord(*i, d)).fold(
                (f64::INFINITY, f64::NEG_INFINITY),
                |(lo, hi), v| (lo.min(v), hi.max(v)),
            );
            if hi - lo > best.1 {
                best = (d, hi - lo);
            }
        }
        best.0
    }

    #[inline]
    fn coord(&self, i: usize, d: usize) -> f64 {
        self.points[i * self.dim + d]
    }

    /// Returns the number of points in the tree
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Checks whether the tree is empty (which is never the case)
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the spatial dimension
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Returns the coordinates of the given point
    pub fn point(&self, i: usize) -> &'a [f64] {
        &self.points[i * self.dim..(i + 1) * self.dim]
    }

    /// Returns the depth of the deepest node
    pub fn max_depth(&self) -> usize {
        self.nodes.iter().map(|n| n.depth).max().unwrap_or(0)
    }

    /// Returns every point within the closed box `[lower, upper]`
    pub fn range_query(&self, lower: &[f64], upper: &[f64]) -> Vec<usize> {
        let mut out = vec![];
        self.range_query_into(lower, upper, &mut out);
        out
    }

    /// Appends every point within the closed box `[lower, upper]` to `out`
    ///
    /// `out` is not cleared, so it can be reused as a scratch buffer.
    pub fn range_query_into(
        &self,
        lower: &[f64],
        upper: &[f64],
        out: &mut Vec<usize>,
    ) {
        assert_eq!(lower.len(), self.dim);
        assert_eq!(upper.len(), self.dim);
        self.range_recurse(self.root, lower, upper, out);
    }

    fn range_recurse(
        &self,
        n: usize,
        lower: &[f64],
        upper: &[f64],
        out: &mut Vec<usize>,
    ) {
        let node = self.nodes[n];
        let p = self.point(node.index);
        if p.iter()
            .zip(lower.iter().zip(upper))
            .all(|(v, (lo, hi))| *lo <= *v && *v <= *hi)
        {
            out.push(node.index);
        }
        let v = p[node.axis];
        if let Some(left) = node.left {
            if lower[node.axis] <= v {
                self.range_recurse(left, lower, upper, out);
            }
        }
        if let Some(right) = node.right {
            if upper[node.axis] >= v {
                self.range_recurse(right, lower, upper, out);
            }
        }
    }

    /// Returns every point with Euclidean distance `<= radius` from `origin`
    pub fn within_radius(&self, origin: &[f64], radius: f64) -> Vec<usize> {
        assert_eq!(origin.len(), self.dim);
        let mut out = vec![];
        self.radius_recurse(self.root, origin, radius, &mut out);
        out
    }

    fn radius_recurse(
        &self,
        n: usize,
        origin: &[f64],
        radius: f64,
        out: &mut Vec<usize>,
    ) {
        let node = self.nodes[n];
        let p = self.point(node.index);
        if dist2(p, origin) <= radius * radius {
            out.push(node.index);
        }
        let v = p[node.axis];
        if let Some(left) = node.left {
            if origin[node.axis] - radius <= v {
                self.radius_recurse(left, origin, radius, out);
            }
        }
        if let Some(right) = node.right {
            if origin[node.axis] + radius >= v {
                self.radius_recurse(right, origin, radius, out);
            }
        }
    }

    /// Finds the point nearest to `query`, returning its index and distance
    ///
    /// On ties, the first point visited is kept.
    pub fn nearest(&self, query: &[f64]) -> Option<(usize, f64)> {
        assert_eq!(query.len(), self.dim);
        let mut best = None;
        self.nearest_recurse(self.root, query, &mut best);
        best.map(|(i, d2): (usize, f64)| (i, d2.sqrt()))
    }

    fn nearest_recurse(
        &self,
        n: usize,
        query: &[f64],
        best: &mut Option<(usize, f64)>,
    ) {
        let node = self.nodes[n];
        let p = self.point(node.index);
        let d2 = dist2(p, query);
        if best.is_none_or(|(_, b)| d2 < b) {
            *best = Some((node.index, d2));
        }

        let delta = query[node.axis] - p[node.axis];
        let (near, far) = if delta <= 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };
        if let Some(near) = near {
            self.nearest_recurse(near, query, best);
        }
        if let Some(far) = far {
            if best.is_none_or(|(_, b)| delta * delta <= b) {
                self.nearest_recurse(far, query, best);
            }
        }
    }

    /// Returns the minimum coordinate of any point along axis `d`
    pub fn min_along(&self, d: usize) -> f64 {
        assert!(d < self.dim);
        self.min_recurse(self.root, d)
    }

    fn min_recurse(&self, n: usize, d: usize) -> f64 {
        let node = self.nodes[n];
        let mut v = self.coord(node.index, d);
        if let Some(left) = node.left {
            v = v.min(self.min_recurse(left, d));
        }
        // Points on the right side can't be smaller along the split axis
        if node.axis != d {
            if let Some(right) = node.right {
                v = v.min(self.min_recurse(right, d));
            }
        }
        v
    }

    /// Returns the maximum coordinate of any point along axis `d`
    pub fn max_along(&self, d: usize) -> f64 {
        assert!(d < self.dim);
        self.max_recurse(self.root, d)
    }

    fn max_recurse(&self, n: usize, d: usize) -> f64 {
        let node = self.nodes[n];
        let mut v = self.coord(node.index, d);
        if let Some(right) = node.right {
            v = v.max(self.max_recurse(right, d));
        }
        if node.axis != d {
            if let Some(left) = node.left {
                v = v.max(self.max_recurse(left, d));
            }
        }
        v
    }
}

fn dist2(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(a, b)| (a - b).powi(2)).sum()
}
