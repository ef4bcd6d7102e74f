//! Bounding boxes and their reductions.
use crate::traits::general::{FmmScalar, RealScalar};
use crate::tree::types::{Body, Bounds};

impl<T> Bounds<T>
where
    T: RealScalar,
{
    /// Construct from explicit corners.
    pub fn new(xmin: &[T; 3], xmax: &[T; 3]) -> Self {
        Self {
            xmin: *xmin,
            xmax: *xmax,
        }
    }

    /// Elementwise min/max of the body positions. An empty body set produces
    /// the degenerate zero box.
    pub fn from_bodies<V>(bodies: &[Body<T, V>]) -> Self
    where
        V: FmmScalar<T>,
    {
        let mut bounds = match bodies.first() {
            Some(b) => Bounds::new(&b.x, &b.x),
            None => return Bounds::default(),
        };
        for body in bodies.iter().skip(1) {
            for d in 0..3 {
                bounds.xmin[d] = bounds.xmin[d].min(body.x[d]);
                bounds.xmax[d] = bounds.xmax[d].max(body.x[d]);
            }
        }
        bounds
    }

    /// The union box: elementwise min of minima and max of maxima. This is
    /// the reduction applied across ranks to obtain the global bounds.
    pub fn union(&self, other: &Self) -> Self {
        let mut out = *self;
        for d in 0..3 {
            out.xmin[d] = out.xmin[d].min(other.xmin[d]);
            out.xmax[d] = out.xmax[d].max(other.xmax[d]);
        }
        out
    }

    /// Side length of the encoding cube: the largest axis extent.
    pub fn diameter(&self) -> T {
        let mut diameter = T::zero();
        for d in 0..3 {
            diameter = diameter.max(self.xmax[d] - self.xmin[d]);
        }
        // A degenerate box (single point, or all points coincident) still
        // needs a nonzero cube for the codec.
        if diameter == T::zero() {
            T::one()
        } else {
            diameter
        }
    }

    /// Center of the encoding cube anchored at `xmin`.
    pub fn cube_center(&self) -> [T; 3] {
        let r = self.cube_radius();
        [self.xmin[0] + r, self.xmin[1] + r, self.xmin[2] + r]
    }

    /// Half side length of the encoding cube.
    pub fn cube_radius(&self) -> T {
        self.diameter() / (T::one() + T::one())
    }

    /// Periodic cell extents, one per axis.
    pub fn cycle(&self) -> [T; 3] {
        [
            self.xmax[0] - self.xmin[0],
            self.xmax[1] - self.xmin[1],
            self.xmax[2] - self.xmin[2],
        ]
    }

    /// Squared distance from `x` (shifted by `shift`) to the nearest point of
    /// this box; zero when the shifted point lies inside.
    pub fn distance2(&self, x: &[T; 3], shift: &[T; 3]) -> T {
        let mut r2 = T::zero();
        for d in 0..3 {
            let xd = x[d] + shift[d];
            let gap = if xd > self.xmax[d] {
                xd - self.xmax[d]
            } else if xd < self.xmin[d] {
                xd - self.xmin[d]
            } else {
                T::zero()
            };
            r2 += gap * gap;
        }
        r2
    }
}
