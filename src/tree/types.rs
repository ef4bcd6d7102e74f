//! Data structures for bodies, cells and octrees.
use std::ops::Range;

use crate::traits::general::{FmmScalar, RealScalar};

/// Axis aligned bounding box of a set of points, reduced across ranks in the
/// distributed setting. All Morton encoding is performed with respect to the
/// cube spanned by these bounds.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Bounds<T>
where
    T: RealScalar,
{
    /// Elementwise minimum of the point coordinates.
    pub xmin: [T; 3],

    /// Elementwise maximum of the point coordinates.
    pub xmax: [T; 3],
}

/// A point source/target.
///
/// Bodies live for the duration of one solve. They are reordered by the tree
/// builder, stamped with a destination rank by the partitioner, and have
/// their target values accumulated by the kernels; `ibody` preserves the
/// caller's original index across all of this.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Body<T, V>
where
    T: RealScalar,
    V: FmmScalar<T>,
{
    /// Position.
    pub x: [T; 3],

    /// Source strength, real for Laplace and complex for Helmholtz.
    pub src: V,

    /// Quadrature weight, carried for boundary-integral style callers.
    pub qweight: T,

    /// Target values: potential followed by the three gradient components.
    pub trg: [V; 4],

    /// Stable identity, the index of the body before any reordering.
    pub ibody: usize,

    /// Destination rank assigned by the partitioner.
    pub irank: i32,

    /// Load balancing weight.
    pub weight: T,
}

impl<T, V> Body<T, V>
where
    T: RealScalar,
    V: FmmScalar<T>,
{
    /// A body at `x` with strength `src` and identity `ibody`, unit weights.
    pub fn new(x: [T; 3], src: V, ibody: usize) -> Self {
        Self {
            x,
            src,
            qweight: T::one(),
            trg: [V::default(); 4],
            ibody,
            irank: 0,
            weight: T::one(),
        }
    }
}

/// A node of the octree.
///
/// Cells are plain data: topology is expressed with indices into the sibling
/// contiguous cell array (`ichild`, `nchild`, `iparent`) and into the leaf
/// ordered body array (`body`, `nbody`), so cells can be moved, serialized
/// and shipped between ranks without fixups beyond index rewriting. The
/// multipole and local expansion coefficients of cell `i` live in flat
/// per-solve arrays at `[i * nterm, (i + 1) * nterm)`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Cell<T>
where
    T: RealScalar,
{
    /// Cube center.
    pub x: [T; 3],

    /// Half side length of the cube; divided by the multipole acceptance
    /// parameter theta at the end of the upward pass so that acceptance
    /// tests reduce to comparisons of plain distances against plain radii.
    pub r: T,

    /// Side length of the cube at build time, 2R. Fixes the expansion scale
    /// for the Helmholtz kernel independently of the radius adjustment.
    pub scale: T,

    /// Morton key of the cube at `level`.
    pub key: u64,

    /// Depth of the cell below the root.
    pub level: u32,

    /// First body owned by this cell in the leaf ordered body array.
    pub body: usize,

    /// Number of bodies in `[body, body + nbody)`.
    pub nbody: usize,

    /// Index of the first child in the cell array.
    pub ichild: usize,

    /// Number of children in `[ichild, ichild + nchild)`.
    pub nchild: usize,

    /// Index of the parent cell; the root points at itself.
    pub iparent: usize,

    /// Load accounting weight, accumulated during traversal.
    pub weight: T,
}

impl<T> Cell<T>
where
    T: RealScalar,
{
    /// Whether this cell is a leaf.
    pub fn is_leaf(&self) -> bool {
        self.nchild == 0
    }

    /// Body index range of this cell.
    pub fn bodies(&self) -> Range<usize> {
        self.body..self.body + self.nbody
    }

    /// Child index range of this cell.
    pub fn children(&self) -> Range<usize> {
        self.ichild..self.ichild + self.nchild
    }
}

/// Subdivision strategy for the tree builder.
#[derive(Debug, Clone, Copy)]
pub enum TreeKind {
    /// Split cells while they hold more than `ncrit` bodies, up to `max_level`.
    Adaptive {
        /// Leaf population threshold.
        ncrit: usize,
        /// Depth cap.
        max_level: u32,
    },

    /// Emit the complete octree to a fixed depth, including empty cells.
    Uniform {
        /// Tree depth.
        depth: u32,
    },
}

/// An octree over a rank-local body set.
///
/// Cells are stored root first with siblings contiguous and every descendant
/// strictly after its ancestors, level by level, so that `levels[l]` is a
/// contiguous index range and parent/child accesses split cleanly at level
/// boundaries.
#[derive(Debug, Clone, Default)]
pub struct Octree<T>
where
    T: RealScalar,
{
    /// All cells, root at index 0.
    pub cells: Vec<Cell<T>>,

    /// Cell index range of every level, indexed by depth.
    pub levels: Vec<Range<usize>>,

    /// Depth of the deepest leaf.
    pub depth: u32,

    /// Encoding depth used for body keys.
    pub max_level: u32,

    /// Bounds the tree was built against.
    pub bounds: Bounds<T>,
}

impl<T> Octree<T>
where
    T: RealScalar,
{
    /// Number of cells.
    pub fn n_cells(&self) -> usize {
        self.cells.len()
    }

    /// Iterator over leaf cell indices.
    pub fn leaves(&self) -> impl Iterator<Item = usize> + '_ {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_leaf())
            .map(|(i, _)| i)
    }
}
