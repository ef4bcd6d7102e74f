//! # Spherical Harmonic Fast Multipole Method (sphfmm)
//!
//! A hierarchical N-body solver approximating all pairwise interactions
//! among N sources and targets in O(N) to O(N log N) time, for the Laplace
//! and Helmholtz kernels in three dimensions.
//!
//! Notable features of this library are:
//! * Analytic spherical harmonic expansions, with rotation-accelerated
//!   translations and adaptive order reduction for the Helmholtz kernel.
//! * Adaptive and uniform Morton-ordered octrees with flat, shippable cell
//!   records.
//! * Acceptance-criterion driven dual tree traversal with per-target
//!   interaction lists, evaluated task-parallel over disjoint accumulators.
//! * Periodic image shells, handled by shifted traversals near and an
//!   aggregated image multipole far out.
//! * A distributed layer (behind the `mpi` feature) exchanging bodies and
//!   locally essential trees between ranks; the selection and serialization
//!   logic is pure and tested in-process.
#![cfg_attr(feature = "strict", deny(warnings))]
#![warn(missing_docs)]

pub mod fmm;
pub mod kernel;
pub mod traits;
pub mod tree;

// Public API
#[doc(inline)]
pub use fmm::builder::FmmBuilder;
#[doc(inline)]
pub use fmm::types::{Fmm, FmmParameters};
#[doc(inline)]
pub use kernel::helmholtz::HelmholtzKernel;
#[doc(inline)]
pub use kernel::laplace::LaplaceKernel;
#[doc(inline)]
pub use tree::types::{Body, Bounds};
