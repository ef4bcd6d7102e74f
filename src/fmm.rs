//! The FMM driver: builder, expansion passes, traversal, partitioning,
//! distributed exchange and orchestration.
pub mod builder;
pub mod eval;
pub mod exchange;
pub mod helpers;
#[cfg(feature = "mpi")]
pub mod multi_node;
pub mod partition;
pub mod passes;
pub mod traversal;
pub mod types;
