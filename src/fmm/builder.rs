//! Builder for FMM instances.
use crate::fmm::types::{Fmm, FmmParameters};
use crate::traits::general::RealScalar;
use crate::traits::kernel::Kernel;
use crate::tree::constants::DEEPEST_LEVEL;
use crate::tree::types::{Body, Octree};

/// Step-by-step configuration of an [`Fmm`] instance.
///
/// Invalid configurations are rejected here, before any collective or any
/// kernel table is touched.
pub struct FmmBuilder<T, K>
where
    T: RealScalar,
    K: Kernel<T>,
{
    kernel: Option<K>,
    bodies: Option<Vec<Body<T, K::Value>>>,
    params: FmmParameters<T>,
}

impl<T, K> Default for FmmBuilder<T, K>
where
    T: RealScalar,
    K: Kernel<T>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, K> FmmBuilder<T, K>
where
    T: RealScalar,
    K: Kernel<T>,
{
    /// An empty builder with default parameters.
    pub fn new() -> Self {
        Self {
            kernel: None,
            bodies: None,
            params: FmmParameters::default(),
        }
    }

    /// Associate the equation kernel.
    pub fn kernel(mut self, kernel: K) -> Self {
        self.kernel = Some(kernel);
        self
    }

    /// Ingest the rank-local bodies. Identities are preserved; an empty set
    /// is legal and produces an empty tree at solve time.
    pub fn bodies(mut self, bodies: Vec<Body<T, K::Value>>) -> Self {
        self.bodies = Some(bodies);
        self
    }

    /// Set the runtime parameters, validated eagerly.
    pub fn parameters(mut self, params: FmmParameters<T>) -> Result<Self, std::io::Error> {
        if !(params.theta > T::zero() && params.theta <= T::one()) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "theta must lie in (0, 1]",
            ));
        }
        if params.ncrit == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "ncrit must be positive",
            ));
        }
        if params.nspawn == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "nspawn must be positive",
            ));
        }
        if params.max_level > DEEPEST_LEVEL {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "max_level exceeds the key width",
            ));
        }
        self.params = params;
        Ok(self)
    }

    /// Finalize into an evaluable FMM.
    pub fn build(self) -> Result<Fmm<T, K>, std::io::Error> {
        let kernel = self.kernel.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "a kernel must be supplied before building",
            )
        })?;
        let bodies = self.bodies.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "bodies must be supplied before building",
            )
        })?;
        Ok(Fmm {
            kernel,
            params: self.params,
            bodies,
            tree: Octree::default(),
            multipoles: Vec::new(),
            locals: Vec::new(),
            potentials: Vec::new(),
            global_bounds: None,
            operator_times: Vec::new(),
            communication_times: Vec::new(),
        })
    }
}
