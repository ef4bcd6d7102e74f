//! Utility types for trait definitions.
use std::{
    fmt,
    time::{Duration, Instant},
};

/// Type to handle FMM related errors
#[derive(Debug)]
pub enum FmmError {
    /// Failure to run some business logic
    Failed(String),

    /// Unimplemented section
    Unimplemented(String),

    /// I/O failure
    Io(std::io::Error),
}

/// Enumeration of operator phases for timing
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub enum FmmOperatorType {
    /// P2M at the leaves and M2M up to the root
    UpwardPass,

    /// Dual tree traversal, list formation
    Traversal,

    /// Multipole to local translation of the far field lists
    M2L,

    /// Direct evaluation of the near field lists
    P2P,

    /// Far field of periodic image shells
    PeriodicFarField,

    /// L2L from the root and L2P at the leaves
    DownwardPass,

    /// Reference all-pairs evaluation
    Direct,
}

/// Enumeration of communication types for timing
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub enum CommunicationType {
    /// Global bounds reduction
    Bounds,

    /// Recursive bisection of bodies over ranks
    Partition,

    /// Body exchange to owning ranks
    BodyExchange,

    /// Locally essential tree exchange
    CellExchange,
}

/// Wall time attributed to a single FMM operator
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct FmmOperatorTime {
    /// Operator name
    pub operator: FmmOperatorType,

    /// Time in milliseconds
    pub time: u64,
}

/// Wall time attributed to a single collective operation
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct CommunicationTime {
    /// Operator name
    pub operator: CommunicationType,

    /// Time in milliseconds
    pub time: u64,
}

impl FmmOperatorTime {
    /// Constructor
    pub fn new(operator: FmmOperatorType, time: u64) -> Self {
        Self { operator, time }
    }

    /// Constructor from instant
    pub fn from_instant(operator: FmmOperatorType, time: Instant) -> Self {
        let time = time.elapsed().as_millis() as u64;
        Self { operator, time }
    }

    /// Constructor from duration
    pub fn from_duration(operator: FmmOperatorType, time: Duration) -> Self {
        Self {
            operator,
            time: time.as_millis() as u64,
        }
    }
}

impl CommunicationTime {
    /// Constructor
    pub fn new(operator: CommunicationType, time: u64) -> Self {
        Self { operator, time }
    }

    /// Constructor from instant
    pub fn from_instant(operator: CommunicationType, time: Instant) -> Self {
        let time = time.elapsed().as_millis() as u64;
        Self { operator, time }
    }

    /// Constructor from duration
    pub fn from_duration(operator: CommunicationType, time: Duration) -> Self {
        Self {
            operator,
            time: time.as_millis() as u64,
        }
    }
}

impl fmt::Display for FmmOperatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FmmOperatorType::UpwardPass => write!(f, "Upward Pass"),
            FmmOperatorType::Traversal => write!(f, "Traversal"),
            FmmOperatorType::M2L => write!(f, "M2L"),
            FmmOperatorType::P2P => write!(f, "P2P"),
            FmmOperatorType::PeriodicFarField => write!(f, "Periodic Far Field"),
            FmmOperatorType::DownwardPass => write!(f, "Downward Pass"),
            FmmOperatorType::Direct => write!(f, "Direct"),
        }
    }
}

impl fmt::Display for CommunicationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommunicationType::Bounds => write!(f, "Bounds"),
            CommunicationType::Partition => write!(f, "Partition"),
            CommunicationType::BodyExchange => write!(f, "Body Exchange"),
            CommunicationType::CellExchange => write!(f, "Cell Exchange"),
        }
    }
}

impl std::fmt::Display for FmmOperatorTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Operator: {}, Time: {} ms", self.operator, self.time)
    }
}

impl std::fmt::Display for CommunicationTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Communication Type: {}, Time: {} ms",
            self.operator, self.time
        )
    }
}

impl std::fmt::Display for FmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FmmError::Failed(e) => write!(f, "Failed: {}", e),
            FmmError::Unimplemented(e) => write!(f, "Unimplemented: {}", e),
            FmmError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for FmmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FmmError::Io(e) => Some(e),
            FmmError::Failed(_e) => None,
            FmmError::Unimplemented(_e) => None,
        }
    }
}
