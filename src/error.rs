use thiserror::Error;

/// Errors surfaced by the encode/decode entry points.
///
/// Numeric edge cases (zero-energy bands, degenerate budgets) never show up
/// here; they are clamped where they occur. Only structural failures reach
/// the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The decoder consumed more bits than the packet contains, or hit an
    /// out-of-range symbol. The frame output is already concealed (zeroed
    /// bands) by the time this is reported.
    #[error("corrupted or truncated stream")]
    MalformedStream,

    /// The encoder's output buffer cannot hold the terminated range-coder
    /// stream. Fatal for this encode call only.
    #[error("output buffer too small")]
    BufferOverflow,

    /// Unsupported frame size / channel count / parameter combination,
    /// rejected up front rather than mid-frame.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(&'static str),

    /// The bit budget cannot satisfy even the minimum allocation. Internal
    /// to the allocator contract: the public API absorbs this into the
    /// degenerate all-zero allocation instead of failing.
    #[error("bit budget below minimum allocation")]
    AllocationInfeasible,
}

pub type Result<T> = std::result::Result<T, Error>;
