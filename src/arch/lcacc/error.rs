use thiserror::Error;

use super::tlb::TlbError;

/// Caller bugs the DMA controller refuses instead of trying to recover from.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DmaError {
  #[error("{side} region has {sizes} sizes but {strides} strides")]
  DimensionMismatch {
    side: &'static str,
    sizes: usize,
    strides: usize,
  },
  #[error("element size must be non-zero")]
  ZeroElementSize,
  #[error("already hooked to memory controller {0}")]
  AlreadyHooked(String),
  #[error("page size {0} is not a power of two")]
  BadPageSize(u64),
  #[error(transparent)]
  Tlb(#[from] TlbError),
}
