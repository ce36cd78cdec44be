//! Kernel-specific error types.

use mnemos_types::error::MnemosError;
use thiserror::Error;

/// Kernel error type wrapping MnemosError with kernel-specific context.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A wrapped MnemosError.
    #[error(transparent)]
    Mnemos(#[from] MnemosError),

    /// The kernel failed to boot.
    #[error("Boot failed: {0}")]
    BootFailed(String),
}

impl From<KernelError> for MnemosError {
    fn from(e: KernelError) -> Self {
        match e {
            KernelError::Mnemos(inner) => inner,
            KernelError::BootFailed(msg) => MnemosError::Internal(format!("boot failed: {msg}")),
        }
    }
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;
