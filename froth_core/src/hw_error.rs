//! Maps `Box<dyn Error>` from trait boundaries to typed `FrothError`.
//!
//! The traits in `froth_traits` use `Box<dyn Error + Send + Sync>` so any
//! backend can plug in; this module converts those to our typed error enum,
//! with an optional feature-gated path for `froth_hardware::HwError`
//! downcasting.

use crate::error::FrothError;

/// Map a trait-boundary error to a typed `FrothError`.
///
/// Attempts to downcast known hardware error types first, then falls back
/// to string-based heuristics.
pub fn map_hw_error(e: &(dyn std::error::Error + 'static)) -> FrothError {
    #[cfg(feature = "hardware-errors")]
    {
        if let Some(hw) = e.downcast_ref::<froth_hardware::error::HwError>() {
            return match hw {
                froth_hardware::error::HwError::Timeout => FrothError::Timeout,
                other => FrothError::Hardware(other.to_string()),
            };
        }
    }

    let s = e.to_string();
    if s.to_lowercase().contains("timeout") || s.to_lowercase().contains("timed out") {
        FrothError::Timeout
    } else {
        FrothError::Hardware(s)
    }
}
