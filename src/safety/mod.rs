//! Trading-mode gate
//!
//! Only paper trading is wired. Live mode exists in configuration but every entry
//! point refuses it through [`ensure_paper_mode`].

use crate::config::{AppConfig, TradingMode};
use crate::error::{QuoteflowError, Result};

/// Always false; there is no live execution path
#[inline]
pub fn live_trading_allowed() -> bool {
    false
}

/// Single enforcement gate checked before any broker client is built
pub fn ensure_paper_mode(config: &AppConfig) -> Result<()> {
    if config.trading.mode == TradingMode::Paper || live_trading_allowed() {
        return Ok(());
    }
    Err(QuoteflowError::Validation(
        "trading.mode = \"live\" is disabled; only paper trading is supported".to_string(),
    ))
}
