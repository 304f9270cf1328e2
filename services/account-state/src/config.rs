//! Service configuration

use std::time::Duration;

/// Tunables for the account-state service.
#[derive(Debug, Clone)]
pub struct AccountServiceConfig {
    /// Upper bound on open orders plus queued placements per account.
    pub max_active_orders: usize,
    /// Interval between websocket diff flushes.
    pub ws_diff_interval: Duration,
    /// Deadline for a whole batch-cancel round.
    pub batch_cancel_timeout: Duration,
    /// An expiry timer that fires within this distance of the order's
    /// expiration cancels it; earlier firings reschedule.
    pub expiration_threshold: Duration,
    /// Deadline for a single spendable-balance ask.
    pub balance_request_timeout: Duration,
}

impl Default for AccountServiceConfig {
    fn default() -> Self {
        Self {
            max_active_orders: 200,
            ws_diff_interval: Duration::from_millis(100),
            batch_cancel_timeout: Duration::from_secs(20),
            expiration_threshold: Duration::from_millis(50),
            balance_request_timeout: Duration::from_secs(5),
        }
    }
}
