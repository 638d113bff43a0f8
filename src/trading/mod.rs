pub mod eod;
pub mod ladder;
pub mod order_log;
pub mod order_manager;
pub mod session_state;

pub use eod::EodReconciler;
pub use ladder::compute_exit_ladder;
pub use order_log::{OrderLog, OrderLogRow};
pub use order_manager::{OrderManager, OrderManagerSettings, SubmitOutcome, TickOutcome};
pub use session_state::{SessionState, SharedSessionState};
