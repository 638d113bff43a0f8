pub mod rules;
pub mod signals;

pub use rules::RuleGate;
pub use signals::{Decision, OrderRequest, RefusalReason};
