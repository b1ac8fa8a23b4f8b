//! AI 定向单仓策略
//!
//! 决策 → 计算仓位 → 开仓 → 监控 → 平仓，循环往复；同一标的任何时刻最多一个持仓。
pub mod controller;
pub mod journal;
pub mod sizer;
pub mod state;

#[cfg(test)]
mod testing;

pub use controller::PositionLifecycleController;
pub use journal::{JournalEntry, JournalEvent, TradeJournal};
pub use sizer::{PositionSizer, SizePlan};
pub use state::{LifecyclePhase, Pause, TrackedPosition};
