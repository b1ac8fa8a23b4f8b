// 策略模块
pub mod ai_directional;

pub use ai_directional::{PositionLifecycleController, PositionSizer, TradeJournal};
