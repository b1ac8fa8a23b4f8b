// 核心模块 - 领域类型、配置、错误与交易所抽象
pub mod config;
pub mod error;
pub mod exchange;
pub mod retry_policy;
pub mod types;

pub use self::config::*;
pub use self::error::*;
pub use self::exchange::*;
pub use self::types::{
    Amount, Candle, CandleLookback, ContractLimits, Environment, MarginMode, OpenPositionRequest,
    PositionHandle, PositionMode, PositionState, Side,
};
