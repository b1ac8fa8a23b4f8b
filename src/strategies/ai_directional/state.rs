use chrono::{DateTime, Utc};

use super::sizer::SizePlan;
use crate::core::types::{Amount, PositionHandle, PositionState, Side};

/// 控制器正在跟踪的持仓（仅内存，重启后通过查询交易所重新接管）
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedPosition {
    pub instrument: String,
    pub side: Side,
    pub order_id: Option<String>,
    pub contracts: f64,
    /// 开仓时的可用余额，用于平仓时估算盈亏；重新接管的持仓没有这个值
    pub opened_balance: Option<Amount>,
    pub since: DateTime<Utc>,
    pub last_snapshot: Option<PositionState>,
}

impl TrackedPosition {
    pub fn opened(handle: PositionHandle, plan: &SizePlan) -> Self {
        Self {
            instrument: handle.instrument,
            side: handle.side,
            order_id: Some(handle.order_id),
            contracts: handle.contracts,
            opened_balance: Some(plan.available_balance),
            since: handle.opened_at,
            last_snapshot: None,
        }
    }

    /// 交易所上已存在的持仓
    pub fn reattached(position: PositionState) -> Self {
        Self {
            instrument: position.instrument.clone(),
            side: position.side,
            order_id: None,
            contracts: position.size,
            opened_balance: None,
            since: Utc::now(),
            last_snapshot: Some(position),
        }
    }

    pub fn is_reattached(&self) -> bool {
        self.order_id.is_none()
    }
}

/// 持仓生命周期状态
#[derive(Debug, Clone, PartialEq)]
pub enum LifecyclePhase {
    Idle,
    Deciding { attempt: u32 },
    Sizing { side: Side },
    Opening { side: Side, plan: SizePlan },
    Monitoring { tracked: TrackedPosition },
    Closing { tracked: TrackedPosition },
}

impl LifecyclePhase {
    pub fn name(&self) -> &'static str {
        match self {
            LifecyclePhase::Idle => "IDLE",
            LifecyclePhase::Deciding { .. } => "DECIDING",
            LifecyclePhase::Sizing { .. } => "SIZING",
            LifecyclePhase::Opening { .. } => "OPENING",
            LifecyclePhase::Monitoring { .. } => "MONITORING",
            LifecyclePhase::Closing { .. } => "CLOSING",
        }
    }
}

impl Default for LifecyclePhase {
    fn default() -> Self {
        LifecyclePhase::Idle
    }
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// 一次状态转换后是否需要等待一个轮询间隔
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pause {
    None,
    PollInterval,
}
