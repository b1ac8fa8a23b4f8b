use crate::core::error::TradingError;
use crate::core::types::Amount;

/// 单次开仓的资金计划
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizePlan {
    /// 实际投入的本金（未乘杠杆）
    pub notional: Amount,
    pub leverage: u32,
    /// 计算时的可用余额
    pub available_balance: Amount,
}

impl SizePlan {
    /// 名义敞口 = 本金 × 杠杆
    pub fn exposure(&self) -> f64 {
        self.notional.value() * self.leverage as f64
    }

    /// 余额不足配置本金时退化为全仓
    pub fn uses_full_balance(&self) -> bool {
        self.notional == self.available_balance
    }
}

/// 根据可用余额和配置本金计算开仓本金
///
/// 合约张数的换算交给交易所网关，这里只输出本金和杠杆意图。
#[derive(Debug, Clone, Copy, Default)]
pub struct PositionSizer;

impl PositionSizer {
    pub fn new() -> Self {
        Self
    }

    pub fn compute_size(
        &self,
        available_balance: Amount,
        configured_notional: Amount,
        leverage: u32,
    ) -> Result<SizePlan, TradingError> {
        if available_balance.is_zero() {
            return Err(TradingError::InsufficientFundsError {
                available: available_balance.value(),
            });
        }

        let notional = available_balance.min(configured_notional);
        if notional < configured_notional {
            log::warn!(
                "⚠️ 可用余额 {} 低于配置本金 {}，使用全部余额开仓",
                available_balance,
                configured_notional
            );
        }

        Ok(SizePlan {
            notional,
            leverage: leverage.max(1),
            available_balance,
        })
    }
}
