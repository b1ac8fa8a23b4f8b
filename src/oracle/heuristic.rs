use async_trait::async_trait;

use super::{DecisionOracle, OracleError};
use crate::core::types::{Candle, Side};

const DEFAULT_WINDOW: usize = 30;

/// 动量启发式：最近 N 根收盘价上涨做多，否则做空
pub struct HeuristicOracle {
    window: usize,
}

impl HeuristicOracle {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(2),
        }
    }
}

impl Default for HeuristicOracle {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

#[async_trait]
impl DecisionOracle for HeuristicOracle {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn decide(&self, instrument: &str, candles: &[Candle]) -> Result<Side, OracleError> {
        let recent = &candles[candles.len().saturating_sub(self.window)..];
        let (first, last) = match (recent.first(), recent.last()) {
            (Some(first), Some(last)) if recent.len() >= 2 => (first.close, last.close),
            _ => {
                return Err(OracleError::InvalidResponse(format!(
                    "{} K线不足，无法判断动量 ({} 根)",
                    instrument,
                    candles.len()
                )))
            }
        };

        let side = if last > first { Side::Long } else { Side::Short };
        log::debug!(
            "🧭 {} 动量判断: {:.4} -> {:.4} => {}",
            instrument,
            first,
            last,
            side
        );
        Ok(side)
    }
}
