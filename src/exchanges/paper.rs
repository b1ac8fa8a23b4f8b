use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;

use crate::core::{error::ExchangeError, exchange::ExchangeGateway, types::*};

const PAPER_BALANCE_USDT: f64 = 1000.0;

/// 离线纸面网关：无凭证干跑时使用，不发任何网络请求
///
/// 余额固定、K线为随机游走、永远没有持仓，下单直接拒绝。
pub struct PaperExchange {
    balance: Amount,
}

impl PaperExchange {
    pub fn new() -> Self {
        Self {
            balance: Amount::new(PAPER_BALANCE_USDT),
        }
    }

    fn seed_price(instrument: &str) -> f64 {
        if instrument.starts_with("BTC") {
            30_000.0
        } else {
            2_000.0
        }
    }
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

/// K线周期换算为秒，无法识别的按 1 分钟处理
fn bar_seconds(bar: &str) -> i64 {
    let (digits, unit) = bar.split_at(bar.find(|c: char| !c.is_ascii_digit()).unwrap_or(bar.len()));
    let count = digits.parse::<i64>().unwrap_or(1).max(1);
    let unit_seconds = match unit {
        "m" => 60,
        "H" | "h" => 3_600,
        "D" | "d" => 86_400,
        "W" | "w" => 604_800,
        _ => 60,
    };
    count * unit_seconds
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn get_available_balance(&self) -> Result<Amount> {
        Ok(self.balance)
    }

    async fn set_leverage(
        &self,
        instrument: &str,
        leverage: u32,
        _margin_mode: MarginMode,
    ) -> Result<()> {
        log::debug!("📝 纸面网关忽略杠杆设置: {} {}x", instrument, leverage);
        Ok(())
    }

    async fn get_recent_candles(
        &self,
        instrument: &str,
        lookback: &CandleLookback,
    ) -> Result<Vec<Candle>> {
        let step = bar_seconds(&lookback.bar);
        let limit = lookback.limit as i64;
        let start = Utc::now() - ChronoDuration::seconds(step * limit);
        let mut price = Self::seed_price(instrument);
        let mut rng = rand::thread_rng();

        let candles = (0..limit)
            .map(|i| {
                let drift = (rng.gen::<f64>() - 0.5) * 0.002;
                price = (price * (1.0 + drift)).max(1.0);
                Candle {
                    timestamp: start + ChronoDuration::seconds(step * (i + 1)),
                    open: price * (1.0 - 0.0005),
                    high: price * (1.0 + 0.001),
                    low: price * (1.0 - 0.001),
                    close: price,
                    volume: 0.0,
                }
            })
            .collect();

        Ok(candles)
    }

    async fn open_position(&self, request: &OpenPositionRequest) -> Result<PositionHandle> {
        Err(ExchangeError::NotSupported(format!(
            "纸面网关不能下单: {} {}",
            request.instrument, request.side
        )))
    }

    async fn get_open_position(&self, _instrument: &str) -> Result<Option<PositionState>> {
        Ok(None)
    }

    async fn get_open_positions(&self) -> Result<Vec<PositionState>> {
        Ok(Vec::new())
    }
}
