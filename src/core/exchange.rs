use crate::core::types::{
    Amount, Candle, CandleLookback, MarginMode, OpenPositionRequest, PositionHandle,
    PositionState, Result,
};
use async_trait::async_trait;

/// 交易所网关：控制器只依赖这六项能力
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// 网关名称
    fn name(&self) -> &str;

    /// 获取可用USDT余额
    async fn get_available_balance(&self) -> Result<Amount>;

    /// 设置杠杆与保证金模式
    async fn set_leverage(
        &self,
        instrument: &str,
        leverage: u32,
        margin_mode: MarginMode,
    ) -> Result<()>;

    /// 获取最近K线，按时间升序返回
    async fn get_recent_candles(
        &self,
        instrument: &str,
        lookback: &CandleLookback,
    ) -> Result<Vec<Candle>>;

    /// 市价开仓，止盈止损随单附带
    async fn open_position(&self, request: &OpenPositionRequest) -> Result<PositionHandle>;

    /// 查询标的当前持仓，无持仓返回 None
    async fn get_open_position(&self, instrument: &str) -> Result<Option<PositionState>>;

    /// 查询账户下全部永续合约持仓
    async fn get_open_positions(&self) -> Result<Vec<PositionState>>;
}
