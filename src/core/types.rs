use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, crate::core::error::ExchangeError>;

/// 计价货币(USDT)金额，构造后保证非负
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Amount(f64);

impl Amount {
    /// 负数和非有限值一律截断为 0
    pub fn new(value: f64) -> Self {
        if value.is_finite() && value > 0.0 {
            Amount(value)
        } else {
            Amount(0.0)
        }
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 <= 0.0
    }

    pub fn min(self, other: Amount) -> Amount {
        if self.0 <= other.0 {
            self
        } else {
            other
        }
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}

/// 开仓方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }

    /// OKX 下单方向
    pub fn order_side(&self) -> &'static str {
        match self {
            Side::Long => "buy",
            Side::Short => "sell",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 保证金模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Cross,
    Isolated,
}

impl MarginMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarginMode::Cross => "cross",
            MarginMode::Isolated => "isolated",
        }
    }
}

impl Default for MarginMode {
    fn default() -> Self {
        MarginMode::Cross
    }
}

/// 单一持仓约束的范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionScope {
    /// 整个账户同时最多一个持仓，按顺序轮转标的
    Account,
    /// 每个标的独立循环，各自最多一个持仓
    Instrument,
}

impl Default for PositionScope {
    fn default() -> Self {
        PositionScope::Account
    }
}

/// 运行环境
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Demo,
    Prod,
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Demo
    }
}

/// 账户持仓模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionMode {
    /// 单向净持仓
    Net,
    /// 双向持仓
    LongShort,
}

/// K线，序列统一按时间升序排列(最新一根在最后)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// K线回看窗口，默认 60 根 1 分钟K线
#[derive(Debug, Clone, PartialEq)]
pub struct CandleLookback {
    pub bar: String,
    pub limit: u32,
}

impl Default for CandleLookback {
    fn default() -> Self {
        Self {
            bar: "1m".to_string(),
            limit: 60,
        }
    }
}

/// 交易所持仓快照，只读，每次轮询重新获取
#[derive(Debug, Clone, PartialEq)]
pub struct PositionState {
    pub instrument: String,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_ratio: f64,
    pub is_open: bool,
}

/// 下单成功后的持仓句柄
#[derive(Debug, Clone, PartialEq)]
pub struct PositionHandle {
    pub order_id: String,
    pub instrument: String,
    pub side: Side,
    pub contracts: f64,
    pub opened_at: DateTime<Utc>,
}

/// 合约张数约束
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ContractLimits {
    /// 固定张数，优先级最高
    pub fixed_contracts: Option<u64>,
    /// 张数上限
    pub max_contracts: Option<u64>,
}

/// 开仓请求：名义本金与杠杆意图，张数换算由交易所网关完成
#[derive(Debug, Clone, PartialEq)]
pub struct OpenPositionRequest {
    pub instrument: String,
    pub side: Side,
    pub notional: Amount,
    pub leverage: u32,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub margin_mode: MarginMode,
    pub limits: ContractLimits,
}
