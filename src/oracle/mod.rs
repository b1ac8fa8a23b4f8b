//! AI 方向决策
//!
//! `DecisionOracle` 把最近的K线（按时间升序，最后一根最新）映射为开仓方向。
pub mod heuristic;
pub mod openai;

pub use heuristic::HeuristicOracle;
pub use openai::OpenAiCompatOracle;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::core::config::AiConfig;
use crate::core::error::TradingError;
use crate::core::types::{Candle, Side};

/// 决策服务边界错误
#[derive(Error, Debug)]
pub enum OracleError {
    #[error("网络请求错误: {0}")]
    NetworkError(String),

    #[error("请求超时 ({timeout_ms}ms)")]
    Timeout { timeout_ms: u64 },

    #[error("API错误: HTTP {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("响应格式无效: {0}")]
    InvalidResponse(String),

    #[error("无法解析决策: {0:?}")]
    UnparseableDecision(String),
}

impl From<OracleError> for TradingError {
    fn from(e: OracleError) -> Self {
        TradingError::OracleUnavailableError(e.to_string())
    }
}

/// 方向决策服务
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    fn name(&self) -> &str;

    /// 根据K线给出 long / short
    async fn decide(&self, instrument: &str, candles: &[Candle]) -> Result<Side, OracleError>;
}

/// 解析模型回复：恰好出现 long/short（或 做多/做空）之一才算有效
pub fn parse_decision(content: &str) -> Result<Side, OracleError> {
    let text = content.trim().to_lowercase();
    let long = text.contains("long") || text.contains("做多");
    let short = text.contains("short") || text.contains("做空");

    match (long, short) {
        (true, false) => Ok(Side::Long),
        (false, true) => Ok(Side::Short),
        _ => Err(OracleError::UnparseableDecision(content.trim().to_string())),
    }
}

/// 按配置创建决策服务；没有 API Key 时退回动量启发式
pub fn build_oracle(
    config: &AiConfig,
    timeout: Duration,
) -> Result<Arc<dyn DecisionOracle>, TradingError> {
    let api_key = config
        .api_key
        .as_ref()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty());

    match (config.provider.to_lowercase().as_str(), api_key) {
        ("heuristic", _) => {
            log::info!("🧭 使用动量启发式决策");
            Ok(Arc::new(HeuristicOracle::default()))
        }
        (_, None) => {
            log::warn!("⚠️ 未配置 AI API Key，改用动量启发式决策");
            Ok(Arc::new(HeuristicOracle::default()))
        }
        (_, Some(key)) => {
            let oracle = OpenAiCompatOracle::new(config, key, timeout)?;
            log::info!("🤖 AI 决策服务: {} ({})", config.model, config.base_url);
            Ok(Arc::new(oracle))
        }
    }
}
