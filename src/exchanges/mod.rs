// 交易所实现
pub mod okx;
pub mod paper;

pub use okx::OkxGateway;
pub use paper::PaperExchange;

use std::sync::Arc;

use crate::core::config::AppConfig;
use crate::core::error::TradingError;
use crate::core::exchange::ExchangeGateway;

/// 按配置创建交易所网关：有凭证走 OKX，干跑且无凭证走纸面网关
pub fn build_gateway(config: &AppConfig) -> Result<Arc<dyn ExchangeGateway>, TradingError> {
    match config.okx.credentials() {
        Some(keys) => {
            let gateway = OkxGateway::new(
                keys,
                config.environment,
                &config.okx.base_url,
                config.trading.call_timeout(),
            )?;
            log::info!(
                "🔗 OKX 网关: {} ({:?})",
                config.okx.base_url,
                config.environment
            );
            Ok(Arc::new(gateway))
        }
        None if config.trading.dry_run => {
            log::warn!("⚠️ 未配置 OKX 凭证，干跑使用离线纸面网关");
            Ok(Arc::new(PaperExchange::new()))
        }
        None => Err(TradingError::ConfigurationError(
            "实盘模式需要完整的 OKX 凭证".to_string(),
        )),
    }
}
