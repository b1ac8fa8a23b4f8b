use clap::{Arg, ArgAction, Command};
use okx_ai_trader::{
    core::config::{AppConfig, ExecutionOverride},
    core::error::TradingError,
    core::types::PositionScope,
    exchanges::build_gateway,
    oracle::build_oracle,
    strategies::ai_directional::{PositionLifecycleController, TradeJournal},
    utils::init_global_logger,
};
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::watch;

/// AI 请求超时上限
const ORACLE_HTTP_TIMEOUT_SECS: u64 = 30;

fn cli() -> Command {
    Command::new("okx-ai-trader")
        .version(env!("CARGO_PKG_VERSION"))
        .about("OKX 永续合约 AI 定向单仓交易")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径 (默认 CONFIG_PATH 或 config/config.yaml)"),
        )
        .arg(
            Arg::new("live")
                .long("live")
                .action(ArgAction::SetTrue)
                .conflicts_with("dry-run")
                .help("实盘下单，覆盖配置中的 dry_run"),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .action(ArgAction::SetTrue)
                .help("只模拟不下单，覆盖配置中的 dry_run"),
        )
}

#[tokio::main]
async fn main() -> ExitCode {
    // 加载 .env
    dotenv::dotenv().ok();

    let matches = cli().get_matches();
    let execution = if matches.get_flag("live") {
        Some(ExecutionOverride::Live)
    } else if matches.get_flag("dry-run") {
        Some(ExecutionOverride::DryRun)
    } else {
        None
    };
    let config_path = matches.get_one::<String>("config").map(String::as_str);

    // 日志尚未初始化，启动错误直接输出到 stderr
    let config = match AppConfig::bootstrap(config_path, execution) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {}", e);
            return ExitCode::FAILURE;
        }
    };

    let _log_handle = match init_global_logger(&config.log) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("❌ {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("❌ 启动失败: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AppConfig) -> Result<(), TradingError> {
    log::info!(
        "启动 okx-ai-trader: 环境 {:?}, {}",
        config.environment,
        if config.trading.dry_run { "干跑模式" } else { "⚠️ 实盘模式" }
    );

    let exchange = build_gateway(&config)?;
    let oracle_timeout = config
        .trading
        .poll_interval()
        .min(Duration::from_secs(ORACLE_HTTP_TIMEOUT_SECS));
    let oracle = build_oracle(&config.ai, oracle_timeout)?;
    let journal = TradeJournal::new(&config.log.orders_file);

    let controllers = match config.trading.position_scope {
        // 全账户单一持仓：一个控制器轮转全部标的
        PositionScope::Account => vec![PositionLifecycleController::rotating(
            config.instruments(),
            config.trading.clone(),
            exchange,
            oracle,
            journal,
        )?],
        PositionScope::Instrument => config
            .instruments()
            .into_iter()
            .map(|instrument| {
                PositionLifecycleController::new(
                    instrument,
                    config.trading.clone(),
                    exchange.clone(),
                    oracle.clone(),
                    journal.clone(),
                )
            })
            .collect(),
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut handles = Vec::new();
    for controller in controllers {
        let stop = stop_rx.clone();
        handles.push(tokio::spawn(async move {
            controller.run(stop).await;
        }));
    }
    log::info!(
        "✅ 已启动 {} 个控制器 (持仓范围 {:?})",
        handles.len(),
        config.trading.position_scope
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("收到停止信号，正在关闭..."),
        Err(e) => log::error!("❌ 监听 Ctrl-C 失败，立即关闭: {}", e),
    }
    let _ = stop_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            log::error!("❌ 控制器任务异常退出: {}", e);
        }
    }

    log::info!("👋 已退出");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_flags() {
        let matches = cli()
            .try_get_matches_from(["okx-ai-trader", "-c", "a.yaml", "--live"])
            .unwrap();
        assert_eq!(matches.get_one::<String>("config").unwrap(), "a.yaml");
        assert!(matches.get_flag("live"));
        assert!(!matches.get_flag("dry-run"));
    }

    #[test]
    fn test_live_and_dry_run_conflict() {
        assert!(cli()
            .try_get_matches_from(["okx-ai-trader", "--live", "--dry-run"])
            .is_err());
    }
}
