//! 统一日志管理：控制台 + logs/operations.log（按大小轮转）
use crate::core::error::TradingError;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::config::{Appender, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

fn default_level() -> String {
    "INFO".to_string()
}

fn default_root_dir() -> String {
    "logs".to_string()
}

fn default_max_file_size_mb() -> u64 {
    10
}

fn default_retention_files() -> u32 {
    5
}

fn default_console_output() -> bool {
    true
}

fn default_format() -> String {
    "[{d(%Y-%m-%d %H:%M:%S%.3f)}] [{l}] [{t}] {m}{n}".to_string()
}

fn default_orders_file() -> String {
    "logs/orders.md".to_string()
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    /// 轮转保留的历史文件数
    #[serde(default = "default_retention_files")]
    pub retention_files: u32,
    #[serde(default = "default_console_output")]
    pub console_output: bool,
    #[serde(default = "default_format")]
    pub format: String,
    /// 开平仓记录(Markdown 表格)
    #[serde(default = "default_orders_file")]
    pub orders_file: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            root_dir: default_root_dir(),
            max_file_size_mb: default_max_file_size_mb(),
            retention_files: default_retention_files(),
            console_output: default_console_output(),
            format: default_format(),
            orders_file: default_orders_file(),
        }
    }
}

impl LogConfig {
    /// 获取日志级别
    pub fn level_filter(&self) -> LevelFilter {
        match self.level.to_uppercase().as_str() {
            "TRACE" => LevelFilter::Trace,
            "DEBUG" => LevelFilter::Debug,
            "INFO" => LevelFilter::Info,
            "WARN" | "WARNING" => LevelFilter::Warn,
            "ERROR" => LevelFilter::Error,
            "OFF" => LevelFilter::Off,
            _ => LevelFilter::Info,
        }
    }

    pub fn operations_log_path(&self) -> String {
        format!("{}/operations.log", self.root_dir)
    }
}

/// 构建 log4rs 配置（不安装全局 logger）
pub fn build_log_config(config: &LogConfig) -> Result<log4rs::Config, TradingError> {
    let setup_err = |e: String| TradingError::ConfigurationError(format!("日志初始化失败: {}", e));

    if !Path::new(&config.root_dir).exists() {
        fs::create_dir_all(&config.root_dir).map_err(|e| setup_err(e.to_string()))?;
    }

    let roll_pattern = format!("{}/operations.{{}}.log", config.root_dir);
    let roller = FixedWindowRoller::builder()
        .build(&roll_pattern, config.retention_files.max(1))
        .map_err(|e| setup_err(e.to_string()))?;
    let trigger = SizeTrigger::new(config.max_file_size_mb.max(1) * 1024 * 1024);
    let policy = CompoundPolicy::new(Box::new(trigger), Box::new(roller));

    let operations = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(&config.format)))
        .build(config.operations_log_path(), Box::new(policy))
        .map_err(|e| setup_err(e.to_string()))?;

    let mut builder = log4rs::Config::builder()
        .appender(Appender::builder().build("operations", Box::new(operations)))
        // HTTP 库的调试输出太多
        .logger(Logger::builder().build("hyper", LevelFilter::Warn))
        .logger(Logger::builder().build("reqwest", LevelFilter::Warn));

    let mut root = Root::builder().appender("operations");

    if config.console_output {
        let console = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new(&config.format)))
            .build();
        builder = builder.appender(Appender::builder().build("console", Box::new(console)));
        root = root.appender("console");
    }

    builder
        .build(root.build(config.level_filter()))
        .map_err(|e| setup_err(e.to_string()))
}

/// 初始化全局日志器
pub fn init_global_logger(config: &LogConfig) -> Result<log4rs::Handle, TradingError> {
    let log_config = build_log_config(config)?;
    log4rs::init_config(log_config)
        .map_err(|e| TradingError::ConfigurationError(format!("日志初始化失败: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter_parsing() {
        let mut config = LogConfig::default();
        assert_eq!(config.level_filter(), LevelFilter::Info);

        config.level = "debug".to_string();
        assert_eq!(config.level_filter(), LevelFilter::Debug);

        config.level = "warning".to_string();
        assert_eq!(config.level_filter(), LevelFilter::Warn);

        config.level = "verbose".to_string();
        assert_eq!(config.level_filter(), LevelFilter::Info);
    }

    #[test]
    fn test_build_creates_log_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nested/logs");
        let config = LogConfig {
            root_dir: root.to_string_lossy().to_string(),
            console_output: false,
            ..LogConfig::default()
        };

        assert!(build_log_config(&config).is_ok());
        assert!(root.exists());
    }
}
