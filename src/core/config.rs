use crate::core::error::TradingError;
use crate::core::types::{CandleLookback, ContractLimits, Environment, MarginMode, PositionScope};
use crate::utils::unified_logger::LogConfig;
use config::{Config as ConfigLoader, ConfigBuilder, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";

/// 通用环境变量前缀，例如 TRADER_TRADING__POLL_INTERVAL_SEC=15
const ENV_PREFIX: &str = "TRADER";

fn default_poll_interval_sec() -> u64 {
    30
}

fn default_leverage() -> u32 {
    100
}

fn default_tp_percent() -> f64 {
    0.02
}

fn default_sl_percent() -> f64 {
    0.01
}

fn default_base_notional_usdt() -> f64 {
    10.0
}

fn default_true() -> bool {
    true
}

fn default_candle_bar() -> String {
    "1m".to_string()
}

fn default_candle_limit() -> u32 {
    60
}

fn default_request_timeout_sec() -> u64 {
    10
}

fn default_ai_provider() -> String {
    "openai".to_string()
}

fn default_ai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_ai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_ai_temperature() -> f32 {
    0.2
}

fn default_ai_max_tokens() -> u32 {
    4
}

fn default_ai_max_candles() -> usize {
    120
}

fn default_okx_base_url() -> String {
    "https://www.okx.com".to_string()
}

/// 应用顶层配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub instruments: Vec<InstrumentSettings>,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub okx: OkxConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// 全局交易参数与默认值
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    #[serde(default = "default_poll_interval_sec")]
    pub poll_interval_sec: u64,
    #[serde(default = "default_leverage")]
    pub default_leverage: u32,
    #[serde(default = "default_tp_percent")]
    pub default_tp_percent: f64,
    #[serde(default = "default_sl_percent")]
    pub default_sl_percent: f64,
    #[serde(default = "default_base_notional_usdt")]
    pub base_notional_usdt: f64,
    #[serde(default)]
    pub margin_mode: MarginMode,
    #[serde(default = "default_true")]
    pub dry_run: bool,
    /// account: 全账户单一持仓并轮转标的；instrument: 每个标的独立循环
    #[serde(default)]
    pub position_scope: PositionScope,
    /// 全局合约张数上限（标的未单独设置时生效）
    #[serde(default)]
    pub max_contracts: Option<u64>,
    #[serde(default = "default_candle_bar")]
    pub candle_bar: String,
    #[serde(default = "default_candle_limit")]
    pub candle_limit: u32,
    /// 单次API调用超时，实际取值不超过轮询间隔
    #[serde(default = "default_request_timeout_sec")]
    pub request_timeout_sec: u64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            poll_interval_sec: default_poll_interval_sec(),
            default_leverage: default_leverage(),
            default_tp_percent: default_tp_percent(),
            default_sl_percent: default_sl_percent(),
            base_notional_usdt: default_base_notional_usdt(),
            margin_mode: MarginMode::default(),
            dry_run: true,
            position_scope: PositionScope::default(),
            max_contracts: None,
            candle_bar: default_candle_bar(),
            candle_limit: default_candle_limit(),
            request_timeout_sec: default_request_timeout_sec(),
        }
    }
}

impl TradingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_sec)
    }

    /// 单次调用超时：min(request_timeout_sec, poll_interval_sec)
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_sec.min(self.poll_interval_sec).max(1))
    }

    pub fn lookback(&self) -> CandleLookback {
        CandleLookback {
            bar: self.candle_bar.clone(),
            limit: self.candle_limit,
        }
    }
}

/// 单个标的的个性化配置（原始形式，未填充默认值）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstrumentSettings {
    pub inst_id: String,
    #[serde(default)]
    pub leverage: Option<u32>,
    #[serde(default)]
    pub tp_percent: Option<f64>,
    #[serde(default)]
    pub sl_percent: Option<f64>,
    #[serde(default)]
    pub base_notional_usdt: Option<f64>,
    #[serde(default)]
    pub fixed_contracts: Option<u64>,
    #[serde(default)]
    pub max_contracts: Option<u64>,
}

/// 填充默认值后的标的配置，加载后不可变
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentConfig {
    pub inst_id: String,
    pub leverage: u32,
    pub tp_percent: f64,
    pub sl_percent: f64,
    pub base_notional_usdt: f64,
    pub limits: ContractLimits,
}

/// AI 决策服务配置（OpenAI 兼容接口）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default = "default_ai_provider")]
    pub provider: String,
    #[serde(default = "default_ai_base_url")]
    pub base_url: String,
    #[serde(default = "default_ai_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_ai_temperature")]
    pub temperature: f32,
    #[serde(default = "default_ai_max_tokens")]
    pub max_tokens: u32,
    /// 发送给模型的最大K线根数
    #[serde(default = "default_ai_max_candles")]
    pub max_candles: usize,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: default_ai_provider(),
            base_url: default_ai_base_url(),
            model: default_ai_model(),
            api_key: None,
            temperature: default_ai_temperature(),
            max_tokens: default_ai_max_tokens(),
            max_candles: default_ai_max_candles(),
        }
    }
}

/// OKX 接入配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkxConfig {
    #[serde(default = "default_okx_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
}

impl Default for OkxConfig {
    fn default() -> Self {
        Self {
            base_url: default_okx_base_url(),
            api_key: None,
            api_secret: None,
            passphrase: None,
        }
    }
}

impl OkxConfig {
    /// 三项凭证齐全时返回 API 密钥
    pub fn credentials(&self) -> Option<ApiKeys> {
        let non_empty = |v: &Option<String>| v.as_ref().filter(|s| !s.trim().is_empty()).cloned();

        Some(ApiKeys {
            api_key: non_empty(&self.api_key)?,
            api_secret: non_empty(&self.api_secret)?,
            passphrase: non_empty(&self.passphrase)?,
        })
    }
}

/// API密钥配置
#[derive(Debug, Clone)]
pub struct ApiKeys {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: String,
}

/// 命令行对 dry_run 的覆盖
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOverride {
    Live,
    DryRun,
}

impl AppConfig {
    /// 加载、覆盖并校验配置，任何失败都是启动期致命错误
    pub fn bootstrap(
        path: Option<&str>,
        execution: Option<ExecutionOverride>,
    ) -> Result<Self, TradingError> {
        let mut config = Self::load(path)?;
        config.apply_execution_override(execution);
        config.validate()?;
        Ok(config)
    }

    /// 从 YAML 文件与环境变量加载
    ///
    /// 路径优先级：参数 > CONFIG_PATH > config/config.yaml。
    /// 默认路径不存在时使用内置默认值，显式指定的路径不存在则报错。
    pub fn load(path: Option<&str>) -> Result<Self, TradingError> {
        let explicit = path
            .map(str::to_string)
            .or_else(|| std::env::var("CONFIG_PATH").ok());
        let required = explicit.is_some();
        let path = explicit.unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        if required && !Path::new(&path).exists() {
            return Err(TradingError::ConfigurationError(format!(
                "配置文件不存在: {}",
                path
            )));
        }

        let builder = ConfigLoader::builder()
            .add_source(File::new(&path, FileFormat::Yaml).required(required))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let builder = Self::apply_named_env_overrides(builder, |key| std::env::var(key).ok())?;
        let config: AppConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// 从 YAML 字符串加载（不读取环境变量）
    pub fn from_yaml_str(yaml: &str) -> Result<Self, TradingError> {
        let config: AppConfig = ConfigLoader::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// 兼容旧部署的具名环境变量
    fn apply_named_env_overrides<St, F>(
        builder: ConfigBuilder<St>,
        lookup: F,
    ) -> Result<ConfigBuilder<St>, TradingError>
    where
        St: config::builder::BuilderState,
        F: Fn(&str) -> Option<String>,
    {
        const MAPPINGS: [(&str, &str); 8] = [
            ("OKX_API_KEY", "okx.api_key"),
            ("OKX_API_SECRET", "okx.api_secret"),
            ("OKX_PASSPHRASE", "okx.passphrase"),
            ("OPENAI_API_KEY", "ai.api_key"),
            ("OPENAI_BASE_URL", "ai.base_url"),
            ("OPENAI_MODEL", "ai.model"),
            ("ENV", "environment"),
            ("LOG_LEVEL", "log.level"),
        ];

        let mut builder = builder;
        for (env_key, config_key) in MAPPINGS {
            let value = lookup(env_key).filter(|v| !v.trim().is_empty());
            builder = builder.set_override_option(config_key, value)?;
        }
        Ok(builder)
    }

    pub fn apply_execution_override(&mut self, execution: Option<ExecutionOverride>) {
        match execution {
            Some(ExecutionOverride::Live) => self.trading.dry_run = false,
            Some(ExecutionOverride::DryRun) => self.trading.dry_run = true,
            None => {}
        }
    }

    /// 校验全部字段，所有问题合并为一个 ConfigurationError
    pub fn validate(&self) -> Result<(), TradingError> {
        let mut problems = Vec::new();
        let t = &self.trading;

        if t.poll_interval_sec == 0 {
            problems.push("trading.poll_interval_sec 必须大于 0".to_string());
        }
        if t.request_timeout_sec == 0 {
            problems.push("trading.request_timeout_sec 必须大于 0".to_string());
        }
        check_leverage("trading.default_leverage", t.default_leverage, &mut problems);
        check_fraction("trading.default_tp_percent", t.default_tp_percent, &mut problems);
        check_fraction("trading.default_sl_percent", t.default_sl_percent, &mut problems);
        check_notional("trading.base_notional_usdt", t.base_notional_usdt, &mut problems);
        check_contracts("trading.max_contracts", t.max_contracts, &mut problems);
        if t.candle_bar.trim().is_empty() {
            problems.push("trading.candle_bar 不能为空".to_string());
        }
        if t.candle_limit == 0 || t.candle_limit > 300 {
            problems.push(format!(
                "trading.candle_limit 必须在 1..=300 之间，当前 {}",
                t.candle_limit
            ));
        }

        if self.instruments.is_empty() {
            problems.push("配置中缺少 instruments".to_string());
        }
        let mut seen = HashSet::new();
        for (idx, inst) in self.instruments.iter().enumerate() {
            let id = inst.inst_id.trim();
            if id.is_empty() {
                problems.push(format!("instruments[{}].inst_id 不能为空", idx));
                continue;
            }
            if !seen.insert(id.to_string()) {
                problems.push(format!("instruments 中 {} 重复", id));
            }
            if let Some(leverage) = inst.leverage {
                check_leverage(&format!("{}.leverage", id), leverage, &mut problems);
            }
            if let Some(tp) = inst.tp_percent {
                check_fraction(&format!("{}.tp_percent", id), tp, &mut problems);
            }
            if let Some(sl) = inst.sl_percent {
                check_fraction(&format!("{}.sl_percent", id), sl, &mut problems);
            }
            if let Some(notional) = inst.base_notional_usdt {
                check_notional(&format!("{}.base_notional_usdt", id), notional, &mut problems);
            }
            let fixed = inst.fixed_contracts;
            check_contracts(&format!("{}.fixed_contracts", id), fixed, &mut problems);
            check_contracts(&format!("{}.max_contracts", id), inst.max_contracts, &mut problems);
        }

        check_url("ai.base_url", &self.ai.base_url, &mut problems);
        check_url("okx.base_url", &self.okx.base_url, &mut problems);
        if self.ai.max_candles == 0 {
            problems.push("ai.max_candles 必须大于 0".to_string());
        }

        if !t.dry_run && self.okx.credentials().is_none() {
            problems.push(
                "实盘模式需要完整的 OKX 凭证 (OKX_API_KEY / OKX_API_SECRET / OKX_PASSPHRASE)"
                    .to_string(),
            );
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(TradingError::ConfigurationError(problems.join("; ")))
        }
    }

    /// 按标的填充默认值
    pub fn instruments(&self) -> Vec<InstrumentConfig> {
        let t = &self.trading;
        self.instruments
            .iter()
            .map(|inst| InstrumentConfig {
                inst_id: inst.inst_id.trim().to_string(),
                leverage: inst.leverage.unwrap_or(t.default_leverage),
                tp_percent: inst.tp_percent.unwrap_or(t.default_tp_percent),
                sl_percent: inst.sl_percent.unwrap_or(t.default_sl_percent),
                base_notional_usdt: inst.base_notional_usdt.unwrap_or(t.base_notional_usdt),
                limits: ContractLimits {
                    fixed_contracts: inst.fixed_contracts,
                    max_contracts: inst.max_contracts.or(t.max_contracts),
                },
            })
            .collect()
    }
}

fn check_leverage(field: &str, value: u32, problems: &mut Vec<String>) {
    if value < 1 {
        problems.push(format!("{} 必须 >= 1，当前 {}", field, value));
    }
}

fn check_fraction(field: &str, value: f64, problems: &mut Vec<String>) {
    if !(value > 0.0 && value < 1.0) {
        problems.push(format!("{} 必须在 (0, 1) 之间，当前 {}", field, value));
    }
}

fn check_notional(field: &str, value: f64, problems: &mut Vec<String>) {
    if !(value.is_finite() && value > 0.0) {
        problems.push(format!("{} 必须大于 0，当前 {}", field, value));
    }
}

fn check_contracts(field: &str, value: Option<u64>, problems: &mut Vec<String>) {
    if value == Some(0) {
        problems.push(format!("{} 必须大于 0", field));
    }
}

fn check_url(field: &str, value: &str, problems: &mut Vec<String>) {
    if let Err(e) = url::Url::parse(value) {
        problems.push(format!("{} 不是合法URL ({}): {}", field, value, e));
    }
}
