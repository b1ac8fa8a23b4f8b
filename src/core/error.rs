use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("网络请求错误: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("JSON序列化错误: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("API错误: {code} - {message}")]
    ApiError { code: i32, message: String },

    #[error("认证错误: {0}")]
    AuthError(String),

    #[error("订单错误: {0}")]
    OrderError(String),

    #[error("速率限制: {0}")]
    RateLimitError(String, Option<u64>),

    #[error("数据解析错误: {0}")]
    ParseError(String),

    #[error("超时错误: 操作 '{operation}' 超时 ({timeout_seconds}秒)")]
    TimeoutError {
        operation: String,
        timeout_seconds: u64,
    },

    #[error("不支持的功能: {0}")]
    NotSupported(String),
}

impl ExchangeError {
    /// 判断错误是否可以重试
    pub fn is_retryable(&self) -> bool {
        match self {
            ExchangeError::NetworkError(_) => true,
            ExchangeError::TimeoutError { .. } => true,
            ExchangeError::RateLimitError(_, _) => true,
            ExchangeError::ApiError { code, .. } => {
                // HTTP 5xx 错误通常可以重试
                *code >= 500 && *code < 600
            }
            _ => false,
        }
    }

    /// 获取错误的严重程度
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ExchangeError::NetworkError(_) => ErrorSeverity::Warning,
            ExchangeError::TimeoutError { .. } => ErrorSeverity::Warning,
            ExchangeError::RateLimitError(_, _) => ErrorSeverity::Warning,
            ExchangeError::AuthError(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }
}

/// 错误严重程度
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorSeverity {
    Warning,  // 警告性错误，可能影响性能但可以重试
    Error,    // 一般错误，需要用户处理
    Critical, // 严重错误，需要立即处理
}

/// 交易循环的错误分类
///
/// 只有 `ConfigurationError` 会终止进程，其余错误都在控制器边界被记录并按轮询间隔重试。
#[derive(Error, Debug)]
pub enum TradingError {
    #[error("配置错误: {0}")]
    ConfigurationError(String),

    #[error("余额不足: 可用余额 {available} USDT")]
    InsufficientFundsError { available: f64 },

    #[error("AI决策不可用: {0}")]
    OracleUnavailableError(String),

    #[error("交易所错误: {0}")]
    ExchangeError(#[from] ExchangeError),
}

impl TradingError {
    /// 是否为启动期致命错误
    pub fn is_fatal(&self) -> bool {
        matches!(self, TradingError::ConfigurationError(_))
    }
}

impl From<config::ConfigError> for TradingError {
    fn from(e: config::ConfigError) -> Self {
        TradingError::ConfigurationError(e.to_string())
    }
}
