// 工具模块 - 通用工具函数
pub mod signature;
pub mod unified_logger;

pub use signature::*;
pub use unified_logger::{build_log_config, init_global_logger, LogConfig};
