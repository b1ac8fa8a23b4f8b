use chrono::{DateTime, Local};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::core::types::{Amount, Side};

const TABLE_HEADER: &str = "\
| 时间 | 类型 | 标的 | 方向 | 张数 | 本金(USDT) | 开仓余额 | 平仓余额 | 盈亏 | 盈亏率 | 订单ID |\n\
|---|---|---|---|---|---|---|---|---|---|---|\n";

/// 记录类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalEvent {
    Open,
    SimulatedOpen,
    Close,
}

impl JournalEvent {
    pub fn label(&self) -> &'static str {
        match self {
            JournalEvent::Open => "开仓",
            JournalEvent::SimulatedOpen => "模拟开仓",
            JournalEvent::Close => "平仓",
        }
    }
}

/// 一行开平仓记录
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub time: DateTime<Local>,
    pub event: JournalEvent,
    pub instrument: String,
    pub side: Side,
    pub contracts: Option<f64>,
    pub notional: Option<Amount>,
    pub open_balance: Option<Amount>,
    pub close_balance: Option<Amount>,
    /// 交易所最后一次报告的持仓收益率
    pub pnl_ratio: Option<f64>,
    pub order_id: Option<String>,
}

impl JournalEntry {
    pub fn new(event: JournalEvent, instrument: &str, side: Side) -> Self {
        Self {
            time: Local::now(),
            event,
            instrument: instrument.to_string(),
            side,
            contracts: None,
            notional: None,
            open_balance: None,
            close_balance: None,
            pnl_ratio: None,
            order_id: None,
        }
    }

    /// 以余额差估算盈亏
    pub fn pnl(&self) -> Option<f64> {
        match (self.open_balance, self.close_balance) {
            (Some(open), Some(close)) => Some(close.value() - open.value()),
            _ => None,
        }
    }

    fn to_row(&self) -> String {
        let amount = |v: Option<Amount>| {
            v.map(|a| format!("{:.4}", a.value()))
                .unwrap_or_else(|| "-".to_string())
        };
        format!(
            "| {} | {} | {} | {} | {} | {} | {} | {} | {} | {} | {} |\n",
            self.time.format("%Y-%m-%d %H:%M:%S"),
            self.event.label(),
            self.instrument,
            self.side,
            self.contracts
                .map(|c| format!("{}", c))
                .unwrap_or_else(|| "-".to_string()),
            amount(self.notional),
            amount(self.open_balance),
            amount(self.close_balance),
            self.pnl()
                .map(|p| format!("{:+.4}", p))
                .unwrap_or_else(|| "-".to_string()),
            self.pnl_ratio
                .map(|r| format!("{:+.2}%", r * 100.0))
                .unwrap_or_else(|| "-".to_string()),
            self.order_id.as_deref().unwrap_or("-"),
        )
    }
}

/// Markdown 表格形式的开平仓记录，多个标的共享同一文件
#[derive(Debug, Clone)]
pub struct TradeJournal {
    path: Option<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl TradeJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// 不写文件
    pub fn disabled() -> Self {
        Self {
            path: None,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// 写入一行；失败只告警，不影响交易循环
    pub fn record(&self, entry: &JournalEntry) {
        if let Err(e) = self.append(entry) {
            log::warn!("⚠️ 写入开平仓记录失败: {}", e);
        }
    }

    fn append(&self, entry: &JournalEntry) -> std::io::Result<()> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };

        // 锁中毒只说明别的线程写入时 panic 过，继续写即可
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let is_empty = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if is_empty {
            file.write_all(TABLE_HEADER.as_bytes())?;
        }
        file.write_all(entry.to_row().as_bytes())
    }
}
