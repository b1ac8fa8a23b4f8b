use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::journal::{JournalEntry, JournalEvent, TradeJournal};
use super::sizer::{PositionSizer, SizePlan};
use super::state::{LifecyclePhase, Pause, TrackedPosition};
use crate::core::config::{InstrumentConfig, TradingConfig};
use crate::core::error::{ErrorSeverity, ExchangeError, TradingError};
use crate::core::exchange::ExchangeGateway;
use crate::core::types::{Amount, OpenPositionRequest, PositionScope, PositionState, Side};
use crate::oracle::{DecisionOracle, OracleError};

/// 持仓生命周期控制器
///
/// 状态只存在于 `run` 循环持有的 `LifecyclePhase` 中；持仓的真实状态以交易所为准，
/// 开仓前总会重新查询，保证最多一个持仓（进程重启后同样成立）。
/// `position_scope = account` 时查询整个账户，多个标的按顺序轮流开仓；
/// `instrument` 时只看自己的标的。
pub struct PositionLifecycleController {
    instruments: Vec<InstrumentConfig>,
    trading: TradingConfig,
    exchange: Arc<dyn ExchangeGateway>,
    oracle: Arc<dyn DecisionOracle>,
    sizer: PositionSizer,
    journal: TradeJournal,
    /// 已轮到的次数，当前标的为 instruments[(turn - 1) % len]
    turn: AtomicUsize,
}

impl PositionLifecycleController {
    pub fn new(
        instrument: InstrumentConfig,
        trading: TradingConfig,
        exchange: Arc<dyn ExchangeGateway>,
        oracle: Arc<dyn DecisionOracle>,
        journal: TradeJournal,
    ) -> Self {
        Self {
            instruments: vec![instrument],
            trading,
            exchange,
            oracle,
            sizer: PositionSizer::new(),
            journal,
            turn: AtomicUsize::new(0),
        }
    }

    /// 多个标的共用一个控制器，空仓时按配置顺序轮转
    pub fn rotating(
        instruments: Vec<InstrumentConfig>,
        trading: TradingConfig,
        exchange: Arc<dyn ExchangeGateway>,
        oracle: Arc<dyn DecisionOracle>,
        journal: TradeJournal,
    ) -> Result<Self, TradingError> {
        if instruments.is_empty() {
            return Err(TradingError::ConfigurationError(
                "轮转控制器至少需要一个标的".to_string(),
            ));
        }
        Ok(Self {
            instruments,
            trading,
            exchange,
            oracle,
            sizer: PositionSizer::new(),
            journal,
            turn: AtomicUsize::new(0),
        })
    }

    /// 当前轮到的标的
    fn active(&self) -> &InstrumentConfig {
        let turn = self.turn.load(Ordering::Relaxed).saturating_sub(1);
        &self.instruments[turn % self.instruments.len()]
    }

    fn advance(&self) -> &InstrumentConfig {
        self.turn.fetch_add(1, Ordering::Relaxed);
        self.active()
    }

    /// 日志前缀：账户范围用 "账户"，否则用标的
    fn scope_label(&self) -> &str {
        match self.trading.position_scope {
            PositionScope::Account => "账户",
            PositionScope::Instrument => &self.active().inst_id,
        }
    }

    /// 运行主循环，直到收到停止信号
    ///
    /// 停止信号在每次循环开始和每次等待期间检查，最迟一个轮询间隔内退出。
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let ids: Vec<&str> = self.instruments.iter().map(|i| i.inst_id.as_str()).collect();
        info!(
            "🚀 [{}] 控制器启动: 标的 {}, {} 模式, {} 网关, {} 决策, 轮询 {}s",
            self.scope_label(),
            ids.join(","),
            if self.trading.dry_run { "干跑" } else { "实盘" },
            self.exchange.name(),
            self.oracle.name(),
            self.trading.poll_interval_sec
        );

        let mut phase = LifecyclePhase::Idle;
        loop {
            if *stop.borrow() {
                break;
            }

            let (next, pause) = self.step(phase).await;
            phase = next;

            if pause == Pause::PollInterval {
                // 发送端被丢弃也视为停止
                let sender_gone = tokio::select! {
                    _ = tokio::time::sleep(self.trading.poll_interval()) => false,
                    changed = stop.changed() => changed.is_err(),
                };
                if sender_gone || *stop.borrow() {
                    break;
                }
            }
        }

        info!("🛑 [{}] 控制器已停止 (最后状态 {})", self.scope_label(), phase);
    }

    /// 执行一次状态转换，返回下一个状态以及是否需要等待
    pub async fn step(&self, phase: LifecyclePhase) -> (LifecyclePhase, Pause) {
        debug!("[{}] 状态: {}", self.scope_label(), phase);

        match phase {
            LifecyclePhase::Idle => self.on_idle().await,
            LifecyclePhase::Deciding { attempt } => self.on_deciding(attempt).await,
            LifecyclePhase::Sizing { side } => self.on_sizing(side).await,
            LifecyclePhase::Opening { side, plan } => self.on_opening(side, plan).await,
            LifecyclePhase::Monitoring { tracked } => self.on_monitoring(tracked).await,
            LifecyclePhase::Closing { tracked } => self.on_closing(tracked).await,
        }
    }

    async fn on_idle(&self) -> (LifecyclePhase, Pause) {
        let current = self.active().inst_id.clone();
        match self.query_open_position(&current).await {
            Ok(Some(position)) => {
                warn!(
                    "🔁 [{}] 发现已有持仓 {} {}张 @ {}，重新接管监控",
                    position.instrument, position.side, position.size, position.entry_price
                );
                (
                    LifecyclePhase::Monitoring {
                        tracked: TrackedPosition::reattached(position),
                    },
                    Pause::PollInterval,
                )
            }
            Ok(None) => {
                let next = self.advance();
                if self.instruments.len() > 1 {
                    info!("🔄 无持仓，轮到 {}", next.inst_id);
                }
                (LifecyclePhase::Deciding { attempt: 0 }, Pause::None)
            }
            Err(e) => {
                self.report(&current, "查询持仓失败，稍后重试", &e);
                (LifecyclePhase::Idle, Pause::PollInterval)
            }
        }
    }

    async fn on_deciding(&self, attempt: u32) -> (LifecyclePhase, Pause) {
        match self.decide().await {
            Ok(side) => {
                info!("🎯 [{}] 决策方向: {}", self.active().inst_id, side);
                (LifecyclePhase::Sizing { side }, Pause::None)
            }
            Err(e) => {
                warn!(
                    "⚠️ [{}] 决策失败 (第{}次)，{}s 后重试: {}",
                    self.active().inst_id,
                    attempt + 1,
                    self.trading.poll_interval_sec,
                    e
                );
                (
                    LifecyclePhase::Deciding {
                        attempt: attempt.saturating_add(1),
                    },
                    Pause::PollInterval,
                )
            }
        }
    }

    async fn on_sizing(&self, side: Side) -> (LifecyclePhase, Pause) {
        let instrument = self.active();
        // 开仓前再确认一次，避免重复开仓
        match self.query_open_position(&instrument.inst_id).await {
            Ok(Some(position)) => {
                warn!(
                    "🔁 [{}] 开仓前发现已有持仓 {} {}，跳过开仓",
                    instrument.inst_id, position.instrument, position.side
                );
                return (
                    LifecyclePhase::Monitoring {
                        tracked: TrackedPosition::reattached(position),
                    },
                    Pause::PollInterval,
                );
            }
            Ok(None) => {}
            Err(e) => {
                self.report(&instrument.inst_id, "开仓前查询持仓失败", &e);
                return (LifecyclePhase::Sizing { side }, Pause::PollInterval);
            }
        }

        let balance = match self
            .guarded("get_available_balance", self.exchange.get_available_balance())
            .await
        {
            Ok(balance) => balance,
            Err(e) => {
                self.report(&instrument.inst_id, "查询余额失败", &e);
                return (LifecyclePhase::Sizing { side }, Pause::PollInterval);
            }
        };

        let configured = Amount::new(instrument.base_notional_usdt);
        match self
            .sizer
            .compute_size(balance, configured, instrument.leverage)
        {
            Ok(plan) => {
                info!(
                    "💰 [{}] 可用余额 {} USDT，本金 {} USDT × {}x = 名义 {:.2} USDT{}",
                    instrument.inst_id,
                    balance,
                    plan.notional,
                    plan.leverage,
                    plan.exposure(),
                    if plan.uses_full_balance() { " (全部余额)" } else { "" }
                );
                (LifecyclePhase::Opening { side, plan }, Pause::None)
            }
            Err(e) => {
                warn!("⚠️ [{}] {}，等待下一轮", instrument.inst_id, e);
                (LifecyclePhase::Idle, Pause::PollInterval)
            }
        }
    }

    async fn on_opening(&self, side: Side, plan: SizePlan) -> (LifecyclePhase, Pause) {
        let request = self.order_request(side, &plan);

        if self.trading.dry_run {
            info!(
                "🧪 [{}] 干跑: 模拟开仓 {} 本金 {} USDT × {}x, TP {:.2}%, SL {:.2}%",
                request.instrument,
                side,
                request.notional,
                request.leverage,
                request.take_profit * 100.0,
                request.stop_loss * 100.0
            );
            let mut entry =
                JournalEntry::new(JournalEvent::SimulatedOpen, &request.instrument, side);
            entry.notional = Some(plan.notional);
            entry.open_balance = Some(plan.available_balance);
            self.journal.record(&entry);
            return (LifecyclePhase::Idle, Pause::PollInterval);
        }

        if let Err(e) = self
            .guarded(
                "set_leverage",
                self.exchange.set_leverage(
                    &request.instrument,
                    request.leverage,
                    request.margin_mode,
                ),
            )
            .await
        {
            warn!(
                "⚠️ [{}] 设置杠杆失败，继续按当前杠杆开仓: {}",
                request.instrument, e
            );
        }

        match self
            .guarded("open_position", self.exchange.open_position(&request))
            .await
        {
            Ok(handle) => {
                info!(
                    "✅ [{}] 开仓成功: {} {}张, 订单 {}",
                    handle.instrument, handle.side, handle.contracts, handle.order_id
                );
                let mut entry = JournalEntry::new(JournalEvent::Open, &handle.instrument, side);
                entry.contracts = Some(handle.contracts);
                entry.notional = Some(plan.notional);
                entry.open_balance = Some(plan.available_balance);
                entry.order_id = Some(handle.order_id.clone());
                self.journal.record(&entry);

                (
                    LifecyclePhase::Monitoring {
                        tracked: TrackedPosition::opened(handle, &plan),
                    },
                    Pause::PollInterval,
                )
            }
            Err(e) => {
                error!("❌ [{}] 开仓失败，重新决策: {}", request.instrument, e);
                (LifecyclePhase::Deciding { attempt: 0 }, Pause::PollInterval)
            }
        }
    }

    async fn on_monitoring(&self, mut tracked: TrackedPosition) -> (LifecyclePhase, Pause) {
        match self.query_open_position(&tracked.instrument).await {
            Ok(Some(position)) if position.instrument != tracked.instrument => {
                // 账户范围：跟踪的持仓已平，其它持仓由 Idle 重新接管
                info!(
                    "📉 [{}] 持仓已平，账户仍持有 {} {}",
                    tracked.instrument, position.instrument, position.side
                );
                (LifecyclePhase::Closing { tracked }, Pause::None)
            }
            Ok(Some(position)) => {
                debug!(
                    "📊 [{}] 持仓中: {} {}张, 均价 {}, 浮盈 {:.4} ({:.2}%)",
                    position.instrument,
                    position.side,
                    position.size,
                    position.entry_price,
                    position.unrealized_pnl,
                    position.unrealized_pnl_ratio * 100.0
                );
                tracked.last_snapshot = Some(position);
                (LifecyclePhase::Monitoring { tracked }, Pause::PollInterval)
            }
            Ok(None) => {
                info!(
                    "📉 [{}] 持仓已平 ({} {}张)",
                    tracked.instrument, tracked.side, tracked.contracts
                );
                (LifecyclePhase::Closing { tracked }, Pause::None)
            }
            Err(e) => {
                self.report(&tracked.instrument, "轮询持仓失败，稍后重试", &e);
                (LifecyclePhase::Monitoring { tracked }, Pause::PollInterval)
            }
        }
    }

    async fn on_closing(&self, tracked: TrackedPosition) -> (LifecyclePhase, Pause) {
        let close_balance = match self
            .guarded("get_available_balance", self.exchange.get_available_balance())
            .await
        {
            Ok(balance) => Some(balance),
            Err(e) => {
                self.report(&tracked.instrument, "平仓后查询余额失败", &e);
                None
            }
        };

        let mut entry = JournalEntry::new(JournalEvent::Close, &tracked.instrument, tracked.side);
        entry.contracts = Some(tracked.contracts);
        entry.open_balance = tracked.opened_balance;
        entry.close_balance = close_balance;
        entry.pnl_ratio = tracked
            .last_snapshot
            .as_ref()
            .map(|p| p.unrealized_pnl_ratio);
        entry.order_id = tracked.order_id.clone();

        match entry.pnl() {
            Some(pnl) => info!(
                "🏁 [{}] 本轮结束，余额变化 {:+.4} USDT，持仓时长 {}s",
                tracked.instrument,
                pnl,
                (chrono::Utc::now() - tracked.since).num_seconds()
            ),
            None => info!("🏁 [{}] 本轮结束", tracked.instrument),
        }
        self.journal.record(&entry);

        (LifecyclePhase::Idle, Pause::None)
    }

    /// 认证类错误需要人工处理，提升日志级别
    fn report(&self, label: &str, context: &str, e: &ExchangeError) {
        match e.severity() {
            ErrorSeverity::Critical => error!("❌ [{}] {}: {}", label, context, e),
            _ => warn!("⚠️ [{}] {}: {}", label, context, e),
        }
    }

    fn order_request(&self, side: Side, plan: &SizePlan) -> OpenPositionRequest {
        let instrument = self.active();
        OpenPositionRequest {
            instrument: instrument.inst_id.clone(),
            side,
            notional: plan.notional,
            leverage: plan.leverage,
            take_profit: instrument.tp_percent,
            stop_loss: instrument.sl_percent,
            margin_mode: self.trading.margin_mode,
            limits: instrument.limits,
        }
    }

    /// 账户范围返回任一持仓，优先返回 `instrument` 的持仓
    async fn query_open_position(
        &self,
        instrument: &str,
    ) -> Result<Option<PositionState>, ExchangeError> {
        match self.trading.position_scope {
            PositionScope::Instrument => {
                self.guarded(
                    "get_open_position",
                    self.exchange.get_open_position(instrument),
                )
                .await
            }
            PositionScope::Account => {
                let mut positions = self
                    .guarded("get_open_positions", self.exchange.get_open_positions())
                    .await?;
                let preferred = positions
                    .iter()
                    .position(|p| p.instrument == instrument)
                    .unwrap_or(0);
                Ok(if positions.is_empty() {
                    None
                } else {
                    Some(positions.swap_remove(preferred))
                })
            }
        }
    }

    async fn decide(&self) -> Result<Side, TradingError> {
        let instrument = &self.active().inst_id;
        let lookback = self.trading.lookback();
        let candles = self
            .guarded(
                "get_recent_candles",
                self.exchange.get_recent_candles(instrument, &lookback),
            )
            .await?;

        // 模型响应通常慢于交易所接口，上限取一个轮询间隔
        let oracle_timeout = self.trading.poll_interval();
        let decision = self.oracle.decide(instrument, &candles);
        match tokio::time::timeout(oracle_timeout, decision).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(OracleError::Timeout {
                timeout_ms: oracle_timeout.as_millis() as u64,
            }
            .into()),
        }
    }

    /// 给协作方调用加上超时，上限不超过轮询间隔
    async fn guarded<T, F>(&self, operation: &str, call: F) -> Result<T, ExchangeError>
    where
        F: Future<Output = Result<T, ExchangeError>>,
    {
        let timeout: Duration = self.trading.call_timeout();
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::TimeoutError {
                operation: operation.to_string(),
                timeout_seconds: timeout.as_secs(),
            }),
        }
    }
}
