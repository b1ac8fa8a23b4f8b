//! 控制器测试用的脚本化交易所与决策服务
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::core::error::ExchangeError;
use crate::core::exchange::ExchangeGateway;
use crate::core::types::*;
use crate::oracle::{DecisionOracle, OracleError};

/// 交易所调用轨迹
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    PositionNone,
    PositionOpen,
    PositionError,
    Balance,
    Leverage,
    Open,
    Candles,
}

struct ExchangeState {
    balance: Amount,
    /// 各标的持仓及其剩余的“仍持仓”查询次数
    positions: BTreeMap<String, (PositionState, usize)>,
    /// 同时存在的最大持仓数
    max_concurrent: usize,
    hold_polls: usize,
    position_errors: VecDeque<bool>,
    open_failures: usize,
    leverage_fails: bool,
    hang_position_queries: bool,
    calls: Vec<Call>,
    opened: Vec<OpenPositionRequest>,
    order_seq: u64,
}

/// 模拟交易所：开仓后持仓保持 `hold_polls` 次查询，然后视为被止盈/止损平掉
pub struct SimulatedExchange {
    state: Mutex<ExchangeState>,
}

impl SimulatedExchange {
    pub fn new(balance: f64, hold_polls: usize) -> Self {
        Self {
            state: Mutex::new(ExchangeState {
                balance: Amount::new(balance),
                positions: BTreeMap::new(),
                max_concurrent: 0,
                hold_polls,
                position_errors: VecDeque::new(),
                open_failures: 0,
                leverage_fails: false,
                hang_position_queries: false,
                calls: Vec::new(),
                opened: Vec::new(),
                order_seq: 0,
            }),
        }
    }

    /// 交易所上已有持仓
    pub fn with_existing_position(self, side: Side, hold_polls: usize) -> Self {
        self.with_position_on(DEFAULT_INSTRUMENT, side, hold_polls)
    }

    pub fn with_position_on(self, instrument: &str, side: Side, hold_polls: usize) -> Self {
        let held = position(instrument, side, 1.0);
        self.state.lock().unwrap().insert(instrument, held, hold_polls);
        self
    }

    /// 按顺序决定每次持仓查询是否失败
    pub fn with_position_errors(self, pattern: &[bool]) -> Self {
        self.state.lock().unwrap().position_errors = pattern.iter().copied().collect();
        self
    }

    pub fn with_open_failures(self, count: usize) -> Self {
        self.state.lock().unwrap().open_failures = count;
        self
    }

    pub fn with_failing_leverage(self) -> Self {
        self.state.lock().unwrap().leverage_fails = true;
        self
    }

    pub fn with_hanging_position_queries(self) -> Self {
        self.state.lock().unwrap().hang_position_queries = true;
        self
    }

    pub fn set_balance(&self, balance: f64) {
        self.state.lock().unwrap().balance = Amount::new(balance);
    }

    pub fn place_external_position(&self, side: Side) {
        self.place_external_position_on(DEFAULT_INSTRUMENT, side);
    }

    pub fn place_external_position_on(&self, instrument: &str, side: Side) {
        let mut state = self.state.lock().unwrap();
        let hold = state.hold_polls;
        state.insert(instrument, position(instrument, side, 1.0), hold);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn opened(&self) -> Vec<OpenPositionRequest> {
        self.state.lock().unwrap().opened.clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn max_concurrent(&self) -> usize {
        self.state.lock().unwrap().max_concurrent
    }
}

impl ExchangeState {
    fn insert(&mut self, instrument: &str, position: PositionState, hold_polls: usize) {
        self.positions.insert(instrument.to_string(), (position, hold_polls));
        self.max_concurrent = self.max_concurrent.max(self.positions.len());
    }

    /// 每次查询消耗一次剩余次数，用完即视为已平仓
    fn poll(&mut self, instrument: &str) -> Option<PositionState> {
        match self.positions.get_mut(instrument) {
            Some((pos, remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Some(pos.clone())
            }
            Some(_) => {
                self.positions.remove(instrument);
                None
            }
            None => None,
        }
    }

    /// 模拟的交易所故障，返回 true 表示本次查询失败
    fn position_query_fails(&mut self) -> bool {
        if self.position_errors.pop_front().unwrap_or(false) {
            self.calls.push(Call::PositionError);
            return true;
        }
        false
    }
}

const DEFAULT_INSTRUMENT: &str = "BTC-USDT-SWAP";

fn position(instrument: &str, side: Side, size: f64) -> PositionState {
    PositionState {
        instrument: instrument.to_string(),
        side,
        size,
        entry_price: 50_000.0,
        unrealized_pnl: 0.0,
        unrealized_pnl_ratio: 0.0,
        is_open: true,
    }
}

pub fn sample_candles(count: usize) -> Vec<Candle> {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    (0..count)
        .map(|i| Candle {
            timestamp: start + ChronoDuration::minutes(i as i64),
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.0 + i as f64,
            volume: 1.0,
        })
        .collect()
}

#[async_trait]
impl ExchangeGateway for SimulatedExchange {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn get_available_balance(&self) -> Result<Amount> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Balance);
        Ok(state.balance)
    }

    async fn set_leverage(
        &self,
        _instrument: &str,
        _leverage: u32,
        _margin_mode: MarginMode,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Leverage);
        if state.leverage_fails {
            return Err(ExchangeError::ApiError {
                code: 59000,
                message: "leverage locked".to_string(),
            });
        }
        Ok(())
    }

    async fn get_recent_candles(
        &self,
        _instrument: &str,
        lookback: &CandleLookback,
    ) -> Result<Vec<Candle>> {
        self.state.lock().unwrap().calls.push(Call::Candles);
        Ok(sample_candles(lookback.limit as usize))
    }

    async fn open_position(&self, request: &OpenPositionRequest) -> Result<PositionHandle> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Open);
        state.opened.push(request.clone());

        if state.open_failures > 0 {
            state.open_failures -= 1;
            return Err(ExchangeError::OrderError("rejected".to_string()));
        }

        state.order_seq += 1;
        let hold = state.hold_polls;
        let opened = position(&request.instrument, request.side, 2.0);
        state.insert(&request.instrument, opened, hold);
        Ok(PositionHandle {
            order_id: format!("ORD{}", state.order_seq),
            instrument: request.instrument.clone(),
            side: request.side,
            contracts: 2.0,
            opened_at: Utc::now(),
        })
    }

    async fn get_open_position(&self, instrument: &str) -> Result<Option<PositionState>> {
        self.hang_if_configured().await;

        let mut state = self.state.lock().unwrap();
        if state.position_query_fails() {
            return Err(busy());
        }

        let result = state.poll(instrument);
        state.calls.push(if result.is_some() {
            Call::PositionOpen
        } else {
            Call::PositionNone
        });
        Ok(result)
    }

    async fn get_open_positions(&self) -> Result<Vec<PositionState>> {
        self.hang_if_configured().await;

        let mut state = self.state.lock().unwrap();
        if state.position_query_fails() {
            return Err(busy());
        }

        let instruments: Vec<String> = state.positions.keys().cloned().collect();
        let open: Vec<PositionState> = instruments
            .iter()
            .filter_map(|instrument| state.poll(instrument))
            .collect();
        state.calls.push(if open.is_empty() {
            Call::PositionNone
        } else {
            Call::PositionOpen
        });
        Ok(open)
    }
}

impl SimulatedExchange {
    async fn hang_if_configured(&self) {
        let hang = self.state.lock().unwrap().hang_position_queries;
        if hang {
            std::future::pending::<()>().await;
        }
    }
}

fn busy() -> ExchangeError {
    ExchangeError::ApiError {
        code: 503,
        message: "busy".to_string(),
    }
}

/// 按脚本返回决策；脚本用完后返回默认方向
pub struct ScriptedOracle {
    script: Mutex<VecDeque<std::result::Result<Side, OracleError>>>,
    default: Side,
    calls: Mutex<Vec<Instant>>,
    stop_after: Option<(usize, watch::Sender<bool>)>,
}

impl ScriptedOracle {
    pub fn new(default: Side) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default,
            calls: Mutex::new(Vec::new()),
            stop_after: None,
        }
    }

    pub fn with_script(self, script: Vec<std::result::Result<Side, OracleError>>) -> Self {
        *self.script.lock().unwrap() = script.into();
        self
    }

    /// 第 n 次调用后发出停止信号
    pub fn stop_after(mut self, calls: usize, stop: watch::Sender<bool>) -> Self {
        self.stop_after = Some((calls, stop));
        self
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DecisionOracle for ScriptedOracle {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn decide(
        &self,
        _instrument: &str,
        _candles: &[Candle],
    ) -> std::result::Result<Side, OracleError> {
        let count = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Instant::now());
            calls.len()
        };
        if let Some((limit, stop)) = &self.stop_after {
            if count >= *limit {
                let _ = stop.send(true);
            }
        }

        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(self.default))
    }
}
