use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::core::{
    config::ApiKeys,
    error::ExchangeError,
    exchange::ExchangeGateway,
    retry_policy::ExponentialBackoffRetry,
    types::*,
};
use crate::utils::SignatureHelper;

const INST_TYPE: &str = "SWAP";
const QUOTE_CCY: &str = "USDT";

/// 保证金不足
const CODE_INSUFFICIENT_MARGIN: &str = "51008";
/// 超过最大可持仓量
const CODE_POSITION_CAP: &str = "51004";

/// OKX 统一响应信封，data 延迟解析以便错误时仍能读取 sCode
#[derive(Debug, Deserialize)]
struct OkxResponse {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Option<Value>,
}

impl OkxResponse {
    fn into_data<T: DeserializeOwned>(self) -> Result<T> {
        if self.code == "0" {
            let data = self.data.unwrap_or_else(|| Value::Array(Vec::new()));
            Ok(serde_json::from_value(data)?)
        } else {
            let code: i32 = self.code.parse().unwrap_or(-1);
            // 501xx: 密钥、签名、时间戳、环境不匹配等认证问题
            if (50100..50120).contains(&code) {
                Err(ExchangeError::AuthError(format!("{} {}", code, self.msg)))
            } else {
                Err(ExchangeError::ApiError {
                    code,
                    message: self.msg,
                })
            }
        }
    }
}

/// 合约规格
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentSpec {
    /// 每张合约面值（币）
    pub ct_val: f64,
    /// 下单数量精度
    pub lot_sz: f64,
    /// 最小下单张数
    pub min_sz: f64,
    /// 价格精度
    pub tick_sz: f64,
}

#[derive(Debug, Deserialize)]
struct OkxInstrument {
    #[serde(rename = "ctVal")]
    ct_val: String,
    #[serde(rename = "lotSz")]
    lot_sz: String,
    #[serde(rename = "minSz")]
    min_sz: String,
    #[serde(rename = "tickSz")]
    tick_sz: String,
}

#[derive(Debug, Deserialize)]
struct OkxPosition {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(rename = "posSide", default)]
    pos_side: String,
    #[serde(default)]
    pos: String,
    #[serde(rename = "avgPx", default)]
    avg_px: String,
    #[serde(default)]
    upl: String,
    #[serde(rename = "uplRatio", default)]
    upl_ratio: String,
}

#[derive(Debug, Deserialize)]
struct OkxOrderAck {
    #[serde(rename = "ordId", default)]
    ord_id: String,
    #[serde(rename = "sCode", default)]
    s_code: String,
    #[serde(rename = "sMsg", default)]
    s_msg: String,
}

#[derive(Debug, Clone, Serialize)]
struct OkxAttachedAlgo {
    #[serde(rename = "tpTriggerPx")]
    tp_trigger_px: String,
    #[serde(rename = "tpOrdPx")]
    tp_ord_px: String,
    #[serde(rename = "tpTriggerPxType")]
    tp_trigger_px_type: String,
    #[serde(rename = "slTriggerPx")]
    sl_trigger_px: String,
    #[serde(rename = "slOrdPx")]
    sl_ord_px: String,
    #[serde(rename = "slTriggerPxType")]
    sl_trigger_px_type: String,
}

#[derive(Debug, Clone, Serialize)]
struct OkxOrderRequest {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(rename = "tdMode")]
    td_mode: String,
    side: String,
    #[serde(rename = "posSide", skip_serializing_if = "Option::is_none")]
    pos_side: Option<String>,
    #[serde(rename = "ordType")]
    ord_type: String,
    sz: String,
    #[serde(rename = "attachAlgoOrds")]
    attach_algo_ords: Vec<OkxAttachedAlgo>,
}

/// OKX 永续合约网关
pub struct OkxGateway {
    client: reqwest::Client,
    base_url: String,
    api_keys: ApiKeys,
    simulated: bool,
    timeout: Duration,
    read_retry: ExponentialBackoffRetry,
    position_mode: RwLock<Option<PositionMode>>,
    instrument_specs: RwLock<HashMap<String, InstrumentSpec>>,
    /// (instId, 杠杆) -> 交易所返回的最大可持仓张数
    position_caps: RwLock<HashMap<(String, u32), u64>>,
}

impl OkxGateway {
    /// 创建OKX网关；demo 环境通过 x-simulated-trading 头走模拟盘
    pub fn new(
        api_keys: ApiKeys,
        environment: Environment,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("okx-ai-trader/0.1.0")
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_keys,
            simulated: environment == Environment::Demo,
            timeout,
            read_retry: ExponentialBackoffRetry::default(),
            position_mode: RwLock::new(None),
            instrument_specs: RwLock::new(HashMap::new()),
            position_caps: RwLock::new(HashMap::new()),
        })
    }

    pub fn with_read_retry(mut self, retry: ExponentialBackoffRetry) -> Self {
        self.read_retry = retry;
        self
    }

    fn transport_error(&self, endpoint: &str, error: reqwest::Error) -> ExchangeError {
        if error.is_timeout() {
            ExchangeError::TimeoutError {
                operation: endpoint.to_string(),
                timeout_seconds: self.timeout.as_secs(),
            }
        } else {
            ExchangeError::NetworkError(error)
        }
    }

    /// 发送请求到OKX，返回未解析 data 的响应信封
    async fn send_request(
        &self,
        method: Method,
        endpoint: &str,
        params: Option<&BTreeMap<String, String>>,
        body: Option<String>,
        signed: bool,
    ) -> Result<OkxResponse> {
        let request_path = match params {
            Some(params) if !params.is_empty() => {
                format!("{}?{}", endpoint, SignatureHelper::build_query_string(params))
            }
            _ => endpoint.to_string(),
        };
        let url = format!("{}{}", self.base_url, request_path);
        let body = body.unwrap_or_default();

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header("Content-Type", "application/json");

        if self.simulated {
            request = request.header("x-simulated-trading", "1");
        }

        if signed {
            let timestamp = SignatureHelper::okx_timestamp();
            let signature = SignatureHelper::okx_signature(
                &self.api_keys.api_secret,
                &timestamp,
                method.as_str(),
                &request_path,
                &body,
            );
            request = request
                .header("OK-ACCESS-KEY", &self.api_keys.api_key)
                .header("OK-ACCESS-SIGN", signature)
                .header("OK-ACCESS-TIMESTAMP", timestamp)
                .header("OK-ACCESS-PASSPHRASE", &self.api_keys.passphrase);
        }

        if method == Method::POST {
            request = request.body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(endpoint, e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| self.transport_error(endpoint, e))?;

        if status.as_u16() == 429 {
            return Err(ExchangeError::RateLimitError(text, Some(1)));
        }
        if status.is_server_error() {
            return Err(ExchangeError::ApiError {
                code: status.as_u16() as i32,
                message: text,
            });
        }

        match serde_json::from_str::<OkxResponse>(&text) {
            Ok(envelope) => Ok(envelope),
            Err(_) if !status.is_success() => Err(ExchangeError::ApiError {
                code: status.as_u16() as i32,
                message: text,
            }),
            Err(e) => Err(ExchangeError::ParseError(format!(
                "{} 响应解析失败: {}",
                endpoint, e
            ))),
        }
    }

    async fn signed_get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<T> {
        self.send_request(Method::GET, endpoint, Some(params), None, true)
            .await?
            .into_data()
    }

    async fn signed_post<T: DeserializeOwned, B: Serialize>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T> {
        let body = serde_json::to_string(body)?;
        self.send_request(Method::POST, endpoint, None, Some(body), true)
            .await?
            .into_data()
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<T> {
        self.send_request(Method::GET, endpoint, Some(params), None, false)
            .await?
            .into_data()
    }

    async fn fetch_balance(&self) -> Result<Amount> {
        #[derive(Deserialize)]
        struct OkxBalanceData {
            #[serde(default)]
            details: Vec<OkxBalance>,
        }

        #[derive(Deserialize)]
        struct OkxBalance {
            ccy: String,
            #[serde(rename = "availBal", default)]
            avail_bal: String,
        }

        let params = query(&[("ccy", QUOTE_CCY)]);
        let data: Vec<OkxBalanceData> = self.signed_get("/api/v5/account/balance", &params).await?;

        let available = data
            .iter()
            .flat_map(|d| d.details.iter())
            .find(|b| b.ccy == QUOTE_CCY)
            .map(|b| parse_f64(&b.avail_bal))
            .unwrap_or(0.0);

        if available < 0.0 {
            log::warn!("⚠️ OKX 返回负的可用余额 {}，按 0 处理", available);
        }
        Ok(Amount::new(available))
    }

    async fn fetch_candles(
        &self,
        instrument: &str,
        lookback: &CandleLookback,
    ) -> Result<Vec<Candle>> {
        let limit = lookback.limit.to_string();
        let params = query(&[
            ("instId", instrument),
            ("bar", lookback.bar.as_str()),
            ("limit", limit.as_str()),
        ]);

        // OKX K线格式: [ts, o, h, l, c, vol, volCcy, volCcyQuote, confirm]，最新在前
        let rows: Vec<Vec<String>> = self.public_get("/api/v5/market/candles", &params).await?;
        Ok(parse_candles(&rows))
    }

    async fn fetch_open_position(&self, instrument: &str) -> Result<Option<PositionState>> {
        let params = query(&[("instType", INST_TYPE), ("instId", instrument)]);
        let positions: Vec<OkxPosition> =
            self.signed_get("/api/v5/account/positions", &params).await?;

        Ok(positions
            .iter()
            .filter(|p| p.inst_id == instrument)
            .find_map(parse_position))
    }

    async fn fetch_account_positions(&self) -> Result<Vec<PositionState>> {
        let params = query(&[("instType", INST_TYPE)]);
        let positions: Vec<OkxPosition> =
            self.signed_get("/api/v5/account/positions", &params).await?;

        Ok(positions.iter().filter_map(parse_position).collect())
    }

    async fn fetch_last_price(&self, instrument: &str) -> Result<f64> {
        #[derive(Deserialize)]
        struct OkxTicker {
            last: String,
        }

        let params = query(&[("instId", instrument)]);
        let tickers: Vec<OkxTicker> = self.public_get("/api/v5/market/ticker", &params).await?;
        let last = tickers.first().map(|t| parse_f64(&t.last)).unwrap_or(0.0);

        if last > 0.0 {
            Ok(last)
        } else {
            Err(ExchangeError::ParseError(format!("{} 最新价无效", instrument)))
        }
    }

    /// 账户持仓模式，首次查询后缓存
    async fn position_mode(&self) -> Result<PositionMode> {
        if let Some(mode) = *self.position_mode.read().await {
            return Ok(mode);
        }

        #[derive(Deserialize)]
        struct OkxAccountConfig {
            #[serde(rename = "posMode", default)]
            pos_mode: String,
        }

        let no_params: BTreeMap<String, String> = BTreeMap::new();
        let configs: Vec<OkxAccountConfig> = self
            .read_retry
            .execute_with_retry("get_account_config", || {
                self.signed_get("/api/v5/account/config", &no_params)
            })
            .await?;

        let mode = match configs.first().map(|c| c.pos_mode.as_str()) {
            Some("long_short_mode") => PositionMode::LongShort,
            _ => PositionMode::Net,
        };
        log::info!("📋 OKX 账户持仓模式: {:?}", mode);
        *self.position_mode.write().await = Some(mode);
        Ok(mode)
    }

    /// 合约规格，按标的缓存
    async fn instrument_spec(&self, instrument: &str) -> Result<InstrumentSpec> {
        if let Some(spec) = self.instrument_specs.read().await.get(instrument) {
            return Ok(spec.clone());
        }

        let params = query(&[("instType", INST_TYPE), ("instId", instrument)]);
        let instruments: Vec<OkxInstrument> = self
            .read_retry
            .execute_with_retry("get_instruments", || {
                self.public_get("/api/v5/public/instruments", &params)
            })
            .await?;

        let raw = instruments
            .first()
            .ok_or_else(|| ExchangeError::ParseError(format!("未找到合约 {}", instrument)))?;
        let spec = InstrumentSpec {
            ct_val: parse_f64(&raw.ct_val),
            lot_sz: parse_f64(&raw.lot_sz),
            min_sz: parse_f64(&raw.min_sz),
            tick_sz: parse_f64(&raw.tick_sz),
        };
        if spec.ct_val <= 0.0 || spec.lot_sz <= 0.0 || spec.tick_sz <= 0.0 {
            return Err(ExchangeError::ParseError(format!(
                "{} 合约规格无效: {:?}",
                instrument, spec
            )));
        }

        self.instrument_specs
            .write()
            .await
            .insert(instrument.to_string(), spec.clone());
        Ok(spec)
    }

    async fn cached_position_cap(&self, instrument: &str, leverage: u32) -> Option<u64> {
        self.position_caps
            .read()
            .await
            .get(&(instrument.to_string(), leverage))
            .copied()
    }

    async fn submit_order(&self, order: &OkxOrderRequest) -> Result<OkxOrderAck> {
        let body = serde_json::to_string(order)?;
        let envelope = self
            .send_request(Method::POST, "/api/v5/trade/order", None, Some(body), true)
            .await?;

        // 下单失败时 code 非 0，但具体原因在 data[0].sCode
        let acks: Vec<OkxOrderAck> = envelope
            .data
            .clone()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();

        match acks.into_iter().next() {
            Some(ack) => Ok(ack),
            None => Err(ExchangeError::ApiError {
                code: envelope.code.parse().unwrap_or(-1),
                message: if envelope.msg.is_empty() {
                    "下单无响应数据".to_string()
                } else {
                    envelope.msg
                },
            }),
        }
    }
}

#[async_trait]
impl ExchangeGateway for OkxGateway {
    fn name(&self) -> &str {
        "okx"
    }

    async fn get_available_balance(&self) -> Result<Amount> {
        self.read_retry
            .execute_with_retry("get_balance", || self.fetch_balance())
            .await
    }

    async fn set_leverage(
        &self,
        instrument: &str,
        leverage: u32,
        margin_mode: MarginMode,
    ) -> Result<()> {
        #[derive(Serialize)]
        struct OkxLeverageRequest<'a> {
            #[serde(rename = "instId")]
            inst_id: &'a str,
            lever: String,
            #[serde(rename = "mgnMode")]
            mgn_mode: &'a str,
            #[serde(rename = "posSide", skip_serializing_if = "Option::is_none")]
            pos_side: Option<&'a str>,
        }

        // 双向持仓 + 逐仓时杠杆按方向分别设置
        let pos_sides: Vec<Option<&str>> = match (margin_mode, self.position_mode().await?) {
            (MarginMode::Isolated, PositionMode::LongShort) => vec![Some("long"), Some("short")],
            _ => vec![None],
        };

        for pos_side in pos_sides {
            let request = OkxLeverageRequest {
                inst_id: instrument,
                lever: leverage.to_string(),
                mgn_mode: margin_mode.as_str(),
                pos_side,
            };
            let _: Value = self
                .signed_post("/api/v5/account/set-leverage", &request)
                .await?;
        }

        log::info!(
            "⚙️ {} 杠杆已设置为 {}x ({})",
            instrument,
            leverage,
            margin_mode.as_str()
        );
        Ok(())
    }

    async fn get_recent_candles(
        &self,
        instrument: &str,
        lookback: &CandleLookback,
    ) -> Result<Vec<Candle>> {
        self.read_retry
            .execute_with_retry("get_candles", || self.fetch_candles(instrument, lookback))
            .await
    }

    async fn open_position(&self, request: &OpenPositionRequest) -> Result<PositionHandle> {
        let instrument = request.instrument.as_str();
        let mode = self.position_mode().await?;
        let spec = self.instrument_spec(instrument).await?;
        let last = self
            .read_retry
            .execute_with_retry("get_ticker", || self.fetch_last_price(instrument))
            .await?;
        let cap = self.cached_position_cap(instrument, request.leverage).await;

        let contracts = compute_contracts(
            request.notional,
            request.leverage,
            last,
            &spec,
            &request.limits,
            cap,
        )?;

        let (tp_px, sl_px) =
            trigger_prices(request.side, last, request.take_profit, request.stop_loss);

        let mut order = OkxOrderRequest {
            inst_id: instrument.to_string(),
            td_mode: request.margin_mode.as_str().to_string(),
            side: request.side.order_side().to_string(),
            // 净持仓模式不能传 posSide
            pos_side: match mode {
                PositionMode::LongShort => Some(request.side.as_str().to_string()),
                PositionMode::Net => None,
            },
            ord_type: "market".to_string(),
            sz: format_step(contracts, spec.lot_sz),
            attach_algo_ords: vec![OkxAttachedAlgo {
                tp_trigger_px: format_step(tp_px, spec.tick_sz),
                tp_ord_px: "-1".to_string(),
                tp_trigger_px_type: "last".to_string(),
                sl_trigger_px: format_step(sl_px, spec.tick_sz),
                sl_ord_px: "-1".to_string(),
                sl_trigger_px_type: "last".to_string(),
            }],
        };

        log::info!(
            "📤 OKX 下单: {} {} sz={} last={} TP={} SL={}",
            instrument,
            request.side,
            order.sz,
            last,
            order.attach_algo_ords[0].tp_trigger_px,
            order.attach_algo_ords[0].sl_trigger_px
        );

        let mut ack = self.submit_order(&order).await?;
        let mut placed = contracts;

        // 一次性自愈：保证金不足缩量一半，超过持仓上限按上限重试
        let retry_size = match ack.s_code.as_str() {
            CODE_INSUFFICIENT_MARGIN => {
                let half = floor_to_step(contracts / 2.0, spec.lot_sz);
                log::warn!("⚠️ 保证金不足 (51008)，缩量至 {} 张重试", half);
                Some(half)
            }
            CODE_POSITION_CAP => match parse_position_cap(&ack.s_msg) {
                Some(parsed) => {
                    self.position_caps
                        .write()
                        .await
                        .insert((instrument.to_string(), request.leverage), parsed);
                    log::warn!("⚠️ 超过最大可持仓量 (51004)，按上限 {} 张重试", parsed);
                    Some(floor_to_step(contracts.min(parsed as f64), spec.lot_sz))
                }
                None => {
                    let half = floor_to_step(contracts / 2.0, spec.lot_sz);
                    log::warn!(
                        "⚠️ 超过最大可持仓量 (51004) 且无法解析上限，缩量至 {} 张重试",
                        half
                    );
                    Some(half)
                }
            },
            _ => None,
        };

        if let Some(size) = retry_size {
            if size >= spec.min_sz && size > 0.0 && size < contracts {
                order.sz = format_step(size, spec.lot_sz);
                ack = self.submit_order(&order).await?;
                placed = size;
            }
        }

        if ack.s_code != "0" || ack.ord_id.is_empty() {
            return Err(ExchangeError::OrderError(format!(
                "{} 下单失败: {} {}",
                instrument, ack.s_code, ack.s_msg
            )));
        }

        Ok(PositionHandle {
            order_id: ack.ord_id,
            instrument: instrument.to_string(),
            side: request.side,
            contracts: placed,
            opened_at: Utc::now(),
        })
    }

    async fn get_open_position(&self, instrument: &str) -> Result<Option<PositionState>> {
        self.read_retry
            .execute_with_retry("get_positions", || self.fetch_open_position(instrument))
            .await
    }

    async fn get_open_positions(&self) -> Result<Vec<PositionState>> {
        self.read_retry
            .execute_with_retry("get_account_positions", || self.fetch_account_positions())
            .await
    }
}

fn query(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn parse_f64(value: &str) -> f64 {
    value.trim().parse::<f64>().unwrap_or(0.0)
}

/// 解析K线并按时间升序排列，无法解析的行跳过
fn parse_candles(rows: &[Vec<String>]) -> Vec<Candle> {
    let mut candles: Vec<Candle> = rows
        .iter()
        .filter(|row| row.len() >= 6)
        .filter_map(|row| {
            let ts = row[0].parse::<i64>().ok()?;
            let timestamp = DateTime::<Utc>::from_timestamp_millis(ts)?;
            Some(Candle {
                timestamp,
                open: row[1].parse().ok()?,
                high: row[2].parse().ok()?,
                low: row[3].parse().ok()?,
                close: row[4].parse().ok()?,
                volume: row[5].parse().unwrap_or(0.0),
            })
        })
        .collect();

    candles.sort_by_key(|c| c.timestamp);
    candles
}

fn parse_position(raw: &OkxPosition) -> Option<PositionState> {
    let pos = parse_f64(&raw.pos);
    if pos == 0.0 {
        return None;
    }

    let side = match raw.pos_side.as_str() {
        "long" => Side::Long,
        "short" => Side::Short,
        // net 模式按持仓数量正负判断方向
        _ if pos > 0.0 => Side::Long,
        _ => Side::Short,
    };

    Some(PositionState {
        instrument: raw.inst_id.clone(),
        side,
        size: pos.abs(),
        entry_price: parse_f64(&raw.avg_px),
        unrealized_pnl: parse_f64(&raw.upl),
        unrealized_pnl_ratio: parse_f64(&raw.upl_ratio),
        is_open: true,
    })
}

fn floor_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    // 加一个极小量，避免 2.9999999 这类浮点误差被截断
    ((value / step) + 1e-9).floor() * step
}

fn step_decimals(step: f64) -> usize {
    let text = format!("{}", step);
    text.split('.').nth(1).map(|d| d.len()).unwrap_or(0)
}

/// 按步长取整并格式化为字符串
fn format_step(value: f64, step: f64) -> String {
    let rounded = if step > 0.0 {
        (value / step).round() * step
    } else {
        value
    };
    format!("{:.*}", step_decimals(step), rounded)
}

/// 名义本金 × 杠杆 换算为合约张数
///
/// 优先级：fixed_contracts > min(max_contracts, 交易所上限)。
pub fn compute_contracts(
    notional: Amount,
    leverage: u32,
    last_price: f64,
    spec: &InstrumentSpec,
    limits: &ContractLimits,
    exchange_cap: Option<u64>,
) -> Result<f64> {
    if last_price <= 0.0 || spec.ct_val <= 0.0 {
        return Err(ExchangeError::ParseError(format!(
            "无法换算张数: last={} ctVal={}",
            last_price, spec.ct_val
        )));
    }

    let exposure = notional.value() * leverage.max(1) as f64;
    let mut contracts = floor_to_step(exposure / (last_price * spec.ct_val), spec.lot_sz);

    if let Some(fixed) = limits.fixed_contracts {
        contracts = fixed as f64;
    } else if let Some(cap) = [limits.max_contracts, exchange_cap].into_iter().flatten().min() {
        if contracts > cap as f64 {
            log::info!("📏 触发张数上限钳制: {} -> {}", contracts, cap);
            contracts = cap as f64;
        }
    }

    if contracts <= 0.0 || contracts < spec.min_sz {
        return Err(ExchangeError::OrderError(format!(
            "计算张数 {} 低于最小下单量 {} (本金 {} × {}x, 价格 {})",
            contracts, spec.min_sz, notional, leverage, last_price
        )));
    }

    Ok(contracts)
}

/// 止盈止损触发价：多单 tp 在上、sl 在下，空单相反
pub fn trigger_prices(side: Side, last: f64, take_profit: f64, stop_loss: f64) -> (f64, f64) {
    let tp = take_profit.abs();
    let sl = stop_loss.abs();
    match side {
        Side::Long => (last * (1.0 + tp), last * (1.0 - sl)),
        Side::Short => (last * (1.0 - tp), last * (1.0 + sl)),
    }
}

/// 从 51004 错误文案中提取最大张数，例如 "... 1,500(contracts)"
pub fn parse_position_cap(message: &str) -> Option<u64> {
    let digits_before = |end: usize| -> Option<u64> {
        let prefix = &message[..end];
        let start = prefix
            .rfind(|c: char| !(c.is_ascii_digit() || c == ','))
            .map(|i| i + 1)
            .unwrap_or(0);
        let number: String = prefix[start..].chars().filter(|c| c.is_ascii_digit()).collect();
        number.parse().ok()
    };

    if let Some(idx) = message.find("(contracts)") {
        if let Some(cap) = digits_before(idx) {
            return Some(cap);
        }
    }

    let lower = message.to_lowercase();
    let idx = lower.find("maximum position amount")?;
    let rest = &lower[idx..];
    let start = rest.find(|c: char| c.is_ascii_digit())?;
    let number: String = rest[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',')
        .filter(|c| c.is_ascii_digit())
        .collect();
    number.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn btc_spec() -> InstrumentSpec {
        InstrumentSpec {
            ct_val: 0.01,
            lot_sz: 1.0,
            min_sz: 1.0,
            tick_sz: 0.1,
        }
    }

    fn gateway(server: &MockServer) -> OkxGateway {
        OkxGateway::new(
            ApiKeys {
                api_key: "key".to_string(),
                api_secret: "secret".to_string(),
                passphrase: "pass".to_string(),
            },
            Environment::Demo,
            &server.uri(),
            Duration::from_secs(5),
        )
        .unwrap()
        .with_read_retry(ExponentialBackoffRetry::disabled())
    }

    fn ok(data: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({"code": "0", "msg": "", "data": data}))
    }

    #[test]
    fn test_compute_contracts_from_notional() {
        // 10 USDT × 100x = 1000 USDT，每张 0.01 × 50000 = 500 USDT
        let contracts = compute_contracts(
            Amount::new(10.0),
            100,
            50_000.0,
            &btc_spec(),
            &ContractLimits::default(),
            None,
        )
        .unwrap();
        assert_eq!(contracts, 2.0);
    }

    #[test]
    fn test_compute_contracts_applies_limits() {
        let spec = btc_spec();
        let fixed = ContractLimits {
            fixed_contracts: Some(7),
            max_contracts: Some(3),
        };
        assert_eq!(
            compute_contracts(Amount::new(10.0), 100, 50_000.0, &spec, &fixed, None).unwrap(),
            7.0
        );

        let capped = ContractLimits {
            fixed_contracts: None,
            max_contracts: Some(5),
        };
        assert_eq!(
            compute_contracts(Amount::new(100.0), 100, 50_000.0, &spec, &capped, Some(3)).unwrap(),
            3.0
        );
    }

    #[test]
    fn test_compute_contracts_below_minimum_is_error() {
        let result = compute_contracts(
            Amount::new(1.0),
            1,
            50_000.0,
            &btc_spec(),
            &ContractLimits::default(),
            None,
        );
        assert!(matches!(result, Err(ExchangeError::OrderError(_))));
    }

    #[test]
    fn test_trigger_prices_by_side() {
        let (tp, sl) = trigger_prices(Side::Long, 100.0, 0.02, 0.01);
        assert_eq!(format_step(tp, 0.1), "102.0");
        assert_eq!(format_step(sl, 0.1), "99.0");

        let (tp, sl) = trigger_prices(Side::Short, 100.0, 0.02, 0.01);
        assert_eq!(format_step(tp, 0.1), "98.0");
        assert_eq!(format_step(sl, 0.1), "101.0");
    }

    #[test]
    fn test_format_step_precision() {
        assert_eq!(format_step(3.0, 1.0), "3");
        assert_eq!(format_step(0.123456, 0.01), "0.12");
        assert_eq!(format_step(64_123.456, 0.1), "64123.5");
    }

    #[test]
    fn test_parse_position_cap() {
        assert_eq!(
            parse_position_cap(
                "Your position amount exceeds the maximum position amount 1,500(contracts) at 100x"
            ),
            Some(1500)
        );
        assert_eq!(
            parse_position_cap("The maximum position amount is 250 for this tier"),
            Some(250)
        );
        assert_eq!(parse_position_cap("Insufficient margin"), None);
    }

    #[test]
    fn test_parse_candles_sorted_oldest_first() {
        let rows = vec![
            vec!["1700000120000", "3", "4", "2", "3.5", "10"],
            vec!["1700000060000", "2", "3", "1", "2.5", "11"],
            vec!["bad", "1", "1", "1", "1", "1"],
            vec!["1700000000000", "1", "2", "0.5", "1.5", "12"],
        ]
        .into_iter()
        .map(|r| r.into_iter().map(String::from).collect())
        .collect::<Vec<Vec<String>>>();

        let candles = parse_candles(&rows);
        assert_eq!(candles.len(), 3);
        assert_eq!(candles[0].close, 1.5);
        assert_eq!(candles[2].close, 3.5);
        assert!(candles[0].timestamp < candles[2].timestamp);
    }

    #[tokio::test]
    async fn test_balance_signed_and_simulated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v5/account/balance"))
            .and(query_param("ccy", "USDT"))
            .and(header("x-simulated-trading", "1"))
            .and(header("OK-ACCESS-KEY", "key"))
            .and(header_exists("OK-ACCESS-SIGN"))
            .respond_with(ok(json!([{
                "details": [
                    {"ccy": "BTC", "availBal": "0.5"},
                    {"ccy": "USDT", "availBal": "123.45"}
                ]
            }])))
            .mount(&server)
            .await;

        let balance = gateway(&server).get_available_balance().await.unwrap();
        assert_eq!(balance.value(), 123.45);
    }

    #[tokio::test]
    async fn test_negative_balance_clamped_to_zero() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v5/account/balance"))
            .respond_with(ok(json!([{"details": [{"ccy": "USDT", "availBal": "-3"}]}])))
            .mount(&server)
            .await;

        let balance = gateway(&server).get_available_balance().await.unwrap();
        assert!(balance.is_zero());
    }

    #[tokio::test]
    async fn test_auth_error_code_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v5/account/balance"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(json!({"code": "50113", "msg": "Invalid Sign", "data": []})),
            )
            .mount(&server)
            .await;

        match gateway(&server).get_available_balance().await {
            Err(ExchangeError::AuthError(message)) => assert!(message.contains("Invalid Sign")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_business_error_code_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v5/account/positions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"code": "51001", "msg": "Instrument ID does not exist", "data": []}),
            ))
            .mount(&server)
            .await;

        match gateway(&server).get_open_position("NOPE-USDT-SWAP").await {
            Err(ExchangeError::ApiError { code, .. }) => assert_eq!(code, 51001),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v5/account/balance"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v5/account/balance"))
            .respond_with(ok(json!([{"details": [{"ccy": "USDT", "availBal": "7"}]}])))
            .mount(&server)
            .await;

        let gateway = gateway(&server).with_read_retry(
            ExponentialBackoffRetry::default()
                .with_max_retries(2)
                .with_initial_delay(1),
        );
        assert_eq!(gateway.get_available_balance().await.unwrap().value(), 7.0);
    }

    #[tokio::test]
    async fn test_open_position_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v5/account/positions"))
            .and(query_param("instId", "BTC-USDT-SWAP"))
            .respond_with(ok(json!([{
                "instId": "BTC-USDT-SWAP",
                "posSide": "net",
                "pos": "-3",
                "avgPx": "64000.5",
                "upl": "-1.2",
                "uplRatio": "-0.05"
            }])))
            .mount(&server)
            .await;

        let position = gateway(&server)
            .get_open_position("BTC-USDT-SWAP")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(position.side, Side::Short);
        assert_eq!(position.size, 3.0);
        assert_eq!(position.entry_price, 64000.5);
        assert!(position.is_open);
    }

    #[tokio::test]
    async fn test_flat_position_reports_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v5/account/positions"))
            .respond_with(ok(json!([{"instId": "BTC-USDT-SWAP", "posSide": "net", "pos": "0"}])))
            .mount(&server)
            .await;

        let position = gateway(&server)
            .get_open_position("BTC-USDT-SWAP")
            .await
            .unwrap();
        assert!(position.is_none());
    }

    #[tokio::test]
    async fn test_account_positions_skip_flat_entries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v5/account/positions"))
            .and(query_param("instType", "SWAP"))
            .respond_with(ok(json!([
                {"instId": "BTC-USDT-SWAP", "posSide": "net", "pos": "0"},
                {"instId": "ETH-USDT-SWAP", "posSide": "long", "pos": "5", "avgPx": "3000"},
                {"instId": "SOL-USDT-SWAP", "posSide": "net", "pos": "-2", "avgPx": "150"}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let positions = gateway(&server).get_open_positions().await.unwrap();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].instrument, "ETH-USDT-SWAP");
        assert_eq!(positions[0].side, Side::Long);
        assert_eq!(positions[1].instrument, "SOL-USDT-SWAP");
        assert_eq!(positions[1].side, Side::Short);
    }

    #[tokio::test]
    async fn test_candles_reordered_oldest_first() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v5/market/candles"))
            .and(query_param("bar", "1m"))
            .and(query_param("limit", "60"))
            .respond_with(ok(json!([
                ["1700000060000", "2", "3", "1", "2.5", "11", "0", "0", "1"],
                ["1700000000000", "1", "2", "0.5", "1.5", "12", "0", "0", "1"]
            ])))
            .mount(&server)
            .await;

        let candles = gateway(&server)
            .get_recent_candles("BTC-USDT-SWAP", &CandleLookback::default())
            .await
            .unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].close, 2.5);
    }

    async fn mount_order_prerequisites(server: &MockServer, pos_mode: &str) {
        Mock::given(method("GET"))
            .and(path("/api/v5/account/config"))
            .respond_with(ok(json!([{"posMode": pos_mode}])))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v5/public/instruments"))
            .respond_with(ok(json!([{
                "instId": "BTC-USDT-SWAP",
                "ctVal": "0.01",
                "lotSz": "1",
                "minSz": "1",
                "tickSz": "0.1"
            }])))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v5/market/ticker"))
            .respond_with(ok(json!([{"instId": "BTC-USDT-SWAP", "last": "50000"}])))
            .mount(server)
            .await;
    }

    fn request(side: Side, notional: f64) -> OpenPositionRequest {
        OpenPositionRequest {
            instrument: "BTC-USDT-SWAP".to_string(),
            side,
            notional: Amount::new(notional),
            leverage: 100,
            take_profit: 0.02,
            stop_loss: 0.01,
            margin_mode: MarginMode::Cross,
            limits: ContractLimits::default(),
        }
    }

    #[tokio::test]
    async fn test_open_position_attaches_tp_sl() {
        let server = MockServer::start().await;
        mount_order_prerequisites(&server, "net_mode").await;
        Mock::given(method("POST"))
            .and(path("/api/v5/trade/order"))
            .and(body_partial_json(json!({
                "instId": "BTC-USDT-SWAP",
                "tdMode": "cross",
                "side": "buy",
                "ordType": "market",
                "sz": "2",
                "attachAlgoOrds": [{
                    "tpTriggerPx": "51000.0",
                    "tpOrdPx": "-1",
                    "slTriggerPx": "49500.0",
                    "slOrdPx": "-1"
                }]
            })))
            .respond_with(ok(json!([{"ordId": "A1", "sCode": "0", "sMsg": ""}])))
            .expect(1)
            .mount(&server)
            .await;

        let handle = gateway(&server)
            .open_position(&request(Side::Long, 10.0))
            .await
            .unwrap();
        assert_eq!(handle.order_id, "A1");
        assert_eq!(handle.contracts, 2.0);
        assert_eq!(handle.side, Side::Long);
    }

    #[tokio::test]
    async fn test_long_short_mode_sends_pos_side() {
        let server = MockServer::start().await;
        mount_order_prerequisites(&server, "long_short_mode").await;
        Mock::given(method("POST"))
            .and(path("/api/v5/trade/order"))
            .and(body_partial_json(json!({"side": "sell", "posSide": "short"})))
            .respond_with(ok(json!([{"ordId": "S1", "sCode": "0", "sMsg": ""}])))
            .expect(1)
            .mount(&server)
            .await;

        let handle = gateway(&server)
            .open_position(&request(Side::Short, 10.0))
            .await
            .unwrap();
        assert_eq!(handle.order_id, "S1");
    }

    #[tokio::test]
    async fn test_insufficient_margin_retries_half_size() {
        let server = MockServer::start().await;
        mount_order_prerequisites(&server, "net_mode").await;
        Mock::given(method("POST"))
            .and(path("/api/v5/trade/order"))
            .and(body_partial_json(json!({"sz": "4"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": "1",
                "msg": "Operation failed.",
                "data": [{"ordId": "", "sCode": "51008", "sMsg": "Insufficient margin"}]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v5/trade/order"))
            .and(body_partial_json(json!({"sz": "2"})))
            .respond_with(ok(json!([{"ordId": "B2", "sCode": "0", "sMsg": ""}])))
            .expect(1)
            .mount(&server)
            .await;

        let handle = gateway(&server)
            .open_position(&request(Side::Long, 20.0))
            .await
            .unwrap();
        assert_eq!(handle.order_id, "B2");
        assert_eq!(handle.contracts, 2.0);
    }

    fn position_cap_rejection(message: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "code": "1",
            "msg": "Operation failed.",
            "data": [{"ordId": "", "sCode": "51004", "sMsg": message}]
        }))
    }

    #[tokio::test]
    async fn test_position_cap_is_cached_and_reused() {
        let server = MockServer::start().await;
        mount_order_prerequisites(&server, "net_mode").await;
        // 300 USDT × 100x / (50000 × 0.01) = 60 张
        Mock::given(method("POST"))
            .and(path("/api/v5/trade/order"))
            .and(body_partial_json(json!({"sz": "60"})))
            .respond_with(position_cap_rejection(
                "Your position amount exceeds the maximum position amount 40(contracts)",
            ))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v5/trade/order"))
            .and(body_partial_json(json!({"sz": "40"})))
            .respond_with(ok(json!([{"ordId": "C1", "sCode": "0", "sMsg": ""}])))
            .expect(2)
            .mount(&server)
            .await;

        let gateway = gateway(&server);
        let first = gateway
            .open_position(&request(Side::Long, 300.0))
            .await
            .unwrap();
        assert_eq!(first.contracts, 40.0);
        assert_eq!(gateway.cached_position_cap("BTC-USDT-SWAP", 100).await, Some(40));

        // 第二次直接按缓存的上限下单
        let second = gateway
            .open_position(&request(Side::Long, 300.0))
            .await
            .unwrap();
        assert_eq!(second.contracts, 40.0);
        assert_eq!(gateway.cached_position_cap("BTC-USDT-SWAP", 50).await, None);
    }

    #[tokio::test]
    async fn test_unparsable_position_cap_retries_half_size() {
        let server = MockServer::start().await;
        mount_order_prerequisites(&server, "net_mode").await;
        Mock::given(method("POST"))
            .and(path("/api/v5/trade/order"))
            .and(body_partial_json(json!({"sz": "60"})))
            .respond_with(position_cap_rejection("Position limit exceeded"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v5/trade/order"))
            .and(body_partial_json(json!({"sz": "30"})))
            .respond_with(ok(json!([{"ordId": "C2", "sCode": "0", "sMsg": ""}])))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = gateway(&server);
        let handle = gateway
            .open_position(&request(Side::Short, 300.0))
            .await
            .unwrap();
        assert_eq!(handle.order_id, "C2");
        assert_eq!(handle.contracts, 30.0);
        assert_eq!(gateway.cached_position_cap("BTC-USDT-SWAP", 100).await, None);
    }

    #[tokio::test]
    async fn test_rejected_order_is_error() {
        let server = MockServer::start().await;
        mount_order_prerequisites(&server, "net_mode").await;
        Mock::given(method("POST"))
            .and(path("/api/v5/trade/order"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": "1",
                "msg": "Operation failed.",
                "data": [{"ordId": "", "sCode": "51000", "sMsg": "Parameter error"}]
            })))
            .mount(&server)
            .await;

        let result = gateway(&server)
            .open_position(&request(Side::Long, 10.0))
            .await;
        assert!(matches!(result, Err(ExchangeError::OrderError(_))));
    }

    #[tokio::test]
    async fn test_set_leverage_both_sides_when_isolated_long_short() {
        let server = MockServer::start().await;
        mount_order_prerequisites(&server, "long_short_mode").await;
        Mock::given(method("POST"))
            .and(path("/api/v5/account/set-leverage"))
            .and(body_partial_json(json!({"mgnMode": "isolated", "lever": "20"})))
            .respond_with(ok(json!([{"lever": "20"}])))
            .expect(2)
            .mount(&server)
            .await;

        gateway(&server)
            .set_leverage("BTC-USDT-SWAP", 20, MarginMode::Isolated)
            .await
            .unwrap();
    }
}
