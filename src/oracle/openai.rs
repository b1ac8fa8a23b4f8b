use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{parse_decision, DecisionOracle, OracleError};
use crate::core::config::AiConfig;
use crate::core::error::TradingError;
use crate::core::types::{Candle, Side};

const ENDPOINT_CHAT: &str = "/chat/completions";

const SYSTEM_PROMPT: &str = "你是加密货币永续合约的方向决策助手。\
根据给出的K线判断下一段行情的开仓方向，综合考虑趋势、动量和波动率。\
只回答一个单词：long 或 short。";

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// 发给模型的行情上下文
#[derive(Debug, Serialize)]
struct MarketContext<'a> {
    inst_id: &'a str,
    candles_schema: &'static str,
    order: &'static str,
    recent_candles: Vec<[f64; 6]>,
}

/// OpenAI 兼容的 /chat/completions 决策客户端
///
/// base_url 和模型名作为不透明配置，可指向任意兼容服务。
pub struct OpenAiCompatOracle {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    max_candles: usize,
    timeout: Duration,
}

impl OpenAiCompatOracle {
    pub fn new(config: &AiConfig, api_key: &str, timeout: Duration) -> Result<Self, TradingError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                TradingError::ConfigurationError(format!("AI HTTP 客户端创建失败: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_candles: config.max_candles.max(1),
            timeout,
        })
    }

    fn build_request(
        &self,
        instrument: &str,
        candles: &[Candle],
    ) -> Result<ChatCompletionRequest, OracleError> {
        // 只取最近的 max_candles 根，保持升序
        let recent = &candles[candles.len().saturating_sub(self.max_candles)..];
        let context = MarketContext {
            inst_id: instrument,
            candles_schema: "[timestamp_ms, open, high, low, close, volume]",
            order: "oldest_first",
            recent_candles: recent
                .iter()
                .map(|c| {
                    [
                        c.timestamp.timestamp_millis() as f64,
                        c.open,
                        c.high,
                        c.low,
                        c.close,
                        c.volume,
                    ]
                })
                .collect(),
        };
        let user_content = serde_json::to_string(&context)
            .map_err(|e| OracleError::InvalidResponse(format!("行情序列化失败: {}", e)))?;

        Ok(ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_content,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        })
    }
}

#[async_trait]
impl DecisionOracle for OpenAiCompatOracle {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn decide(&self, instrument: &str, candles: &[Candle]) -> Result<Side, OracleError> {
        let request = self.build_request(instrument, candles)?;
        let url = format!("{}{}", self.base_url, ENDPOINT_CHAT);

        log::debug!("🤖 请求 AI 决策: {} model={}", instrument, self.model);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OracleError::Timeout {
                        timeout_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    OracleError::NetworkError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(OracleError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| OracleError::InvalidResponse(e.to_string()))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| OracleError::InvalidResponse("响应中没有 choices".to_string()))?;

        let side = parse_decision(&content)?;
        log::info!("🤖 {} AI 决策: {} (原始回复 {:?})", instrument, side, content.trim());
        Ok(side)
    }
}
