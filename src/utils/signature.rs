use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

/// OKX 请求签名工具
pub struct SignatureHelper;

impl SignatureHelper {
    /// OKX 签名: Base64(HMAC-SHA256(timestamp + method + path + body))
    ///
    /// GET 请求的 path 需包含查询串。
    pub fn okx_signature(
        secret: &str,
        timestamp: &str,
        method: &str,
        request_path: &str,
        body: &str,
    ) -> String {
        let prehash = format!("{}{}{}{}", timestamp, method, request_path, body);
        // HMAC 接受任意长度密钥，new_from_slice 不会失败
        let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(prehash.as_bytes());
        general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    /// OKX 要求的 ISO8601 毫秒时间戳
    pub fn okx_timestamp() -> String {
        Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
    }

    /// URL 编码并保持键排序
    pub fn build_query_string(params: &BTreeMap<String, String>) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }
}
