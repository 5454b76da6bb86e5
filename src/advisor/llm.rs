// src/advisor/llm.rs
use crate::advisor::traits::AdvisorClient;
use crate::config::AdvisorConfig;
use crate::types::{AccountState, AdvisorResponse, Candle, MarketSnapshot};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use tracing::debug;

const API_VERSION: &str = "2023-06-01";

/// Asks a hosted language model for a decision through a messages-style
/// HTTP endpoint and parses the JSON object out of its reply.
pub struct LlmAdvisor {
    http_client: Client,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
}

#[derive(Serialize)]
struct MessageRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct MessageResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

impl LlmAdvisor {
    pub fn new(config: &AdvisorConfig) -> Self {
        Self {
            http_client: Client::new(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_tokens: config.max_tokens,
        }
    }

    fn build_prompt(snapshot: &MarketSnapshot, account: &AccountState) -> String {
        let mut p = String::new();
        let _ = writeln!(
            p,
            "You are a short-term crypto trader for {}. Recommend the next action.\n",
            snapshot.symbol
        );
        let _ = writeln!(p, "## Market");
        let _ = writeln!(p, "time: {}", snapshot.timestamp.format("%Y-%m-%d %H:%M:%S UTC"));
        let _ = writeln!(
            p,
            "last: {} | bid: {} | ask: {}",
            snapshot.last_price, snapshot.bid_price, snapshot.ask_price
        );
        let _ = writeln!(
            p,
            "24h change: {}% | high: {} | low: {} | volume: {}",
            snapshot.change_24h, snapshot.high_24h, snapshot.low_24h, snapshot.volume_24h
        );
        for (label, candles) in [
            ("1m", &snapshot.candles_1m),
            ("5m", &snapshot.candles_5m),
            ("15m", &snapshot.candles_15m),
        ] {
            let _ = writeln!(p, "{}", summarize_candles(label, candles));
        }
        if let Some(book) = &snapshot.order_book {
            let _ = writeln!(
                p,
                "order book: buy pressure {:.4}, sell pressure {:.4}, ratio {:.2} (>1.2 bullish, <0.8 bearish)",
                book.buy_pressure, book.sell_pressure, book.pressure_ratio
            );
        }

        let _ = writeln!(p, "\n## Account");
        let _ = writeln!(
            p,
            "{q} available: {:.2} | {b} available: {:.6} | max position: {:.6} {b}",
            account.quote_available(),
            account.base_available(),
            account.max_position,
            q = account.quote_asset,
            b = account.base_asset,
        );

        let _ = writeln!(p, "\n## Rules");
        let _ = writeln!(p, "- never risk more than 20% of equity on one trade");
        let _ = writeln!(p, "- only trade with confidence >= 60, otherwise hold");
        let _ = writeln!(p, "- amount is in {} with at most 6 decimals, 0 for hold", account.base_asset);
        let _ = writeln!(
            p,
            "\nReply with JSON only: {{\"action\": \"buy\"|\"sell\"|\"hold\", \"amount\": number, \
             \"confidence\": 0-100, \"reason\": string, \"stop_loss\": string, \"take_profit\": string}}"
        );
        p
    }
}

fn summarize_candles(label: &str, candles: &[Candle]) -> String {
    let (Some(first), Some(last)) = (candles.first(), candles.last()) else {
        return format!("{label} candles: no data");
    };
    let high = candles.iter().map(|c| c.high).max().unwrap_or(first.high);
    let low = candles.iter().map(|c| c.low).min().unwrap_or(first.low);
    let volume: rust_decimal::Decimal = candles.iter().map(|c| c.volume).sum();
    let trend = if candles.len() < 3 {
        "insufficient data"
    } else if last.close > first.open {
        "up"
    } else if last.close < first.open {
        "down"
    } else {
        "flat"
    };
    format!(
        "{label} candles ({}): open {} -> close {}, high {high}, low {low}, volume {volume}, trend {trend}",
        candles.len(),
        first.open,
        last.close
    )
}

/// Returns the outermost `{...}` span of a model reply.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

#[async_trait]
impl AdvisorClient for LlmAdvisor {
    fn name(&self) -> String {
        self.model.clone()
    }

    async fn analyze(
        &self,
        snapshot: &MarketSnapshot,
        account: &AccountState,
    ) -> Result<AdvisorResponse> {
        let request = MessageRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: vec![Message {
                role: "user",
                content: Self::build_prompt(snapshot, account),
            }],
        };

        let response: MessageResponse = self
            .http_client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let text = response
            .content
            .iter()
            .find(|b| b.kind == "text")
            .map(|b| b.text.as_str())
            .ok_or_else(|| anyhow!("advisor reply contained no text block"))?;
        debug!("Advisor reply: {}", text);

        let json = extract_json(text).ok_or_else(|| anyhow!("no JSON object in reply: {text}"))?;
        serde_json::from_str(json).with_context(|| format!("malformed decision JSON: {json}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn candle(open: i64, close: i64) -> Candle {
        Candle {
            open_time: 0,
            open: Decimal::from(open),
            high: Decimal::from(open.max(close) + 1),
            low: Decimal::from(open.min(close) - 1),
            close: Decimal::from(close),
            volume: Decimal::from(2),
        }
    }

    #[test]
    fn extracts_json_from_fenced_reply() {
        let reply = "```json\n{\"action\": \"hold\", \"amount\": 0}\n```";
        assert_eq!(extract_json(reply), Some("{\"action\": \"hold\", \"amount\": 0}"));
        assert_eq!(extract_json("no braces here"), None);
        assert_eq!(extract_json("} {"), None);
    }

    #[test]
    fn reply_parses_into_raw_response() {
        let json = extract_json("Sure: {\"action\":\"BUY\",\"amount\":0.002,\"confidence\":72,\"reason\":\"breakout\"}").unwrap();
        let raw: AdvisorResponse = serde_json::from_str(json).unwrap();
        assert_eq!(raw.action, "BUY");
        assert_eq!(raw.confidence, 72.0);
        assert_eq!(raw.stop_loss, None);
    }

    #[test]
    fn candle_summary_reports_trend() {
        let rising = vec![candle(100, 101), candle(101, 103), candle(103, 105)];
        let summary = summarize_candles("5m", &rising);
        assert!(summary.contains("trend up"));
        assert!(summary.contains("volume 6"));
        assert_eq!(summarize_candles("1m", &[]), "1m candles: no data");
    }
}
