// src/connectors/binance.rs
use crate::config::ExchangeConfig;
use crate::connectors::traits::ExchangeClient;
use crate::types::{
    AssetBalance, Candle, OrderBook, OrderResponse, OrderType, PriceLevel, Side, Ticker,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::str::FromStr;
use tracing::info;

type HmacSha256 = Hmac<Sha256>;

pub struct BinanceClient {
    api_key: String,
    secret_key: String,
    http_client: Client,
    base_rest_url: String,
    recv_window_ms: u64,
}

impl BinanceClient {
    pub fn new(config: &ExchangeConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            http_client: Client::new(),
            base_rest_url: config.base_url.trim_end_matches('/').to_string(),
            recv_window_ms: config.recv_window_ms,
        }
    }

    fn sign_and_build_query(&self, mut params: Vec<(&str, String)>) -> Result<String> {
        params.push(("recvWindow", self.recv_window_ms.to_string()));
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));

        let query_string = serde_urlencoded::to_string(&params)?;
        let signature = sign(&self.secret_key, &query_string)?;

        Ok(format!("{}&signature={}", query_string, signature))
    }

    async fn send_signed_request<T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        endpoint: &str,
        params: Vec<(&str, String)>,
    ) -> Result<T> {
        let full_query = self.sign_and_build_query(params)?;
        let url = format!("{}{}?{}", self.base_rest_url, endpoint, full_query);

        let response = self
            .http_client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json::<T>().await?)
    }

    async fn get_public<T: for<'de> Deserialize<'de>>(&self, endpoint: &str, query: &str) -> Result<T> {
        let url = format!("{}{}?{}", self.base_rest_url, endpoint, query);
        let resp = self
            .http_client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<T>()
            .await?;
        Ok(resp)
    }
}

fn sign(secret_key: &str, payload: &str) -> Result<String> {
    let mut mac =
        HmacSha256::new_from_slice(secret_key.as_bytes()).context("Invalid secret key length")?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn dec(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).with_context(|| format!("not a decimal: {s:?}"))
}

fn levels(raw: &[[String; 2]]) -> Result<Vec<PriceLevel>> {
    raw.iter()
        .map(|[price, size]| {
            Ok(PriceLevel {
                price: dec(price)?,
                size: dec(size)?,
            })
        })
        .collect()
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Ticker24h {
            last_price: String,
            bid_price: String,
            ask_price: String,
            high_price: String,
            low_price: String,
            volume: String,
            price_change_percent: String,
        }

        let t: Ticker24h = self
            .get_public("/api/v3/ticker/24hr", &format!("symbol={}", symbol))
            .await?;

        Ok(Ticker {
            symbol: symbol.to_string(),
            price: dec(&t.last_price)?,
            bid_price: dec(&t.bid_price)?,
            ask_price: dec(&t.ask_price)?,
            high_24h: dec(&t.high_price)?,
            low_24h: dec(&t.low_price)?,
            volume_24h: dec(&t.volume)?,
            change_24h: dec(&t.price_change_percent)?,
            timestamp: Utc::now(),
        })
    }

    async fn get_account_assets(&self) -> Result<Vec<AssetBalance>> {
        #[derive(Deserialize)]
        struct Balance {
            asset: String,
            free: String,
            locked: String,
        }
        #[derive(Deserialize)]
        struct AccountInfo {
            balances: Vec<Balance>,
        }

        let resp: AccountInfo = self
            .send_signed_request(Method::GET, "/api/v3/account", vec![])
            .await?;

        resp.balances
            .into_iter()
            .map(|b| {
                let available = dec(&b.free)?;
                Ok(AssetBalance {
                    total: available + dec(&b.locked)?,
                    available,
                    asset: b.asset,
                })
            })
            .collect()
    }

    async fn create_order(
        &self,
        pair: &str,
        side: Side,
        order_type: OrderType,
        quantity: Decimal,
    ) -> Result<OrderResponse> {
        let side_str = match side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };

        let params = vec![
            ("symbol", pair.to_string()),
            ("side", side_str.to_string()),
            ("type", order_type.as_str().to_string()),
            ("quantity", quantity.to_string()),
            ("newOrderRespType", "FULL".to_string()),
        ];

        #[derive(Deserialize)]
        struct Fill {
            price: String,
            qty: String,
            commission: String,
            #[serde(rename = "commissionAsset")]
            commission_asset: String,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct BinanceOrderResponse {
            order_id: u64,
            symbol: String,
            status: String,
            executed_qty: String,
            #[serde(default)]
            fills: Vec<Fill>,
        }

        info!("Sending order: {} {} {} {}", side_str, quantity, pair, order_type.as_str());

        let resp: BinanceOrderResponse = self
            .send_signed_request(Method::POST, "/api/v3/order", params)
            .await?;

        let mut notional = Decimal::ZERO;
        let mut filled = Decimal::ZERO;
        let mut fee = Decimal::ZERO;
        for fill in &resp.fills {
            let price = dec(&fill.price)?;
            let qty = dec(&fill.qty)?;
            notional += price * qty;
            filled += qty;
            // Commission charged in the base asset is converted at the fill price.
            let commission = dec(&fill.commission)?;
            fee += if pair.starts_with(&fill.commission_asset) {
                commission * price
            } else {
                commission
            };
        }

        Ok(OrderResponse {
            id: resp.order_id.to_string(),
            symbol: resp.symbol,
            status: resp.status,
            executed_qty: Some(dec(&resp.executed_qty)?),
            avg_price: (!filled.is_zero()).then(|| notional / filled),
            fee: (!resp.fills.is_empty()).then_some(fee),
        })
    }

    async fn get_candles(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>> {
        // [openTime, open, high, low, close, volume, closeTime, ...]
        let rows: Vec<Vec<serde_json::Value>> = self
            .get_public(
                "/api/v3/klines",
                &format!("symbol={}&interval={}&limit={}", symbol, interval, limit),
            )
            .await?;

        rows.iter()
            .map(|row| {
                let field = |i: usize| -> Result<Decimal> {
                    row.get(i)
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| anyhow!("kline field {} missing", i))
                        .and_then(dec)
                };
                Ok(Candle {
                    open_time: row.first().and_then(|v| v.as_i64()).unwrap_or_default(),
                    open: field(1)?,
                    high: field(2)?,
                    low: field(3)?,
                    close: field(4)?,
                    volume: field(5)?,
                })
            })
            .collect()
    }

    async fn get_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook> {
        #[derive(Deserialize)]
        struct Depth {
            bids: Vec<[String; 2]>,
            asks: Vec<[String; 2]>,
        }

        let d: Depth = self
            .get_public("/api/v3/depth", &format!("symbol={}&limit={}", symbol, depth))
            .await?;

        Ok(OrderBook {
            bids: levels(&d.bids)?,
            asks: levels(&d.asks)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_reference_vector() {
        // Example from the Binance REST documentation.
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        assert_eq!(
            sign(secret, query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn depth_levels_parse() {
        let raw = vec![["100.5".to_string(), "2".to_string()]];
        let parsed = levels(&raw).unwrap();
        assert_eq!(parsed[0].price, Decimal::new(1005, 1));
        assert!(levels(&[["x".to_string(), "1".to_string()]]).is_err());
    }
}
