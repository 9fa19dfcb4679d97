use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::Config;
use crate::errors::{classify_error, with_retry, ExchangeError};
use crate::quantize::SymbolFilters;
use crate::types::Side;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
}

#[derive(Debug, Clone)]
pub struct ExchangeOrderInfo {
    pub order_id: String,
    pub order_status: String, // "New" | "PartiallyFilled" | "Filled" | "Cancelled" | "Rejected"
    pub avg_price: Decimal,
    pub cum_exec_qty: Decimal,
    pub qty: Decimal,
}

#[derive(Debug, Clone)]
pub struct ExchangePositionInfo {
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub avg_price: Decimal,
}

/// Direct generalization of the teacher's `BybitClient`: same signing scheme, same
/// retCode==0 success rule, same error taxonomy, extended with the dual-limit and
/// quantization primitives the entry/lifecycle engines need.
#[derive(Clone)]
pub struct BybitGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    recv_window_ms: u64,
}

impl BybitGateway {
    pub fn new(cfg: &Config) -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("HTTP client build failed");

        BybitGateway {
            client,
            base_url: cfg.bybit_rest_url.clone(),
            api_key: cfg.bybit_api_key.clone(),
            api_secret: cfg.bybit_api_secret.clone(),
            recv_window_ms: cfg.recv_window_ms,
        }
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.api_secret.as_bytes()).expect("HMAC init failed");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_headers(&self, body: &str) -> reqwest::header::HeaderMap {
        let ts = Self::timestamp_ms().to_string();
        let recv_window = self.recv_window_ms.to_string();
        let payload = format!("{}{}{}{}", ts, self.api_key, recv_window, body);
        let signature = self.sign(&payload);

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("X-BAPI-API-KEY", self.api_key.parse().unwrap());
        headers.insert("X-BAPI-TIMESTAMP", ts.parse().unwrap());
        headers.insert("X-BAPI-SIGN", signature.parse().unwrap());
        headers.insert("X-BAPI-RECV-WINDOW", recv_window.parse().unwrap());
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            "application/json".parse().unwrap(),
        );
        headers
    }

    fn signed_get_headers(&self, query: &str) -> reqwest::header::HeaderMap {
        let ts = Self::timestamp_ms().to_string();
        let recv_window = self.recv_window_ms.to_string();
        let payload = format!("{}{}{}{}", ts, self.api_key, recv_window, query);
        let signature = self.sign(&payload);

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("X-BAPI-API-KEY", self.api_key.parse().unwrap());
        headers.insert("X-BAPI-TIMESTAMP", ts.parse().unwrap());
        headers.insert("X-BAPI-SIGN", signature.parse().unwrap());
        headers.insert("X-BAPI-RECV-WINDOW", recv_window.parse().unwrap());
        headers
    }

    async fn post_json(&self, path: &str, body: String) -> Result<serde_json::Value, ExchangeError> {
        let url = format!("{}{}", self.base_url, path);
        let headers = self.signed_headers(&body);
        let resp = self
            .client
            .post(&url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("HTTP error: {}", e)))?;

        let http_status = resp.status().as_u16();
        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transient(format!("parse error: {}", e)))?;

        let ret_code = json["retCode"].as_i64().unwrap_or(-1);
        if ret_code == 0 {
            Ok(json)
        } else {
            let msg = json["retMsg"].as_str().unwrap_or("unknown");
            Err(classify_error(ret_code, http_status, msg))
        }
    }

    async fn get_json(&self, path: &str, query: &str) -> Result<serde_json::Value, ExchangeError> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        let headers = self.signed_get_headers(query);
        let resp = self
            .client
            .get(&url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("HTTP error: {}", e)))?;

        let http_status = resp.status().as_u16();
        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transient(format!("parse error: {}", e)))?;

        let ret_code = json["retCode"].as_i64().unwrap_or(-1);
        if ret_code == 0 {
            Ok(json)
        } else {
            let msg = json["retMsg"].as_str().unwrap_or("unknown");
            Err(classify_error(ret_code, http_status, msg))
        }
    }

    async fn place_limit_raw(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        price: Decimal,
        post_only: bool,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "side": side.as_bybit(),
            "orderType": "Limit",
            "qty": qty.to_string(),
            "price": price.to_string(),
            "timeInForce": if post_only { "PostOnly" } else { "GTC" },
            "reduceOnly": reduce_only,
        })
        .to_string();

        let json = self.post_json("/v5/order/create", body).await?;
        let order_id = json["result"]["orderId"].as_str().unwrap_or("").to_string();
        log::info!("limit order placed: {} {} qty={} price={}", side.as_bybit(), symbol, qty, price);
        Ok(OrderAck { order_id })
    }

    /// Place a (possibly post-only) limit order, retried against transient failures only —
    /// permanent rejections (bad qty, insufficient margin) surface immediately.
    pub async fn place_limit(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        price: Decimal,
        post_only: bool,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError> {
        let s = self.clone();
        let sym = symbol.to_string();
        with_retry(
            || {
                let s = s.clone();
                let sym = sym.clone();
                async move {
                    s.place_limit_raw(&sym, side, qty, price, post_only, reduce_only)
                        .await
                }
            },
            3,
        )
        .await
    }

    async fn place_market_raw(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "side": side.as_bybit(),
            "orderType": "Market",
            "qty": qty.to_string(),
            "timeInForce": "IOC",
            "reduceOnly": reduce_only,
        })
        .to_string();

        let json = self.post_json("/v5/order/create", body).await?;
        let order_id = json["result"]["orderId"].as_str().unwrap_or("").to_string();
        log::info!("market order placed: {} {} qty={}", side.as_bybit(), symbol, qty);
        Ok(OrderAck { order_id })
    }

    /// Place an immediate-or-cancel market order (pyramid adds, hedge opens): the spec needs
    /// the fill now, not a resting post-only leg that might never cross.
    pub async fn place_market(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError> {
        let s = self.clone();
        let sym = symbol.to_string();
        with_retry(
            || {
                let s = s.clone();
                let sym = sym.clone();
                async move { s.place_market_raw(&sym, side, qty, reduce_only).await }
            },
            3,
        )
        .await
    }

    /// Cancel a resting order.
    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let s = self.clone();
        let sym = symbol.to_string();
        let oid = order_id.to_string();
        with_retry(
            || {
                let s = s.clone();
                let sym = sym.clone();
                let oid = oid.clone();
                async move {
                    let body = serde_json::json!({
                        "category": "linear",
                        "symbol": sym,
                        "orderId": oid,
                    })
                    .to_string();
                    s.post_json("/v5/order/cancel", body).await.map(|_| ())
                }
            },
            3,
        )
        .await
    }

    /// Fetch the current state of a single order (used for the entry-engine fill poll).
    pub async fn get_order(&self, symbol: &str, order_id: &str) -> Result<ExchangeOrderInfo, ExchangeError> {
        let s = self.clone();
        let sym = symbol.to_string();
        let oid = order_id.to_string();
        with_retry(
            || {
                let s = s.clone();
                let sym = sym.clone();
                let oid = oid.clone();
                async move {
                    let query = format!("category=linear&symbol={}&orderId={}", sym, oid);
                    let json = s.get_json("/v5/order/realtime", &query).await?;
                    let entry = json["result"]["list"]
                        .as_array()
                        .and_then(|a| a.first())
                        .cloned()
                        .ok_or_else(|| ExchangeError::Transient("order not found".into()))?;
                    parse_order_info(&entry)
                }
            },
            5,
        )
        .await
    }

    /// Fetch all open positions (single REST call), keyed implicitly by symbol+side via the
    /// returned vec — mirrors the teacher's `get_all_open_positions`.
    pub async fn get_positions(&self) -> Result<Vec<ExchangePositionInfo>, ExchangeError> {
        let s = self.clone();
        with_retry(
            || {
                let s = s.clone();
                async move {
                    let query = "category=linear&settleCoin=USDT&limit=200";
                    let json = s.get_json("/v5/position/list", query).await?;
                    let list = match json["result"]["list"].as_array() {
                        Some(l) => l,
                        None => return Ok(Vec::new()),
                    };
                    let mut out = Vec::new();
                    for entry in list {
                        let size: Decimal = entry["size"]
                            .as_str()
                            .and_then(|s| s.parse().ok())
                            .unwrap_or(Decimal::ZERO);
                        if size.is_zero() {
                            continue;
                        }
                        let symbol = match entry["symbol"].as_str() {
                            Some(s) => s.to_string(),
                            None => continue,
                        };
                        let side = match entry["side"].as_str() {
                            Some("Buy") => Side::Long,
                            _ => Side::Short,
                        };
                        let avg_price = entry["avgPrice"]
                            .as_str()
                            .and_then(|s| s.parse().ok())
                            .unwrap_or(Decimal::ZERO);
                        out.push(ExchangePositionInfo { symbol, side, size, avg_price });
                    }
                    Ok(out)
                }
            },
            5,
        )
        .await
    }

    /// Fetch tick size / qty step / min qty for a symbol.
    pub async fn get_symbol_info(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        let url = format!(
            "{}/v5/market/instruments-info?category=linear&symbol={}",
            self.base_url, symbol
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("HTTP error: {}", e)))?;
        let http_status = resp.status().as_u16();
        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transient(format!("parse error: {}", e)))?;
        let ret_code = json["retCode"].as_i64().unwrap_or(-1);
        if ret_code != 0 {
            let msg = json["retMsg"].as_str().unwrap_or("unknown");
            return Err(classify_error(ret_code, http_status, msg));
        }
        let entry = json["result"]["list"]
            .as_array()
            .and_then(|a| a.first())
            .ok_or_else(|| ExchangeError::Permanent("instruments-info: empty list".into()))?;

        let tick_size = entry["priceFilter"]["tickSize"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Decimal::new(1, 2));
        let qty_step = entry["lotSizeFilter"]["qtyStep"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Decimal::new(1, 3));
        let min_qty = entry["lotSizeFilter"]["minOrderQty"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(qty_step);

        Ok(SymbolFilters { tick_size, qty_step, min_qty })
    }

    /// Set leverage for a symbol (both buy/sell legs, linear perp convention).
    pub async fn set_leverage(&self, symbol: &str, leverage: Decimal) -> Result<(), ExchangeError> {
        let s = self.clone();
        let sym = symbol.to_string();
        with_retry(
            || {
                let s = s.clone();
                let sym = sym.clone();
                async move {
                    let body = serde_json::json!({
                        "category": "linear",
                        "symbol": sym,
                        "buyLeverage": leverage.to_string(),
                        "sellLeverage": leverage.to_string(),
                    })
                    .to_string();
                    match s.post_json("/v5/position/set-leverage", body).await {
                        Ok(_) => Ok(()),
                        // leverage already at this value — Bybit returns retCode=110043, treat as success
                        Err(ExchangeError::Permanent(msg)) if msg.contains("110043") => Ok(()),
                        Err(e) => Err(e),
                    }
                }
            },
            3,
        )
        .await
    }

    /// Amend a resting stop-loss/take-profit attached to a position (used by the trailing
    /// stop and TP2-breakeven logic).
    pub async fn set_trading_stop(
        &self,
        symbol: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<(), ExchangeError> {
        let s = self.clone();
        let sym = symbol.to_string();
        with_retry(
            || {
                let s = s.clone();
                let sym = sym.clone();
                async move {
                    let mut body = serde_json::json!({
                        "category": "linear",
                        "symbol": sym,
                        "tpslMode": "Full",
                    });
                    if let Some(sl) = stop_loss {
                        body["stopLoss"] = serde_json::Value::String(sl.to_string());
                    }
                    if let Some(tp) = take_profit {
                        body["takeProfit"] = serde_json::Value::String(tp.to_string());
                    }
                    s.post_json("/v5/position/trading-stop", body.to_string())
                        .await
                        .map(|_| ())
                }
            },
            3,
        )
        .await
    }

    /// Fetch the current mark price (used by pyramid/hedge pollers, public endpoint).
    pub async fn get_mark_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let url = format!(
            "{}/v5/market/tickers?category=linear&symbol={}",
            self.base_url, symbol
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("HTTP error: {}", e)))?;
        let http_status = resp.status().as_u16();
        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transient(format!("parse error: {}", e)))?;
        let ret_code = json["retCode"].as_i64().unwrap_or(-1);
        if ret_code != 0 {
            let msg = json["retMsg"].as_str().unwrap_or("unknown");
            return Err(classify_error(ret_code, http_status, msg));
        }
        json["result"]["list"]
            .as_array()
            .and_then(|a| a.first())
            .and_then(|e| e["markPrice"].as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ExchangeError::Transient("missing markPrice".into()))
    }

    /// Fetch available USDT balance on the unified trading account, used to size entries
    /// against real account equity rather than a fixed notional.
    pub async fn get_balance(&self) -> Result<Decimal, ExchangeError> {
        let s = self.clone();
        with_retry(
            || {
                let s = s.clone();
                async move {
                    let query = "accountType=UNIFIED&coin=USDT";
                    let json = s.get_json("/v5/account/wallet-balance", query).await?;
                    let coin = json["result"]["list"]
                        .as_array()
                        .and_then(|a| a.first())
                        .and_then(|acct| acct["coin"].as_array())
                        .and_then(|c| c.first())
                        .ok_or_else(|| ExchangeError::Transient("wallet-balance: empty list".into()))?;
                    coin["walletBalance"]
                        .as_str()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| ExchangeError::Transient("missing walletBalance".into()))
                }
            },
            5,
        )
        .await
    }
}

fn parse_order_info(entry: &serde_json::Value) -> Result<ExchangeOrderInfo, ExchangeError> {
    Ok(ExchangeOrderInfo {
        order_id: entry["orderId"].as_str().unwrap_or("").to_string(),
        order_status: entry["orderStatus"].as_str().unwrap_or("").to_string(),
        avg_price: entry["avgPrice"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Decimal::ZERO),
        cum_exec_qty: entry["cumExecQty"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Decimal::ZERO),
        qty: entry["qty"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Decimal::ZERO),
    })
}
