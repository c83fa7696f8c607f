//! HTTP client for a terminal bridge process.
//!
//! The bridge exposes one broker terminal per account over a small JSON
//! API. Result codes are forwarded as-is inside [`TerminalError::Rejected`].

use super::error::TerminalError;
use super::traits::TerminalClient;
use super::types::{OpenRequest, PositionId, ProviderPosition, Side};
use crate::config::TerminalConfig;
use crate::utils::{decimal_from_wire, level_from_wire, level_to_wire};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Request completed.
const RETCODE_DONE: i32 = 10009;
/// Order placed (accepted for execution).
const RETCODE_PLACED: i32 = 10008;

const ORDER_TYPE_BUY: u8 = 0;
const ORDER_TYPE_SELL: u8 = 1;

#[derive(Debug, Deserialize)]
struct BridgePosition {
    ticket: u64,
    symbol: String,
    #[serde(rename = "type")]
    order_type: u8,
    volume: f64,
    price_open: f64,
    #[serde(default)]
    sl: f64,
    #[serde(default)]
    tp: f64,
    time: i64,
    #[serde(default)]
    comment: String,
}

#[derive(Debug, Serialize)]
struct BridgeOrder<'a> {
    symbol: &'a str,
    #[serde(rename = "type")]
    order_type: u8,
    volume: f64,
    sl: f64,
    tp: f64,
    deviation: u32,
    magic: u64,
    comment: &'a str,
}

#[derive(Debug, Serialize)]
struct BridgeModify {
    sl: f64,
    tp: f64,
}

#[derive(Debug, Serialize)]
struct BridgeClose {
    deviation: u32,
}

#[derive(Debug, Deserialize)]
struct BridgeResult {
    retcode: i32,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    position_ticket: Option<u64>,
}

impl BridgeResult {
    fn into_result(self) -> Result<Self, TerminalError> {
        if self.retcode == RETCODE_DONE || self.retcode == RETCODE_PLACED {
            Ok(self)
        } else {
            Err(TerminalError::Rejected {
                code: self.retcode,
                message: self.comment,
            })
        }
    }
}

impl BridgePosition {
    fn into_position(self) -> Option<ProviderPosition> {
        let side = match self.order_type {
            ORDER_TYPE_BUY => Side::Buy,
            ORDER_TYPE_SELL => Side::Sell,
            other => {
                warn!(ticket = self.ticket, order_type = other, "Skipping position with unknown type");
                return None;
            }
        };

        Some(ProviderPosition {
            position_id: self.ticket,
            symbol: self.symbol,
            side,
            volume: decimal_from_wire(self.volume),
            open_price: decimal_from_wire(self.price_open),
            stop_loss: level_from_wire(self.sl),
            take_profit: level_from_wire(self.tp),
            opened_at: DateTime::<Utc>::from_timestamp(self.time, 0).unwrap_or_default(),
            comment: self.comment,
        })
    }
}

/// Terminal client speaking to a bridge over HTTP.
pub struct BridgeClient {
    http: Client,
    base_url: String,
    account_path: String,
    secret: String,
    timeout: Duration,
    deviation_points: u32,
}

impl BridgeClient {
    /// Create a client for `account_id` behind the configured bridge.
    pub fn new(account_id: &str, config: &TerminalConfig, deviation_points: u32) -> Result<Self> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: config.bridge_url.trim_end_matches('/').to_string(),
            account_path: format!("/accounts/{}", urlencoding::encode(account_id)),
            secret: config.bridge_secret.clone(),
            timeout,
            deviation_points,
        })
    }

    /// HMAC-SHA256 over timestamp, method, path and body.
    fn sign(&self, payload: &str) -> Result<String, TerminalError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes())
            .map_err(|e| TerminalError::Disconnected(format!("invalid bridge secret: {e}")))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn transport_error(&self, error: reqwest::Error) -> TerminalError {
        if error.is_timeout() {
            TerminalError::Timeout(self.timeout)
        } else {
            TerminalError::Disconnected(error.to_string())
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
    ) -> Result<reqwest::Response, TerminalError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method.clone(), &url);

        if !self.secret.is_empty() {
            let timestamp = Utc::now().timestamp_millis();
            let payload = format!(
                "{}{}{}{}",
                timestamp,
                method.as_str(),
                path,
                body.as_deref().unwrap_or_default()
            );
            request = request
                .header("X-Bridge-Timestamp", timestamp.to_string())
                .header("X-Bridge-Signature", self.sign(&payload)?);
        }
        if let Some(body) = body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        request.send().await.map_err(|e| self.transport_error(e))
    }

    /// POST a JSON body and interpret the bridge's result code.
    async fn post_action<B: Serialize>(
        &self,
        path: &str,
        body: &B,
        position_id: Option<PositionId>,
    ) -> Result<BridgeResult, TerminalError> {
        let body = serde_json::to_string(body)
            .map_err(|e| TerminalError::Disconnected(format!("failed to encode request: {e}")))?;
        let response = self.send(Method::POST, path, Some(body)).await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            if let Some(position_id) = position_id {
                return Err(TerminalError::PositionNotFound(position_id));
            }
        }
        if !status.is_success() {
            return Err(TerminalError::Disconnected(format!("bridge returned HTTP {status}")));
        }

        let result: BridgeResult = response
            .json()
            .await
            .map_err(|e| TerminalError::Disconnected(format!("malformed bridge response: {e}")))?;
        result.into_result()
    }
}

fn volume_to_wire(volume: Decimal) -> f64 {
    volume.to_f64().unwrap_or_default()
}

#[async_trait]
impl TerminalClient for BridgeClient {
    #[instrument(skip(self), fields(account = %self.account_path))]
    async fn snapshot(&self) -> Result<Vec<ProviderPosition>, TerminalError> {
        let path = format!("{}/positions", self.account_path);
        let response = self.send(Method::GET, &path, None).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TerminalError::Disconnected(format!("bridge returned HTTP {status}")));
        }

        let positions: Vec<BridgePosition> = response
            .json()
            .await
            .map_err(|e| TerminalError::Disconnected(format!("malformed positions response: {e}")))?;

        debug!(count = positions.len(), "Fetched positions");
        Ok(positions
            .into_iter()
            .filter_map(BridgePosition::into_position)
            .collect())
    }

    #[instrument(skip(self, request), fields(account = %self.account_path, symbol = %request.symbol))]
    async fn open(&self, request: &OpenRequest) -> Result<PositionId, TerminalError> {
        let order = BridgeOrder {
            symbol: &request.symbol,
            order_type: match request.side {
                Side::Buy => ORDER_TYPE_BUY,
                Side::Sell => ORDER_TYPE_SELL,
            },
            volume: volume_to_wire(request.volume),
            sl: level_to_wire(request.stop_loss),
            tp: level_to_wire(request.take_profit),
            deviation: request.deviation_points,
            magic: request.magic_number,
            comment: &request.comment,
        };
        let path = format!("{}/orders", self.account_path);
        let result = self.post_action(&path, &order, None).await?;

        result.position_ticket.ok_or_else(|| {
            TerminalError::Disconnected("bridge accepted order without a position ticket".into())
        })
    }

    #[instrument(skip(self), fields(account = %self.account_path))]
    async fn modify(
        &self,
        position_id: PositionId,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<(), TerminalError> {
        let body = BridgeModify {
            sl: level_to_wire(stop_loss),
            tp: level_to_wire(take_profit),
        };
        let path = format!("{}/positions/{}/modify", self.account_path, position_id);
        self.post_action(&path, &body, Some(position_id)).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(account = %self.account_path))]
    async fn close(&self, position_id: PositionId) -> Result<(), TerminalError> {
        let body = BridgeClose {
            deviation: self.deviation_points,
        };
        let path = format!("{}/positions/{}/close", self.account_path, position_id);
        self.post_action(&path, &body, Some(position_id)).await?;
        Ok(())
    }
}
