//! REST side of the user-data session: listen key lifecycle and the signed
//! open-orders snapshot used to seed the tracker at startup.

use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::Deserialize;

use crate::error::ConnectError;
use crate::signing::sign_query;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListenKeyResponse {
    listen_key: String,
}

/// A currently open order, as reported by the REST snapshot.
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub price: f64,
    pub orig_qty: f64,
    pub executed_qty: f64,
    pub status: String,
    pub update_time: u64,
}

#[derive(Clone)]
pub struct RestClient {
    client: Client,
    base: String,
    api_key: String,
    api_secret: String,
}

impl RestClient {
    pub fn new(base: String, api_key: String, api_secret: String) -> Self {
        Self {
            client: Client::new(),
            base,
            api_key,
            api_secret,
        }
    }

    fn timestamp_ms() -> u64 {
        chrono::Utc::now().timestamp_millis() as u64
    }

    /// Obtain a fresh listen key. A credential rejection (401/403) is
    /// non-retryable; anything else is transient.
    pub async fn create_listen_key(&self) -> Result<String, ConnectError> {
        let url = format!("{}/api/v3/userDataStream", self.base);
        let resp = self
            .client
            .post(url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| ConnectError::Transient(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ConnectError::Transient(e.to_string()))?;

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ConnectError::Auth(body));
        }
        if !status.is_success() {
            return Err(ConnectError::Transient(format!(
                "userDataStream {}: {}",
                status, body
            )));
        }

        let parsed: ListenKeyResponse =
            serde_json::from_str(&body).map_err(|e| ConnectError::Transient(e.to_string()))?;
        Ok(parsed.listen_key)
    }

    /// Renew the listen key in place. The server keeps the same key alive;
    /// the open socket is untouched.
    pub async fn keepalive_listen_key(&self, listen_key: &str) -> Result<()> {
        let url = format!(
            "{}/api/v3/userDataStream?listenKey={}",
            self.base, listen_key
        );
        let resp = self
            .client
            .put(url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("keepalive failed: {}", body));
        }
        Ok(())
    }

    /// Release the server-side listen key. Best-effort on teardown.
    pub async fn close_listen_key(&self, listen_key: &str) -> Result<()> {
        let url = format!(
            "{}/api/v3/userDataStream?listenKey={}",
            self.base, listen_key
        );
        let resp = self
            .client
            .delete(url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("close listen key failed: {}", body));
        }
        Ok(())
    }

    /// Signed snapshot of all open orders across symbols.
    pub async fn fetch_open_orders(&self) -> Result<Vec<OpenOrder>> {
        let timestamp = Self::timestamp_ms();
        let query = format!("timestamp={}&recvWindow=5000", timestamp);
        let signature = sign_query(&query, &self.api_secret).map_err(|e| anyhow!(e))?;
        let signed_query = format!("{}&signature={}", query, signature);
        let url = format!("{}/api/v3/openOrders?{}", self.base, signed_query);

        let resp = self
            .client
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("openOrders failed: {}", body));
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct WireOrder {
            order_id: u64,
            client_order_id: String,
            symbol: String,
            side: String,
            #[serde(rename = "type")]
            order_type: String,
            price: String,
            orig_qty: String,
            executed_qty: String,
            status: String,
            update_time: u64,
        }

        let orders: Vec<WireOrder> = resp.json().await?;
        Ok(orders
            .into_iter()
            .map(|o| OpenOrder {
                order_id: o.order_id.to_string(),
                client_order_id: o.client_order_id,
                symbol: o.symbol,
                side: o.side,
                order_type: o.order_type,
                price: o.price.parse().unwrap_or(0.0),
                orig_qty: o.orig_qty.parse().unwrap_or(0.0),
                executed_qty: o.executed_qty.parse().unwrap_or(0.0),
                status: o.status,
                update_time: o.update_time,
            })
            .collect())
    }
}
