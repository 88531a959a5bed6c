//! Normalized order-lifecycle model and the raw wire shapes it is built from.
//!
//! The exchange delivers JSON frames with single-letter keys; everything
//! downstream of the event processor works on `OrderUpdate` instead.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::logging::ts_epoch;

/// A raw frame as handed off from the transport's receive task. Moved by
/// value through the frame queue and consumed exactly once.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub payload: Map<String, Value>,
    pub received_at: u64,
}

impl RawFrame {
    pub fn new(payload: Map<String, Value>) -> Self {
        Self {
            payload,
            received_at: ts_epoch(),
        }
    }
}

/// Known user-data event kinds plus the liveness fallback. Closed set:
/// a new exchange event kind becomes a compile error at the match sites,
/// not a silently dropped frame.
#[derive(Debug)]
pub enum StreamEvent {
    ExecutionReport(ExecutionReport),
    AccountPosition(AccountPosition),
    BalanceUpdate(BalanceUpdate),
    ListStatus(ListStatus),
    /// Transport-level error marker; triggers reconnection.
    TransportError { message: String },
    /// Any frame without a recognized discriminator counts as liveness.
    Heartbeat,
}

/// Event kinds consumers may register callbacks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    ExecutionReport,
    AccountPosition,
    BalanceUpdate,
    ListStatus,
}

impl EventType {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "executionReport" => Some(EventType::ExecutionReport),
            "accountPosition" => Some(EventType::AccountPosition),
            "balanceUpdate" => Some(EventType::BalanceUpdate),
            "listStatus" => Some(EventType::ListStatus),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ExecutionReport => "executionReport",
            EventType::AccountPosition => "accountPosition",
            EventType::BalanceUpdate => "balanceUpdate",
            EventType::ListStatus => "listStatus",
        }
    }
}

// =============================================================================
// Wire shapes (exchange short keys)
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionReport {
    #[serde(rename = "E", default)]
    pub event_time: u64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "c", default)]
    pub client_order_id: String,
    #[serde(rename = "S")]
    pub side: String,
    #[serde(rename = "o", default)]
    pub order_type: String,
    #[serde(rename = "X")]
    pub order_status: String,
    #[serde(rename = "i")]
    pub order_id: u64,
    #[serde(rename = "p", default)]
    pub price: String,
    #[serde(rename = "q", default)]
    pub qty: String,
    #[serde(rename = "z", default)]
    pub cum_filled_qty: String,
    #[serde(rename = "l", default)]
    pub last_fill_qty: String,
    #[serde(rename = "L", default)]
    pub last_fill_price: String,
    #[serde(rename = "T", default)]
    pub transact_time: u64,
    #[serde(rename = "m", default)]
    pub is_maker: bool,
    #[serde(rename = "R", default)]
    pub is_reduce_only: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountPosition {
    #[serde(rename = "E", default)]
    pub event_time: u64,
    #[serde(rename = "B", default)]
    pub balances: Vec<AccountBalance>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountBalance {
    #[serde(rename = "a")]
    pub asset: String,
    #[serde(rename = "f", default)]
    pub free: String,
    #[serde(rename = "l", default)]
    pub locked: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BalanceUpdate {
    #[serde(rename = "E", default)]
    pub event_time: u64,
    #[serde(rename = "a")]
    pub asset: String,
    #[serde(rename = "d", default)]
    pub delta: String,
    #[serde(rename = "T", default)]
    pub clear_time: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListStatus {
    #[serde(rename = "E", default)]
    pub event_time: u64,
    #[serde(rename = "s", default)]
    pub symbol: String,
    #[serde(rename = "g", default)]
    pub order_list_id: i64,
    #[serde(rename = "l", default)]
    pub list_status_type: String,
    #[serde(rename = "L", default)]
    pub list_order_status: String,
    #[serde(rename = "T", default)]
    pub transact_time: u64,
}

/// Classify a raw frame into the closed event set.
///
/// Parse failures on a recognized discriminator are logged by the caller and
/// degrade to `Heartbeat`: a malformed frame is still a liveness signal.
pub fn classify(frame: &RawFrame) -> StreamEvent {
    if let Some(err) = frame.payload.get("error") {
        return StreamEvent::TransportError {
            message: err.to_string(),
        };
    }
    let value = Value::Object(frame.payload.clone());
    match frame.payload.get("e").and_then(|e| e.as_str()) {
        Some("error") => StreamEvent::TransportError {
            message: value.to_string(),
        },
        Some("executionReport") => match serde_json::from_value::<ExecutionReport>(value) {
            Ok(report) => StreamEvent::ExecutionReport(report),
            Err(_) => StreamEvent::Heartbeat,
        },
        Some("outboundAccountPosition") => {
            match serde_json::from_value::<AccountPosition>(value) {
                Ok(update) => StreamEvent::AccountPosition(update),
                Err(_) => StreamEvent::Heartbeat,
            }
        }
        Some("balanceUpdate") => match serde_json::from_value::<BalanceUpdate>(value) {
            Ok(update) => StreamEvent::BalanceUpdate(update),
            Err(_) => StreamEvent::Heartbeat,
        },
        Some("listStatus") => match serde_json::from_value::<ListStatus>(value) {
            Ok(status) => StreamEvent::ListStatus(status),
            Err(_) => StreamEvent::Heartbeat,
        },
        _ => StreamEvent::Heartbeat,
    }
}

// =============================================================================
// Normalized model
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    Unknown,
}

impl OrderStatus {
    /// Terminal states are final; the tracker refuses any later transition
    /// to a different status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }

    pub fn from_wire(status: &str) -> Self {
        match status {
            "NEW" => OrderStatus::Open,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELED" | "PENDING_CANCEL" => OrderStatus::Canceled,
            "REJECTED" => OrderStatus::Rejected,
            "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Expired,
            _ => OrderStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Expired => "expired",
            OrderStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillRecord {
    pub price: f64,
    pub qty: f64,
    pub ts: u64,
}

/// Normalized view of one execution report. `fills` is cumulative and
/// maintained by the tracker; `last_fill` carries just this report's fill,
/// if any.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub order_type: String,
    pub status: OrderStatus,
    pub price: f64,
    pub qty: f64,
    pub filled_qty: f64,
    pub remaining_qty: f64,
    pub ts: u64,
    pub is_maker: bool,
    pub is_reduce_only: bool,
    pub last_fill: Option<FillRecord>,
    pub fills: Vec<FillRecord>,
}

impl OrderUpdate {
    pub fn from_report(report: &ExecutionReport) -> Self {
        let qty: f64 = report.qty.parse().unwrap_or(0.0);
        let filled_qty: f64 = report.cum_filled_qty.parse().unwrap_or(0.0);
        let last_qty: f64 = report.last_fill_qty.parse().unwrap_or(0.0);
        let last_price: f64 = report.last_fill_price.parse().unwrap_or(0.0);
        let ts = if report.transact_time > 0 {
            report.transact_time
        } else {
            report.event_time
        };

        let last_fill = if last_qty > 0.0 {
            Some(FillRecord {
                price: last_price,
                qty: last_qty,
                ts,
            })
        } else {
            None
        };

        Self {
            order_id: report.order_id.to_string(),
            client_order_id: if report.client_order_id.is_empty() {
                None
            } else {
                Some(report.client_order_id.clone())
            },
            symbol: report.symbol.clone(),
            side: if report.side == "BUY" {
                Side::Buy
            } else {
                Side::Sell
            },
            order_type: report.order_type.clone(),
            status: OrderStatus::from_wire(&report.order_status),
            price: report.price.parse().unwrap_or(0.0),
            qty,
            filled_qty,
            remaining_qty: (qty - filled_qty).max(0.0),
            ts,
            is_maker: report.is_maker,
            is_reduce_only: report.is_reduce_only,
            last_fill,
            fills: Vec::new(),
        }
    }
}
