use crate::domain::accrual::{Points, TerminalStatus};
use crate::domain::order::OrderNumber;
use crate::domain::resolution::{DeferReason, Resolution};
use crate::error::{AccrualError, Result};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Body of a 200 answer from the accrual service.
#[derive(Debug, Deserialize)]
struct AccrualResponse {
    order: String,
    status: String,
    #[serde(default)]
    accrual: Option<Decimal>,
}

/// Client for `GET {base}/api/orders/{number}` on the external accrual service.
#[derive(Debug, Clone)]
pub struct AccrualClient {
    client: Client,
    orders_url: String,
}

impl AccrualClient {
    /// Creates a client whose every request carries `timeout` as its deadline.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/');
        if base_url.is_empty() {
            return Err(AccrualError::Config(
                "accrual system address not configured".to_string(),
            ));
        }

        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            orders_url: format!("{base_url}/api/orders"),
        })
    }

    /// Polls the service once for `order` and classifies the answer.
    ///
    /// Timeouts, truncated bodies and redirect loops come back as a deferral.
    /// Connection failures and malformed bodies are errors: they mean the
    /// service or the network is broken, not that the order is still being
    /// processed.
    pub async fn query(&self, order: &OrderNumber) -> Result<Resolution> {
        let url = format!("{}/{}", self.orders_url, order);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => return deferral_for(e).map(Resolution::Defer),
        };

        let status = response.status();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => return deferral_for(e).map(Resolution::Defer),
        };
        debug!(%order, status = status.as_u16(), "accrual service answered");

        classify(order, status, &body)
    }
}

/// Transport failures that leave the order retryable. Anything else is
/// returned as an error.
fn deferral_for(e: reqwest::Error) -> Result<DeferReason> {
    if e.is_timeout() {
        Ok(DeferReason::TimedOut)
    } else if e.is_body() || e.is_redirect() {
        Ok(DeferReason::Transport(e.to_string()))
    } else {
        Err(e.into())
    }
}

/// Maps one accrual service answer to what the engine does with the order.
///
/// The order echoed in a 200 body is informational: a mismatch is logged and
/// the answer is still applied to the order that was asked about.
pub fn classify(order: &OrderNumber, status: StatusCode, body: &[u8]) -> Result<Resolution> {
    match status {
        StatusCode::OK => {
            let response: AccrualResponse = serde_json::from_slice(body)?;
            if response.order != order.as_str() {
                warn!(%order, answered = %response.order, "accrual answer names another order");
            }
            let accrual = Points::new(response.accrual.unwrap_or_default())?;
            Ok(match response.status.as_str() {
                "PROCESSED" => Resolution::Finalize {
                    status: TerminalStatus::Processed,
                    accrual,
                },
                "INVALID" => Resolution::Finalize {
                    status: TerminalStatus::Invalid,
                    accrual,
                },
                other => Resolution::Defer(DeferReason::Pending(other.to_string())),
            })
        }
        StatusCode::TOO_MANY_REQUESTS => Ok(Resolution::Defer(DeferReason::RateLimited)),
        StatusCode::INTERNAL_SERVER_ERROR => Ok(Resolution::Defer(DeferReason::ServerError)),
        other => Ok(Resolution::Defer(DeferReason::UnexpectedStatus(other.as_u16()))),
    }
}
