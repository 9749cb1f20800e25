#![allow(dead_code)]

use accrual_engine::config::EngineConfig;
use accrual_engine::domain::order::OrderNumber;
use serde_json::json;
use std::fs::File;
use std::future::Future;
use std::io::Error;
use std::path::Path;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Appends the Luhn check digit to `payload`.
pub fn with_check_digit(payload: u64) -> String {
    let digits = payload.to_string();
    let sum: u32 = digits
        .bytes()
        .rev()
        .enumerate()
        .map(|(i, b)| {
            let d = u32::from(b - b'0');
            if i % 2 == 0 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    format!("{digits}{}", (10 - sum % 10) % 10)
}

pub fn order(payload: u64) -> OrderNumber {
    OrderNumber::parse(&with_check_digit(payload)).unwrap()
}

/// Engine settings small enough for tests to finish quickly.
pub fn fast_config(server: &MockServer, workers: usize) -> EngineConfig {
    EngineConfig {
        workers,
        empty_queue_backoff: Duration::from_millis(10),
        request_timeout: Duration::from_secs(2),
        ..EngineConfig::with_address(server.uri())
    }
}

/// Answers every poll for `order` with the given status and accrual.
pub async fn respond_status(
    server: &MockServer,
    order: &OrderNumber,
    status: &str,
    accrual: Option<f64>,
) {
    let mut body = json!({ "order": order.as_str(), "status": status });
    if let Some(accrual) = accrual {
        body["accrual"] = json!(accrual);
    }
    Mock::given(method("GET"))
        .and(path(format!("/api/orders/{order}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

/// Answers every poll for `order` with a bare HTTP status code.
pub async fn respond_code(server: &MockServer, order: &OrderNumber, code: u16) {
    Mock::given(method("GET"))
        .and(path(format!("/api/orders/{order}")))
        .respond_with(ResponseTemplate::new(code))
        .mount(server)
        .await;
}

/// Polls `check` until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}

/// Writes a `user,order` CSV with `rows` orders for user 1.
pub fn generate_orders_csv(path: &Path, rows: u64) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);

    wtr.write_record(["user", "order"])?;
    for i in 1..=rows {
        wtr.write_record(["1", &with_check_digit(1000 + i)])?;
    }

    wtr.flush()?;
    Ok(())
}

/// How many times the mock service was asked about `order`.
pub async fn requests_for(server: &MockServer, order: &OrderNumber) -> usize {
    let wanted = format!("/api/orders/{order}");
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path() == wanted)
        .count()
}

/// Reports every polled order as processed with a fixed accrual.
pub struct ProcessEverything(pub f64);

impl Respond for ProcessEverything {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let order = request.url.path().rsplit('/').next().unwrap_or_default();
        ResponseTemplate::new(200).set_body_json(json!({
            "order": order,
            "status": "PROCESSED",
            "accrual": self.0,
        }))
    }
}
