//! Poll a JSON endpoint that reports a flat object of metrics.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use super::poll::Poller;
use super::MetricReading;
use crate::error::SourceError;

/// GETs `url` each poll and turns every numeric field into a reading.
///
/// A `timestamp` field (epoch seconds or RFC 3339) stamps all readings of
/// that response; otherwise they are stamped at the adapter boundary.
pub struct HttpJsonPoller {
    client: Client,
    url: String,
}

impl HttpJsonPoller {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Io(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn fetch(&self) -> Result<Value, SourceError> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| SourceError::Io(format!("GET {}: {e}", self.url)))?;
        if !resp.status().is_success() {
            return Err(SourceError::Io(format!(
                "GET {} returned {}",
                self.url,
                resp.status()
            )));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))
    }
}

#[async_trait::async_trait]
impl Poller for HttpJsonPoller {
    async fn open(&mut self) -> Result<(), SourceError> {
        self.fetch().await.map(|_| ())
    }

    async fn poll(&mut self) -> Result<Vec<MetricReading>, SourceError> {
        let body = self.fetch().await?;
        let readings = readings_from_json(&body)?;
        debug!(url = %self.url, count = readings.len(), "polled metrics");
        Ok(readings)
    }
}

/// Extract numeric fields of a flat JSON object as readings, in key order.
pub fn readings_from_json(body: &Value) -> Result<Vec<MetricReading>, SourceError> {
    let obj = body
        .as_object()
        .ok_or_else(|| SourceError::Decode("expected a JSON object of metrics".into()))?;

    let timestamp = obj.get("timestamp").and_then(parse_timestamp);

    let mut readings: Vec<MetricReading> = obj
        .iter()
        .filter(|(k, _)| k.as_str() != "timestamp")
        .filter_map(|(k, v)| v.as_f64().map(|f| (k, f)))
        .filter(|(_, f)| f.is_finite())
        .map(|(k, f)| {
            let reading = MetricReading::new(k.clone(), f);
            match timestamp {
                Some(ts) => reading.at(ts),
                None => reading,
            }
        })
        .collect();
    readings.sort_by(|a, b| a.metric_name.cmp(&b.metric_name));
    Ok(readings)
}

fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::Number(n) => {
            let secs = n.as_f64()?;
            let whole = secs.trunc() as i64;
            let nanos = ((secs - secs.trunc()) * 1e9) as u32;
            Utc.timestamp_opt(whole, nanos).single()
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_fields_become_readings() {
        let body = json!({
            "cpu_usage": 41.5,
            "memory_usage": 60,
            "host": "web-1",
            "healthy": true
        });
        let readings = readings_from_json(&body).unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].metric_name, "cpu_usage");
        assert_eq!(readings[1].value, 60.0);
        assert!(readings.iter().all(|r| r.timestamp.is_none()));
    }

    #[test]
    fn test_timestamp_field_stamps_readings() {
        let body = json!({ "timestamp": 1_700_000_000, "cpu_usage": 1.0 });
        let readings = readings_from_json(&body).unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].timestamp.unwrap().timestamp(), 1_700_000_000);

        let body = json!({ "timestamp": "2024-01-02T03:04:05Z", "cpu_usage": 1.0 });
        let readings = readings_from_json(&body).unwrap();
        assert_eq!(readings[0].timestamp.unwrap().to_rfc3339(), "2024-01-02T03:04:05+00:00");
    }

    #[test]
    fn test_non_object_is_decode_error() {
        assert!(matches!(
            readings_from_json(&json!([1, 2])),
            Err(SourceError::Decode(_))
        ));
    }
}
