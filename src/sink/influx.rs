use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};

use super::{SinkError, StorageSink};
use crate::reading::Reading;

const MEASUREMENT: &str = "sensor_data";

/// Escritura HTTP a InfluxDB v2 en line protocol, precisión de milisegundos.
pub struct InfluxSink {
    client: Client,
    write_url: String,
    token: String,
    org: String,
    bucket: String,
    closed: bool,
}

impl InfluxSink {
    pub fn new(
        url: &str,
        token: &str,
        org: &str,
        bucket: &str,
        timeout: Duration,
    ) -> Result<Self, SinkError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            write_url: format!("{}/api/v2/write", url.trim_end_matches('/')),
            token: token.to_string(),
            org: org.to_string(),
            bucket: bucket.to_string(),
            closed: false,
        })
    }

    fn write(&self, body: String) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed("influxdb"));
        }
        let mut request = self
            .client
            .post(&self.write_url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ms"),
            ])
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body);
        if !self.token.is_empty() {
            request = request.header(AUTHORIZATION, format!("Token {}", self.token));
        }

        let response = request.send()?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SinkError::Rejected {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            })
        }
    }
}

/// Una línea `sensor_data,sensor=..,slave_id=.. temperature=..,humidity=.. <ms>`.
pub fn line_protocol(reading: &Reading) -> String {
    format!(
        "{},sensor={},slave_id={} temperature={},humidity={} {}",
        MEASUREMENT,
        escape_tag(&reading.sensor_name),
        reading.slave_id,
        reading.temperature,
        reading.humidity,
        reading.timestamp_millis()
    )
}

fn escape_tag(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | '=' | ' ' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl StorageSink for InfluxSink {
    fn kind(&self) -> &'static str {
        "influxdb"
    }

    fn save(&mut self, reading: &Reading) -> Result<(), SinkError> {
        self.write(line_protocol(reading))
    }

    fn save_batch(&mut self, readings: &[Reading]) -> Result<(), SinkError> {
        let body = readings
            .iter()
            .map(line_protocol)
            .collect::<Vec<_>>()
            .join("\n");
        self.write(body)
    }

    fn supports_batch(&self) -> bool {
        true
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.closed = true;
        Ok(())
    }
}
