use std::fmt::Write as _;

use tracing::debug;

use crate::{
    config::ApiConfig,
    error::{Error, Result},
    readings::Snapshot,
};

/// One outbound GET carrying every fresh reading as numbered query pairs:
/// `?token=..&sensor1=<hex>&value1=<celsius>&sensor2=..`.
#[derive(Debug, Clone, PartialEq)]
pub struct PushRequest {
    base_url: String,
    params: Vec<(String, String)>,
    sensors: usize,
}

impl PushRequest {
    /// `None` when there is nothing worth sending. Stale readings are left
    /// out so the collector never records a power-on default.
    pub fn from_snapshot(api: &ApiConfig, snapshot: &Snapshot) -> Option<Self> {
        let mut params = vec![("token".to_string(), api.token.clone())];
        let mut sensors = 0;

        for reading in snapshot.iter() {
            let celsius = match reading.checked_celsius() {
                Ok(celsius) => celsius,
                Err(err) => {
                    debug!("not pushing: {err}");
                    continue;
                }
            };
            sensors += 1;
            params.push((format!("sensor{sensors}"), reading.address.to_string()));
            params.push((format!("value{sensors}"), format_celsius(celsius)));
        }

        if sensors == 0 {
            return None;
        }

        Some(Self {
            base_url: api.url.clone(),
            params,
            sensors,
        })
    }

    pub fn sensors(&self) -> usize {
        self.sensors
    }

    pub fn to_url(&self) -> String {
        let mut url = self.base_url.clone();
        url.push(if url.contains('?') { '&' } else { '?' });
        for (index, (key, value)) in self.params.iter().enumerate() {
            if index > 0 {
                url.push('&');
            }
            url.push_str(&percent_encode(key));
            url.push('=');
            url.push_str(&percent_encode(value));
        }
        url
    }
}

/// The collector accepts exactly 200.
pub fn check_status(status: u16) -> Result<()> {
    if status == 200 {
        Ok(())
    } else {
        Err(Error::NetworkFailure(format!(
            "collector answered with status {status}"
        )))
    }
}

// Shortest form that round-trips, always with a decimal point ("25.0").
fn format_celsius(celsius: f32) -> String {
    format!("{celsius:?}")
}

fn percent_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(char::from(byte));
            }
            _ => {
                let _ = write!(encoded, "%{byte:02X}");
            }
        }
    }
    encoded
}
