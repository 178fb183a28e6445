use std::collections::BTreeMap;

use serde::Serialize;

use crate::{address::DeviceAddress, readings::Snapshot};

/// Body of `/api/sensors`: `{"<hex address>": celsius}`.
pub fn sensors_payload(snapshot: &Snapshot) -> BTreeMap<String, f32> {
    snapshot
        .iter()
        .map(|reading| (reading.address.to_string(), reading.temperature_c))
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadingView {
    pub address: DeviceAddress,
    #[serde(rename = "temperatureC")]
    pub temperature_c: f32,
    #[serde(rename = "ageMs")]
    pub age_ms: u64,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadingsPayload {
    #[serde(rename = "generatedAt")]
    pub generated_at: i64,
    pub readings: Vec<ReadingView>,
}

impl ReadingsPayload {
    pub fn new(snapshot: &Snapshot, now_ms: u64, generated_at: i64) -> Self {
        Self {
            generated_at,
            readings: snapshot
                .iter()
                .map(|reading| ReadingView {
                    address: reading.address,
                    temperature_c: reading.temperature_c,
                    age_ms: reading.age_ms(now_ms),
                    stale: reading.stale,
                })
                .collect(),
        }
    }
}
