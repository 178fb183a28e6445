use std::fmt::Write as _;

use chrono::{DateTime, Utc};

use crate::readings::Snapshot;

const REFRESH_MS: u32 = 5_000;

const STYLE: &str = "body{font-family:Arial,sans-serif;max-width:600px;margin:50px auto;\
padding:20px;background-color:#f5f5f5}h1{color:#333;text-align:center}\
table{width:100%;border-collapse:collapse;background-color:white;\
box-shadow:0 2px 4px rgba(0,0,0,0.1)}th{background-color:#4CAF50;color:white;\
padding:12px;text-align:left}td{padding:10px;border-bottom:1px solid #ddd}\
tr:hover{background-color:#f9f9f9}.stale{color:#b36b00}\
.refresh{text-align:center;margin-top:20px;font-size:12px;color:#666}";

/// The status page served at `/`.
pub fn index_page(snapshot: &Snapshot, now_ms: u64, generated_at: DateTime<Utc>) -> String {
    let mut rows = String::new();
    if snapshot.is_empty() {
        rows.push_str("<tr><td colspan='3'>No sensors found</td></tr>");
    }
    for reading in snapshot.iter() {
        let marker = if reading.stale {
            " <span class='stale'>(power-on value)</span>"
        } else {
            ""
        };
        let _ = write!(
            rows,
            "<tr><td>{}</td><td>{:.2}°C{}</td><td>{}</td></tr>",
            reading.address,
            reading.temperature_c,
            marker,
            format_age(reading.age_ms(now_ms)),
        );
    }

    format!(
        "<!DOCTYPE html><html><head><title>Temperature Sensors</title>\
<meta charset=\"utf-8\"><meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
<style>{STYLE}</style>\
<script>setInterval(function(){{location.reload();}},{REFRESH_MS});</script></head>\
<body><h1>Temperature Monitoring</h1><table>\
<tr><th>Sensor ID</th><th>Temperature</th><th>Updated</th></tr>{rows}</table>\
<div class=\"refresh\"><p>Auto-refreshing every {} seconds. Generated {}.</p></div>\
</body></html>",
        REFRESH_MS / 1_000,
        generated_at.format("%Y-%m-%d %H:%M:%S UTC"),
    )
}

fn format_age(age_ms: u64) -> String {
    let secs = age_ms / 1_000;
    match secs {
        0 => "just now".to_string(),
        1..=59 => format!("{secs}s ago"),
        60..=3_599 => format!("{}m {}s ago", secs / 60, secs % 60),
        _ => format!("{}h {}m ago", secs / 3_600, (secs % 3_600) / 60),
    }
}
