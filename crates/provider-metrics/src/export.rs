//! Text renderings of time-series points for monitoring backends.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::error::MetricsResult;
use crate::types::{ExportFormat, TimeSeriesDataPoint};

pub fn render(points: &[TimeSeriesDataPoint], format: ExportFormat) -> MetricsResult<String> {
    match format {
        ExportFormat::Prometheus => Ok(prometheus(points)),
        ExportFormat::Influxdb => Ok(influx_line_protocol(points)),
        ExportFormat::Json => Ok(serde_json::to_string_pretty(points)?),
        ExportFormat::Csv => Ok(csv(points)),
    }
}

/// Prometheus text exposition: one `# TYPE <metric> gauge` header per family,
/// then `metric{tag="value",...} value timestamp_ms` per point.
pub fn prometheus(points: &[TimeSeriesDataPoint]) -> String {
    let mut families: BTreeMap<String, Vec<&TimeSeriesDataPoint>> = BTreeMap::new();
    for point in points {
        families
            .entry(sanitize_name(&point.metric))
            .or_default()
            .push(point);
    }

    let mut out = String::new();
    for (name, samples) in families {
        let _ = writeln!(out, "# TYPE {} gauge", name);
        for point in samples {
            out.push_str(&name);
            if !point.tags.is_empty() {
                let labels: Vec<String> = point
                    .tags
                    .iter()
                    .map(|(key, value)| format!("{}=\"{}\"", sanitize_name(key), escape_label(value)))
                    .collect();
                let _ = write!(out, "{{{}}}", labels.join(","));
            }
            let _ = writeln!(out, " {} {}", prometheus_value(point.value), point.timestamp);
        }
    }
    out
}

/// InfluxDB line protocol: `metric,tag=val value=<v> <timestamp_ns>`.
pub fn influx_line_protocol(points: &[TimeSeriesDataPoint]) -> String {
    let mut out = String::new();
    for point in points {
        out.push_str(&escape_influx(&point.metric, false));
        for (key, value) in &point.tags {
            let _ = write!(out, ",{}={}", escape_influx(key, true), escape_influx(value, true));
        }
        let _ = writeln!(
            out,
            " value={} {}",
            point.value,
            point.timestamp.saturating_mul(1_000_000)
        );
    }
    out
}

/// `timestamp,metric,value,tags` with tags rendered as `key=value;key=value`.
pub fn csv(points: &[TimeSeriesDataPoint]) -> String {
    let mut out = String::from("timestamp,metric,value,tags\n");
    for point in points {
        let tags: Vec<String> = point
            .tags
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        let _ = writeln!(
            out,
            "{},{},{},{}",
            point.timestamp,
            csv_field(&point.metric),
            point.value,
            csv_field(&tags.join(";"))
        );
    }
    out
}

fn sanitize_name(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == ':' { c } else { '_' })
        .collect();
    if sanitized.starts_with(|c: char| c.is_ascii_digit()) {
        sanitized.insert(0, '_');
    }
    sanitized
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn prometheus_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".into()
    } else if value == f64::INFINITY {
        "+Inf".into()
    } else if value == f64::NEG_INFINITY {
        "-Inf".into()
    } else {
        value.to_string()
    }
}

fn escape_influx(value: &str, escape_equals: bool) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c == ',' || c == ' ' || (escape_equals && c == '=') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
