use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, MeterProvider},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use std::collections::HashSet;

pub struct Metrics {
    request_counter: Counter<u64>,
    scoring_duration: Histogram<u64>,
    photo_score: Gauge<f64>,
    // Keeps the reader alive when another provider replaces the global one.
    _provider: SdkMeterProvider,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build prometheus exporter: {}", e))?;

        let provider = SdkMeterProvider::builder().with_reader(exporter).build();

        let meter = provider.meter("photo_score");
        global::set_meter_provider(provider.clone());

        let request_counter = meter
            .u64_counter("requests_total")
            .with_description("Total number of scoring requests")
            .build();

        let boundaries = generate_boundaries((10, 50, 100, 500, 2000));

        let scoring_duration = meter
            .u64_histogram("scoring_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Duration of decode, preprocessing and inference in milliseconds")
            .build();

        let photo_score = meter
            .f64_gauge("photo_score")
            .with_description("Last score returned")
            .build();

        Ok(Metrics {
            request_counter,
            scoring_duration,
            photo_score,
            _provider: provider,
            registry,
        })
    }

    pub fn record_request(&self, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_scoring_duration(&self, duration_ms: u64, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.scoring_duration.record(duration_ms, &attributes);
    }

    pub fn record_score(&self, score: f64, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.photo_score.record(score, &attributes);
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 10;
    let middle_step: usize = 25;
    let end_step: usize = 100;
    let tail_step: usize = 500;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};

    #[test]
    fn test_generate_boundaries() {
        let parts = (10, 50, 100, 500, 2000);
        let get = generate_boundaries(parts);
        let expected = vec![
            10.0, 20.0, 30.0, 40.0, 50.0, 75.0, 100.0, 200.0, 300.0, 400.0, 500.0, 1000.0,
            1500.0, 2000.0,
        ];

        assert_eq!(get, expected);
    }

    #[test]
    fn test_recorded_metrics_are_exported() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request("/");
        metrics.record_scoring_duration(42, "/");
        metrics.record_score(73.42, "/");

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metrics.registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();

        assert!(text.contains("requests_total"));
        assert!(text.contains("scoring_duration_ms"));
        assert!(text.contains("photo_score"));
    }
}
