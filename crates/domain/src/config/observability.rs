use serde::{Deserialize, Serialize};

/// `[observability]`: optional OTLP trace export next to the JSON logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// OTLP/gRPC collector, e.g. `http://localhost:4317`. Unset or blank
    /// means logs only.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
    #[serde(default = "d_service_name")]
    pub service_name: String,
    /// Fraction of traces exported, `0.0..=1.0`.
    #[serde(default = "d_sample_rate")]
    pub sample_rate: f64,
}

impl ObservabilityConfig {
    /// Collector to export to, if export is enabled.
    pub fn export_endpoint(&self) -> Option<&str> {
        self.otlp_endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            service_name: d_service_name(),
            sample_rate: d_sample_rate(),
        }
    }
}

fn d_service_name() -> String {
    "relaybroker".into()
}

fn d_sample_rate() -> f64 {
    1.0
}

#[cfg(test)]
mod tests {
    use crate::config::{Config, ConfigSeverity};

    #[test]
    fn section_is_optional_in_full_config() {
        let cfg: Config = toml::from_str(
            r#"
            [server]
            port = 9100
            "#,
        )
        .unwrap();
        assert_eq!(cfg.observability.export_endpoint(), None);
        assert_eq!(cfg.observability.service_name, "relaybroker");
    }

    #[test]
    fn section_parses_inside_full_config() {
        let cfg: Config = toml::from_str(
            r#"
            [broker]
            liveness_timeout_secs = 120

            [observability]
            otlp_endpoint = "http://collector:4317"
            sample_rate = 0.25
            "#,
        )
        .unwrap();
        assert_eq!(cfg.broker.liveness_timeout_secs, 120);
        assert_eq!(cfg.observability.export_endpoint(), Some("http://collector:4317"));
        assert_eq!(cfg.observability.service_name, "relaybroker");
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn blank_endpoint_disables_export() {
        let cfg: Config = toml::from_str("[observability]\notlp_endpoint = \"  \"\n").unwrap();
        assert_eq!(cfg.observability.export_endpoint(), None);
    }

    #[test]
    fn out_of_range_sample_rate_fails_validation() {
        for rate in [-0.1, 1.5] {
            let mut cfg = Config::default();
            cfg.observability.sample_rate = rate;
            let issues = cfg.validate();
            assert!(
                issues.iter().any(|i| i.field == "observability.sample_rate"
                    && i.severity == ConfigSeverity::Error),
                "rate {rate} accepted: {issues:?}"
            );
        }

        let mut cfg = Config::default();
        cfg.observability.sample_rate = 0.0;
        assert!(cfg.validate().is_empty());
    }
}
