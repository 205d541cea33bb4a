use serde::{Deserialize, Serialize};

use crate::upstream::{CountsSnapshot, HealthCheckSpec};

/// Persisted health snapshot of one backend.
///
/// Unknown fields are ignored and missing ones default to zero/empty, so
/// records written by older or newer router versions stay readable.
/// `alive` and `reporter` are informational: readers recompute liveness from
/// the counters and never trust the writer's verdict.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthRecord {
    #[serde(alias = "ServicePrefix")]
    pub service_prefix: String,

    pub url: String,

    #[serde(alias = "zone_aws", skip_serializing_if = "String::is_empty")]
    pub zone: String,

    #[serde(rename = "healthcheck", skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckSpec>,

    pub alive: bool,

    #[serde(rename = "counts_requests")]
    pub request_counts: CountsSnapshot,

    #[serde(rename = "counts_healthchecks")]
    pub probe_counts: CountsSnapshot,

    /// RFC 3339 timestamp of the last recorded outcome.
    #[serde(rename = "update_date")]
    pub updated_at: String,

    /// Instance id of the router that wrote the record.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reporter: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthCheckType;

    #[test]
    fn test_decode_legacy_field_names() {
        let json = r#"{
            "ServicePrefix": "app1",
            "url": "http://10.0.0.1:8080",
            "zone_aws": "us-east-1a",
            "healthcheck": {"type": "http", "endpoint": "http://10.0.0.1:8080/health"},
            "alive": true,
            "counts_requests": {"requests": 7, "total_failures": 3, "consecutive_failures": 3},
            "counts_healthchecks": {"requests": 2, "total_successes": 2, "consecutive_successes": 2},
            "update_date": "2024-05-01T10:00:00Z"
        }"#;
        let r: HealthRecord = serde_json::from_str(json).unwrap();
        assert_eq!(r.service_prefix, "app1");
        assert_eq!(r.zone, "us-east-1a");
        assert_eq!(r.request_counts.consecutive_failures, 3);
        assert_eq!(r.probe_counts.consecutive_successes, 2);
        assert_eq!(
            r.health_check.as_ref().map(|h| h.kind),
            Some(HealthCheckType::Http)
        );
    }

    #[test]
    fn test_decode_sparse_record() {
        let r: HealthRecord =
            serde_json::from_str(r#"{"url": "http://a:80", "unknown": [1, 2]}"#).unwrap();
        assert_eq!(r.url, "http://a:80");
        assert_eq!(r.request_counts, CountsSnapshot::default());
        assert!(r.health_check.is_none());
        assert!(r.reporter.is_empty());
    }

    #[test]
    fn test_encode_skips_empty_optional_fields() {
        let r = HealthRecord {
            service_prefix: "app1".to_string(),
            url: "http://a:80".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&r).unwrap();
        assert!(json.get("zone").is_none());
        assert!(json.get("reporter").is_none());
        assert!(json.get("healthcheck").is_none());
        assert_eq!(json["counts_requests"]["requests"], 0);
    }
}
