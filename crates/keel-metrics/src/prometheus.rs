//! Prometheus text exposition format.
//!
//! Renders fleet metrics into the Prometheus text exposition format
//! for scraping by a Prometheus server or compatible agent.

use std::fmt::Write;

use crate::collector::{EndpointMetrics, FleetMetrics};

/// Emit one per-endpoint gauge family.
fn endpoint_gauge(
    out: &mut String,
    name: &str,
    help: &str,
    endpoints: &[EndpointMetrics],
    value: impl Fn(&EndpointMetrics) -> String,
) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    for e in endpoints {
        let _ = writeln!(out, "{name}{{endpoint=\"{}\"}} {}", e.endpoint_id, value(e));
    }
}

fn fleet_gauge(out: &mut String, name: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

/// Render fleet metrics into Prometheus text format.
///
/// Per-endpoint gauges carry an `endpoint` label; fleet-wide gauges are
/// unlabelled.
pub fn render_prometheus(metrics: &FleetMetrics) -> String {
    let mut out = String::new();
    let eps = &metrics.endpoints;

    endpoint_gauge(&mut out, "keel_instances", "Instances registered for the endpoint.", eps, |e| {
        e.total_instances.to_string()
    });
    endpoint_gauge(&mut out, "keel_instances_healthy", "Instances currently healthy.", eps, |e| {
        e.healthy_instances.to_string()
    });
    endpoint_gauge(&mut out, "keel_instances_starting", "Instances still starting.", eps, |e| {
        e.starting_instances.to_string()
    });
    endpoint_gauge(&mut out, "keel_instances_unhealthy", "Instances failing health checks.", eps, |e| {
        e.unhealthy_instances.to_string()
    });
    endpoint_gauge(&mut out, "keel_health_score", "Mean instance health score (0.0-1.0).", eps, |e| {
        format!("{:.4}", e.average_health_score)
    });
    endpoint_gauge(&mut out, "keel_requests", "Requests routed to the endpoint's instances.", eps, |e| {
        e.request_count.to_string()
    });
    endpoint_gauge(&mut out, "keel_error_rate", "Failed request fraction (0.0-1.0).", eps, |e| {
        format!("{:.4}", e.error_rate)
    });

    fleet_gauge(&mut out, "keel_deployments_in_progress", "Deployments not yet terminal.", metrics.deployments_in_progress);
    fleet_gauge(&mut out, "keel_deployments_completed", "Deployments that completed.", metrics.deployments_completed);
    fleet_gauge(&mut out, "keel_deployments_failed", "Deployments that failed.", metrics.deployments_failed);
    fleet_gauge(&mut out, "keel_open_circuits", "Instances with an open circuit breaker.", metrics.open_circuits);
    fleet_gauge(&mut out, "keel_metrics_refreshes", "Metrics refreshes since startup.", metrics.refreshes);

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(id: &str) -> EndpointMetrics {
        EndpointMetrics {
            endpoint_id: id.to_string(),
            total_instances: 4,
            healthy_instances: 3,
            starting_instances: 1,
            unhealthy_instances: 0,
            average_health_score: 0.875,
            request_count: 1200,
            error_count: 12,
            error_rate: 0.01,
            average_cpu_usage: 20.0,
            average_memory_usage: 40.0,
        }
    }

    #[test]
    fn render_empty() {
        let output = render_prometheus(&FleetMetrics::default());
        // Type declarations are always present.
        assert!(output.contains("# HELP keel_instances "));
        assert!(output.contains("# TYPE keel_instances gauge"));
        assert!(output.contains("keel_open_circuits 0\n"));
    }

    #[test]
    fn render_single_endpoint() {
        let metrics = FleetMetrics {
            endpoints: vec![endpoint("api")],
            deployments_failed: 2,
            ..FleetMetrics::default()
        };
        let output = render_prometheus(&metrics);

        assert!(output.contains("keel_instances{endpoint=\"api\"} 4\n"));
        assert!(output.contains("keel_instances_healthy{endpoint=\"api\"} 3\n"));
        assert!(output.contains("keel_health_score{endpoint=\"api\"} 0.8750\n"));
        assert!(output.contains("keel_requests{endpoint=\"api\"} 1200\n"));
        assert!(output.contains("keel_error_rate{endpoint=\"api\"} 0.0100\n"));
        assert!(output.contains("keel_deployments_failed 2\n"));
    }

    #[test]
    fn render_multiple_endpoints() {
        let metrics = FleetMetrics {
            endpoints: vec![endpoint("api"), endpoint("web")],
            ..FleetMetrics::default()
        };
        let output = render_prometheus(&metrics);

        assert!(output.contains("endpoint=\"api\""));
        assert!(output.contains("endpoint=\"web\""));
    }
}
