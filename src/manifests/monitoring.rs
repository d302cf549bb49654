//! Monitoring infrastructure
//!
//! Alerts on the readiness gauge and a scrape target for the operator
//! metrics endpoint, plus the RBAC letting the cluster Prometheus read it.

use super::rbac::{role_ref, rule, service_account_subject};
use super::{app_labels, owned_meta};
use crate::controller::ControllerConfig;
use crate::crd::{
    monitoring::{Endpoint, LabelSelector, NamespaceSelector, Rule, RuleGroup},
    HostPathProvisioner, PrometheusRule, PrometheusRuleSpec, ServiceMonitor, ServiceMonitorSpec,
};
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

pub const RULE_NAME: &str = "prometheus-hpp-rules";
pub const SERVICE_MONITOR_NAME: &str = "service-monitor-hpp";
pub const METRICS_SERVICE_NAME: &str = "hpp-prometheus-metrics";
pub const MONITORING_RBAC_NAME: &str = "hostpath-provisioner-monitoring";

const PROMETHEUS_LABEL_KEY: &str = "prometheus.hostpathprovisioner.kubevirt.io";
const METRICS_PORT_NAME: &str = "metrics";
const PROMETHEUS_SERVICE_ACCOUNT: &str = "prometheus-k8s";

fn prometheus_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(PROMETHEUS_LABEL_KEY.to_string(), "true".to_string())])
}

fn alert(name: &str, expr: &str, summary: &str, severity: &str) -> Rule {
    Rule {
        alert: Some(name.to_string()),
        expr: expr.to_string(),
        r#for: Some("5m".to_string()),
        labels: BTreeMap::from([
            ("severity".to_string(), severity.to_string()),
            ("operator_health_impact".to_string(), severity.to_string()),
            ("kubernetes_operator_part_of".to_string(), "kubevirt".to_string()),
            ("kubernetes_operator_component".to_string(), "hostpath-provisioner-operator".to_string()),
        ]),
        annotations: BTreeMap::from([("summary".to_string(), summary.to_string())]),
        ..Default::default()
    }
}

pub fn prometheus_rule(cr: &HostPathProvisioner, config: &ControllerConfig) -> PrometheusRule {
    let up_expr = format!(
        "sum(up{{namespace='{}', pod=~'hostpath-provisioner-operator-.*'}} or vector(0))",
        config.namespace
    );
    let mut metadata = owned_meta(cr, RULE_NAME, &config.namespace);
    metadata.labels.get_or_insert_with(BTreeMap::new).extend(prometheus_labels());

    PrometheusRule {
        metadata,
        spec: PrometheusRuleSpec {
            groups: vec![RuleGroup {
                name: "hpp.rules".to_string(),
                rules: vec![
                    Rule {
                        record: Some("kubevirt_hpp_operator_up".to_string()),
                        expr: up_expr,
                        ..Default::default()
                    },
                    alert(
                        "HPPOperatorDown",
                        "kubevirt_hpp_operator_up == 0",
                        "Hostpath Provisioner operator is down",
                        "critical",
                    ),
                    alert(
                        "HPPNotReady",
                        "kubevirt_hpp_cr_ready == 0",
                        "Hostpath Provisioner is not available to use",
                        "warning",
                    ),
                    alert(
                        "HPPReadinessUnknown",
                        "kubevirt_hpp_cr_ready == -1",
                        "Hostpath Provisioner readiness has not been reported",
                        "warning",
                    ),
                ],
            }],
        },
    }
}

/// Service exposing the operator metrics port to the scrape target
pub fn metrics_service(cr: &HostPathProvisioner, config: &ControllerConfig) -> Service {
    let mut metadata = owned_meta(cr, METRICS_SERVICE_NAME, &config.namespace);
    metadata.labels.get_or_insert_with(BTreeMap::new).extend(prometheus_labels());

    Service {
        metadata,
        spec: Some(ServiceSpec {
            selector: Some(prometheus_labels()),
            ports: Some(vec![ServicePort {
                name: Some(METRICS_PORT_NAME.to_string()),
                port: 8080,
                target_port: Some(IntOrString::String(METRICS_PORT_NAME.to_string())),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn service_monitor(cr: &HostPathProvisioner, config: &ControllerConfig) -> ServiceMonitor {
    let mut metadata = owned_meta(cr, SERVICE_MONITOR_NAME, &config.namespace);
    metadata.labels.get_or_insert_with(BTreeMap::new).extend(prometheus_labels());

    ServiceMonitor {
        metadata,
        spec: ServiceMonitorSpec {
            selector: LabelSelector {
                match_labels: prometheus_labels(),
            },
            namespace_selector: NamespaceSelector {
                match_names: vec![config.namespace.clone()],
            },
            endpoints: vec![Endpoint {
                port: METRICS_PORT_NAME.to_string(),
                scheme: Some("http".to_string()),
                interval: Some("30s".to_string()),
            }],
        },
    }
}

/// Lets the cluster Prometheus discover the metrics service
pub fn monitoring_role(cr: &HostPathProvisioner, config: &ControllerConfig) -> Role {
    Role {
        metadata: owned_meta(cr, MONITORING_RBAC_NAME, &config.namespace),
        rules: Some(vec![rule(&[""], &["services", "endpoints", "pods"], &["get", "list", "watch"])]),
    }
}

pub fn monitoring_role_binding(cr: &HostPathProvisioner, config: &ControllerConfig) -> RoleBinding {
    RoleBinding {
        metadata: owned_meta(cr, MONITORING_RBAC_NAME, &config.namespace),
        role_ref: role_ref("Role", MONITORING_RBAC_NAME),
        subjects: Some(vec![service_account_subject(
            PROMETHEUS_SERVICE_ACCOUNT,
            &config.monitoring_namespace,
        )]),
    }
}
