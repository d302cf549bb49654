//! SecurityContextConstraints
//!
//! OpenShift's security policy kind. Its fields sit at the top level of the
//! object rather than under a spec, so the `Resource` impl is written out by hand.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::ClusterResourceScope;
use kube::Resource;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

const GROUP: &str = "security.openshift.io";
const VERSION: &str = "v1";
const KIND: &str = "SecurityContextConstraints";

/// Strategy selector used by several SCC fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyOptions {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
}

impl StrategyOptions {
    pub fn of(strategy: &str) -> Self {
        Self {
            type_: Some(strategy.to_string()),
        }
    }
}

/// Security policy admitting the provisioner pods
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContextConstraints {
    #[serde(default = "api_version")]
    pub api_version: String,
    #[serde(default = "kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub allow_privileged_container: bool,
    #[serde(default)]
    pub allow_host_dir_volume_plugin: bool,
    #[serde(default)]
    pub allow_host_ipc: bool,
    #[serde(default)]
    pub allow_host_network: bool,
    #[serde(default)]
    pub allow_host_pid: bool,
    #[serde(default)]
    pub allow_host_ports: bool,
    #[serde(default)]
    pub read_only_root_filesystem: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_drop_capabilities: Vec<String>,
    #[serde(default)]
    pub run_as_user: StrategyOptions,
    #[serde(rename = "seLinuxContext", default)]
    pub se_linux_context: StrategyOptions,
    #[serde(default)]
    pub fs_group: StrategyOptions,
    #[serde(default)]
    pub supplemental_groups: StrategyOptions,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
}

fn api_version() -> String {
    format!("{}/{}", GROUP, VERSION)
}

fn kind() -> String {
    KIND.to_string()
}

impl Default for SecurityContextConstraints {
    fn default() -> Self {
        Self {
            api_version: api_version(),
            kind: kind(),
            metadata: ObjectMeta::default(),
            allow_privileged_container: false,
            allow_host_dir_volume_plugin: false,
            allow_host_ipc: false,
            allow_host_network: false,
            allow_host_pid: false,
            allow_host_ports: false,
            read_only_root_filesystem: false,
            required_drop_capabilities: Vec::new(),
            run_as_user: StrategyOptions::default(),
            se_linux_context: StrategyOptions::default(),
            fs_group: StrategyOptions::default(),
            supplemental_groups: StrategyOptions::default(),
            users: Vec::new(),
            volumes: Vec::new(),
        }
    }
}

impl Resource for SecurityContextConstraints {
    type DynamicType = ();
    type Scope = ClusterResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(KIND)
    }

    fn group(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(GROUP)
    }

    fn version(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(VERSION)
    }

    fn plural(_: &()) -> Cow<'_, str> {
        Cow::Borrowed("securitycontextconstraints")
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
