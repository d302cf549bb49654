//! CSIDriver registration

use super::{cluster_meta, CSI_DRIVER_NAME};
use k8s_openapi::api::storage::v1::{CSIDriver, CSIDriverSpec};

/// The driver registration object. Its spec is immutable once created.
pub fn csi_driver() -> CSIDriver {
    CSIDriver {
        metadata: cluster_meta(CSI_DRIVER_NAME),
        spec: CSIDriverSpec {
            attach_required: Some(false),
            pod_info_on_mount: Some(true),
            storage_capacity: Some(true),
            volume_lifecycle_modes: Some(vec!["Persistent".to_string()]),
            ..Default::default()
        },
    }
}
