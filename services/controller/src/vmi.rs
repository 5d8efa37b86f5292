//! The slice of the VirtualMachineInstance resource this controller reads.
//!
//! Only identity and `spec.directVNCAccess` matter here; every other field
//! of the resource is ignored when decoding.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::{Metadata, NamespaceResourceScope, Resource};
use serde::{Deserialize, Serialize};

/// Console port used when a declaration gives none (or a non-positive one).
pub const DEFAULT_VNC_PORT: i32 = 5900;

/// A running virtual machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachineInstance {
    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: VirtualMachineInstanceSpec,
}

/// Declared intent of a VirtualMachineInstance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineInstanceSpec {
    /// Present when the owner wants an externally reachable console.
    #[serde(
        rename = "directVNCAccess",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub direct_vnc_access: Option<DirectVncAccess>,
}

/// Request for a node-reachable VNC endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectVncAccess {
    /// Port override; `None` or non-positive means [`DEFAULT_VNC_PORT`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

impl DirectVncAccess {
    /// Port the exposure object should carry.
    pub fn effective_port(&self) -> i32 {
        self.port.filter(|p| *p > 0).unwrap_or(DEFAULT_VNC_PORT)
    }
}

impl VirtualMachineInstance {
    /// Whether the instance declares direct VNC access.
    pub fn wants_direct_vnc(&self) -> bool {
        self.spec.direct_vnc_access.is_some()
    }
}

impl Resource for VirtualMachineInstance {
    const API_VERSION: &'static str = "kubevirt.io/v1";
    const GROUP: &'static str = "kubevirt.io";
    const KIND: &'static str = "VirtualMachineInstance";
    const VERSION: &'static str = "v1";
    const URL_PATH_SEGMENT: &'static str = "virtualmachineinstances";
    type Scope = NamespaceResourceScope;
}

impl Metadata for VirtualMachineInstance {
    type Ty = ObjectMeta;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(None, 5900)]
    #[case(Some(0), 5900)]
    #[case(Some(-1), 5900)]
    #[case(Some(5901), 5901)]
    fn test_effective_port(#[case] port: Option<i32>, #[case] expected: i32) {
        assert_eq!(DirectVncAccess { port }.effective_port(), expected);
    }

    #[test]
    fn test_decode_declaration() {
        let vmi: VirtualMachineInstance = serde_json::from_value(serde_json::json!({
            "apiVersion": "kubevirt.io/v1",
            "kind": "VirtualMachineInstance",
            "metadata": {"name": "vm1", "namespace": "ns", "uid": "u1", "resourceVersion": "7"},
            "spec": {
                "domain": {"devices": {}},
                "directVNCAccess": {"port": 5901}
            },
            "status": {"phase": "Running"}
        }))
        .unwrap();

        assert!(vmi.wants_direct_vnc());
        assert_eq!(
            vmi.spec.direct_vnc_access.as_ref().map(DirectVncAccess::effective_port),
            Some(5901)
        );
        assert_eq!(vmi.metadata.uid.as_deref(), Some("u1"));
    }

    #[test]
    fn test_decode_without_declaration() {
        let vmi: VirtualMachineInstance = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "vm1", "namespace": "ns"},
            "spec": {"directVNCAccess": null}
        }))
        .unwrap();
        assert!(!vmi.wants_direct_vnc());

        let vmi: VirtualMachineInstance = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "vm1", "namespace": "ns"},
            "spec": {"directVNCAccess": {}}
        }))
        .unwrap();
        assert_eq!(vmi.spec.direct_vnc_access, Some(DirectVncAccess { port: None }));
    }
}
