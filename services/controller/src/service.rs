//! Derivation of the VNC exposure Service from a VirtualMachineInstance.
//!
//! The desired Service is a pure function of the instance's identity and
//! its `directVNCAccess` declaration. Comparison only looks at the fields
//! this controller owns, so server-side defaulting never causes churn.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::Resource;

use crate::error::ControllerError;
use crate::vmi::{DirectVncAccess, VirtualMachineInstance};

/// Appended to the instance name to form the Service name.
pub const VNC_SERVICE_SUFFIX: &str = "-vnc";

/// Label linking the Service back to the instance UID. Also the pod selector.
pub const LABEL_CREATED_BY: &str = "kubevirt.io/created-by";

/// Well-known component label.
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";

/// Value of [`LABEL_COMPONENT`] on every Service this controller owns.
pub const COMPONENT_VNC_ACCESS: &str = "vnc-access";

/// Label carrying the instance name.
pub const LABEL_VMI: &str = "kubevirt.io/vmi";

/// Annotation recording the effective VNC port.
pub const ANNOTATION_VNC_PORT: &str = "kubevirt.io/vnc-port";

/// Name of the single Service port.
pub const VNC_PORT_NAME: &str = "vnc";

/// Label selector matching every Service this controller manages.
pub fn managed_service_selector() -> String {
    format!("{LABEL_COMPONENT}={COMPONENT_VNC_ACCESS}")
}

/// Name of the Service exposing `vmi_name`.
pub fn vnc_service_name(vmi_name: &str) -> String {
    format!("{vmi_name}{VNC_SERVICE_SUFFIX}")
}

/// Build the Service that should exist for `vmi`.
///
/// Fails when the instance lacks the identity needed to own a Service.
pub fn desired_service(
    vmi: &VirtualMachineInstance,
    access: &DirectVncAccess,
) -> Result<Service, ControllerError> {
    let meta = &vmi.metadata;
    let invalid = |reason: &str| ControllerError::InvalidObject {
        kind: VirtualMachineInstance::KIND,
        name: meta.name.clone().unwrap_or_default(),
        reason: reason.to_string(),
    };

    let name = meta
        .name
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| invalid("missing name"))?;
    let namespace = meta
        .namespace
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| invalid("missing namespace"))?;
    let uid = meta
        .uid
        .as_deref()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| invalid("missing uid"))?;

    let port = access.effective_port();

    let labels = BTreeMap::from([
        (LABEL_CREATED_BY.to_string(), uid.to_string()),
        (LABEL_COMPONENT.to_string(), COMPONENT_VNC_ACCESS.to_string()),
        (LABEL_VMI.to_string(), name.to_string()),
    ]);
    let annotations = BTreeMap::from([(ANNOTATION_VNC_PORT.to_string(), port.to_string())]);
    let selector = BTreeMap::from([(LABEL_CREATED_BY.to_string(), uid.to_string())]);

    Ok(Service {
        metadata: ObjectMeta {
            name: Some(vnc_service_name(name)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![OwnerReference {
                api_version: VirtualMachineInstance::API_VERSION.to_string(),
                kind: VirtualMachineInstance::KIND.to_string(),
                name: name.to_string(),
                uid: uid.to_string(),
                controller: Some(true),
                block_owner_deletion: None,
            }]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("NodePort".to_string()),
            external_traffic_policy: Some("Local".to_string()),
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some(VNC_PORT_NAME.to_string()),
                protocol: Some("TCP".to_string()),
                port,
                target_port: Some(IntOrString::Int(port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    })
}

fn port_matches(observed: &ServicePort, desired: &ServicePort) -> bool {
    observed.name == desired.name
        && observed.protocol == desired.protocol
        && observed.port == desired.port
        && observed.target_port == desired.target_port
}

fn spec_matches(observed: Option<&ServiceSpec>, desired: Option<&ServiceSpec>) -> bool {
    let (Some(observed), Some(desired)) = (observed, desired) else {
        return observed.is_none() && desired.is_none();
    };

    let observed_ports = observed.ports.as_deref().unwrap_or_default();
    let desired_ports = desired.ports.as_deref().unwrap_or_default();

    observed.type_ == desired.type_
        && observed.external_traffic_policy == desired.external_traffic_policy
        && observed.selector == desired.selector
        && observed_ports.len() == desired_ports.len()
        && observed_ports
            .iter()
            .zip(desired_ports)
            .all(|(o, d)| port_matches(o, d))
}

/// Whether `observed` differs from `desired` in any owned field.
pub fn needs_update(observed: &Service, desired: &Service) -> bool {
    observed.metadata.labels != desired.metadata.labels
        || observed.metadata.annotations != desired.metadata.annotations
        || !spec_matches(observed.spec.as_ref(), desired.spec.as_ref())
}

/// Produce the object to send as an update, or `None` when nothing changed.
///
/// Labels, annotations and spec are replaced by the desired values. Identity
/// and concurrency fields of `observed` are kept, as are the addresses and
/// node ports the API server already allocated.
pub fn updated_service(observed: &Service, desired: &Service) -> Option<Service> {
    if !needs_update(observed, desired) {
        return None;
    }

    let mut updated = observed.clone();
    updated.metadata.labels = desired.metadata.labels.clone();
    updated.metadata.annotations = desired.metadata.annotations.clone();

    let mut spec = desired.spec.clone().unwrap_or_default();
    if let Some(current) = observed.spec.as_ref() {
        spec.cluster_ip = current.cluster_ip.clone();
        spec.cluster_ips = current.cluster_ips.clone();
        spec.ip_families = current.ip_families.clone();
        spec.ip_family_policy = current.ip_family_policy.clone();

        let current_ports = current.ports.as_deref().unwrap_or_default();
        for port in spec.ports.iter_mut().flatten() {
            port.node_port = current_ports
                .iter()
                .find(|p| p.name == port.name)
                .and_then(|p| p.node_port);
        }
    }
    updated.spec = Some(spec);
    updated.status = None;

    Some(updated)
}
