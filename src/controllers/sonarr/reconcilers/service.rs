use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::resources::sonarrs::Sonarr;
use crate::Result;

use super::{object_meta, selector_labels, HTTP_PORT, HTTP_PORT_NAME};

/// ClusterIP service in front of the Sonarr web UI
pub fn desired_service(sonarr: &Sonarr) -> Result<Service> {
    Ok(Service {
        metadata: object_meta(sonarr)?,
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(&sonarr.name_any())),
            ports: Some(vec![ServicePort {
                name: Some(HTTP_PORT_NAME.into()),
                port: HTTP_PORT,
                target_port: Some(IntOrString::String(HTTP_PORT_NAME.into())),
                protocol: Some("TCP".into()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    })
}
