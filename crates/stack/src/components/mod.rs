//! The platform components, in deploy order.

mod gateway;
mod gatewayapi;
mod istio;
pub mod kubevip;
mod longhorn;
mod tunnel;

pub use gateway::{Gateway, GatewayComponent, GatewaySpec, VirtualService, VirtualServiceSpec, HEALTH_BODY};
pub use gatewayapi::GatewayApi;
pub use istio::{Istio, IstioIngress, ISTIO_NAMESPACE, ISTIO_REPO};
pub use kubevip::KubeVip;
pub use longhorn::Longhorn;
pub use tunnel::CloudflareTunnel;

use crate::component::Component;

/// Every component, in the order they must be deployed.
#[must_use]
pub fn all() -> Vec<Box<dyn Component>> {
    vec![
        Box::new(KubeVip),
        Box::new(GatewayApi),
        Box::new(Istio),
        Box::new(IstioIngress),
        Box::new(GatewayComponent),
        Box::new(Longhorn),
        Box::new(CloudflareTunnel::default()),
    ]
}
