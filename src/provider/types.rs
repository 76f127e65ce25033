use serde::{Deserialize, Serialize};

/// A provider-side virtual machine record, as returned by ListVMs/GetVM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vm {
    pub id: u64,
    pub hostname: String,
    pub datacenter_id: String,
    pub ip_address: Option<String>,
    pub ipv6_address: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVmRequest {
    pub name: String,
    pub datacenter_id: String,
    pub offering_id: String,
    pub os_image_id: String,
    pub ssh_key_ids: Vec<String>,
}

/// Response to a CreateVM call. `vm_id` is `None` when the provider accepted
/// the request asynchronously and has not yet assigned an identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVmResponse {
    pub accepted: bool,
    pub vm_id: Option<u64>,
}

/// A purchasable K8s worker offering (instance type).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct K8sOffer {
    pub offering_id: String,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub monthly_price: f64,
}

/// An existing provider-managed K8s node group, used by C8 to avoid
/// colliding with a size ID already in use (provider constraint: one pool
/// per size).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct K8sNodeGroup {
    pub id: String,
    pub size_id: String,
    pub cluster_id: String,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub base_url: String,
}
