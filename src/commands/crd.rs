use anyhow::Result;
use kube::CustomResourceExt;

use vpsie_autoscaler::crd::{NodeGroup, VPSieNode};

/// Print the NodeGroup and VPSieNode CRD YAML to stdout for `kubectl apply -f`.
pub fn generate() -> Result<()> {
    let nodegroup_crd = NodeGroup::crd();
    let vpsienode_crd = VPSieNode::crd();

    println!("{}", serde_yaml::to_string(&nodegroup_crd)?);
    println!("---");
    println!("{}", serde_yaml::to_string(&vpsienode_crd)?);
    Ok(())
}

/// Apply both CRDs directly to the connected cluster.
pub async fn install() -> Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::{Api, Client};

    let client = Client::try_default().await?;
    let crds: Api<CustomResourceDefinition> = Api::all(client);

    for crd in [NodeGroup::crd(), VPSieNode::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        match crds.create(&Default::default(), &crd).await {
            Ok(_) => println!("CRD '{name}' installed successfully"),
            Err(kube::Error::Api(err)) if err.code == 409 => {
                println!("CRD '{name}' already exists — skipping");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}
