use anyhow::Result;
use kube::Client;

use vpsie_autoscaler::pool_controller;
use vpsie_autoscaler::scale_down::ScaleDownVerdict;

/// Offline report of which Instances in a Pool are currently safe to
/// remove, without requesting any drain. Useful for dry-running the C9
/// scale-down simulation against a live cluster before trusting the
/// reconciler to act on it.
pub async fn simulate(namespace: &str, pool_name: &str) -> Result<()> {
    let client = Client::try_default().await?;

    println!("Scale-down simulation for pool '{pool_name}' in namespace '{namespace}'\n");

    let results = pool_controller::simulate_scale_down(&client, namespace, pool_name).await?;

    if results.is_empty() {
        println!("No ready instances found for this pool.");
        return Ok(());
    }

    let mut safe_count = 0;
    for (instance_name, verdict) in &results {
        match verdict {
            ScaleDownVerdict::Safe => {
                safe_count += 1;
                println!("  {instance_name} .. SAFE");
            }
            ScaleDownVerdict::Blocked(reason) => {
                println!("  {instance_name} .. BLOCKED ({reason})");
            }
        }
    }

    println!("\n{safe_count}/{} instances are safe to remove.", results.len());
    Ok(())
}
