use anyhow::Result;

pub fn run() -> Result<()> {
    println!("vpsie-autoscaler {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
