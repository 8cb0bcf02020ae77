//! Demo host
//!
//! ```bash
//! SIDELOAD_REALMS=client,server cargo run -p sideload-demo
//! cargo run -p sideload-demo -- host.toml
//! ```
//!
//! Every realm gets `<sideload_root>/<realm>/`; drop `*.module` files in there.

use std::path::PathBuf;
use std::sync::Arc;

use sideload_host::{ConfiguredRealms, HostConfig, HostServices, NativeRegistry, bootstrap, logging};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init("info").map_err(|e| anyhow::anyhow!(e))?;

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let mut config = HostConfig::load(config_path.as_deref())?;
    if config.realms.is_empty() {
        config = config.with_realm("default");
    }

    let registry = NativeRegistry::new()?;
    info!("Native modules are staged in {:?}", registry.staging_dir());

    let services = HostServices::new(
        Arc::new(ConfiguredRealms::from_config(&config)),
        Arc::new(registry),
    );
    let realms = bootstrap(services, &config).await;
    for handle in realms.realms() {
        let report = handle.report();
        info!(
            "Realm {} ready: {} loaded, {} failed",
            handle.realm().name(),
            report.loaded,
            report.failed
        );
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    realms.shutdown().await;
    Ok(())
}
