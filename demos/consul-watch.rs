//! Watches a Consul service and prints every address snapshot.
//!
//! # Running locally
//!
//! ```bash
//! consul agent -dev &
//! cargo run --example consul-watch
//! ```
//!
//! # Environment Variables
//!
//! - `CONSUL_TARGET`: Target URL (default: `consul://127.0.0.1:8500/greeter-server?wait=30s`)

use std::env;

use tokio::sync::watch;
use tonic_lb_consul::{Address, ConsulClient, Target, Watch};
use tracing::{Level, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    let url = env::var("CONSUL_TARGET")
        .unwrap_or_else(|_| "consul://127.0.0.1:8500/greeter-server?wait=30s".to_string());

    let target = Target::parse(&url)?;
    info!("Watching {target} via {}", target.address);

    let client = ConsulClient::new(&target)?;
    let (tx, mut rx) = watch::channel::<Vec<Address>>(Vec::new());
    let consul_watch = Watch::start(target, client, tx)?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }

                let snapshot = rx.borrow_and_update().clone();
                info!("{} endpoints", snapshot.len());
                for address in &snapshot {
                    info!(
                        "  {} (create index {}, modify index {})",
                        address.addr, address.create_index, address.modify_index
                    );
                }
            }
        }
    }

    info!("Stopping");
    consul_watch.stop().await;

    Ok(())
}
