//! Swarm demo application
//!
//! Flies a swarm of ships through an asteroid field while worker threads run
//! proximity, sensor and light queries against the same partition index.
//!
//! ```text
//! cargo run --bin swarm_demo -- partition_demo/swarm.toml
//! ```

mod swarm;

use std::path::PathBuf;

use spatial_partition::config::Config;
use spatial_partition::foundation::logging;

use crate::swarm::{DemoConfig, Swarm};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_with_default("info");

    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => {
            log::info!("Loading demo configuration from {}", path.display());
            DemoConfig::load_from_file(&path)?
        }
        None => {
            log::info!("No configuration given, using defaults");
            DemoConfig::default()
        }
    };

    let mut swarm = Swarm::new(config)?;
    swarm.run();
    swarm.report();
    Ok(())
}
