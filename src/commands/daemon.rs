use std::path::Path;

use anyhow::Result;

use crate::config::Config;

pub fn run(
    http_addr: Option<String>,
    log_level: Option<String>,
    config_path: Option<String>,
) -> Result<()> {
    let mut config = Config::load(config_path.as_deref().map(Path::new))?;

    // CLI flags override config values
    if let Some(addr) = http_addr {
        config.daemon.http_addr = addr;
    }
    if let Some(level) = log_level {
        config.daemon.log_level = level;
    }

    // Build tokio runtime explicitly (no #[tokio::main] on fn main)
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(crate::server::run(config))
}
