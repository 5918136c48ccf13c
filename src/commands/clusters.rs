//! `kubeforge clusters` — inspect and prune the local cluster store.

use std::path::Path;

use anyhow::Result;
use colored::Colorize;

use crate::config::Config;
use crate::domain::crypto::SecretCipher;
use crate::domain::store::ClusterStore;

fn open_store(config_path: Option<&str>) -> Result<(ClusterStore, Config)> {
    let config = Config::load(config_path.map(Path::new))?;
    let cipher = SecretCipher::load(config.store.secret.as_deref(), &config.store.key_file())?;
    let store = ClusterStore::new(config.store.clusters_file(), cipher);
    Ok((store, config))
}

pub fn list(format: String, config_path: Option<String>) -> Result<()> {
    let (store, _config) = open_store(config_path.as_deref())?;
    let runtime = tokio::runtime::Runtime::new()?;
    let clusters = runtime.block_on(store.list())?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&clusters)?);
        return Ok(());
    }

    if clusters.is_empty() {
        println!("no clusters recorded");
        return Ok(());
    }

    println!("{}", "kubeforge clusters".bold());
    for cluster in &clusters {
        let status = if cluster.status == "healthy" {
            cluster.status.green()
        } else {
            cluster.status.yellow()
        };
        let mode = if cluster.simulation_mode {
            " (simulated)".dimmed().to_string()
        } else {
            String::new()
        };
        println!();
        println!("  {}{}", cluster.cluster_name.bold(), mode);
        println!("    id:       {}", cluster.id);
        println!("    status:   {}", status);
        println!("    version:  {}", cluster.k8s_version);
        println!("    endpoint: {}", cluster.endpoint);
        println!(
            "    nodes:    {} ({} master, {} worker)",
            cluster.node_count,
            cluster.master_nodes.len(),
            cluster.worker_nodes.len()
        );
    }
    Ok(())
}

pub fn delete(id: String, config_path: Option<String>) -> Result<()> {
    let (store, _config) = open_store(config_path.as_deref())?;
    let runtime = tokio::runtime::Runtime::new()?;
    if runtime.block_on(store.delete(&id))? {
        println!("cluster {} {}", id, "deleted".green());
    } else {
        println!("cluster {} {}", id, "not found".red());
    }
    Ok(())
}
