use anyhow::{Context, Result};

use pxrun::config::Settings;
use pxrun::models::NodeInventory;
use pxrun::provision::selector;
use pxrun::proxmox::{ControlPlane, ProxmoxClient};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

pub async fn nodes(settings: &Settings) -> Result<()> {
    let client = ProxmoxClient::new(settings.proxmox.clone())?;
    let version = client.version().await.context("Failed to reach Proxmox API")?;
    let inventory = NodeInventory::fetch(&client)
        .await
        .context("Failed to read cluster nodes")?;

    println!(
        "Proxmox VE {version}, {} node(s) as of {}\n",
        inventory.nodes.len(),
        inventory.fetched_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "{:<4} {:<16} {:>6} {:>6} {:>14} {:>7} {:<}",
        "RANK", "NODE", "CORES", "CPU", "MEMORY", "SCORE", "STORAGE"
    );
    for (i, node) in selector::rank(&inventory).into_iter().enumerate() {
        println!(
            "{:<4} {:<16} {:>6} {:>5.0}% {:>5.1}/{:<5.1}GB {:>7.3} {}",
            i + 1,
            node.name,
            node.cores,
            node.cpu_usage * 100.0,
            node.mem_used as f64 / GIB,
            node.mem_total as f64 / GIB,
            node.load_score(),
            node.storage_pools.join(",")
        );
    }
    for node in inventory.nodes.iter().filter(|n| !n.online) {
        println!("-    {:<16} offline", node.name);
    }
    Ok(())
}
