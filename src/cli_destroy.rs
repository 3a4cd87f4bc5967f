use anyhow::{anyhow, Context, Result};
use std::io::{self, Write};
use tracing::warn;

use pxrun::config::Settings;
use pxrun::models::MatchCandidate;
use pxrun::overlay::TailscaleClient;
use pxrun::proxmox::ProxmoxClient;
use pxrun::teardown::{destroy_container, find_container, find_teardown_candidate, remove_candidate};

pub async fn destroy(
    settings: &Settings,
    vmid: u32,
    force: bool,
    purge: bool,
    keep_overlay: bool,
) -> Result<()> {
    let control_plane = ProxmoxClient::new(settings.proxmox.clone())?;
    let container = find_container(&control_plane, vmid)
        .await?
        .ok_or_else(|| anyhow!("Container {vmid} not found"))?;

    println!("Container to destroy:");
    println!("  VMID: {}", container.vmid);
    println!("  Hostname: {}", container.name);
    println!("  Node: {}", container.node);
    println!("  Status: {}", container.status);

    let overlay = match (&settings.tailscale, keep_overlay) {
        (Some(auth), false) => Some(TailscaleClient::new(auth.clone())?),
        (None, false) => {
            println!("  Tailscale: not configured, node cleanup skipped");
            None
        }
        (_, true) => None,
    };

    let candidate = match &overlay {
        Some(directory) => match find_teardown_candidate(directory, &container.name).await {
            Ok(candidate) => Some(candidate),
            Err(e) => {
                warn!("Could not read Tailscale devices: {}", e);
                println!("  Tailscale: lookup failed ({e})");
                None
            }
        },
        None => None,
    };
    if let Some(candidate) = &candidate {
        describe(candidate);
    }

    if !force && !confirm(&format!("\nDestroy container {vmid} ({})?", container.name))? {
        println!("Cancelled");
        return Ok(());
    }

    if container.is_running() {
        println!("Stopping container...");
    }
    destroy_container(&control_plane, &container, purge)
        .await
        .with_context(|| format!("Failed to destroy container {vmid}"))?;
    println!("✓ Container {vmid} destroyed");

    if let (Some(directory), Some(candidate)) = (&overlay, candidate) {
        if !candidate.is_actionable() {
            return Ok(());
        }
        let approved = if force && candidate.allows_unattended_removal() {
            true
        } else {
            confirm(&format!(
                "Remove Tailscale node {} (match: {})?",
                candidate_label(&candidate),
                candidate.confidence
            ))?
        };
        if approved {
            match remove_candidate(directory, &candidate).await {
                Ok(()) => println!("✓ Tailscale node {} removed", candidate_label(&candidate)),
                Err(e) => eprintln!("Warning: failed to remove Tailscale node: {e}"),
            }
        } else {
            println!("Tailscale node kept");
        }
    }

    Ok(())
}

fn describe(candidate: &MatchCandidate) {
    match &candidate.identity {
        Some(identity) if candidate.is_actionable() => {
            println!(
                "  Tailscale: {} ({}) {} [match: {}]",
                identity.name,
                identity.fqdn,
                if identity.online { "online" } else { "offline" },
                candidate.confidence
            );
        }
        _ => println!("  Tailscale: no matching node"),
    }
}

fn candidate_label(candidate: &MatchCandidate) -> String {
    candidate
        .identity
        .as_ref()
        .map(|i| format!("{} ({})", i.name, i.fqdn))
        .unwrap_or_default()
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N]: ");
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
