use anyhow::{anyhow, Context, Result};
use clap::ValueEnum;

use pxrun::config;
use pxrun::models::OverlayIdentity;
use pxrun::overlay::{OverlayDirectory, TailscaleClient};
use pxrun::teardown::find_teardown_candidate;

fn client() -> Result<TailscaleClient> {
    let auth = config::tailscale_from_env()?
        .ok_or_else(|| anyhow!("TAILSCALE_API_KEY and TAILSCALE_TAILNET must be set"))?;
    Ok(TailscaleClient::new(auth)?)
}

pub async fn find_overlay(hostname: &str) -> Result<()> {
    let directory = client()?;
    let candidate = find_teardown_candidate(&directory, hostname)
        .await
        .context("Failed to read Tailscale devices")?;

    match &candidate.identity {
        Some(identity) if candidate.is_actionable() => {
            println!("Match:      {}", candidate.confidence);
            println!("Name:       {}", identity.name);
            println!("FQDN:       {}", identity.fqdn);
            println!("ID:         {}", identity.id);
            println!("Addresses:  {}", identity.addresses.join(", "));
            println!("Online:     {}", if identity.online { "yes" } else { "no" });
            if !candidate.allows_unattended_removal() {
                println!("\nMatched by FQDN label only; removal always asks for confirmation.");
            }
        }
        _ => println!("No Tailscale node matches {hostname}"),
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ListFormat {
    #[default]
    Table,
    Json,
    Csv,
}

pub async fn list_overlay(online_only: bool, format: ListFormat) -> Result<()> {
    let directory = client()?;
    let mut identities = directory
        .list_identities()
        .await
        .context("Failed to read Tailscale devices")?;
    if online_only {
        identities.retain(|i| i.online);
    }
    identities.sort_by(|a, b| a.name.cmp(&b.name));

    match format {
        ListFormat::Json => println!("{}", serde_json::to_string_pretty(&identities)?),
        ListFormat::Csv => print!("{}", to_csv(&identities)),
        ListFormat::Table => print_table(&identities),
    }
    Ok(())
}

fn print_table(identities: &[OverlayIdentity]) {
    if identities.is_empty() {
        println!("No Tailscale nodes found");
        return;
    }

    println!("{:<24} {:<40} {:<16} {:<8} {:<10}", "NAME", "FQDN", "IP", "STATUS", "OS");
    for identity in identities {
        println!(
            "{:<24} {:<40} {:<16} {:<8} {:<10}",
            identity.name,
            identity.fqdn,
            identity.addresses.first().map(String::as_str).unwrap_or("-"),
            if identity.online { "online" } else { "offline" },
            identity.os
        );
    }
    println!("\n{} node(s)", identities.len());
}

fn to_csv(identities: &[OverlayIdentity]) -> String {
    let mut out = String::from("id,name,fqdn,addresses,os,online,last_seen\n");
    for identity in identities {
        let row = [
            identity.id.clone(),
            identity.name.clone(),
            identity.fqdn.clone(),
            identity.addresses.join(" "),
            identity.os.clone(),
            identity.online.to_string(),
            identity.last_seen.clone().unwrap_or_default(),
        ];
        let fields: Vec<String> = row.iter().map(|f| csv_field(f)).collect();
        out.push_str(&fields.join(","));
        out.push('\n');
    }
    out
}

/// Quotes a field when it holds a separator, quote or line break.
fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str, os: &str) -> OverlayIdentity {
        OverlayIdentity {
            id: "n1".to_string(),
            name: name.to_string(),
            fqdn: format!("{name}.tailnet.ts.net"),
            addresses: vec!["100.64.0.1".to_string(), "fd7a::1".to_string()],
            online: true,
            os: os.to_string(),
            last_seen: None,
        }
    }

    #[test]
    fn csv_has_header_and_one_row_per_node() {
        let csv = to_csv(&[identity("web1", "linux")]);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "id,name,fqdn,addresses,os,online,last_seen");
        assert_eq!(lines[1], "n1,web1,web1.tailnet.ts.net,100.64.0.1 fd7a::1,linux,true,");
    }

    #[test]
    fn csv_quotes_awkward_fields() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
