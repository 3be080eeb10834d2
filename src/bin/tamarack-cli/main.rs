//! Administrative CLI for the IPAM daemon.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use tamarack::server::{ServiceClient, ServiceRequest, ServiceResponse};
use tamarack::topology::TopologyConfig;

#[derive(Debug, Parser)]
#[command(name = "tamarack-cli", about = "IPAM administration")]
struct Cli {
    /// Daemon TCP address.
    #[arg(long, default_value = "127.0.0.1:4720")]
    daemon: String,

    /// Connect over the daemon's unix socket instead of TCP.
    #[arg(long)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show pool statistics.
    Stats,
    /// Show blocks assigned to a node.
    Blocks { node_id: String },
    /// Allocate a block for a node.
    Allocate { node_id: String },
    /// Release an empty block from a node.
    Release { node_id: String, cidr: String },
    /// Show one node's topology standing.
    NodeStats { node_id: String },
    /// Initialize the topology from a JSON config file.
    TopologyInit {
        /// Path to the topology config (JSON).
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Register a host under a TOR.
    RegisterNode {
        node_id: String,
        tor_id: String,
        /// Display name; defaults to the node id.
        #[arg(long)]
        name: Option<String>,
        /// Labels as key=value, repeatable.
        #[arg(long = "label")]
        labels: Vec<String>,
    },
    /// Add a subnet to a TOR.
    SubnetAdd {
        tor_id: String,
        cidr: String,
        #[arg(default_value = "default")]
        purpose: String,
    },
    /// Show cluster health and leadership.
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = match &cli.socket {
        Some(path) => ServiceClient::unix(path.clone()),
        None => ServiceClient::tcp(cli.daemon.clone()),
    };

    let request = build_request(&cli.command)?;
    let response = client.request(request).await?;
    render(response)
}

fn build_request(command: &Command) -> Result<ServiceRequest> {
    Ok(match command {
        Command::Stats => ServiceRequest::GetPoolStats,
        Command::Blocks { node_id } => ServiceRequest::GetNodeBlocks {
            node_id: node_id.clone(),
        },
        Command::Allocate { node_id } => ServiceRequest::AllocateBlock {
            node_id: node_id.clone(),
        },
        Command::Release { node_id, cidr } => ServiceRequest::ReleaseBlock {
            node_id: node_id.clone(),
            cidr: cidr.clone(),
        },
        Command::NodeStats { node_id } => ServiceRequest::GetNodeStats {
            node_id: node_id.clone(),
        },
        Command::TopologyInit { file } => {
            let raw = std::fs::read_to_string(file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let config: TopologyConfig =
                serde_json::from_str(&raw).context("invalid topology config")?;
            ServiceRequest::InitTopology { config }
        }
        Command::RegisterNode {
            node_id,
            tor_id,
            name,
            labels,
        } => {
            let mut parsed = BTreeMap::new();
            for label in labels {
                let (key, value) = label
                    .split_once('=')
                    .with_context(|| format!("expected key=value label, got {label}"))?;
                parsed.insert(key.to_string(), value.to_string());
            }
            ServiceRequest::RegisterNode {
                node_id: node_id.clone(),
                name: name.clone().unwrap_or_else(|| node_id.clone()),
                tor_id: tor_id.clone(),
                labels: parsed,
            }
        }
        Command::SubnetAdd {
            tor_id,
            cidr,
            purpose,
        } => ServiceRequest::AddSubnet {
            tor_id: tor_id.clone(),
            cidr: cidr.clone(),
            purpose: purpose.clone(),
        },
        Command::Health => ServiceRequest::GetHealth,
    })
}

fn render(response: ServiceResponse) -> Result<()> {
    match response {
        ServiceResponse::Error { kind, message } => {
            bail!("daemon error ({kind:?}): {message}");
        }
        ServiceResponse::PoolStats { flat, topology } => {
            println!("Flat pool:");
            println!(
                "  nodes {}  blocks {}  ips {}/{} used  {} available",
                flat.total_nodes,
                flat.total_blocks,
                flat.used_ips,
                flat.total_ips,
                flat.available_ips
            );
            for (node, stats) in &flat.node_stats {
                println!(
                    "  {node}: {} blocks, {}/{} used",
                    stats.blocks, stats.used_ips, stats.total_ips
                );
            }
            println!("Topology pool:");
            println!(
                "  zones {}  pods {}  tors {}  nodes {}",
                topology.zone_count, topology.pod_count, topology.tor_count, topology.node_count
            );
            println!(
                "  subnets {}  ips {}/{} used  {} available",
                topology.total_subnets,
                topology.total_used,
                topology.total_capacity,
                topology.total_available
            );
        }
        ServiceResponse::NodeBlocks { blocks } => {
            if blocks.is_empty() {
                println!("no blocks");
            }
            for block in blocks {
                println!(
                    "{}  {}/{} used  {} available{}",
                    block.cidr,
                    block.used,
                    block.total,
                    block.available,
                    if block.under_pressure { "  [pressure]" } else { "" }
                );
            }
        }
        ServiceResponse::BlockAllocated {
            node_id,
            cidr,
            total,
            available,
            ..
        } => {
            println!("allocated {cidr} to {node_id} ({available}/{total} available)");
        }
        ServiceResponse::BlockReleased { node_id, cidr } => {
            println!("released {cidr} from {node_id}");
        }
        ServiceResponse::NodeStats { detail } => {
            println!("node {}  ({})", detail.node_id, detail.path);
            println!("  tor {}  allocated {}", detail.tor_id, detail.allocated_ips);
            println!(
                "  tor capacity {}/{} used  {} available",
                detail.tor_used, detail.tor_capacity, detail.tor_available
            );
            for (cidr, subnet) in &detail.subnet_stats {
                println!(
                    "  {cidr} [{}]  {}/{} used",
                    subnet.purpose, subnet.used, subnet.capacity
                );
            }
        }
        ServiceResponse::TopologyInitialized {
            zones,
            pods,
            tors,
            subnets,
        } => {
            println!("topology initialized: {zones} zones, {pods} pods, {tors} tors, {subnets} subnets");
        }
        ServiceResponse::NodeRegistered {
            node_id, tor_id, ..
        } => {
            println!("registered {node_id} under {tor_id}");
        }
        ServiceResponse::SubnetAdded {
            tor_id,
            cidr,
            purpose,
        } => {
            println!("added {cidr} [{purpose}] to {tor_id}");
        }
        ServiceResponse::Health {
            node_id,
            is_leader,
            leader,
        } => {
            println!(
                "node {node_id}: {}  leader={}",
                if is_leader { "leader" } else { "follower" },
                leader.map_or_else(|| "unknown".into(), |l| l.to_string())
            );
        }
        other => {
            // A response kind this command does not produce; surface it
            // rather than guessing at a rendering.
            println!("{other:?}");
        }
    }
    Ok(())
}
