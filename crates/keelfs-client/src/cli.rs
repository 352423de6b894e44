use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use keelfs_meta::{now_ms, FileStatus, NodeHealth};

use crate::cluster::MiniCluster;
use crate::config::ClusterConfig;

#[derive(Parser)]
#[command(name = "keelfs")]
#[command(about = "KeelFS file system shell over an in-process cluster", long_about = None)]
pub struct Cli {
    /// Cluster config (.toml or .json); defaults apply when absent
    #[arg(short, long, env = "KEELFS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Overrides the data directory from the config
    #[arg(short, long, env = "KEELFS_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a directory
    Mkdir {
        path: String,
        /// Create missing parents
        #[arg(short, long)]
        parents: bool,
    },
    /// Upload a local file
    Put {
        local: PathBuf,
        remote: String,
        /// Replace an existing file
        #[arg(short, long)]
        force: bool,
        /// Replication factor for the new file
        #[arg(short, long)]
        replication: Option<u16>,
    },
    /// Download a file
    Get { remote: String, local: PathBuf },
    /// Delete a file or directory
    Rm {
        path: String,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Rename or move
    Mv { src: String, dst: String },
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// List files recursively with block locations
    Lsr {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Write a checkpoint of the namespace now
    Checkpoint,
    /// Show datanodes and their health
    Nodes,
}

impl Cli {
    pub fn load_config(&self) -> Result<ClusterConfig> {
        let mut config = match &self.config {
            Some(path) => ClusterConfig::from_file(path)?,
            None => ClusterConfig::default(),
        };
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        Ok(config)
    }

    pub async fn run(self) -> Result<()> {
        let config = self.load_config()?;
        let cluster = MiniCluster::start(config)?;
        match self.command {
            Command::Mkdir { ref path, parents } => {
                let client = cluster.client();
                if parents {
                    client.mkdirs(path)?;
                } else {
                    client.mkdir(path)?;
                }
            }
            Command::Put {
                ref local,
                ref remote,
                force,
                replication,
            } => {
                let mut client = cluster.client();
                if let Some(r) = replication {
                    client = client.with_replication(r);
                }
                let status = client.put(local, remote, force).await?;
                println!("{} ({} bytes)", status.path, status.len);
            }
            Command::Get {
                ref remote,
                ref local,
            } => {
                let written = cluster.client().get(remote, local).await?;
                println!("{} -> {} ({} bytes)", remote, local.display(), written);
            }
            Command::Rm {
                ref path,
                recursive,
            } => cluster.client().rm(path, recursive)?,
            Command::Mv { ref src, ref dst } => cluster.client().mv(src, dst)?,
            Command::Ls { ref path } => {
                for status in cluster.client().list_status(path)? {
                    println!("{}", format_status(&status));
                }
            }
            Command::Lsr { ref path } => {
                for file in cluster.client().list_files(path, true)? {
                    println!("{}", format_status(&file.status));
                    for block in &file.blocks {
                        let hosts: Vec<String> =
                            block.locations.iter().map(|h| h.node.to_string()).collect();
                        println!(
                            "    {} offset={} len={} [{}]",
                            block.block,
                            block.offset,
                            block.len,
                            hosts.join(", ")
                        );
                    }
                }
            }
            Command::Checkpoint => match cluster.coordinator().checkpoint(now_ms())? {
                Some(watermark) => println!("checkpoint written at transaction {}", watermark),
                None => println!("namespace unchanged since the last checkpoint"),
            },
            Command::Nodes => {
                println!(
                    "{:<8} {:<10} {:<12} {:>8}",
                    "NODE", "RACK", "HEALTH", "BLOCKS"
                );
                for node in cluster.coordinator().monitor().nodes() {
                    let health = match node.health {
                        NodeHealth::Alive => "alive",
                        NodeHealth::Stale => "stale",
                        NodeHealth::Dead => "dead",
                    };
                    println!(
                        "{:<8} {:<10} {:<12} {:>8}",
                        node.id.to_string(),
                        node.rack,
                        health,
                        node.blocks.len()
                    );
                }
            }
        }
        Ok(())
    }
}

fn format_status(status: &FileStatus) -> String {
    if status.is_dir() {
        format!("d   -  {:>12}  {}", "-", status.path)
    } else {
        format!("-   {}  {:>12}  {}", status.replication, status.len, status.path)
    }
}
