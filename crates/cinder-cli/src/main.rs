//! `cinder` command-line entry point.
//!
//! Each invocation is a fresh process, so commands that talk to a guest
//! probe its SSH first. Results go to stdout as JSON; logs go to stderr.

use anyhow::Context;
use cinder_core::ssh::ProbeConfig;
use cinder_core::{ManagerConfig, VmConfig, VmManager};
use cinder_vm::VmId;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "cinder", version, about = "Firecracker microVM lifecycle on one host")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create and boot a VM, waiting until it accepts SSH
    Create {
        /// Kernel image
        #[arg(long)]
        kernel: PathBuf,
        /// Base rootfs image (copied per VM)
        #[arg(long)]
        rootfs: PathBuf,
        #[arg(long, default_value_t = 1)]
        vcpus: u8,
        /// Memory in MiB
        #[arg(long, default_value_t = 512)]
        mem: u32,
        #[arg(long, default_value_t = 10)]
        ssh_retries: u32,
        #[arg(long, default_value_t = 1000)]
        ssh_delay_ms: u64,
    },
    /// Tear a VM down
    Delete {
        #[arg(long)]
        id: String,
        #[arg(long)]
        ip: Ipv4Addr,
    },
    /// Run a shell command in a VM
    Exec {
        #[arg(long)]
        ip: Ipv4Addr,
        /// Working directory, created if missing
        #[arg(long)]
        cwd: Option<String>,
        command: String,
    },
    /// Write a file in a VM
    WriteFile {
        #[arg(long)]
        ip: Ipv4Addr,
        #[arg(long)]
        path: String,
        #[arg(long, conflicts_with = "from_file", required_unless_present = "from_file")]
        content: Option<String>,
        /// Local file whose bytes are written
        #[arg(long)]
        from_file: Option<PathBuf>,
    },
    /// Create a directory in a VM
    Mkdir {
        #[arg(long)]
        ip: Ipv4Addr,
        #[arg(long)]
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries results only.
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("cinder=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = ManagerConfig::from_env();
    tracing::debug!(?config, "Configuration loaded");
    let manager = VmManager::from_config(config).await?;

    let output = run(&manager, cli.command).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(manager: &VmManager, command: Command) -> anyhow::Result<serde_json::Value> {
    match command {
        Command::Create {
            kernel,
            rootfs,
            vcpus,
            mem,
            ssh_retries,
            ssh_delay_ms,
        } => {
            let config = VmConfig::builder()
                .kernel(kernel)
                .rootfs(rootfs)
                .vcpu_count(vcpus)
                .mem_size_mib(mem)
                .ssh_max_retries(ssh_retries)
                .ssh_base_delay(Duration::from_millis(ssh_delay_ms))
                .build()?;
            let vm = manager.create(config).await.context("create failed")?;
            Ok(serde_json::to_value(vm)?)
        }
        Command::Delete { id, ip } => {
            let report = manager.delete(&VmId::from(id), ip).await;
            Ok(serde_json::to_value(report)?)
        }
        Command::Exec { ip, cwd, command } => {
            manager.probe(ip, ProbeConfig::default()).await?;
            let output = manager.execute(ip, &command, cwd.as_deref()).await?;
            Ok(json!({ "output": output }))
        }
        Command::WriteFile {
            ip,
            path,
            content,
            from_file,
        } => {
            let bytes = match (content, from_file) {
                (Some(text), _) => text.into_bytes(),
                (None, Some(file)) => tokio::fs::read(&file)
                    .await
                    .with_context(|| format!("reading {}", file.display()))?,
                (None, None) => anyhow::bail!("one of --content or --from-file is required"),
            };
            manager.probe(ip, ProbeConfig::default()).await?;
            let listing = manager.write_file(ip, &path, &bytes).await?;
            Ok(json!({ "path": path, "listing": listing }))
        }
        Command::Mkdir { ip, path } => {
            manager.probe(ip, ProbeConfig::default()).await?;
            manager.create_dir(ip, &path).await?;
            Ok(json!({ "path": path, "created": true }))
        }
    }
}
