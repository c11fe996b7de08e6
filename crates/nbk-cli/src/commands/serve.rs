//! `nbk serve` command.

use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use nbk_kernel::transport::{NdjsonReceiver, NdjsonSender};
use nbk_kernel::{CompositeKernel, KernelHost};
use tracing::info;

use crate::opts::HostOpts;
use crate::value_kernel;

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Name of the value-store kernel
    #[arg(long, default_value = "value")]
    pub value_kernel: String,

    /// Extra aliases for the value-store kernel
    #[arg(long = "alias")]
    pub aliases: Vec<String>,
}

pub async fn cmd_serve(opts: &HostOpts, args: &ServeArgs) -> Result<()> {
    let root = CompositeKernel::new(opts.kernel_name.clone());
    let aliases: Vec<&str> = args.aliases.iter().map(String::as_str).collect();
    root.add(value_kernel::create(&args.value_kernel), &aliases)?;

    let sender = Arc::new(NdjsonSender::new(tokio::io::stdout()));
    let receiver = Arc::new(NdjsonReceiver::new());
    let host = KernelHost::new(root, sender, receiver.clone(), opts.host_config());

    let ready = host.connect()?;
    info!(uri = %host.uri(), kernels = ready.kernel_infos.len(), "serving on stdio");

    receiver.read_from(tokio::io::stdin()).await?;
    info!("stdin closed, shutting down");
    host.shutdown().await;
    Ok(())
}
