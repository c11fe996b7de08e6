//! `nbk envelope` command.

use anyhow::{Context, Result};
use clap::Args;
use nbk_protocol::{CommandType, EventType, KernelEnvelope};
use tokio::io::AsyncReadExt;
use tracing::warn;

#[derive(Args, Debug)]
pub struct EnvelopeArgs {
    /// Envelope JSON; read from stdin when omitted or "-"
    pub input: Option<String>,

    /// Pretty-print the normalized envelope
    #[arg(long)]
    pub pretty: bool,
}

pub async fn cmd_envelope(args: &EnvelopeArgs) -> Result<()> {
    let text = match args.input.as_deref() {
        None | Some("-") => {
            let mut buf = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buf)
                .await
                .context("read envelope from stdin")?;
            buf
        }
        Some(json) => json.to_string(),
    };

    let envelope = KernelEnvelope::from_json(text.trim()).context("invalid envelope")?;
    match &envelope {
        KernelEnvelope::Command(command) => {
            if !CommandType::CATALOG.contains(&command.command_type().as_str()) {
                warn!(command_type = %command.command_type(), "unknown command type");
            }
        }
        KernelEnvelope::Event(event) => {
            if !EventType::CATALOG.contains(&event.event_type().as_str()) {
                warn!(event_type = %event.event_type(), "unknown event type");
            }
        }
    }

    let model = envelope.to_model();
    let out = if args.pretty {
        serde_json::to_string_pretty(&model)?
    } else {
        serde_json::to_string(&model)?
    };
    println!("{out}");
    Ok(())
}
