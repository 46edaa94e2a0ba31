mod args;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn, Level};

use crate::args::Args;
use reprap_proto::listener::ProtocolListener;
use reprap_proto::state::ProtocolState;
use reprap_proto::{Protocol, ProtocolConfig};

/// Mirrors engine events onto `tracing`, the way a host UI would subscribe to
/// them without owning any of the engine's internal state.
struct TracingListener;

impl ProtocolListener for TracingListener {
    fn on_protocol_state_change(&self, old: ProtocolState, new: ProtocolState) {
        info!(?old, ?new, "state change");
    }

    fn on_protocol_temperature_update(
        &self,
        temps: &std::collections::BTreeMap<String, (Option<f64>, Option<f64>)>,
    ) {
        info!(?temps, "temperature update");
    }

    fn on_protocol_firmware_info(&self, name: &str, info: &std::collections::BTreeMap<String, String>) {
        info!(name, ?info, "firmware identified");
    }

    fn on_protocol_sd_file_list(&self, files: &[(String, u64)]) {
        info!(count = files.len(), "sd file list received");
    }

    fn on_protocol_file_print_started(&self, name: &str, size: u64) {
        info!(name, size, "sd print started");
    }

    fn on_protocol_file_print_done(&self) {
        info!("sd print done");
    }

    fn on_protocol_log(&self, message: &str) {
        info!(%message, "protocol log");
    }

    fn on_protocol_error(&self, error: &reprap_proto::ProtocolError) {
        warn!(%error, "protocol error");
    }

    fn on_protocol_unmatched_line(&self, line: &str) {
        info!(%line, "unmatched line from firmware");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.debug {
        tracing_subscriber::fmt().with_max_level(Level::TRACE).init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "encountered runtime error");
            ExitCode::FAILURE
        },
    }
}

async fn run(args: Args) -> Result<()> {
    let port = args.port.to_string_lossy().into_owned();
    info!(port, baud = args.baud, "opening serial port");

    let transport = reprap_proto::transport::open_serial(&port, args.baud)
        .with_context(|| format!("opening {port}"))?;

    let protocol = Protocol::new(ProtocolConfig::default(), Arc::new(TracingListener));
    protocol.connect(transport).await;

    if let Some(command) = args.command {
        protocol.send_commands([command]).await;
    }

    if let Err(error) = signal::ctrl_c().await {
        warn!(%error, "something strange with ctrl-c handling!");
    }

    protocol.disconnect().await;
    Ok(())
}
