use std::os::fd::{AsRawFd, IntoRawFd};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vtap_broker::MacAddress;
use vtap_broker::config::DEFAULT_SOCKET;
use vtap_client::{MacRequest, exec, exit_code, request_tap, spawn_and_wait, substitute_fd};

#[derive(Parser)]
#[command(name = "vtap-client")]
#[command(about = "Obtain a bridged TAP device from vtap-broker and run a command with it")]
struct Args {
    /// Broker socket
    #[arg(short, long, env = "VTAP_SOCKET", default_value = DEFAULT_SOCKET)]
    socket: PathBuf,

    /// Request this MAC address (the first octet is forced to 02)
    #[arg(short, long, conflicts_with = "interface")]
    mac: Option<MacAddress>,

    /// Copy the MAC address of this interface
    #[arg(short, long)]
    interface: Option<String>,

    /// Run the command as a child and wait for it instead of replacing this process
    #[arg(long)]
    wait: bool,

    /// Command to run; every %FD% is replaced with the descriptor number
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Args {
    fn mac_request(&self) -> MacRequest {
        match (&self.mac, &self.interface) {
            (Some(mac), _) => MacRequest::Explicit(*mac),
            (None, Some(name)) => MacRequest::CopyFrom(name.clone()),
            (None, None) => MacRequest::Any,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("vtap_client=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mac = args.mac_request().resolve()?;
    let fd = request_tap(&args.socket, mac)
        .await
        .with_context(|| format!("No TAP device from {}", args.socket.display()))?;

    let raw = fd.as_raw_fd();
    info!(fd = raw, "Got TAP descriptor");

    if args.command.is_empty() {
        return Ok(());
    }

    let argv = substitute_fd(&args.command, raw);

    if args.wait {
        let status = spawn_and_wait(&argv).await?;
        drop(fd);
        std::process::exit(exit_code(status));
    }

    // Keep the descriptor open across exec.
    let _ = fd.into_raw_fd();
    Err(exec(&argv).into())
}
