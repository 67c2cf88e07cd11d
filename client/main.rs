#![forbid(unsafe_code)]

//! `rexec` — run a command on a remote node as if it were local.
//!
//! Connects to a `rexecd` server, submits the command with this process's
//! stdin/stdout/stderr bridged over the connection, and exits with the
//! remote command's exit code. Setting `USE_TLS` (any non-empty value)
//! switches the connection to TLS.

use clap::Parser;

use rexec::client;
use rexec::config::{self, ClientConfig};

#[derive(Debug, Parser)]
#[command(
    name = "rexec",
    about = "Execute a command on a remote node with bridged stdio",
    version,
    long_about = None
)]
struct Cli {
    /// Server address as <host>:<port>.
    #[arg(short = 'a', long = "address", default_value = config::DEFAULT_ADDRESS)]
    address: String,

    /// Command to execute remotely.
    command: String,

    /// Arguments passed to the remote command.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    arguments: Vec<String>,
}

fn main() {
    let args = Cli::parse();
    let config = ClientConfig::from_env(args.address);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("rexec: failed to build tokio runtime: {err}");
            std::process::exit(client::EXIT_TRANSPORT_FAILURE);
        }
    };

    match runtime.block_on(client::run(&config, &args.command, &args.arguments)) {
        Ok(status) => std::process::exit(client::exit_code_for_status(status)),
        Err(err) => {
            eprintln!("rexec: {err}");
            std::process::exit(client::EXIT_TRANSPORT_FAILURE);
        }
    }
}
