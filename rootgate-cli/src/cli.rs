//! CLI argument definitions

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rootgate")]
#[command(
    about = "Run a command in rootless user, network and mount namespaces",
    long_about = None
)]
#[command(version, args_conflicts_with_subcommands = true, subcommand_negates_reqs = true)]
pub struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage port mappings of a running session
    Port(PortArgs),
}

/// Session flags, shared verbatim by the parent and the child
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// State directory (default: a private temporary directory)
    #[arg(long, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    /// Network driver: host, slirp4netns, vpnkit or vdeplug_slirp
    #[arg(long, default_value = "host")]
    pub net: String,

    /// slirp4netns binary
    #[arg(long, default_value = "slirp4netns", value_name = "PATH")]
    pub slirp4netns_binary: String,

    /// vpnkit binary
    #[arg(long, default_value = "vpnkit", value_name = "PATH")]
    pub vpnkit_binary: String,

    /// MTU of the namespace interface (0 = backend default)
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub mtu: i64,

    /// Address block of the namespace network (slirp4netns only)
    #[arg(long)]
    pub cidr: Option<String>,

    /// Refuse connections from the namespace to the host loopback
    #[arg(long)]
    pub disable_host_loopback: bool,

    /// Make a directory writable inside the namespace (repeatable)
    #[arg(long = "copy-up", value_name = "PATH")]
    pub copy_up: Vec<PathBuf>,

    /// Copy-up driver
    #[arg(long, default_value = "tmpfs+symlink")]
    pub copy_up_mode: String,

    /// Port driver: none, builtin, slirp4netns or socat
    #[arg(long, default_value = "none")]
    pub port_driver: String,

    /// Expose a port, [[HOST_IP:]HOST_PORT:][CHILD_IP:]CHILD_PORT[/PROTO] (repeatable)
    #[arg(short = 'p', long = "publish", value_name = "SPEC")]
    pub publish: Vec<String>,

    /// User namespace id mapping: auto or single
    #[arg(long, default_value = "auto")]
    pub id_map: String,

    /// Command to run
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

#[derive(Args, Debug)]
pub struct PortArgs {
    /// State directory of the session
    #[arg(long, env = "ROOTGATE_STATE_DIR", value_name = "DIR")]
    pub state_dir: PathBuf,

    #[command(subcommand)]
    pub action: PortAction,
}

#[derive(Subcommand, Debug)]
pub enum PortAction {
    /// Expose a port
    Add {
        /// Port spec, e.g. 127.0.0.1:8080:80/tcp
        spec: String,
    },

    /// Withdraw a port
    Remove {
        /// Port id
        id: u64,
    },

    /// List active ports
    List {
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
}
