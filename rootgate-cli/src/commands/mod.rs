use crate::cli::Commands;
use anyhow::Result;

pub mod port;

/// Dispatch command to appropriate handler
pub fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Port(args) => port::execute(args),
    }
}
