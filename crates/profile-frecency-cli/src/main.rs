use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    profile_frecency_cli::init_logging();
    let cli = profile_frecency_cli::Cli::parse();
    profile_frecency_cli::run_cli(cli)
}
