use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    review_odds_cli::init_tracing();
    let cli = review_odds_cli::Cli::parse();
    review_odds_cli::run_cli(cli)
}
