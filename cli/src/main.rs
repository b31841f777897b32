mod commands;
mod interface;
mod output;
mod terminal;

use commands::{CommandLine, Commands, check, scan};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let commands = CommandLine::parse_args();

    terminal::init_logging(commands.verbose);

    match commands.command {
        Commands::Scan(args) => scan::scan(args).await,
        Commands::Check { blocklist, addrs } => check::check(&blocklist, &addrs),
    }
}
