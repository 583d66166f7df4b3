use clap::Parser as _;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};
use vento_tools::commands;

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Parameters(commands::parameters::Args),
    Discover(commands::discover::Args),
    Read(commands::read::Args),
    Status(commands::status::Args),
    Write(commands::write::Args),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn main() {
    let filter_description = std::env::var("VENTO_TOOLS_LOG").unwrap_or_else(|_| "warn".into());
    let filter = match filter_description.parse::<tracing_subscriber::filter::targets::Targets>() {
        Ok(filter) => filter,
        Err(e) => return end(Err(e)),
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    match Commands::parse() {
        Commands::Parameters(args) => end(commands::parameters::run(args)),
        Commands::Discover(args) => end(commands::discover::run(args)),
        Commands::Read(args) => end(commands::read::run(args)),
        Commands::Status(args) => end(commands::status::run(args)),
        Commands::Write(args) => end(commands::write::run(args)),
    }
}
