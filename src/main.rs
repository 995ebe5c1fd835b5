use clap::Parser;
use holdco::api::{Cli, error_json, run};
use tracing_subscriber::EnvFilter;

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(body) => println!("{body}"),
        Err(e) => {
            eprintln!("{}", error_json(&e));
            std::process::exit(1);
        }
    }
}
