use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = stratumctl::Cli::parse();
    stratumctl::init_tracing(cli.verbose);
    if let Err(err) = stratumctl::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
