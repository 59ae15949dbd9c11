use clap::Parser;

mod cli;

fn main() {
    let args = cli::Cli::parse();
    cli::init_tracing(args.options.debug);
    std::process::exit(cli::execute(args));
}
