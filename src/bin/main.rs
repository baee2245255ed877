use clap::Parser;
use log::error;

use vdj_glom::cli::Cli;
use vdj_glom::logging::init_logging;

fn main() {
    let cli = Cli::parse();
    let _handle = init_logging(cli.log_filepath());
    if let Err(err) = cli.run() {
        error!("{err:#}");
        std::process::exit(1);
    }
}
