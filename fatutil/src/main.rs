use std::error::Error;
use std::process;

use clap::Parser;

use fatutil::command::{self, Cli};
use fatutil::logger;

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version go to stdout and succeed.
            let code = if e.use_stderr() { -1 } else { 0 };
            let _ = e.print();
            process::exit(code);
        }
    };

    if let Err(e) = logger::init(cli.verbose) {
        eprintln!("warning: logging disabled: {e}");
    }

    if let Err(e) = command::run(&cli) {
        eprintln!("error: {e}");
        let mut source = e.source();
        while let Some(cause) = source {
            eprintln!("  caused by: {cause}");
            source = cause.source();
        }
        log::logger().flush();
        process::exit(-1);
    }
}
