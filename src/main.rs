use log::{info, LevelFilter};
use pretty_env_logger::env_logger::Target;

use script::{install_builtins, read_script, ExecutionContext};

use std::env;
use std::process::exit;

fn main() {
    let mut builder = pretty_env_logger::formatted_builder();
    builder.target(Target::Stdout).filter_level(LevelFilter::Warn);
    if let Ok(filters) = env::var("SCRIPT_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();

    let path = match env::args().nth(1) {
        Some(v) => v,
        None => {
            eprintln!("usage: rust_script <file>");
            exit(2);
        }
    };

    let source = match read_script(&path) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("{}: {}", path, e);
            exit(2);
        }
    };

    info!("Starting...");

    let mut context = ExecutionContext::new(&source);
    install_builtins(&mut context);
    context.run();

    for line in context.output() {
        println!("{}", line);
    }

    for diagnostic in context.diagnostics() {
        eprintln!("{}", diagnostic);
    }

    if !context.diagnostics().is_empty() {
        exit(1);
    }
}
