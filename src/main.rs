use env_logger::{Builder, Env};
use log::error;

fn init_logger() {
    // RUST_LOG overrides the default level, e.g. RUST_LOG=debug branchsmith sync
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    init_logger();

    if let Err(err) = branchsmith::cli::run() {
        error!("{err:#}");
        std::process::exit(1);
    }
}
