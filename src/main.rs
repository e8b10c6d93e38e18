use clap::Parser;
use varcollector::{Args, CollectorError};

// --------------------------------------------------
fn main() {
    if let Err(e) = varcollector::run(Args::parse()) {
        eprintln!("Error: {e}");
        let code = e
            .downcast_ref::<CollectorError>()
            .map_or(1, CollectorError::exit_code);
        std::process::exit(code);
    }
}
