#![forbid(unsafe_code)]

//! Binary entrypoint: parses the command line, loads the configuration
//! and runs the API server until interrupted.

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    ExitCode::from(rowgate_app::run().await)
}
