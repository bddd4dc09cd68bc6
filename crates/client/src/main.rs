//! AVID-FP client entry point.
//!
//! Minimal main that delegates to the `cli` module.

mod cli;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let exit_code = cli::run().await;
    std::process::exit(exit_code);
}
