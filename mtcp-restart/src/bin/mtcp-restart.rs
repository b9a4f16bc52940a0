//! Thin CLI entry point. All real logic lives in the `mtcp_restart` library
//! so it can be exercised from tests without forking a process.

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if let Err(e) = mtcp_restart::run(args) {
        eprintln!("mtcp-restart: {e}");
        std::process::exit(mtcp_restart::EXIT_SIGNATURE_MISMATCH);
    }
}
