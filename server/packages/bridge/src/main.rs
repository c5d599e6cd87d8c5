use codex_opencode_bridge::cli::run_bridge;

fn main() {
    if let Err(err) = run_bridge() {
        tracing::error!(error = %err, "codex-opencode-bridge failed");
        std::process::exit(1);
    }
}
