use codex_opencode_bridge_client::cli::run_notify;

fn main() {
    if let Err(err) = run_notify() {
        tracing::error!(error = %err, "bridge-notify failed");
        std::process::exit(1);
    }
}
