fn main() {
    if let Err(err) = sandbox_run::cli::run_sandbox_run() {
        tracing::error!(error = %err, "sandbox-run failed");
        std::process::exit(1);
    }
}
