fn main() {
    if let Err(err) = agentbox::cli::run_agentbox() {
        tracing::error!(error = %err, "agentbox failed");
        std::process::exit(1);
    }
}
