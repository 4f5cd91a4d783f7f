/// Environment variable overriding the log filter.
const LOG_ENV_VAR: &str = "KEYFLOW_LOG";

fn main() {
    // Load .env if present (development convenience); production relies on
    // real environment variables and the key store.
    let _ = dotenvy::dotenv();

    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or(LOG_ENV_VAR, "keyflow=info")
            .write_style("KEYFLOW_LOG_STYLE"),
    )
    .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    match runtime.block_on(keyflow::run_headless()) {
        Ok(()) => {}
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(e.exit_code());
        }
    }
}
