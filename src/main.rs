use std::env;

use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage: deskpilot serve --config <path>\n       deskpilot verify-audit --path <file>";

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("serve") => {
            let config_path = flag_value(&args, "--config")
                .unwrap_or_else(|| String::from("./config/deskpilot.yaml"));
            let cfg = match deskpilot_config::load_and_validate(&config_path) {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(path = %config_path, error = %e, "failed to load config");
                    std::process::exit(1);
                }
            };
            if let Err(e) = deskpilot_agent::serve(cfg).await {
                tracing::error!(error = %e, "agent exited with error");
                std::process::exit(1);
            }
        }
        Some("verify-audit") => {
            let Some(path) = flag_value(&args, "--path") else {
                eprintln!("{USAGE}");
                std::process::exit(2);
            };
            match deskpilot_agent::verify_audit_chain(&path) {
                Ok(summary) => println!("{summary}"),
                Err(e) => {
                    eprintln!("audit verification failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }
}
