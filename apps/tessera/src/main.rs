//! # Tessera
//!
//! Command-line front end for the tessera mediation layer.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                apps/tessera (THE BINARY)             │
//! │                                                      │
//! │   ┌─────────────┐   ┌─────────────┐  ┌───────────┐   │
//! │   │    CLI      │   │   config    │  │  schema   │   │
//! │   │   (clap)    │   │   (TOML)    │  │  (TOML)   │   │
//! │   └──────┬──────┘   └──────┬──────┘  └─────┬─────┘   │
//! │          └─────────────────┼───────────────┘         │
//! │                            ▼                         │
//! │                   ┌────────────────┐                 │
//! │                   │  tessera-core  │                 │
//! │                   └────────────────┘                 │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! tessera --schema schema.toml init
//! tessera status
//! tessera seq --name Order --count 3
//! tessera --schema schema.toml query --class app.Person --order-by age:desc
//! ```

use clap::Parser;
use tessera::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

fn main() {
    // TESSERA_LOG_FORMAT=json switches to machine-parseable output.
    let log_format = std::env::var("TESSERA_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "tessera=info,tessera_core=info".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli) {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Print the startup banner.
fn print_banner() {
    println!(
        r#"
  tessera v{}
  identity-stable objects over schemaless records
"#,
        env!("CARGO_PKG_VERSION")
    );
}
