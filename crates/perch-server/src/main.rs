use clap::Parser;
use perch_server::auth::Authenticator;
use perch_server::http::{self, AppState};
use perch_server::schema::CompiledSchema;
use perch_store::CollectionHolder;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "perch-server")]
struct Args {
    /// Port to listen on.
    #[arg(short = 'p', long, env = "PERCH_PORT", default_value_t = 3318)]
    port: u16,

    /// JSON Schema every document body must satisfy.
    #[arg(short = 's', long, env = "PERCH_SCHEMA")]
    schema: PathBuf,

    /// Optional JSON file mapping usernames to pre-issued tokens.
    #[arg(short = 't', long, env = "PERCH_TOKENS")]
    tokens: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset (e.g. "debug", "perch_store=trace").
    #[arg(short = 'l', long, env = "PERCH_LOG", default_value = "info")]
    log: String,
}

fn load_tokens(path: &PathBuf) -> Result<HashMap<String, String>, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| format!("token file not found: {e}"))?;
    serde_json::from_str(&raw).map_err(|e| format!("cannot parse token file: {e}"))
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let schema = match CompiledSchema::from_file(&args.schema) {
        Ok(schema) => schema,
        Err(e) => {
            eprintln!("failed to load schema {}: {e}", args.schema.display());
            std::process::exit(2);
        }
    };

    let auth = Arc::new(Authenticator::new());
    if let Some(path) = &args.tokens {
        match load_tokens(path) {
            Ok(users) => auth.install_users(users),
            Err(e) => {
                eprintln!("failed to load tokens {}: {e}", path.display());
                std::process::exit(2);
            }
        }
    }

    let state = AppState {
        root: CollectionHolder::new(),
        schema: Arc::new(schema),
        auth,
    };
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", args.port))
        .await
        .expect("failed to bind http listener");
    info!(port = args.port, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .expect("http server crashed");
}
