mod auth;
mod config;
mod dispatch;
mod error;
mod models;
mod server;
mod tools;

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use auth::manager::AccountManager;
use auth::refresh::{RefreshQueue, RefreshScheduler};
use auth::store::AccountStore;
use auth::{HttpClient, oauth};
use config::Config;
use dispatch::health::{HealthConfig, HealthTracker, TokenBucketConfig, TokenBucketTracker};
use dispatch::telemetry::TelemetrySink;
use dispatch::{FetchOrchestrator, LogNotifier, OAuthRefresher};
use server::ServerState;

fn init_tracing(debug: bool) {
    let default_filter = if debug { "codexmux=debug" } else { "codexmux=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_usage() {
    println!(
        "codexmux - multi-account proxy for the Codex backend\n\n\
         Usage:\n\
         \x20 codexmux [serve] [--port N] [--host H] [--debug]   start the proxy\n\
         \x20 codexmux login                                     add an account via OAuth\n\
         \x20 codexmux accounts list                             list accounts\n\
         \x20 codexmux accounts switch <n>                       set the active account\n\
         \x20 codexmux accounts toggle <n>                       enable/disable an account\n\
         \x20 codexmux accounts remove <n>                       remove an account\n\
         \x20 codexmux status                                    compact status with quota\n"
    );
}

#[tokio::main]
async fn main() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("login") => {
            init_tracing(false);
            std::process::exit(run_login().await);
        }
        Some("accounts") => {
            init_tracing(false);
            std::process::exit(run_accounts(&args[2..]));
        }
        Some("status") => {
            init_tracing(false);
            std::process::exit(run_status());
        }
        Some("help") | Some("--help") | Some("-h") => {
            print_usage();
        }
        Some("serve") => {
            std::process::exit(run_serve(&args[2..]).await);
        }
        None => {
            std::process::exit(run_serve(&args[1..]).await);
        }
        Some(other) => {
            eprintln!("Unknown command: {other}\n");
            print_usage();
            std::process::exit(2);
        }
    }
}

struct Stack {
    manager: Arc<AccountManager>,
    sink: Arc<TelemetrySink>,
}

fn build_stack(fallback_auth: Option<&oauth::TokenResult>) -> Result<Stack, i32> {
    let store = AccountStore::at_default_location();
    let health = Arc::new(HealthTracker::new(HealthConfig::default()));
    let buckets = Arc::new(TokenBucketTracker::new(TokenBucketConfig::default()));

    let manager = match AccountManager::load_from_disk(store, fallback_auth, health, buckets) {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            error!(error = %e, "could not open the account store");
            if let Some(suggestion) = e.suggestion() {
                eprintln!("{suggestion}");
            }
            return Err(1);
        }
    };
    let sink = Arc::new(TelemetrySink::new(Config::snapshots_path()));
    Ok(Stack { manager, sink })
}

async fn run_serve(args: &[String]) -> i32 {
    let mut port = None;
    let mut host = None;
    let mut debug = false;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--port" => port = iter.next().and_then(|v| v.parse().ok()),
            "--host" => host = iter.next().cloned(),
            "--debug" => debug = true,
            other => {
                eprintln!("Unknown flag: {other}");
                return 2;
            }
        }
    }

    let config = match Config::load() {
        Ok(config) => config.with_overrides(port, host, debug),
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };
    init_tracing(config.logging.debug);
    config::init_config(config.clone());

    let stack = match build_stack(None) {
        Ok(stack) => stack,
        Err(code) => return code,
    };

    if stack.manager.account_count() == 0 && !stack.manager.has_legacy_records() {
        warn!("no accounts configured; run 'codexmux login' to add one");
    }

    let http_client = Arc::new(HttpClient::new());
    let refresher = Arc::new(OAuthRefresher::new(http_client.clone()));

    let (queue, scheduler) = if config.proactive_token_refresh {
        let queue = Arc::new(RefreshQueue::new());
        let scheduler = RefreshScheduler::start(
            stack.manager.clone(),
            queue.clone(),
            http_client.clone(),
            config.token_refresh_skew_ms,
            config.token_refresh_skew_ms,
        );
        (Some(queue), Some(scheduler))
    } else {
        (None, None)
    };

    let orchestrator = Arc::new(FetchOrchestrator::new(
        stack.manager.clone(),
        stack.sink.clone(),
        refresher,
        queue.clone(),
        Arc::new(LogNotifier),
        config.clone(),
    ));

    let state = Arc::new(ServerState { orchestrator });
    let addr: SocketAddr = match format!("{}:{}", config.host(), config.port()).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "invalid listen address");
            return 1;
        }
    };

    let result = tokio::select! {
        result = server::run(state, addr) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    };

    if let Some(scheduler) = scheduler {
        scheduler.stop().await;
    }
    if let Some(queue) = queue {
        queue.stop().await;
    }

    match result {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "server error");
            1
        }
    }
}

/// Interactive OAuth login: print the authorization URL, accept the pasted
/// redirect, exchange the code, and persist the account.
async fn run_login() -> i32 {
    let flow = oauth::create_authorization_flow();

    println!("Open this URL in your browser and sign in:\n\n{}\n", flow.url);
    print!("Paste the full redirect URL (or just the code): ");
    let _ = std::io::stdout().flush();

    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        eprintln!("Could not read input");
        return 1;
    }
    let input = line.trim();
    if input.is_empty() {
        eprintln!("No code provided");
        return 1;
    }

    let (code, returned_state) = parse_redirect_input(input);
    if let Some(returned_state) = returned_state
        && returned_state != flow.state
    {
        eprintln!("State mismatch; aborting login");
        return 1;
    }

    let http_client = HttpClient::new();
    let result = oauth::exchange_authorization_code(
        &http_client,
        &code,
        &flow.pkce_verifier,
        oauth::REDIRECT_URI,
    )
    .await;

    match &result {
        oauth::TokenResult::Success { .. } => {
            let stack = match build_stack(Some(&result)) {
                Ok(stack) => stack,
                Err(code) => return code,
            };
            println!("Login successful.");
            println!("{}", tools::list_accounts(&stack.manager));
            0
        }
        oauth::TokenResult::Failed { reason } => {
            let err = error::Error::Auth(error::AuthError::OAuthFailed(reason.clone()));
            eprintln!("{err}");
            if let Some(suggestion) = err.suggestion() {
                eprintln!("{suggestion}");
            }
            1
        }
    }
}

/// Accept either a bare authorization code or the full redirect URL.
fn parse_redirect_input(input: &str) -> (String, Option<String>) {
    if !input.contains('?') && !input.contains('=') {
        return (input.to_string(), None);
    }

    let query = input.split_once('?').map(|(_, q)| q).unwrap_or(input);
    let mut code = None;
    let mut state = None;
    for pair in query.split('&') {
        let (key, value) = match pair.split_once('=') {
            Some(kv) => kv,
            None => continue,
        };
        match key {
            "code" => code = Some(value.to_string()),
            "state" => state = Some(value.to_string()),
            _ => {}
        }
    }
    (code.unwrap_or_else(|| input.to_string()), state)
}

fn run_accounts(args: &[String]) -> i32 {
    let stack = match build_stack(None) {
        Ok(stack) => stack,
        Err(code) => return code,
    };

    let index_arg = |args: &[String]| -> Option<usize> { args.get(1)?.parse().ok() };

    match args.first().map(String::as_str) {
        Some("list") | None => {
            println!("{}", tools::list_accounts(&stack.manager));
            0
        }
        Some("switch") => match index_arg(args) {
            Some(n) => {
                println!("{}", tools::switch_account(&stack.manager, n));
                0
            }
            None => {
                eprintln!("Usage: codexmux accounts switch <n>");
                2
            }
        },
        Some("toggle") | Some("enable") | Some("disable") => match index_arg(args) {
            Some(n) => {
                println!("{}", tools::toggle_account(&stack.manager, n));
                0
            }
            None => {
                eprintln!("Usage: codexmux accounts toggle <n>");
                2
            }
        },
        Some("remove") => match index_arg(args) {
            Some(n) => {
                println!("{}", tools::remove_account(&stack.manager, n));
                0
            }
            None => {
                eprintln!("Usage: codexmux accounts remove <n>");
                2
            }
        },
        Some(other) => {
            eprintln!("Unknown accounts command: {other}");
            2
        }
    }
}

fn run_status() -> i32 {
    // Classify the raw file first; loading would quarantine a corrupt one
    match AccountStore::at_default_location().inspect() {
        auth::store::InspectReport::Ok => {}
        auth::store::InspectReport::CorruptFile => {
            eprintln!("Warning: account store is corrupt; it will be quarantined on next use.");
        }
        auth::store::InspectReport::NeedsRepair {
            legacy,
            corrupt_entries,
        } => {
            eprintln!(
                "Warning: {} account(s) need repair, {} corrupt entries; repair runs on the next request.",
                legacy.len(),
                corrupt_entries
            );
        }
    }

    let stack = match build_stack(None) {
        Ok(stack) => stack,
        Err(code) => return code,
    };
    println!("{}", tools::compact_status(&stack.manager, &stack.sink));
    0
}
