//! Worker process entry point. Loads configuration, authenticates
//! against the code-hosting API, ensures the local clone is ready, and
//! runs the phase scheduler until a shutdown signal arrives.

use claimd::config::Config;
use claimd::credential_refresher::CredentialRefresher;
use claimd::host_api::HostApiClient;
use claimd::identity::{resolve_worker_id, TokenCache};
use claimd::scheduler::PhaseScheduler;
use claimd::signals::wait_for_shutdown_signal;
use claimd::subprocess::SubprocessAdapter;
use claimd::workspace::WorkspaceManager;
use std::process::ExitCode;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::from(2);
        }
    };

    let (owner, repo_name) = match config.owner_repo() {
        Ok(v) => (v.0.to_string(), v.1.to_string()),
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::from(2);
        }
    };

    let worker_id = resolve_worker_id(config.worker_id.clone());
    info!(worker = %worker_id, repo = %config.repo, "starting worker");

    let http = match reqwest::Client::builder().build() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to build http client");
            return ExitCode::from(1);
        }
    };

    let tokens = match TokenCache::new(&config, http.clone()) {
        Ok(t) => t,
        Err(e) => {
            error!(error = %e, "failed to initialize identity");
            return ExitCode::from(2);
        }
    };

    let mut api = HostApiClient::new(http, owner, repo_name.clone(), tokens);

    let initial_token = match api.current_token().await {
        Ok(t) => t,
        Err(e) => {
            error!(error = %e, "failed to mint initial installation token");
            return ExitCode::from(3);
        }
    };

    let workspace = WorkspaceManager::new(
        config.workspace_dir.clone(),
        config.repo.clone(),
        config.base_branch.clone(),
        config.branch_prefix.clone(),
    );
    if let Err(e) = workspace.ensure_cloned(&initial_token) {
        error!(error = %e, "failed to prepare local clone");
        return ExitCode::from(3);
    }

    let home = dirs::home_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
    let credentials = CredentialRefresher::new(home, config.mcp_server_name.clone());
    credentials.refresh(&initial_token);

    let subprocess = SubprocessAdapter::new(config.subprocess_binary.clone());
    let task_log_dir = std::env::var("TASK_LOG_DIR").ok().map(std::path::PathBuf::from);

    let mut scheduler = PhaseScheduler::new(
        config,
        worker_id,
        api,
        workspace,
        subprocess,
        credentials,
        task_log_dir,
    );

    scheduler.startup_jitter().await;
    scheduler.run(Box::pin(wait_for_shutdown_signal())).await;

    ExitCode::SUCCESS
}
