//! HTTP server for the order queue.
//!
//! `peditos_queue` serves the REST API. `peditos_queue add-user <name> <email> <USER|ADMIN>`
//! registers a user in the configured database and prints its id and a bearer token.

use clap::{Parser, Subcommand};
use peditos_queue::api::{self, AppState};
use peditos_queue::config::{Config, StartupError};
use peditos_queue::Role;
use std::process::ExitCode;
use tokio::net::TcpListener;

/// Peditos order queue server
#[derive(Parser, Debug)]
#[command(name = "peditos_queue")]
#[command(about = "Order queue backend; serves the REST API unless a subcommand is given")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Register a user and print its id and a bearer token
    AddUser {
        /// Display name shown in order summaries
        name: String,
        /// Address confirmations are sent to
        email: String,
        /// USER or ADMIN
        #[arg(value_parser = parse_role)]
        role: Role,
    },
}

fn parse_role(raw: &str) -> Result<Role, String> {
    Role::from_str(raw).ok_or_else(|| format!("role must be USER or ADMIN, got {raw:?}"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _ = env_logger::try_init();
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            log::error!("configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let state = match AppState::from_config(&config) {
        Ok(s) => s,
        Err(e) => {
            log::error!("startup: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        None => serve(state, config.port).await,
        Some(Command::AddUser { name, email, role }) => add_user(&state, &name, &email, role),
    }
}

async fn serve(state: AppState, port: u16) -> ExitCode {
    let app = api::create_router(state);
    let addr = format!("0.0.0.0:{}", port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            log::error!("bind {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };
    log::info!("listening on http://{}", addr);
    if let Err(e) = axum::serve(listener, app.into_make_service()).await {
        log::error!("serve: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn add_user(state: &AppState, name: &str, email: &str, role: Role) -> ExitCode {
    let created = state
        .engine
        .store()
        .insert_user(name, email, role)
        .map_err(StartupError::from)
        .and_then(|user| Ok((user.id, state.jwt.issue(user.id, role)?)));
    match created {
        Ok((id, token)) => {
            println!("id={}", id);
            println!("token={}", token);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("add-user: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_serves() {
        let cli = Cli::try_parse_from(["peditos_queue"]).unwrap();
        assert_eq!(cli.command, None);
    }

    #[test]
    fn add_user_parses_role_case_insensitively() {
        let cli = Cli::try_parse_from(["peditos_queue", "add-user", "Ana", "ana@example.com", "admin"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Command::AddUser {
                name: "Ana".into(),
                email: "ana@example.com".into(),
                role: Role::Admin,
            })
        );
    }

    #[test]
    fn add_user_rejects_unknown_role_and_missing_args() {
        assert!(Cli::try_parse_from(["peditos_queue", "add-user", "Ana", "ana@example.com", "ROOT"]).is_err());
        assert!(Cli::try_parse_from(["peditos_queue", "add-user", "Ana"]).is_err());
    }
}
