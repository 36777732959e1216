//! knockout: elimination trivia server binary.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use knockout_runtime::arena::Arena;
use knockout_runtime::cli::{self, Cli, Command};
use knockout_runtime::identity::TokenFileVerifier;
use knockout_runtime::ws_server::WsServer;
use knockout_store::{SqliteQuestionBank, SqliteStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let filter = std::env::var("KNOCKOUT_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    match args.command {
        Command::Serve(opts) => serve(args.config.as_deref(), opts).await,
        Command::ImportQuestions(opts) => import_questions(opts),
    }
}

async fn serve(config_path: Option<&std::path::Path>, opts: cli::ServeOpts) -> anyhow::Result<()> {
    let config = knockout_runtime::config::resolve(config_path, &opts.game)?;
    tracing::info!(
        min_players = config.min_players,
        max_players = config.max_players,
        question_time_ms = config.question_time_ms,
        "knockout server starting"
    );

    let store = SqliteStore::open(&opts.db)
        .with_context(|| format!("opening session store {}", opts.db.display()))?;
    let questions = SqliteQuestionBank::open(&opts.db)
        .with_context(|| format!("opening question bank {}", opts.db.display()))?;
    let verifier = Arc::new(TokenFileVerifier::load(&opts.credentials)?);
    tracing::info!(identities = verifier.len(), "credentials loaded");

    let arena = Arena::new(config, Box::new(store), Arc::new(questions), verifier.clone());
    let recovered = arena.recover().await?;
    if !recovered.is_empty() {
        tracing::info!(sessions = recovered.len(), "recovering running sessions");
    }

    let ws = WsServer::new(opts.listen, Arc::clone(&arena), verifier)
        .with_max_connections(opts.max_connections);

    let result = tokio::select! {
        result = ws.run() => result.context("ws server failed"),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
            Ok(())
        }
    };
    arena.shutdown();
    result
}

fn import_questions(opts: cli::ImportOpts) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(&opts.file)
        .with_context(|| format!("reading {}", opts.file.display()))?;
    let bank = SqliteQuestionBank::open(&opts.db)
        .with_context(|| format!("opening question bank {}", opts.db.display()))?;
    let count = bank.import_json(&text)?;
    println!("imported {count} questions into {}", opts.db.display());
    Ok(())
}
