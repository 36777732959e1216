//! CLI definition using clap derive.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::GameOverrides;
use crate::ws_server::DEFAULT_MAX_CONNECTIONS;

#[derive(Parser)]
#[command(name = "knockout", about = "real-time elimination trivia server")]
pub struct Cli {
    /// Game config file (TOML)
    #[arg(long, short = 'c', global = true, env = "KNOCKOUT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the game server (WebSocket + session actors)
    Serve(ServeOpts),
    /// Bulk-load questions from a JSON file into the question bank
    ImportQuestions(ImportOpts),
}

#[derive(clap::Args)]
pub struct ServeOpts {
    /// Address to listen on
    #[arg(long, env = "KNOCKOUT_LISTEN", default_value = "127.0.0.1:4000")]
    pub listen: SocketAddr,

    /// SQLite database holding sessions and questions
    #[arg(long, env = "KNOCKOUT_DB", default_value = "knockout.db")]
    pub db: PathBuf,

    /// Credentials file mapping tokens to identities
    #[arg(long, env = "KNOCKOUT_CREDENTIALS")]
    pub credentials: PathBuf,

    /// Maximum concurrent WebSocket connections
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    #[command(flatten)]
    pub game: GameOverrides,
}

#[derive(clap::Args)]
pub struct ImportOpts {
    /// JSON array of questions
    pub file: PathBuf,

    /// SQLite database holding the question bank
    #[arg(long, env = "KNOCKOUT_DB", default_value = "knockout.db")]
    pub db: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_with_overrides() {
        let cli = Cli::try_parse_from([
            "knockout",
            "serve",
            "--credentials",
            "creds.json",
            "--listen",
            "0.0.0.0:9000",
            "--min-players",
            "3",
        ])
        .unwrap();
        let Command::Serve(opts) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(opts.listen.port(), 9000);
        assert_eq!(opts.game.min_players, Some(3));
        assert_eq!(opts.max_connections, DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn import_takes_a_file() {
        let cli = Cli::try_parse_from(["knockout", "import-questions", "qs.json", "--db", "x.db"]).unwrap();
        let Command::ImportQuestions(opts) = cli.command else {
            panic!("expected import-questions");
        };
        assert_eq!(opts.file, PathBuf::from("qs.json"));
        assert_eq!(opts.db, PathBuf::from("x.db"));
    }
}
