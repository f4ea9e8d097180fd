use clap::{Parser, Subcommand};

mod commands;
mod util;

#[derive(Parser)]
#[command(
    name = "essaylab",
    version,
    about = "Essaylab CLI — leveled essay feedback and question flags"
)]
struct Cli {
    /// API base URL
    #[arg(long, env = "ESSAYLAB_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    /// Platform user id sent as the x-user-id header
    #[arg(long, env = "ESSAYLAB_USER_ID")]
    user_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check API health
    Health,
    /// Question flag operations
    Flag {
        #[command(subcommand)]
        command: FlagCommands,
    },
    /// Essay session operations
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Request AI feedback for an essay draft
    Feedback {
        /// Session id
        #[arg(long)]
        session: String,
        /// Essay file path, or '-' for stdin
        #[arg(long)]
        essay: String,
        /// Feedback level (1-based)
        #[arg(long, default_value_t = 1)]
        level: i32,
        /// Skip the cache and always call the provider
        #[arg(long)]
        force_refresh: bool,
    },
    /// Run a flag reconciliation pass now
    Reconcile,
}

#[derive(Subcommand)]
enum FlagCommands {
    /// Set or change a flag on a question
    Set {
        #[arg(long)]
        question_id: i64,
        /// Flag color: blue or red
        #[arg(long)]
        color: String,
        /// Also flag every sibling version of the same bank entry
        #[arg(long, default_value_t = true)]
        all_versions: bool,
    },
    /// Remove a flag from a question
    Unset {
        #[arg(long)]
        question_id: i64,
        /// Also unflag every sibling version of the same bank entry
        #[arg(long, default_value_t = true)]
        all_versions: bool,
    },
    /// List your flags
    List,
}

#[derive(Subcommand)]
enum SessionCommands {
    /// Create a session for a quiz attempt
    Create {
        #[arg(long)]
        attempt_id: i64,
        #[arg(long)]
        quiz_id: i64,
        /// Number of feedback levels (default 3)
        #[arg(long)]
        levels_total: Option<i32>,
        /// Score needed to pass a level (default 80)
        #[arg(long)]
        pass_threshold: Option<f64>,
        /// Scored attempts allowed per level (default 3)
        #[arg(long)]
        max_attempts: Option<i32>,
        /// Advance with a warning when attempts run out
        #[arg(long)]
        advance_on_exhaustion: Option<bool>,
    },
    /// Show a session
    Show {
        #[arg(long)]
        session: String,
    },
    /// Show per-level progress for a session
    Progress {
        #[arg(long)]
        session: String,
    },
}

fn require_user_id(user_id: Option<String>) -> String {
    user_id.unwrap_or_else(|| {
        util::exit_error(
            "user_id is required for this operation",
            Some("Set --user-id or the ESSAYLAB_USER_ID env var"),
        )
    })
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let exit_code = match cli.command {
        Commands::Health => commands::health::run(&cli.api_url).await,
        Commands::Flag { command } => {
            let user_id = require_user_id(cli.user_id);
            match command {
                FlagCommands::Set {
                    question_id,
                    color,
                    all_versions,
                } => {
                    commands::flag::set(&cli.api_url, &user_id, question_id, &color, all_versions)
                        .await
                }
                FlagCommands::Unset {
                    question_id,
                    all_versions,
                } => commands::flag::unset(&cli.api_url, &user_id, question_id, all_versions).await,
                FlagCommands::List => commands::flag::list(&cli.api_url, &user_id).await,
            }
        }
        Commands::Session { command } => {
            let user_id = require_user_id(cli.user_id);
            match command {
                SessionCommands::Create {
                    attempt_id,
                    quiz_id,
                    levels_total,
                    pass_threshold,
                    max_attempts,
                    advance_on_exhaustion,
                } => {
                    commands::session::create(
                        &cli.api_url,
                        &user_id,
                        attempt_id,
                        quiz_id,
                        levels_total,
                        pass_threshold,
                        max_attempts,
                        advance_on_exhaustion,
                    )
                    .await
                }
                SessionCommands::Show { session } => {
                    commands::session::show(&cli.api_url, &user_id, &session).await
                }
                SessionCommands::Progress { session } => {
                    commands::session::progress(&cli.api_url, &user_id, &session).await
                }
            }
        }
        Commands::Feedback {
            session,
            essay,
            level,
            force_refresh,
        } => {
            let user_id = require_user_id(cli.user_id);
            commands::feedback::request(
                &cli.api_url,
                &user_id,
                &session,
                &essay,
                level,
                force_refresh,
            )
            .await
        }
        Commands::Reconcile => commands::admin::reconcile(&cli.api_url).await,
    };

    std::process::exit(exit_code);
}
