use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "vesti", about = "News aggregation pipeline", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check configuration and exit.
    Validate,
    /// Apply pending database migrations and exit.
    Migrate,
    /// Run one processing cycle and exit.
    RunCycle {
        /// Skip digest generation and emission (ingest + AI only).
        #[arg(long)]
        no_emit: bool,
    },
}
