use std::path::PathBuf;
use clap::{Parser, Subcommand};

/// Serverless worker for Wan2.2 speech-to-video generation
#[derive(Parser)]
#[command(name = "s2v-worker")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Clone)]
pub enum Commands {
    /// Pull jobs from the serverless platform (default)
    Worker,

    /// Serve the handler over a local HTTP API
    Serve {
        /// Port to listen on (defaults to PORT)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run a single job from a JSON file and print the response
    Run {
        /// Path to a job payload such as test_input.json
        #[arg(long, short)]
        input: PathBuf,
    },
}
