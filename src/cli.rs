use clap::Parser;

#[derive(Parser)]
#[command(name = "tourmaline", about = "Tourmaline, a UCI chess engine.")]
pub struct Cli {
    #[command(subcommand)]
    pub subcommand: Option<Subcommands>,
}

#[derive(clap::Subcommand)]
pub enum Subcommands {
    /// Count the legal move tree of a position.
    Perft {
        /// Depth to count to.
        depth: i32,
        /// Position to count from; the starting position if omitted.
        #[arg(long)]
        fen: Option<String>,
    },
    /// Run the fixed-depth benchmark suite.
    Bench {
        /// Depth to search each bench position to.
        #[arg(default_value_t = 10)]
        depth: i32,
    },
}
