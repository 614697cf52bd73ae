use clap::Subcommand;

pub mod completions;
pub mod simulate;
pub mod usage;

pub use completions::completions;
pub use simulate::simulate;
pub use usage::usage;

#[derive(clap::Parser, Debug)]
#[command(name = "bcachefs-acct", about = "Bucket accounting & disk-space reservation core, standalone")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Subcommands,
}

#[derive(Subcommand, Debug)]
pub enum Subcommands {
    /// Build an in-memory filesystem, mark a small fixed workload, and
    /// print its usage report.
    Usage(usage::Cli),
    /// Run a scripted concurrent workload against the accounting core
    /// and check the capacity invariant holds throughout.
    Simulate(simulate::Cli),
    /// Print shell completions for this binary to stdout.
    Completions(completions::Cli),
}
