use clap::{CommandFactory, Parser};
use clap_complete::Shell;

#[derive(Parser, Debug)]
#[command(about = "Print shell completions for bcachefs-acct")]
pub struct Cli {
    /// Target shell
    shell: Shell,
}

pub fn completions(cli: Cli) {
    let mut cmd = super::Cli::command();
    let name = cmd.get_name().to_string();
    clap_complete::generate(cli.shell, &mut cmd, name, &mut std::io::stdout());
}
