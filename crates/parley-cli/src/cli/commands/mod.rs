use super::args::*;

pub(crate) mod backends;
pub(crate) mod run;

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.cmd {
        Command::Run(args) => run::run(args).await,
        Command::Backends => Ok(backends::run()),
    }
}
