mod package;
mod simulate;
mod validate;

use crate::{Commands, config::Config};

pub async fn process(config: &Config, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Validate => validate::process(config),
        Commands::Package(args) => package::package(config, args),
        Commands::Inspect { input_path } => package::inspect(&input_path),
        Commands::Shadow {
            input_path,
            output_path,
        } => package::shadow(&input_path, output_path),
        Commands::Simulate(args) => simulate::process(config, args).await,
    }
}
