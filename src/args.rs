use std::path::PathBuf;

use clap::Args;

#[derive(Debug, Clone, Args)]
pub struct BaseArgs {
    /// Output as JSON lines
    #[arg(short = 'j', long, global = true)]
    pub json: bool,

    /// Neptune project, as workspace/project (or via NEPTUNE_PROJECT)
    #[arg(
        short = 'p',
        long,
        env = "NEPTUNE_PROJECT",
        hide_env_values = true,
        global = true
    )]
    pub project: Option<String>,

    /// Neptune API token (or via NEPTUNE_API_TOKEN)
    #[arg(
        short = 'a',
        long,
        env = "NEPTUNE_API_TOKEN",
        hide_env_values = true,
        global = true
    )]
    pub api_token: Option<String>,

    /// MLflow tracking server URI (or via MLFLOW_TRACKING_URI)
    #[arg(
        short = 'u',
        long,
        env = "MLFLOW_TRACKING_URI",
        hide_env_values = true,
        global = true
    )]
    pub mlflow_tracking_uri: Option<String>,

    /// Path to a .env file to load before running commands.
    #[arg(long, env = "NEPTUNE_MLFLOW_ENV_FILE", hide_env_values = true)]
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct CLIArgs<T: Args> {
    #[command(flatten)]
    pub base: BaseArgs,

    #[command(flatten)]
    pub args: T,
}
