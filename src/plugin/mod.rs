//! Tracking-plugin surface: the `neptune://` URI and the live relay.

use anyhow::Result;
use clap::{Args, Subcommand};
use serde_json::Value;

use crate::args::BaseArgs;
use crate::neptune::RunMode;
use crate::ui::{print_command_status, CommandStatus};

pub mod relay;
pub mod uri;

use uri::{decode_config, encode_config, strip_ignored_keys, NeptuneRunConfig};

#[derive(Debug, Clone, Args)]
pub struct UriArgs {
    #[command(subcommand)]
    command: UriCommands,
}

#[derive(Debug, Clone, Subcommand)]
enum UriCommands {
    /// Build a neptune:// tracking URI from run options
    Encode(EncodeArgs),
    /// Print the run options carried by a neptune:// URI
    Decode {
        /// The URI to decode
        uri: String,
    },
}

#[derive(Debug, Clone, Args)]
struct EncodeArgs {
    /// Connection mode of the Neptune runs
    #[arg(long, value_parser = parse_mode)]
    mode: Option<RunMode>,
    /// Name given to each Neptune run
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    description: Option<String>,
    /// Tag added to each Neptune run (repeatable)
    #[arg(long = "tag", value_name = "TAG")]
    tags: Vec<String>,
    #[arg(long)]
    capture_stdout: Option<bool>,
    #[arg(long)]
    capture_stderr: Option<bool>,
    #[arg(long)]
    capture_hardware_metrics: Option<bool>,
    #[arg(long)]
    capture_traceback: Option<bool>,
    #[arg(long)]
    monitoring_namespace: Option<String>,
    /// Seconds between flushes of relayed data
    #[arg(long)]
    flush_period: Option<f64>,
    /// Embed the API token in the URI
    #[arg(long)]
    include_api_token: bool,
}

fn parse_mode(value: &str) -> Result<RunMode, String> {
    serde_json::from_value(Value::String(value.to_string()))
        .map_err(|_| format!("unknown mode '{value}' (async, sync, offline, debug, read-only)"))
}

impl EncodeArgs {
    fn into_config(self, base: &BaseArgs) -> NeptuneRunConfig {
        NeptuneRunConfig {
            api_token: base.api_token.clone().filter(|_| self.include_api_token),
            project: base.project.clone(),
            mode: self.mode,
            name: self.name,
            description: self.description,
            tags: (!self.tags.is_empty()).then_some(self.tags),
            capture_stdout: self.capture_stdout,
            capture_stderr: self.capture_stderr,
            capture_hardware_metrics: self.capture_hardware_metrics,
            monitoring_namespace: self.monitoring_namespace,
            flush_period: self.flush_period,
            capture_traceback: self.capture_traceback,
        }
    }
}

pub fn run(base: BaseArgs, args: UriArgs) -> Result<()> {
    match args.command {
        UriCommands::Encode(encode) => {
            let config = encode.into_config(&base);
            let uri = encode_config(&config)?;
            if base.json {
                println!("{}", serde_json::json!({ "uri": uri }));
            } else {
                println!("{uri}");
            }
        }
        UriCommands::Decode { uri } => {
            let mut config = decode_config(&uri)?;
            for key in strip_ignored_keys(&mut config) {
                if !base.json {
                    print_command_status(CommandStatus::Warning, &format!("'{key}' is ignored by the relay"));
                }
            }
            // Reject options the relay would refuse before printing them back.
            let _: NeptuneRunConfig = serde_json::from_value(Value::Object(config.clone()))?;
            if base.json {
                println!("{}", serde_json::to_string(&config)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[command(flatten)]
        base: BaseArgs,
        #[command(flatten)]
        args: UriArgs,
    }

    fn encode(argv: &[&str]) -> NeptuneRunConfig {
        let cli = TestCli::try_parse_from(["uri", "encode"].into_iter().chain(argv.iter().copied())).unwrap();
        match cli.args.command {
            UriCommands::Encode(encode) => encode.into_config(&cli.base),
            UriCommands::Decode { .. } => panic!("expected encode"),
        }
    }

    #[test]
    fn token_stays_out_unless_asked() {
        let config = encode(&["-a", "secret", "-p", "team/sandbox", "--mode", "debug"]);
        assert_eq!(config.api_token, None);
        assert_eq!(config.project.as_deref(), Some("team/sandbox"));
        assert_eq!(config.mode, Some(RunMode::Debug));

        let config = encode(&["-a", "secret", "--include-api-token"]);
        assert_eq!(config.api_token.as_deref(), Some("secret"));
    }

    #[test]
    fn repeated_tags_are_collected() {
        let config = encode(&["--tag", "a", "--tag", "b", "--flush-period", "2"]);
        assert_eq!(config.tags, Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(config.flush_period, Some(2.0));
        assert_eq!(encode(&[]).tags, None);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(TestCli::try_parse_from(["uri", "encode", "--mode", "turbo"]).is_err());
    }
}
