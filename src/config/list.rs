use anyhow::Result;
use serde_json::{Map, Value};

use crate::args::BaseArgs;

type Fields = Vec<(&'static str, String)>;

pub fn run(base: BaseArgs, global: bool, local: bool, verbose: bool) -> Result<()> {
    if verbose {
        run_verbose(base, global, local)
    } else {
        run_resolved(base, global, local)
    }
}

fn run_resolved(base: BaseArgs, global: bool, local: bool) -> Result<()> {
    let config = if global {
        super::load_global()?
    } else if local {
        super::local_path()
            .map(|p| super::load_file(&p))
            .unwrap_or_default()
    } else {
        super::load()?
    };

    let output = format_resolved(&config.non_empty_fields(), base.json)?;
    if !output.is_empty() {
        if base.json {
            // stdout so it can be piped
            println!("{output}");
        } else {
            eprintln!("{output}");
        }
    }

    Ok(())
}

fn to_json_object(fields: &Fields) -> Map<String, Value> {
    fields
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.clone())))
        .collect()
}

fn format_resolved(fields: &Fields, json: bool) -> Result<String> {
    if json {
        Ok(serde_json::to_string(&to_json_object(fields))?)
    } else {
        Ok(fields
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

fn run_verbose(base: BaseArgs, global: bool, local: bool) -> Result<()> {
    let mut sources: Vec<(String, Fields)> = Vec::new();

    if !local {
        if let Ok(path) = super::global_path() {
            sources.push((path.display().to_string(), super::load_file(&path).non_empty_fields()));
        }
    }

    if !global {
        if let Some(path) = super::local_path() {
            let display_path = std::env::current_dir()
                .ok()
                .and_then(|cwd| path.strip_prefix(&cwd).ok().map(|p| p.to_path_buf()))
                .unwrap_or_else(|| path.clone())
                .display()
                .to_string();
            sources.push((display_path, super::load_file(&path).non_empty_fields()));
        }
    }

    sources.retain(|(_, fields)| !fields.is_empty());

    let output = format_verbose(&sources, base.json)?;
    if !output.is_empty() {
        println!("{output}");
    }

    Ok(())
}

fn format_verbose(sources: &[(String, Fields)], json: bool) -> Result<String> {
    if json {
        let map: Map<String, Value> = sources
            .iter()
            .map(|(path, fields)| (path.clone(), Value::Object(to_json_object(fields))))
            .collect();
        Ok(serde_json::to_string(&map)?)
    } else {
        let parts: Vec<String> = sources
            .iter()
            .map(|(path, fields)| {
                let mut group = path.clone();
                for (key, value) in fields {
                    group.push_str(&format!("\n  {key}: {value}"));
                }
                group
            })
            .collect();
        Ok(parts.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn config_with(project: &str, size: i64) -> Config {
        Config {
            project: Some(project.into()),
            max_artifact_size: Some(size),
            ..Default::default()
        }
    }

    #[test]
    fn resolved_text_shows_merged() {
        let fields = config_with("team/sandbox", 20).non_empty_fields();
        let out = format_resolved(&fields, false).unwrap();
        assert_eq!(out, "project: team/sandbox\nmax_artifact_size: 20");
    }

    #[test]
    fn resolved_text_empty_config() {
        let out = format_resolved(&Config::default().non_empty_fields(), false).unwrap();
        assert_eq!(out, "");
    }

    #[test]
    fn resolved_json_flat_object() {
        let fields = config_with("team/sandbox", 20).non_empty_fields();
        let out = format_resolved(&fields, true).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["project"], "team/sandbox");
        assert_eq!(parsed["max_artifact_size"], "20");
    }

    #[test]
    fn verbose_text_two_sources() {
        let sources: Vec<(String, Fields)> = vec![
            (
                "~/.config/neptune-mlflow/config.json".into(),
                vec![("project", "team/global".to_string())],
            ),
            (
                ".neptune-mlflow/config.json".into(),
                vec![("exclude_artifacts", "true".to_string())],
            ),
        ];
        let out = format_verbose(&sources, false).unwrap();
        assert_eq!(
            out,
            "~/.config/neptune-mlflow/config.json\n  project: team/global\n\n.neptune-mlflow/config.json\n  exclude_artifacts: true"
        );
    }

    #[test]
    fn verbose_json_nested_by_path() {
        let sources: Vec<(String, Fields)> = vec![(
            ".neptune-mlflow/config.json".into(),
            vec![("project", "team/local".to_string())],
        )];
        let out = format_verbose(&sources, true).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed[".neptune-mlflow/config.json"]["project"], "team/local");
    }

    #[test]
    fn verbose_json_empty() {
        assert_eq!(format_verbose(&[], true).unwrap(), "{}");
    }
}
