use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;

use phototags::logging::{self, LogOptions};
use phototags::{Config, FileRef, TagStore};

#[derive(Debug, PartialEq)]
enum Command {
    List,
    Show(Vec<PathBuf>),
    Add { tags: Vec<String>, paths: Vec<PathBuf> },
    Remove { tag_id: i64, path: PathBuf },
    Rename { tag_id: i64, name: String },
    Color { tag_id: i64, color: Option<String> },
    Delete(Vec<i64>),
    Merge { name: String, tag_ids: Vec<i64> },
    Purge,
    Inspect { remove_missing: bool },
    Sync(Vec<PathBuf>),
}

#[derive(Debug, PartialEq)]
struct Args {
    config_path: Option<PathBuf>,
    verbose: bool,
    command: Command,
}

#[derive(Debug, PartialEq)]
enum Invocation {
    Help,
    Version,
    Run(Args),
}

fn parse_id(value: &str) -> Result<i64> {
    value
        .parse()
        .with_context(|| format!("invalid tag id: {value}"))
}

fn parse_ids(values: &[String]) -> Result<Vec<i64>> {
    values.iter().map(|v| parse_id(v)).collect()
}

fn paths(values: &[String]) -> Vec<PathBuf> {
    values.iter().map(PathBuf::from).collect()
}

fn parse_command(name: &str, rest: &[String]) -> Result<Command> {
    let command = match (name, rest) {
        ("list", []) => Command::List,
        ("show", [_, ..]) => Command::Show(paths(rest)),
        ("add", [tags, files @ ..]) if !files.is_empty() => Command::Add {
            tags: tags.split(',').map(str::to_string).collect(),
            paths: paths(files),
        },
        ("remove", [tag_id, path]) => Command::Remove {
            tag_id: parse_id(tag_id)?,
            path: PathBuf::from(path),
        },
        ("rename", [tag_id, name]) => Command::Rename {
            tag_id: parse_id(tag_id)?,
            name: name.clone(),
        },
        ("color", [tag_id]) => Command::Color {
            tag_id: parse_id(tag_id)?,
            color: None,
        },
        ("color", [tag_id, color]) => Command::Color {
            tag_id: parse_id(tag_id)?,
            color: Some(color.clone()),
        },
        ("delete", [_, ..]) => Command::Delete(parse_ids(rest)?),
        ("merge", [name, ids @ ..]) => Command::Merge {
            name: name.clone(),
            tag_ids: parse_ids(ids)?,
        },
        ("purge", []) => Command::Purge,
        ("inspect", []) => Command::Inspect { remove_missing: false },
        ("inspect", [flag]) if flag == "--remove-missing" => Command::Inspect { remove_missing: true },
        ("sync", [_, ..]) => Command::Sync(paths(rest)),
        ("list" | "show" | "add" | "remove" | "rename" | "color" | "delete" | "merge" | "purge"
        | "inspect" | "sync", _) => bail!("wrong arguments for '{name}', see --help"),
        _ => bail!("unknown command: {name}"),
    };
    Ok(command)
}

fn parse_args(args: &[String]) -> Result<Invocation> {
    let mut config_path = None;
    let mut verbose = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => return Ok(Invocation::Help),
            "--version" | "-V" => return Ok(Invocation::Version),
            "--verbose" | "-v" => verbose = true,
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    bail!("--config requires a path argument");
                }
            }
            flag if flag.starts_with('-') => bail!("unknown argument: {flag}"),
            name => {
                let command = parse_command(name, &args[i + 1..])?;
                return Ok(Invocation::Run(Args {
                    config_path,
                    verbose,
                    command,
                }));
            }
        }
        i += 1;
    }

    bail!("no command given, see --help")
}

fn print_help() {
    println!(
        r#"phototags - tag storage for image collections

USAGE:
    phototags [OPTIONS] <COMMAND>

COMMANDS:
    list                        All tags with usage counts
    show PATH...                Tags of each file
    add TAGS PATH...            Attach comma-separated TAGS to files
    remove TAG_ID PATH          Detach a tag from a file
    rename TAG_ID NAME          Rename a tag
    color TAG_ID [HEX]          Set a tag's color, or clear it
    delete TAG_ID...            Delete tags
    merge NAME TAG_ID...        Fold tags into the tag called NAME
    purge                       Delete tags no file uses
    inspect [--remove-missing]  Check files still exist, following moves
    sync PATH...                Refresh the stored location of moved files

OPTIONS:
    --config, -c PATH   Path to config file
    --verbose, -v       Log to stderr
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    PHOTOTAGS_CONFIG    Path to config file (overrides default location)
    PHOTOTAGS_LOG       Log filter (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/phototags/config.toml"#
    );
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn file_refs(paths: &[PathBuf]) -> Vec<FileRef> {
    paths.iter().map(|path| FileRef::new(path)).collect()
}

fn run(store: &TagStore, command: Command) -> Result<()> {
    match command {
        Command::List => print_json(&store.list_tags()?),
        Command::Show(paths) => {
            let found: BTreeMap<_, _> = store.tags_for_images(&paths)?.into_iter().collect();
            print_json(&found)
        }
        Command::Add { tags, paths } => print_json(&store.assign_tags(&file_refs(&paths), &tags)?),
        Command::Remove { tag_id, path } => {
            print_json(&store.remove_tag(&FileRef::new(path), tag_id)?)
        }
        Command::Rename { tag_id, name } => print_json(&store.rename_tag(tag_id, &name)?),
        Command::Color { tag_id, color } => {
            let updated = store.set_tag_color(tag_id, color.as_deref())?;
            print_json(&json!({ "updated": updated }))
        }
        Command::Delete(tag_ids) => {
            print_json(&json!({ "deleted": store.delete_tags(&tag_ids)? }))
        }
        Command::Merge { name, tag_ids } => print_json(&store.merge_tags(&tag_ids, &name)?),
        Command::Purge => print_json(&json!({ "purged": store.purge_unused_tags()? })),
        Command::Inspect { remove_missing } => print_json(&store.inspect_images(remove_missing)?),
        Command::Sync(paths) => {
            print_json(&json!({ "relocated": store.reconcile(&file_refs(&paths))? }))
        }
    }
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&args) {
        Ok(Invocation::Help) => {
            print_help();
            return Ok(());
        }
        Ok(Invocation::Version) => {
            println!("phototags {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Ok(Invocation::Run(args)) => args,
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(2);
        }
    };

    // Keep the guard alive so file logs are flushed on exit.
    let _log_guard = logging::init(LogOptions {
        log_dir: None,
        stderr: args.verbose,
    })?;

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let store = TagStore::from_config(&config);
    let result = run(&store, args.command);
    store.connection().close()?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Invocation> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        parse_args(&args)
    }

    fn command(args: &[&str]) -> Command {
        match parse(args).unwrap() {
            Invocation::Run(args) => args.command,
            other => panic!("expected a command, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_options() {
        assert_eq!(parse(&["--help", "list"]).unwrap(), Invocation::Help);
        assert_eq!(parse(&["-V"]).unwrap(), Invocation::Version);

        let Invocation::Run(args) = parse(&["-c", "/tmp/c.toml", "-v", "purge"]).unwrap() else {
            panic!("expected a command");
        };
        assert_eq!(args.config_path, Some(PathBuf::from("/tmp/c.toml")));
        assert!(args.verbose);
        assert_eq!(args.command, Command::Purge);
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            command(&["add", "work,travel", "a.jpg", "b.jpg"]),
            Command::Add {
                tags: vec!["work".into(), "travel".into()],
                paths: vec!["a.jpg".into(), "b.jpg".into()],
            }
        );
        assert_eq!(
            command(&["color", "3"]),
            Command::Color { tag_id: 3, color: None }
        );
        assert_eq!(
            command(&["merge", "Pets", "1", "2"]),
            Command::Merge {
                name: "Pets".into(),
                tag_ids: vec![1, 2],
            }
        );
        assert_eq!(
            command(&["inspect", "--remove-missing"]),
            Command::Inspect { remove_missing: true }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["--config"]).is_err());
        assert!(parse(&["frobnicate"]).is_err());
        assert!(parse(&["add", "work"]).is_err());
        assert!(parse(&["delete", "x"]).is_err());
        assert!(parse(&["list", "extra"]).is_err());
    }
}
