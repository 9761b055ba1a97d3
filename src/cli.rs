use crate::engine::{Engine, EnginePaths, RunOptions, RunStatus};
use crate::error::{CatalystError, ErrorCode};
use crate::logging::{LogLevel, Logger};
use serde_json::{Map, Value};
use std::io::IsTerminal;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub struct RunCommand {
    pub playbook_id: String,
    pub inputs: Map<String, Value>,
    pub level: LogLevel,
    pub json: bool,
    pub autonomous: bool,
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CliCommand {
    Run(RunCommand),
    Help,
}

pub fn usage() -> &'static str {
    "catalyst run <playbook-id> [--input key=value]... [-q] [-v|-vv|-vvv|-vvvv] [--debug] [--json] [--autonomous] [--root DIR]"
}

pub fn parse_args(args: &[String]) -> Result<CliCommand, CatalystError> {
    let mut iter = args.iter();
    let Some(command) = iter.next() else {
        return Err(usage_error("no command given"));
    };
    match command.as_str() {
        "help" | "--help" | "-h" => return Ok(CliCommand::Help),
        "run" => {}
        other => {
            return Err(usage_error(&format!("unknown command `{other}`")));
        }
    }

    let mut playbook_id: Option<String> = None;
    let mut inputs = Map::new();
    let mut level = LogLevel::Warning;
    let mut json = false;
    let mut autonomous = false;
    let mut root: Option<PathBuf> = None;

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--input" => {
                let Some(pair) = iter.next() else {
                    return Err(usage_error("--input requires a key=value argument"));
                };
                let Some((key, value)) = pair.split_once('=') else {
                    return Err(usage_error(&format!(
                        "--input `{pair}` must use key=value form"
                    )));
                };
                // Repeated keys overwrite earlier values: last one wins.
                inputs.insert(key.to_string(), Value::String(value.to_string()));
            }
            "-q" | "--quiet" => level = LogLevel::Error,
            "-v" => level = LogLevel::Info,
            "-vv" => level = LogLevel::Verbose,
            "-vvv" => level = LogLevel::Debug,
            "-vvvv" => level = LogLevel::Trace,
            "--debug" => level = LogLevel::Debug,
            "--json" => json = true,
            "--autonomous" => autonomous = true,
            "--root" => {
                let Some(dir) = iter.next() else {
                    return Err(usage_error("--root requires a directory argument"));
                };
                root = Some(PathBuf::from(dir));
            }
            flag if flag.starts_with('-') => {
                return Err(usage_error(&format!("unknown flag `{flag}`")));
            }
            positional => {
                if playbook_id.is_some() {
                    return Err(usage_error(&format!(
                        "unexpected extra argument `{positional}`"
                    )));
                }
                playbook_id = Some(positional.to_string());
            }
        }
    }

    let Some(playbook_id) = playbook_id else {
        return Err(CatalystError::new(
            ErrorCode::MissingPlaybookId,
            "`run` requires a playbook id",
        )
        .with_guidance(usage()));
    };
    Ok(CliCommand::Run(RunCommand {
        playbook_id,
        inputs,
        level,
        json,
        autonomous,
        root,
    }))
}

pub fn exit_code_for(error: &CatalystError) -> i32 {
    match error.code {
        ErrorCode::InvalidInput | ErrorCode::MissingPlaybookId => 2,
        _ => 1,
    }
}

pub fn run_cli(args: Vec<String>) -> i32 {
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(err) => {
            eprintln!("{err}");
            eprintln!("usage: {}", usage());
            return exit_code_for(&err);
        }
    };
    let command = match command {
        CliCommand::Help => {
            println!("usage: {}", usage());
            return 0;
        }
        CliCommand::Run(command) => command,
    };

    let paths = EnginePaths::under(command.root.clone().unwrap_or_else(|| PathBuf::from(".")));
    let engine = Engine::new(paths, Logger::stderr(command.level));
    let playbook = match engine.registry().load_playbook(&command.playbook_id) {
        Ok(playbook) => playbook,
        Err(err) => {
            eprintln!("{err}");
            return exit_code_for(&err);
        }
    };

    let options = RunOptions {
        actor: "cli".to_string(),
        autonomous: command.autonomous,
        ..RunOptions::default()
    };
    let result = engine.run(&playbook, command.inputs, &options);

    if command.json {
        match serde_json::to_string_pretty(&result) {
            Ok(rendered) => println!("{rendered}"),
            Err(err) => eprintln!("could not render result: {err}"),
        }
    } else {
        print_human_result(&result);
    }

    match result.status {
        RunStatus::Completed | RunStatus::Paused => 0,
        _ => result.error.as_ref().map(exit_code_for).unwrap_or(1),
    }
}

fn print_human_result(result: &crate::engine::ExecutionResult) {
    let color = use_color();
    let status = match result.status {
        RunStatus::Completed => paint(color, "32", "completed"),
        RunStatus::Paused => paint(color, "33", "paused"),
        _ => paint(color, "31", "failed"),
    };
    println!(
        "run {} {} in {}ms ({} steps)",
        result.run_id, status, result.duration_ms, result.steps_executed
    );
    if !result.outputs.is_empty() {
        for (key, value) in &result.outputs {
            println!("  {key} = {value}");
        }
    }
    if let Some(error) = &result.error {
        println!("  error: {error}");
        if !error.guidance.is_empty() {
            println!("  guidance: {}", error.guidance);
        }
    }
}

fn use_color() -> bool {
    std::env::var_os("NO_COLOR").is_none() && std::io::stdout().is_terminal()
}

fn paint(enabled: bool, code: &str, text: &str) -> String {
    if enabled {
        format!("\x1b[{code}m{text}\x1b[0m")
    } else {
        text.to_string()
    }
}


fn usage_error(message: &str) -> CatalystError {
    CatalystError::new(ErrorCode::InvalidInput, message).with_guidance(usage())
}
