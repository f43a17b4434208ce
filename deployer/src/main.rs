//! Template deployer CLI.
//!
//! Resolves applications from a document root (`applications/`, `templates/`,
//! `frameworks/`, `addons/`, `scripts/`) and runs their commands on a Proxmox
//! host, printing one JSON progress event per command.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use deployer::core::application::instantiate_framework;
use deployer::core::types::{Scalar, TaskType, Values};
use deployer::deploy::{self, DeployRequest, JsonLinesSink, Plan, Prepared};
use deployer::engine::RunStatus;
use deployer::exit_codes;
use deployer::io::checkpoint::load_checkpoint;
use deployer::io::config::{DeployerConfig, load_config, write_config};
use deployer::io::documents::FsDocuments;
use deployer::io::remote::{SshRunner, Target, inspect};
use deployer::logging;
use serde::Serialize;
use tracing::warn;

#[derive(Parser)]
#[command(
    name = "deployer",
    version,
    about = "Resolve and run application templates on Proxmox hosts"
)]
struct Cli {
    /// Document root.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    /// Config file. Defaults to `<root>/deployer.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct RequestArgs {
    /// Application id.
    application: String,
    #[arg(long, default_value = "installation")]
    task: TaskType,
    /// Parameter value as `id=value`. Repeatable.
    #[arg(long = "input", value_parser = parse_input)]
    inputs: Vec<(String, String)>,
    /// Addon id to include. Repeatable.
    #[arg(long = "addon")]
    addons: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the resolved parameters and command list as JSON.
    Plan(RequestArgs),
    /// List parameters with their values and sources.
    Parameters(RequestArgs),
    /// Execute the command list.
    Run {
        #[command(flatten)]
        request: RequestArgs,
        /// Continue after the last successful command of the checkpoint.
        #[arg(long)]
        resume: bool,
        /// Checkpoint file. Defaults to `<root>/state/<app>.<task>.checkpoint.json`.
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },
    /// Run a shell snippet on the host, or in a container with `--vm-id`.
    Inspect {
        #[arg(long)]
        vm_id: Option<u64>,
        script: String,
    },
    /// Create an application from a framework.
    Instantiate {
        framework: String,
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long = "input", value_parser = parse_input)]
        inputs: Vec<(String, String)>,
        /// Overwrite an existing application.
        #[arg(long)]
        force: bool,
    },
    /// Write a config file with every default spelled out.
    Init {
        /// Overwrite an existing config file.
        #[arg(long)]
        force: bool,
    },
}

fn parse_input(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected id=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter id in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn to_values(pairs: &[(String, String)]) -> Values {
    pairs
        .iter()
        .map(|(key, value)| (key.clone(), Scalar::text(value.as_str())))
        .collect()
}

impl RequestArgs {
    fn to_request(&self) -> DeployRequest {
        DeployRequest {
            application: self.application.clone(),
            task: self.task,
            addons: self.addons.clone(),
            inputs: to_values(&self.inputs),
        }
    }
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.root.join("deployer.toml"));
    let load = || load_config(&config_path).context("load config");
    let documents = FsDocuments::new(&cli.root);

    match cli.command {
        Command::Plan(args) => cmd_plan(&documents, &args),
        Command::Parameters(args) => cmd_parameters(&documents, &args),
        Command::Run {
            request,
            resume,
            checkpoint,
        } => {
            let checkpoint = checkpoint.unwrap_or_else(|| {
                deploy::checkpoint_path(&cli.root, &request.application, request.task)
            });
            cmd_run(&documents, &load()?, &request, resume, &checkpoint)
        }
        Command::Inspect { vm_id, script } => cmd_inspect(&load()?, vm_id, &script),
        Command::Instantiate {
            framework,
            id,
            name,
            inputs,
            force,
        } => cmd_instantiate(&documents, &framework, &id, name.as_deref(), &inputs, force),
        Command::Init { force } => cmd_init(&config_path, force),
    }
}

/// `None` when the task does not apply; the caller exits with OK.
fn prepare_plan(
    documents: &FsDocuments,
    args: &RequestArgs,
    prior: &Values,
) -> Result<Option<Plan>> {
    match deploy::prepare(documents, &args.to_request(), prior)? {
        Prepared::Ready(plan) => Ok(Some(plan)),
        Prepared::NotApplicable(metadata) => {
            eprintln!(
                "task '{}' is not applicable to application '{}'",
                args.task, metadata.id
            );
            Ok(None)
        }
    }
}

fn cmd_plan(documents: &FsDocuments, args: &RequestArgs) -> Result<i32> {
    let Some(plan) = prepare_plan(documents, args, &Values::new())? else {
        return Ok(exit_codes::OK);
    };
    print_json(&plan.application)?;
    Ok(exit_codes::OK)
}

fn cmd_parameters(documents: &FsDocuments, args: &RequestArgs) -> Result<i32> {
    let Some(plan) = prepare_plan(documents, args, &Values::new())? else {
        return Ok(exit_codes::OK);
    };
    print_json(&plan.parameter_report())?;
    if plan.missing_required().is_empty() {
        Ok(exit_codes::OK)
    } else {
        Ok(exit_codes::UNRESOLVED)
    }
}

fn cmd_run(
    documents: &FsDocuments,
    config: &DeployerConfig,
    args: &RequestArgs,
    resume: bool,
    checkpoint_path: &Path,
) -> Result<i32> {
    let checkpoint = if resume {
        let Some(checkpoint) = load_checkpoint(checkpoint_path)? else {
            bail!("no checkpoint to resume at {}", checkpoint_path.display());
        };
        Some(checkpoint)
    } else {
        None
    };
    let prior = checkpoint
        .as_ref()
        .map(|c| deployer::core::context::unflatten(&c.outputs))
        .unwrap_or_default();

    let Some(plan) = prepare_plan(documents, args, &prior)? else {
        return Ok(exit_codes::OK);
    };

    if checkpoint.is_none() {
        let missing = plan.missing_required();
        if !missing.is_empty() {
            let ids: Vec<&str> = missing.iter().map(|p| p.id.as_str()).collect();
            eprintln!("missing required parameters: {}", ids.join(", "));
            return Ok(exit_codes::UNRESOLVED);
        }
        let open: Vec<&str> = plan
            .unresolved()
            .into_iter()
            .map(|p| p.id.as_str())
            .collect();
        if !open.is_empty() {
            warn!(parameters = %open.join(", "), "running with defaulted parameters");
        }
    }

    let runner = SshRunner::new(config.clone())?;
    let stdout = std::io::stdout();
    let mut sink = JsonLinesSink::new(stdout.lock(), checkpoint_path.to_path_buf());
    let report = deploy::execute(
        documents,
        &runner,
        config,
        &plan,
        checkpoint.as_ref(),
        &mut sink,
    );
    if sink.checkpoint_failures() > 0 {
        eprintln!(
            "warning: {} checkpoint write(s) failed for {}",
            sink.checkpoint_failures(),
            checkpoint_path.display()
        );
    }

    match report.status {
        RunStatus::Completed => Ok(exit_codes::OK),
        RunStatus::Halted { index, error } => {
            eprintln!("halted at command {index}: {error}");
            Ok(exit_codes::HALTED)
        }
    }
}

fn cmd_inspect(config: &DeployerConfig, vm_id: Option<u64>, script: &str) -> Result<i32> {
    let runner = SshRunner::new(config.clone())?;
    let target = vm_id.map_or(Target::Host, |vm_id| Target::Container { vm_id });
    let output = inspect(&runner, config, target, script)?;
    print!("{}", output.stdout);
    eprint!("{}", output.stderr);
    std::io::stdout().flush().context("flush stdout")?;
    if output.timed_out {
        eprintln!(
            "inspection timed out after {}s",
            config.timeouts.inspection_secs
        );
    }
    Ok(if output.success() {
        exit_codes::OK
    } else {
        exit_codes::INVALID
    })
}

fn cmd_instantiate(
    documents: &FsDocuments,
    framework_id: &str,
    id: &str,
    name: Option<&str>,
    inputs: &[(String, String)],
    force: bool,
) -> Result<i32> {
    let path = documents.application_path(id)?;
    if path.exists() && !force {
        bail!("application '{id}' already exists at {}", path.display());
    }
    let application = instantiate_framework(
        documents,
        framework_id,
        id,
        name.unwrap_or(id),
        &to_values(inputs),
    )?;
    let written = documents.write_application(&application)?;
    println!("{}", written.display());
    Ok(exit_codes::OK)
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        bail!("config already exists at {}", config_path.display());
    }
    write_config(config_path, &DeployerConfig::default())?;
    println!("{}", config_path.display());
    Ok(exit_codes::OK)
}

/// Print `value` as pretty JSON with a trailing newline.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_inputs_and_addons() {
        let cli = Cli::parse_from([
            "deployer",
            "--root",
            "/srv/docs",
            "run",
            "nextcloud",
            "--input",
            "hostname=cloud",
            "--input",
            "memory=2048",
            "--addon",
            "usb",
            "--resume",
        ]);
        assert_eq!(cli.root, PathBuf::from("/srv/docs"));
        let Command::Run {
            request, resume, ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert!(resume);
        assert_eq!(request.task, TaskType::Installation);
        assert_eq!(request.addons, ["usb"]);
        let values = to_values(&request.inputs);
        assert_eq!(values["memory"], Scalar::text("2048"));
    }

    #[test]
    fn parse_task_type() {
        let cli = Cli::parse_from(["deployer", "plan", "web", "--task", "backup"]);
        let Command::Plan(args) = cli.command else {
            panic!("expected plan");
        };
        assert_eq!(args.task, TaskType::Backup);
    }

    #[test]
    fn input_requires_key_and_equals() {
        assert_eq!(
            parse_input("a=b=c").expect("valid"),
            ("a".to_string(), "b=c".to_string())
        );
        assert!(parse_input("novalue").is_err());
        assert!(parse_input("=x").is_err());
        let bad = Cli::try_parse_from(["deployer", "plan", "web", "--input", "bad"]);
        assert!(bad.is_err());
    }

    #[test]
    fn parse_inspect_in_container() {
        let cli = Cli::parse_from(["deployer", "inspect", "--vm-id", "104", "uptime"]);
        assert!(matches!(
            cli.command,
            Command::Inspect {
                vm_id: Some(104),
                ..
            }
        ));
    }

    #[test]
    fn init_writes_defaults_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("deployer.toml");
        assert_eq!(cmd_init(&path, false).expect("init"), exit_codes::OK);
        assert_eq!(load_config(&path).expect("load"), DeployerConfig::default());

        assert!(cmd_init(&path, false).is_err());
        assert_eq!(cmd_init(&path, true).expect("init"), exit_codes::OK);
    }
}
