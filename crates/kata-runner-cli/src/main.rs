use std::io::Write as _;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::{json, Value};

use kata_runner::{Files, PatternClassifier, Runner, RunnerConfig, REPORT_SCHEMA_VERSION};

mod files;

#[derive(Parser)]
#[command(name = "kata-runner")]
#[command(
    about = "Runs kata scripts in short-lived, resource-limited docker containers.",
    long_about = None
)]
struct Cli {
    /// Docker CLI to drive (overrides KATA_RUNNER_DOCKER_BIN).
    #[arg(long, global = true, value_name = "PATH")]
    docker_bin: Option<String>,

    /// Prefix for volume and container names (overrides KATA_RUNNER_NAME_PREFIX).
    #[arg(long, global = true, value_name = "PREFIX")]
    name_prefix: Option<String>,

    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    /// Colour runs by matching stdout instead of the exit status. Red wins.
    #[arg(long, global = true, value_name = "REGEX")]
    red_pattern: Option<String>,

    #[arg(long, global = true, value_name = "REGEX")]
    green_pattern: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Create the kata's volume.
    KataNew(ImageKata),
    /// Remove the kata's volume and every avatar in it.
    KataOld(KataArgs),
    KataExists(KataArgs),
    /// Create the avatar's sandbox dir, optionally with starting files.
    AvatarNew {
        #[command(flatten)]
        target: Target,
        /// JSON object of path -> content.
        #[arg(long, value_name = "PATH")]
        files: Option<PathBuf>,
    },
    AvatarOld(Target),
    AvatarExists(Target),
    /// Delete files, send changed files and run cyber-dojo.sh.
    Run {
        #[command(flatten)]
        target: Target,
        /// JSON object of path -> content.
        #[arg(long, value_name = "PATH")]
        changed: Option<PathBuf>,
        #[arg(long = "deleted", value_name = "FILENAME")]
        deleted: Vec<String>,
        #[arg(long, default_value_t = 10)]
        max_seconds: u64,
    },
    /// Run from a request holding new/deleted/unchanged/changed file sets.
    RunCyberDojoSh {
        #[command(flatten)]
        target: Target,
        #[arg(long, value_name = "PATH")]
        request: PathBuf,
        #[arg(long, default_value_t = 10)]
        max_seconds: u64,
    },
    ImagePulled(ImageArgs),
    ImagePull(ImageArgs),
}

#[derive(Args)]
struct KataArgs {
    #[arg(long)]
    kata_id: String,
}

#[derive(Args)]
struct ImageArgs {
    #[arg(long)]
    image: String,
}

#[derive(Args)]
struct ImageKata {
    #[arg(long)]
    image: String,
    #[arg(long)]
    kata_id: String,
}

#[derive(Args)]
struct Target {
    #[arg(long)]
    image: String,
    #[arg(long)]
    kata_id: String,
    #[arg(long)]
    avatar: String,
}

#[derive(Serialize)]
struct Report<'a> {
    schema_version: &'static str,
    op: &'a str,
    ok: bool,
    result: Value,
}

fn main() -> std::process::ExitCode {
    match try_main() {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            let _ = writeln!(std::io::stderr(), "{err:#}");
            std::process::ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::from(cli.log_level))
        .init();

    let mut config = RunnerConfig::from_env()?;
    if let Some(bin) = cli.docker_bin {
        config = config.with_docker_bin(bin);
    }
    if let Some(prefix) = cli.name_prefix.as_deref() {
        config = config.with_name_prefix(prefix)?;
    }
    tracing::debug!(docker = %config.docker_bin, prefix = %config.name_prefix, "config");

    let mut runner = Runner::host(config);
    if let Some(classifier) = pattern_classifier(cli.red_pattern, cli.green_pattern)? {
        runner = runner.with_classifier(Box::new(classifier));
    }
    let (op, result) = dispatch(&runner, cli.cmd)?;

    let report = Report {
        schema_version: REPORT_SCHEMA_VERSION,
        op,
        ok: true,
        result,
    };
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, &report)?;
    writeln!(stdout)?;
    Ok(())
}

fn pattern_classifier(
    red: Option<String>,
    green: Option<String>,
) -> Result<Option<PatternClassifier>> {
    match (red, green) {
        (None, None) => Ok(None),
        (Some(red), Some(green)) => Ok(Some(PatternClassifier::new(&red, &green)?)),
        _ => bail!("--red-pattern and --green-pattern go together"),
    }
}

fn dispatch<D: kata_runner::runner::Runtime>(
    runner: &Runner<D>,
    cmd: Command,
) -> Result<(&'static str, Value)> {
    Ok(match cmd {
        Command::KataNew(a) => {
            runner.kata_new(&a.image, &a.kata_id)?;
            ("kata_new", Value::Null)
        }
        Command::KataOld(a) => {
            runner.kata_old(&a.kata_id)?;
            ("kata_old", Value::Null)
        }
        Command::KataExists(a) => ("kata_exists", json!(runner.kata_exists(&a.kata_id)?)),
        Command::AvatarNew { target: t, files: path } => {
            let starting = match path {
                Some(path) => files::read_files(&path)?,
                None => Files::new(),
            };
            runner.avatar_new(&t.image, &t.kata_id, &t.avatar, &starting)?;
            ("avatar_new", Value::Null)
        }
        Command::AvatarOld(t) => {
            runner.avatar_old(&t.image, &t.kata_id, &t.avatar)?;
            ("avatar_old", Value::Null)
        }
        Command::AvatarExists(t) => (
            "avatar_exists",
            json!(runner.avatar_exists(&t.image, &t.kata_id, &t.avatar)?),
        ),
        Command::Run {
            target: t,
            changed,
            deleted,
            max_seconds,
        } => {
            let changed = match changed {
                Some(path) => files::read_files(&path)?,
                None => Files::new(),
            };
            let result = runner.run(
                &t.image,
                &t.kata_id,
                &t.avatar,
                &deleted,
                &changed,
                max_seconds,
            )?;
            ("run", serde_json::to_value(result)?)
        }
        Command::RunCyberDojoSh {
            target: t,
            request,
            max_seconds,
        } => {
            let request = files::read_run_request(&request)?;
            let result =
                runner.run_cyber_dojo_sh(&t.image, &t.kata_id, &t.avatar, request, max_seconds)?;
            ("run_cyber_dojo_sh", serde_json::to_value(result)?)
        }
        Command::ImagePulled(a) => ("image_pulled", json!(runner.image_pulled(&a.image)?)),
        Command::ImagePull(a) => ("image_pull", json!(runner.image_pull(&a.image)?)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kata_runner::docker::Docker;
    use kata_runner::testing::ScriptedShell;
    use kata_runner::TimedOutput;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("kata-runner").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = parse(&["kata-exists", "--kata-id", "A1B2C3D4E5", "--log-level", "debug"]);
        assert_eq!(cli.log_level, LogLevel::Debug);
        assert!(matches!(cli.cmd, Command::KataExists(ref a) if a.kata_id == "A1B2C3D4E5"));
    }

    #[test]
    fn run_collects_repeated_deletions() {
        let cli = parse(&[
            "run",
            "--image",
            "alpine",
            "--kata-id",
            "A1B2C3D4E5",
            "--avatar",
            "salmon",
            "--deleted",
            "a.c",
            "--deleted",
            "b.c",
        ]);
        match cli.cmd {
            Command::Run {
                deleted,
                max_seconds,
                changed,
                ..
            } => {
                assert_eq!(deleted, ["a.c", "b.c"]);
                assert_eq!(max_seconds, 10);
                assert!(changed.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn dispatch_reports_kata_exists() {
        let shell = ScriptedShell::new();
        shell.mock_exec(
            "docker volume ls --quiet --filter name=kata_runner_A1B2C3D4E5",
            "kata_runner_A1B2C3D4E5\n",
            "",
            0,
        );
        let runner = Runner::new(Docker::new(&shell, "docker"), RunnerConfig::default());
        let cli = parse(&["kata-exists", "--kata-id", "A1B2C3D4E5"]);
        let (op, result) = dispatch(&runner, cli.cmd).unwrap();
        assert_eq!(op, "kata_exists");
        assert_eq!(result, json!(true));
    }

    fn docker_run_alpine() -> String {
        format!(
            "docker run --detach \
             --env CYBER_DOJO_AVATAR_NAME=salmon \
             --env CYBER_DOJO_IMAGE_NAME=alpine \
             --env CYBER_DOJO_KATA_ID=A1B2C3D4E5 \
             --env CYBER_DOJO_RUNNER=stateful \
             --env CYBER_DOJO_SANDBOX=/sandboxes/salmon \
             --init --interactive --name=kata_runner_A1B2C3D4E5_salmon {} --user=root \
             --volume kata_runner_A1B2C3D4E5:/sandboxes:rw alpine sh",
            kata_runner::limits::RESOURCE_LIMITS.docker_args().join(" ")
        )
    }

    #[test]
    fn patterns_colour_runs_by_stdout() {
        let shell = ScriptedShell::new();
        shell.mock_exec(
            "docker volume ls --quiet --filter name=kata_runner_A1B2C3D4E5",
            "kata_runner_A1B2C3D4E5\n",
            "",
            0,
        );
        shell.mock_exec(&docker_run_alpine(), "0123abcd\n", "", 0);
        shell.mock_exec(
            "docker exec kata_runner_A1B2C3D4E5_salmon sh -c '[ -d /sandboxes/salmon ]'",
            "",
            "",
            0,
        );
        shell.mock_exec_timeout(
            "docker exec --user=40045:5000 --interactive kata_runner_A1B2C3D4E5_salmon \
             sh -c 'cd /sandboxes/salmon && sh ./cyber-dojo.sh'",
            TimedOutput::completed("2 failures\n", "", 0),
        );
        shell.mock_exec("docker rm --force kata_runner_A1B2C3D4E5_salmon", "", "", 0);

        let cli = parse(&[
            "--red-pattern",
            r"\d+ failures",
            "--green-pattern",
            "OK",
            "run",
            "--image",
            "alpine",
            "--kata-id",
            "A1B2C3D4E5",
            "--avatar",
            "salmon",
        ]);
        let classifier = pattern_classifier(cli.red_pattern, cli.green_pattern)
            .unwrap()
            .unwrap();
        let runner = Runner::new(Docker::new(&shell, "docker"), RunnerConfig::default())
            .with_classifier(Box::new(classifier));
        let (op, result) = dispatch(&runner, cli.cmd).unwrap();
        assert_eq!(op, "run");
        assert_eq!(result["colour"], json!("red"));
        assert_eq!(result["status"], json!(0));
    }

    #[test]
    fn a_lone_pattern_is_rejected() {
        assert!(pattern_classifier(None, None).unwrap().is_none());
        let err = pattern_classifier(Some("FAIL".to_string()), None).unwrap_err();
        assert!(err.to_string().contains("--green-pattern"), "{err}");
        assert!(pattern_classifier(Some("(".to_string()), Some("ok".to_string())).is_err());
    }

    #[test]
    fn validation_errors_surface_as_field_reason() {
        let shell = ScriptedShell::new();
        let runner = Runner::new(Docker::new(&shell, "docker"), RunnerConfig::default());
        let cli = parse(&["kata-old", "--kata-id", "nope"]);
        let err = dispatch(&runner, cli.cmd).unwrap_err();
        assert_eq!(format!("{err:#}"), "kata_id:invalid");
    }
}
