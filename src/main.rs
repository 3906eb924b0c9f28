use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use sovereign_agent::agent::AgentRuntime;
use sovereign_agent::config::{Config, DEFAULT_CONFIG_PATH};
use sovereign_agent::error::SessionError;
use sovereign_agent::recorder::FlightEntry;
use sovereign_agent::skills::{CapabilityDescriptor, SkillOrigin};
use sovereign_agent::TaskPlan;

/// Plan completed (and was reconciled if requested).
const EXIT_COMPLETED: u8 = 0;
/// Plan rejected by validation.
const EXIT_REJECTED: u8 = 2;
/// Plan aborted on a failed step or cancellation.
const EXIT_ABORTED: u8 = 3;
/// The plan ran but its flight record could not be written.
const EXIT_AUDIT_FAILED: u8 = 4;

fn print_help() {
    println!(
        "\
sovereign-agent v{}

Runs a plan against a sandboxed copy of a workspace and records every step.

USAGE:
    sovereign-agent [OPTIONS] <PLAN_FILE>
    sovereign-agent [OPTIONS] --capabilities
    sovereign-agent [OPTIONS] --sessions
    sovereign-agent [OPTIONS] --replay <SESSION_ID>

ARGUMENTS:
    PLAN_FILE    JSON plan: {{\"goal\"?, \"steps\": [{{\"capability\", \"args\", \"id\"?}}]}}

OPTIONS:
    -c, --config <PATH>        Configuration file [default: {DEFAULT_CONFIG_PATH}]
    -w, --workspace <DIR>      Workspace to operate on (overrides [agent] workspace)
        --reconcile            Commit the sandbox to the workspace if the plan completes
        --capabilities         List registered capabilities and exit
        --sessions             List recorded sessions and exit
        --replay <SESSION_ID>  Print the flight record of a session and exit
    -h, --help                 Print this help message and exit
    -V, --version              Print version and exit

EXIT CODES:
    0    plan completed
    1    runtime or configuration error
    2    plan rejected
    3    plan aborted (failed step or Ctrl-C)
    4    flight record could not be written

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing
                (e.g. debug, sovereign_agent=debug,warn)

EXAMPLES:
    sovereign-agent plan.json                      # dry run, sandbox discarded
    sovereign-agent --reconcile plan.json          # apply the result
    sovereign-agent -w ./project --capabilities    # what can plans call?
    RUST_LOG=debug sovereign-agent plan.json       # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

enum Mode {
    Run(PathBuf),
    Capabilities,
    Sessions,
    Replay(Uuid),
}

struct Options {
    config: Option<PathBuf>,
    workspace: Option<PathBuf>,
    reconcile: bool,
    mode: Mode,
}

fn parse_args(args: &[String]) -> Result<Options> {
    let mut config = None;
    let mut workspace = None;
    let mut reconcile = false;
    let mut mode = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| anyhow!("{flag} requires a value"))
        };
        match arg.as_str() {
            "-c" | "--config" => config = Some(PathBuf::from(value(arg.as_str())?)),
            "-w" | "--workspace" => workspace = Some(PathBuf::from(value(arg.as_str())?)),
            "--reconcile" => reconcile = true,
            "--capabilities" => mode = Some(Mode::Capabilities),
            "--sessions" => mode = Some(Mode::Sessions),
            "--replay" => {
                let id = value(arg.as_str())?;
                let id = Uuid::parse_str(&id).map_err(|e| anyhow!("invalid session id {id}: {e}"))?;
                mode = Some(Mode::Replay(id));
            }
            flag if flag.starts_with('-') => return Err(anyhow!("unknown option {flag}")),
            path => {
                if mode.is_some() {
                    return Err(anyhow!("unexpected argument {path}"));
                }
                mode = Some(Mode::Run(PathBuf::from(path)));
            }
        }
    }

    Ok(Options {
        config,
        workspace,
        reconcile,
        mode: mode.ok_or_else(|| anyhow!("missing PLAN_FILE (see --help)"))?,
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Handle --help / --version before anything else
    for arg in &args {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("sovereign-agent v{}", env!("CARGO_PKG_VERSION"));
                return Ok(ExitCode::SUCCESS);
            }
            "--help" | "-h" => {
                print_help();
                return Ok(ExitCode::SUCCESS);
            }
            _ => {}
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sovereign_agent=info")),
        )
        .init();

    let options = parse_args(&args)?;

    // Load configuration
    let mut config = Config::load_or_default(options.config.as_deref())?;
    if let Some(workspace) = options.workspace {
        config.agent.workspace = workspace;
    }

    info!("Agent: {}", config.agent.name);
    info!("Workspace: {}", config.agent.workspace.display());
    info!("Sandboxes: {}", config.sandbox.dir.display());

    let runtime = AgentRuntime::new(config)?;

    match options.mode {
        Mode::Capabilities => {
            print_capabilities(&runtime);
            Ok(ExitCode::SUCCESS)
        }
        Mode::Sessions => {
            for id in runtime.sessions()? {
                println!("{id}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Mode::Replay(id) => {
            for entry in runtime.load_session(id)? {
                println!("{}", describe(&entry));
            }
            Ok(ExitCode::SUCCESS)
        }
        Mode::Run(path) => run_plan(&runtime, &path, options.reconcile).await,
    }
}

async fn run_plan(runtime: &AgentRuntime, path: &Path, reconcile: bool) -> Result<ExitCode> {
    let plan = TaskPlan::load(path)?;
    info!(
        "Plan {} loaded from {} ({} steps)",
        plan.plan_id,
        path.display(),
        plan.steps.len()
    );

    let mut session = runtime.open_session();

    // Ctrl-C stops the plan between steps
    let cancel = session.cancel_token();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling after the current step");
            cancel.cancel();
        }
    });

    let outcome = session.run(&plan).await;
    watcher.abort();

    let mut code = match outcome {
        Ok(report) => {
            print!("{report}");
            if report.is_completed() {
                if reconcile {
                    session.reconcile()?;
                    println!("Workspace updated from sandbox.");
                } else {
                    session.discard()?;
                    println!("Sandbox discarded (use --reconcile to apply).");
                }
                EXIT_COMPLETED
            } else {
                session.discard()?;
                EXIT_ABORTED
            }
        }
        Err(SessionError::Validation(e)) => {
            eprintln!("Plan rejected: {e}");
            EXIT_REJECTED
        }
        Err(e) => return Err(e.into()),
    };

    let session_id = session.id();
    if let Err(e) = session.close() {
        error!("Flight record incomplete: {e}");
        code = EXIT_AUDIT_FAILED;
    }
    println!("Session {session_id}");
    Ok(ExitCode::from(code))
}

fn print_capabilities(runtime: &AgentRuntime) {
    for descriptor in runtime.registry().descriptors() {
        println!("{}", describe_capability(descriptor));
    }
}

fn describe_capability(descriptor: &CapabilityDescriptor) -> String {
    let origin = match descriptor.origin() {
        SkillOrigin::Builtin => "builtin".to_string(),
        SkillOrigin::Manifest(path) => path.display().to_string(),
    };
    format!(
        "{} [{origin}]\n    {}\n    uses: {}\n    args: {}",
        descriptor.name(),
        descriptor.description(),
        descriptor.capabilities().join(", "),
        descriptor.schema().to_json_schema()
    )
}

fn describe(entry: &FlightEntry) -> String {
    let scope = match (&entry.plan_id, &entry.step_id) {
        (_, Some(step)) => step.clone(),
        (Some(plan), None) => plan.clone(),
        (None, None) => "-".to_string(),
    };
    let mut payload = serde_json::to_value(&entry.event).unwrap_or_default();
    if let Some(map) = payload.as_object_mut() {
        map.remove("kind");
    }
    format!(
        "{:>4}  {}  {:<20} {:<12} {payload}",
        entry.seq,
        entry.ts.to_rfc3339(),
        entry.event.kind(),
        scope
    )
}
