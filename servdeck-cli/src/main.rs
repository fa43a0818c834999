mod app;
mod console;
mod controller;
mod process_table;
mod shell;
mod tree;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use servdeck_core::Result;
use servdeck_core::config::AppPaths;
use servdeck_core::model::{ShutdownChoice, ShutdownOutcome, StopOutcome};
use servdeck_core::reconcile::ProcessTable;
use servdeck_core::reducer::ControllerEvent;

use app::App;
use console::Console;
use process_table::SysinfoProcessTable;

#[derive(Parser)]
#[command(name = "servdeck")]
#[command(about = "Launch, watch and stop local dev servers", long_about = None)]
struct Cli {
    /// Directory holding projects.json, running_processes.json and settings.yaml
    #[arg(long, env = "SERVDECK_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List projects with their status
    List,
    /// Register a project folder
    Add {
        path: PathBuf,
        /// Display name (defaults to the folder name)
        #[arg(short, long)]
        name: Option<String>,
    },
    Rename {
        project: String,
        name: String,
    },
    /// Point a project at a different folder
    SetPath {
        project: String,
        path: PathBuf,
    },
    /// Stop (if running) and remove a project
    Remove {
        project: String,
    },
    /// Build a project and wait for it to finish
    Build {
        project: String,
    },
    /// Clean a project and wait for it to finish
    Clean {
        project: String,
    },
    /// Start a server and stream its output until Ctrl-C
    Run {
        project: String,
        /// Build first
        #[arg(long)]
        build: bool,
    },
    Stop {
        project: String,
    },
    /// Print the server URL detected for a running project
    Url {
        project: String,
    },
    /// Interactive shell (default)
    Shell,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            console::print_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("SERVDECK_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let paths = AppPaths::resolve(cli.data_dir)?;
    debug!(root = %paths.root().display(), "data directory");
    let table: Arc<dyn ProcessTable> = Arc::new(SysinfoProcessTable::new());
    let (mut app, _) = App::open(&paths, table);
    console::print_warnings(&mut app.state);

    let command = cli.command.unwrap_or(Commands::Shell);
    let mut console = Console::new(matches!(command, Commands::Shell));
    if !matches!(command, Commands::Shell) {
        // restore notices only matter to the streaming views
        console.catch_up(&app.state);
    }

    match command {
        Commands::List => console::print_projects(&app.state),
        Commands::Add { path, name } => {
            let id = app.add(&path, name.as_deref())?;
            if let Some(project) = app.state.registry.get(&id) {
                println!("{}", console::project_row(project));
            }
        }
        Commands::Rename { project, name } => {
            app.rename(&project, &name)?;
        }
        Commands::SetPath { project, path } => {
            app.set_path(&project, path)?;
        }
        Commands::Remove { project } => {
            if let Some(removed) = app.remove(&project).await? {
                console.flush(&app.state)?;
                println!("removed {}", removed.name);
            }
        }
        Commands::Build { project } => {
            let id = app.build(&project)?;
            return Ok(finish(&mut app, &mut console, &id).await);
        }
        Commands::Clean { project } => {
            let id = app.clean(&project)?;
            return Ok(finish(&mut app, &mut console, &id).await);
        }
        Commands::Run { project, build } => {
            if build {
                let id = app.build(&project)?;
                let code = finish(&mut app, &mut console, &id).await;
                if code != ExitCode::SUCCESS {
                    return Ok(code);
                }
            }
            let id = app.run(&project)?;
            return Ok(stream_run(&mut app, &mut console, &id).await);
        }
        Commands::Stop { project } => {
            let outcome = app.stop(&project).await?;
            console.flush(&app.state)?;
            if outcome == StopOutcome::NotRunning {
                println!("{}", outcome.describe());
            }
        }
        Commands::Url { project } => match app.server_url(&project)? {
            Some(url) => println!("{}", url),
            None => {
                println!("Server URL not detected yet. Wait for the server to start.");
                return Ok(ExitCode::FAILURE);
            }
        },
        Commands::Shell => shell::run(&mut app, &mut console).await?,
    }

    console::print_warnings(&mut app.state);
    Ok(ExitCode::SUCCESS)
}

/// Stream a build or clean until it finishes; its exit code becomes ours.
async fn finish(app: &mut App, console: &mut Console, id: &str) -> ExitCode {
    loop {
        tokio::select! {
            env = app.next_event() => {
                if let Err(e) = console.flush(&app.state) {
                    debug!(error = %e, "output closed, stopping");
                    app.stop(id).await.ok();
                    return ExitCode::FAILURE;
                }
                match env.event {
                    ControllerEvent::OperationFinished { id: done, code, .. } if done == id => {
                        console::print_warnings(&mut app.state);
                        return exit_code(code);
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                app.stop(id).await.ok();
                console.flush(&app.state).ok();
                return ExitCode::FAILURE;
            }
        }
    }
}

/// Stream a server until it exits, or until Ctrl-C and the close choice say so.
async fn stream_run(app: &mut App, console: &mut Console, id: &str) -> ExitCode {
    let mut input = shell::stdin_lines();
    loop {
        tokio::select! {
            env = app.next_event() => {
                if let Err(e) = console.flush(&app.state) {
                    shell::output_closed(app, e).await.ok();
                    return ExitCode::FAILURE;
                }
                console::print_warnings(&mut app.state);
                if let ControllerEvent::Exited { id: done, code, .. } = env.event {
                    if done == id {
                        return exit_code(code);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                let choice = shell::prompt_close_choice(&mut input, app.running_count()).await;
                if choice == ShutdownChoice::Cancel {
                    continue;
                }
                if app.shutdown(choice).await == ShutdownOutcome::Exit {
                    console.flush(&app.state).ok();
                    console::print_warnings(&mut app.state);
                    return ExitCode::SUCCESS;
                }
            }
        }
    }
}

fn exit_code(code: Option<i32>) -> ExitCode {
    match code {
        Some(0) => ExitCode::SUCCESS,
        Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        None => ExitCode::FAILURE,
    }
}
