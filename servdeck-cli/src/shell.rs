//! Interactive shell: project commands on stdin, server output on stdout.

use std::io;
use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{debug, warn};

use servdeck_core::model::{ShutdownChoice, ShutdownOutcome};
use servdeck_core::Result;

use crate::app::App;
use crate::console::{self, Console, line_text};

pub type Input = Lines<BufReader<Stdin>>;

pub fn stdin_lines() -> Input {
    BufReader::new(tokio::io::stdin()).lines()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShellCommand {
    List,
    Add { path: PathBuf, name: Option<String> },
    Rename { project: String, name: String },
    SetPath { project: String, path: PathBuf },
    Remove { project: String },
    Build { project: String },
    Clean { project: String },
    Run { project: String },
    Stop { project: String },
    Url { project: String },
    Logs { project: String },
    Help,
    Quit,
}

const HELP: &str = "\
commands:
  list                      show projects
  add <folder> [name]       register a project folder
  rename <project> <name>   rename a project
  path <project> <folder>   change a project's folder
  remove <project>          stop (if running) and remove a project
  build <project>           run the build launcher
  clean <project>           run the clean launcher
  run <project>             start the server
  stop <project>            stop the server
  url <project>             show the detected server URL
  logs <project>            print the session log
  quit                      exit
<project> is a name, an id, or a unique id prefix.";

pub fn parse_command(line: &str) -> std::result::Result<Option<ShellCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<&str> = words.collect();
    let arg = |i: usize, what: &str| {
        rest.get(i)
            .map(|s| s.to_string())
            .ok_or_else(|| format!("{}: missing <{}>", verb, what))
    };
    // names may contain spaces
    let tail = |from: usize| rest.get(from..).map(|w| w.join(" ")).filter(|s| !s.is_empty());

    let command = match verb {
        "list" | "ls" => ShellCommand::List,
        "add" => ShellCommand::Add {
            path: PathBuf::from(arg(0, "folder")?),
            name: tail(1),
        },
        "rename" => ShellCommand::Rename {
            project: arg(0, "project")?,
            name: tail(1).ok_or_else(|| "rename: missing <name>".to_string())?,
        },
        "path" => ShellCommand::SetPath {
            project: arg(0, "project")?,
            path: PathBuf::from(arg(1, "folder")?),
        },
        "remove" | "rm" => ShellCommand::Remove {
            project: arg(0, "project")?,
        },
        "build" => ShellCommand::Build {
            project: arg(0, "project")?,
        },
        "clean" => ShellCommand::Clean {
            project: arg(0, "project")?,
        },
        "run" | "start" => ShellCommand::Run {
            project: arg(0, "project")?,
        },
        "stop" => ShellCommand::Stop {
            project: arg(0, "project")?,
        },
        "url" | "open" => ShellCommand::Url {
            project: arg(0, "project")?,
        },
        "logs" => ShellCommand::Logs {
            project: arg(0, "project")?,
        },
        "help" | "?" => ShellCommand::Help,
        "quit" | "exit" | "q" => ShellCommand::Quit,
        other => return Err(format!("unknown command: {} (try `help`)", other)),
    };
    Ok(Some(command))
}

pub fn parse_choice(answer: &str) -> Option<ShutdownChoice> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "s" | "stop" => Some(ShutdownChoice::StopAll),
        "l" | "leave" => Some(ShutdownChoice::LeaveRunning),
        "c" | "cancel" | "" => Some(ShutdownChoice::Cancel),
        _ => None,
    }
}

/// Ask what to do with running servers. End of input counts as leave running.
pub async fn prompt_close_choice(input: &mut Input, running: usize) -> ShutdownChoice {
    loop {
        println!(
            "{} server(s) still running: [s]top all and exit, [l]eave running and exit, [c]ancel?",
            running
        );
        match input.next_line().await {
            Ok(Some(answer)) => {
                if let Some(choice) = parse_choice(&answer) {
                    return choice;
                }
            }
            Ok(None) | Err(_) => return ShutdownChoice::LeaveRunning,
        }
    }
}

/// Try to close the session; `true` means exit.
pub async fn close(app: &mut App, console: &mut Console, input: &mut Input) -> bool {
    let running = app.running_count();
    let choice = if running == 0 {
        ShutdownChoice::StopAll
    } else {
        prompt_close_choice(input, running).await
    };
    let outcome = app.shutdown(choice).await;
    if let Err(e) = console.flush(&app.state) {
        debug!(error = %e, "output closed while closing");
    }
    console::print_warnings(&mut app.state);
    outcome == ShutdownOutcome::Exit
}

/// Nobody is reading our output any more: keep the servers for the next
/// session and end this one.
pub async fn output_closed(app: &mut App, error: io::Error) -> Result<()> {
    warn!(error = %error, "output closed, leaving servers running");
    app.shutdown(ShutdownChoice::LeaveRunning).await;
    Err(error.into())
}

pub async fn run(app: &mut App, console: &mut Console) -> Result<()> {
    let mut input = stdin_lines();
    console::print_projects(&app.state);
    if let Err(e) = console.flush(&app.state) {
        return output_closed(app, e).await;
    }
    println!("type `help` for commands");

    loop {
        tokio::select! {
            _ = app.next_event() => {
                if let Err(e) = console.flush(&app.state) {
                    return output_closed(app, e).await;
                }
                console::print_warnings(&mut app.state);
            }
            line = input.next_line() => {
                let line = line?;
                let command = match line.as_deref().map(parse_command) {
                    None => Some(ShellCommand::Quit),
                    Some(Ok(command)) => command,
                    Some(Err(message)) => {
                        eprintln!("{}", message);
                        None
                    }
                };
                let Some(command) = command else { continue };

                if command == ShellCommand::Quit {
                    if close(app, console, &mut input).await {
                        return Ok(());
                    }
                    continue;
                }
                if let Err(e) = execute(app, command).await {
                    console::print_error(&e);
                }
                if let Err(e) = console.flush(&app.state) {
                    return output_closed(app, e).await;
                }
                console::print_warnings(&mut app.state);
            }
            _ = tokio::signal::ctrl_c() => {
                if close(app, console, &mut input).await {
                    return Ok(());
                }
            }
        }
    }
}

async fn execute(app: &mut App, command: ShellCommand) -> Result<()> {
    match command {
        ShellCommand::List => console::print_projects(&app.state),
        ShellCommand::Add { path, name } => {
            let id = app.add(&path, name.as_deref())?;
            if let Some(project) = app.state.registry.get(&id) {
                println!("added {}", console::project_row(project));
            }
        }
        ShellCommand::Rename { project, name } => {
            app.rename(&project, &name)?;
        }
        ShellCommand::SetPath { project, path } => {
            app.set_path(&project, path)?;
        }
        ShellCommand::Remove { project } => {
            if let Some(removed) = app.remove(&project).await? {
                println!("removed {}", removed.name);
            }
        }
        ShellCommand::Build { project } => {
            app.build(&project)?;
        }
        ShellCommand::Clean { project } => {
            app.clean(&project)?;
        }
        ShellCommand::Run { project } => {
            app.run(&project)?;
        }
        ShellCommand::Stop { project } => {
            app.stop(&project).await?;
        }
        ShellCommand::Url { project } => match app.server_url(&project)? {
            Some(url) => println!("{}", url),
            None => println!("Server URL not detected yet. Wait for the server to start."),
        },
        ShellCommand::Logs { project } => {
            let id = app.resolve(&project)?;
            for line in app.state.logs.lines(&id) {
                println!("{} {}", console::format_timestamp(line.at), line_text(line));
            }
        }
        ShellCommand::Help => println!("{}", HELP),
        ShellCommand::Quit => {}
    }
    Ok(())
}
