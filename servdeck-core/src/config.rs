use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Recovered, Result, ServdeckError};
use crate::model::Operation;

const APP_DIR_NAME: &str = "servdeck";
const PROJECTS_FILE: &str = "projects.json";
const SNAPSHOT_FILE: &str = "running_processes.json";
const SETTINGS_FILE: &str = "settings.yaml";

/// Launcher invocations, as argv lists run in the project directory.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct LauncherConfig {
    #[serde(default = "default_run")]
    pub run: Vec<String>,
    #[serde(default = "default_build")]
    pub build: Vec<String>,
    #[serde(default = "default_clean")]
    pub clean: Vec<String>,
}

fn default_run() -> Vec<String> {
    vec!["dotnet".into(), "run".into()]
}
fn default_build() -> Vec<String> {
    vec!["dotnet".into(), "build".into()]
}
fn default_clean() -> Vec<String> {
    vec!["dotnet".into(), "clean".into()]
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            run: default_run(),
            build: default_build(),
            clean: default_clean(),
        }
    }
}

impl LauncherConfig {
    pub fn argv(&self, operation: Operation) -> &[String] {
        match operation {
            Operation::Build => &self.build,
            Operation::Clean => &self.clean,
            Operation::Run => &self.run,
        }
    }
}

/// Root settings file structure
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub launcher: LauncherConfig,

    /// Directory (relative to the project) whose files mark a project as built
    #[serde(default = "default_build_output_dir")]
    pub build_output_dir: String,

    /// Refuse to run a project whose build output is missing
    #[serde(default = "default_true")]
    pub require_build_before_run: bool,

    /// Wait for a stopped process tree to exit, in milliseconds
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Per-project wait when stopping everything at exit
    #[serde(default = "default_shutdown_stop_timeout_ms")]
    pub shutdown_stop_timeout_ms: u64,

    /// Session log lines kept per project
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

fn default_build_output_dir() -> String {
    "bin".into()
}
fn default_true() -> bool {
    true
}
fn default_stop_timeout_ms() -> u64 {
    5000
}
fn default_shutdown_stop_timeout_ms() -> u64 {
    3000
}
fn default_log_capacity() -> usize {
    10_000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            launcher: LauncherConfig::default(),
            build_output_dir: default_build_output_dir(),
            require_build_before_run: true,
            stop_timeout_ms: default_stop_timeout_ms(),
            shutdown_stop_timeout_ms: default_shutdown_stop_timeout_ms(),
            log_capacity: default_log_capacity(),
        }
    }
}

impl Settings {
    pub fn parse(yaml: &str, origin: &Path) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(yaml).map_err(|e| ServdeckError::Config {
            path: origin.to_path_buf(),
            details: e.to_string(),
        })?;
        settings.validate(origin)?;
        Ok(settings)
    }

    fn validate(&self, origin: &Path) -> Result<()> {
        for operation in [Operation::Build, Operation::Clean, Operation::Run] {
            if self.launcher.argv(operation).is_empty() {
                return Err(ServdeckError::Config {
                    path: origin.to_path_buf(),
                    details: format!("launcher.{} must not be empty", operation),
                });
            }
        }
        Ok(())
    }

    /// Load settings; a missing file means defaults, a broken one means
    /// defaults plus a warning.
    pub fn load(path: &Path) -> Recovered<Settings> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Recovered::ok(Settings::default());
            }
            Err(e) => {
                return Recovered::fallback(
                    Settings::default(),
                    ServdeckError::Config {
                        path: path.to_path_buf(),
                        details: e.to_string(),
                    },
                );
            }
        };

        match Settings::parse(&text, path) {
            Ok(settings) => Recovered::ok(settings),
            Err(e) => Recovered::fallback(Settings::default(), e),
        }
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn shutdown_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_stop_timeout_ms)
    }
}

/// Locations of the files servdeck owns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppPaths {
    root: PathBuf,
}

impl AppPaths {
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    /// `<data dir>/servdeck`, or the override when one is given.
    pub fn resolve(root_override: Option<PathBuf>) -> Result<Self> {
        if let Some(root) = root_override {
            return Ok(Self::with_root(root));
        }
        dirs::data_dir()
            .map(|dir| Self::with_root(dir.join(APP_DIR_NAME)))
            .ok_or_else(|| ServdeckError::Config {
                path: PathBuf::from(APP_DIR_NAME),
                details: "no application data directory on this platform".into(),
            })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn projects_file(&self) -> PathBuf {
        self.root.join(PROJECTS_FILE)
    }

    pub fn snapshot_file(&self) -> PathBuf {
        self.root.join(SNAPSHOT_FILE)
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE)
    }
}
