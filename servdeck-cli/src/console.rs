use std::io::{self, Write};
use std::time::SystemTime;

use servdeck_core::ServdeckError;
use servdeck_core::model::ProjectRecord;
use servdeck_core::state::{AppState, LogLine, LogStream};

/// Format a SystemTime as HH:MM:SS for log display
pub fn format_timestamp(time: SystemTime) -> String {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(duration) => {
            let secs = duration.as_secs();
            let hours = (secs / 3600) % 24;
            let minutes = (secs / 60) % 60;
            let seconds = secs % 60;
            format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
        }
        Err(_) => "??:??:??".to_string(),
    }
}

/// Body of a log line as shown to the user
pub fn line_text(line: &LogLine) -> String {
    match line.stream {
        LogStream::Stderr => format!("ERROR: {}", line.text),
        LogStream::Stdout | LogStream::System => line.text.clone(),
    }
}

/// Streams the session log to stdout as it grows.
pub struct Console {
    cursor: u64,
    /// Prefix lines with the project name
    tagged: bool,
}

impl Console {
    pub fn new(tagged: bool) -> Self {
        Self { cursor: 0, tagged }
    }

    /// Skip everything logged so far.
    pub fn catch_up(&mut self, state: &AppState) {
        self.cursor = state.logs.cursor();
    }

    /// Print what was logged since the last flush. An error means stdout is
    /// gone (a closed pipe, say) and the caller should stop streaming.
    pub fn flush(&mut self, state: &AppState) -> io::Result<()> {
        self.write_to(state, io::stdout().lock())
    }

    fn write_to(&mut self, state: &AppState, mut out: impl Write) -> io::Result<()> {
        for line in state.logs.merged_since(self.cursor) {
            writeln!(out, "{}", self.render(state, line))?;
        }
        out.flush()?;
        self.cursor = state.logs.cursor();
        Ok(())
    }

    fn render(&self, state: &AppState, line: &LogLine) -> String {
        let at = format_timestamp(line.at);
        if !self.tagged {
            return format!("{} {}", at, line_text(line));
        }
        let name = state
            .registry
            .get(&line.project_id)
            .map(|p| p.name.as_str())
            .unwrap_or("?");
        format!("{} [{}] {}", at, name, line_text(line))
    }
}

pub fn print_projects(state: &AppState) {
    if state.registry.is_empty() {
        println!("No projects yet. Add one with `add <folder>`.");
        return;
    }
    for project in state.registry.iter() {
        println!("{}", project_row(project));
    }
}

pub fn project_row(project: &ProjectRecord) -> String {
    let status = project.status();
    let mut row = format!(
        "{} {:<8} {}  {:<24} {}",
        status.icon(),
        status.label(),
        short_id(&project.id),
        project.name,
        project.path.display()
    );
    if !project.is_built {
        row.push_str("  (not built)");
    }
    if let Some(pid) = project.process_id() {
        row.push_str(&format!("  pid {}", pid));
    }
    if let Some(url) = project.server_url() {
        row.push_str(&format!("  {}", url));
    }
    row
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

pub fn print_warnings(state: &mut AppState) {
    for warning in state.take_warnings() {
        print_error(&warning);
    }
}

pub fn print_error(error: &ServdeckError) {
    eprintln!("error: {}", error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use servdeck_core::config::Settings;
    use servdeck_core::registry::ProjectRegistry;
    use std::path::PathBuf;
    use std::time::Duration;

    struct ClosedPipe;

    impl Write for ClosedPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::ErrorKind::BrokenPipe.into())
        }
    }

    #[test]
    fn test_format_timestamp() {
        let at = SystemTime::UNIX_EPOCH + Duration::from_secs(3600 * 25 + 62);
        assert_eq!(format_timestamp(at), "01:01:02");
    }

    #[test]
    fn test_stderr_lines_are_prefixed() {
        let line = LogLine {
            at: SystemTime::now(),
            project_id: "p".into(),
            stream: LogStream::Stderr,
            text: "Unhandled exception".into(),
        };
        assert_eq!(line_text(&line), "ERROR: Unhandled exception");
    }

    #[test]
    fn test_project_row_shows_run_state() {
        let mut project = ProjectRecord::new(
            "0123456789abcdef".into(),
            "api".into(),
            PathBuf::from("/srv/api"),
            true,
        );
        assert!(project_row(&project).contains("Stopped"));

        project.mark_running(42, None);
        project.latch_server_url("http://localhost:5000");
        let row = project_row(&project);
        assert!(row.contains("01234567 "));
        assert!(row.contains("pid 42"));
        assert!(row.ends_with("http://localhost:5000"));
    }

    #[test]
    fn test_closed_output_is_reported() {
        let mut state = AppState::in_memory(Settings::default(), ProjectRegistry::new());
        let at = SystemTime::UNIX_EPOCH + Duration::from_secs(62);
        state.logs.push("p", LogLine::system("p", at, "Application started.".into()));

        let mut console = Console::new(false);
        let err = console.write_to(&state, ClosedPipe).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        // nothing counts as shown until a write succeeds
        let mut out = Vec::new();
        console.write_to(&state, &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "00:01:02 Application started.\n");

        let mut out = Vec::new();
        console.write_to(&state, &mut out).unwrap();
        assert!(out.is_empty());
    }
}
