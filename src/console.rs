use tracing::info;

/// Lines of text meant for the user: connect progress, server lists, query results. The
///  transport only collects them, and the application decides how to display them (see
///  [crate::transport::Transport::drain_console]).
#[derive(Default)]
pub struct Console {
    lines: Vec<String>,
}

impl Console {
    pub fn print(&mut self, line: impl Into<String>) {
        let line = line.into();
        info!("{}", line);
        self.lines.push(line);
    }

    pub fn drain(&mut self) -> Vec<String> {
        std::mem::take(&mut self.lines)
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}
