//! Routing of child stdout/stderr lines to events, console, caches and file.
use std::{
    fs::File,
    io::{self, BufRead, BufReader, LineWriter, Read, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
};

use tracing::{debug, warn};

use super::{Shared, SupervisorEvent};
use crate::constants::BANNER_SEPARATOR_WIDTH;

/// Console output file opened for one supervision session.
///
/// Writes go through a [`LineWriter`] so every completed line reaches disk
/// while the child is still running.
#[derive(Debug)]
pub(crate) struct OutputFile {
    path: PathBuf,
    writer: Option<LineWriter<File>>,
}

impl OutputFile {
    /// Creates (or truncates) the output file, optionally writing the banner.
    pub(crate) fn create(
        path: &Path,
        banner: Option<(&str, &str)>,
    ) -> io::Result<Self> {
        let file = File::create(path)?;
        let mut writer = LineWriter::new(file);
        if let Some((program, arguments)) = banner {
            writeln!(writer, "{}", banner_heading(program, arguments))?;
            writeln!(writer, "{}", "-".repeat(BANNER_SEPARATOR_WIDTH))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(writer),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line. Failures are ignored: the file may be closed
    /// concurrently while the supervisor shuts down.
    pub(crate) fn write_line(&mut self, line: &str) {
        if let Some(writer) = self.writer.as_mut()
            && let Err(err) = writeln!(writer, "{line}")
        {
            debug!("Dropped console output line for {:?}: {err}", self.path);
        }
    }

    pub(crate) fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut()
            && let Err(err) = writer.flush()
        {
            warn!("Failed to flush console output file {:?}: {err}", self.path);
        }
    }

    pub(crate) fn close(&mut self) {
        self.flush();
        self.writer = None;
    }
}

fn banner_heading(program: &str, arguments: &str) -> String {
    if arguments.trim().is_empty() {
        program.to_string()
    } else {
        format!("{program} {arguments}")
    }
}

pub(crate) type SharedOutputFile = Arc<Mutex<Option<OutputFile>>>;

/// Fans each captured line out to every configured destination.
///
/// Lines from a run whose epoch was abandoned are dropped.
pub(crate) struct OutputRouter {
    shared: Arc<Shared>,
    epoch: u64,
    echo: bool,
    cache: bool,
    file: SharedOutputFile,
}

impl OutputRouter {
    pub(crate) fn new(
        shared: Arc<Shared>,
        epoch: u64,
        echo: bool,
        cache: bool,
        file: SharedOutputFile,
    ) -> Self {
        Self {
            shared,
            epoch,
            echo,
            cache,
            file,
        }
    }

    /// Order: event, echo, stdout cache, output file.
    pub(crate) fn handle_stdout_line(&self, line: &str) {
        if !self.shared.is_current(self.epoch) {
            return;
        }
        self.shared
            .emit(&SupervisorEvent::ConsoleOutput(line.to_string()));
        self.echo_and_write(line);
        if self.cache {
            self.shared.append_stdout(self.epoch, line);
        }
    }

    /// Stderr lines raise their own event, are echoed and written like stdout
    /// so they are not missed, and are kept in the error cache.
    pub(crate) fn handle_stderr_line(&self, line: &str) {
        if !self.shared.is_current(self.epoch) {
            return;
        }
        self.shared
            .emit(&SupervisorEvent::ConsoleError(line.to_string()));
        self.echo_and_write(line);
        self.shared.append_stderr(self.epoch, line);
    }

    fn echo_and_write(&self, line: &str) {
        if self.echo {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            let _ = writeln!(handle, "{line}");
        }

        if let Ok(mut guard) = self.file.lock()
            && let Some(file) = guard.as_mut()
        {
            file.write_line(line);
        }
    }
}

/// Which pipe a reader thread drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn as_str(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

/// Spawns a thread that reads `pipe` line by line and hands each line to `router`.
pub(crate) fn spawn_reader<R>(
    label: &str,
    stream: Stream,
    pipe: R,
    router: Arc<OutputRouter>,
) -> io::Result<thread::JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("{label}-{}", stream.as_str()))
        .spawn(move || {
            let reader = BufReader::new(pipe);
            let result = for_each_line(reader, |line| match stream {
                Stream::Stdout => router.handle_stdout_line(line),
                Stream::Stderr => router.handle_stderr_line(line),
            });
            if let Err(err) = result {
                debug!("{} reader stopped: {err}", stream.as_str());
            }
        })
}

/// Calls `on_line` for every line of `reader`, without the trailing line break.
///
/// Invalid UTF-8 is replaced rather than ending the stream.
pub(crate) fn for_each_line<R, F>(mut reader: R, mut on_line: F) -> io::Result<()>
where
    R: BufRead,
    F: FnMut(&str),
{
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf)?;
        if read == 0 {
            return Ok(());
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        on_line(&String::from_utf8_lossy(&buf));
    }
}
