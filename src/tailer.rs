use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const TAIL_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailRead {
    Unchanged,
    Appended(Vec<String>),
    /// The file shrank (rotation or truncation); carries every current line.
    Truncated(Vec<String>),
}

/// Line-count based tail position over a single log file. Reads are
/// serialized by the position lock.
pub struct LogTailer {
    path: PathBuf,
    last_read_line_count: Mutex<usize>,
}

impl LogTailer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_read_line_count: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn line_count(&self) -> usize {
        *self.last_read_line_count.lock().await
    }

    pub async fn reset(&self) {
        *self.last_read_line_count.lock().await = 0;
    }

    /// Reads the whole file and returns the lines past the stored position.
    /// A missing file reads as unchanged.
    pub async fn read_new_lines(&self) -> Result<TailRead, String> {
        let mut last_read_line_count = self.last_read_line_count.lock().await;

        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(TailRead::Unchanged),
            Err(error) => {
                return Err(format!(
                    "Failed to read game log '{}': {error}",
                    self.path.display()
                ));
            }
        };

        let content = String::from_utf8_lossy(&bytes);
        Ok(slice_new_lines(&content, &mut last_read_line_count))
    }
}

pub fn slice_new_lines(content: &str, last_read_line_count: &mut usize) -> TailRead {
    let lines: Vec<&str> = content.lines().collect();
    let current_line_count = lines.len();

    if current_line_count < *last_read_line_count {
        *last_read_line_count = current_line_count;
        return TailRead::Truncated(lines.into_iter().map(str::to_string).collect());
    }

    if current_line_count == *last_read_line_count {
        return TailRead::Unchanged;
    }

    let appended = lines[*last_read_line_count..]
        .iter()
        .map(|line| line.to_string())
        .collect();
    *last_read_line_count = current_line_count;
    TailRead::Appended(appended)
}

/// Runs the notification watcher and the fallback poll against one file and
/// forwards every non-empty read. A watcher that cannot start leaves polling only.
pub fn spawn_tail_watch(
    tailer: Arc<LogTailer>,
    poll_interval: Duration,
) -> (JoinHandle<()>, mpsc::Receiver<TailRead>) {
    let (read_sender, read_receiver) = mpsc::channel(TAIL_CHANNEL_CAPACITY);
    let (watcher, mut notify_receiver) = match start_watcher(tailer.path()) {
        Ok((watcher, receiver)) => (Some(watcher), Some(receiver)),
        Err(error) => {
            tracing::warn!(
                path = %tailer.path().display(),
                watch_error = %error,
                "File notifications unavailable, falling back to polling"
            );
            (None, None)
        }
    };

    let handle = tokio::spawn(async move {
        let _watcher = watcher;
        let mut poll = tokio::time::interval(poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = poll.tick() => {}
                notification = next_notification(&mut notify_receiver) => match notification {
                    Some(Ok(event)) => {
                        if !is_relevant_notification(&event, tailer.path()) {
                            continue;
                        }
                    }
                    Some(Err(error)) => {
                        tracing::warn!(watch_error = %error, "Game log watcher error");
                        continue;
                    }
                    None => {
                        tracing::debug!("Game log watcher channel closed, polling only");
                        notify_receiver = None;
                        continue;
                    }
                },
            }

            match tailer.read_new_lines().await {
                Ok(TailRead::Unchanged) => {}
                Ok(read) => {
                    if read_sender.send(read).await.is_err() {
                        tracing::debug!("Tail read receiver dropped, stopping watch");
                        break;
                    }
                }
                Err(error) => {
                    tracing::warn!(path = %tailer.path().display(), read_error = %error, "Failed to read game log update");
                }
            }
        }
    });

    (handle, read_receiver)
}

type NotificationReceiver = mpsc::UnboundedReceiver<Result<Event, notify::Error>>;

fn start_watcher(log_path: &Path) -> Result<(notify::RecommendedWatcher, NotificationReceiver), String> {
    let (notify_sender, notify_receiver) = mpsc::unbounded_channel::<Result<Event, notify::Error>>();

    let mut watcher = notify::recommended_watcher(move |result| {
        if notify_sender.send(result).is_err() {
            tracing::debug!("Game log watcher notification receiver dropped");
        }
    })
    .map_err(|error| error.to_string())?;

    let watch_directory = log_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    watcher
        .watch(watch_directory, RecursiveMode::NonRecursive)
        .map_err(|error| error.to_string())?;

    Ok((watcher, notify_receiver))
}

async fn next_notification(
    receiver: &mut Option<NotificationReceiver>,
) -> Option<Result<Event, notify::Error>> {
    match receiver.as_mut() {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

fn is_relevant_notification(event: &Event, log_path: &Path) -> bool {
    let relevant_kind = matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    );
    if !relevant_kind {
        return false;
    }

    let Some(log_file_name) = log_path.file_name() else {
        return false;
    };

    event.paths.iter().any(|path| {
        path == log_path
            || path
                .file_name()
                .map(|file_name| file_name == log_file_name)
                .unwrap_or(false)
    })
}
