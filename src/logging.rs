use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

// ── DeferredFileWriter ───────────────────────────────────

/// A `MakeWriter` that discards writes until a file is attached with
/// `DeferredFileHandle::set_file`.
///
/// The subscriber is installed before the config (which names the log file)
/// has been loaded.
#[derive(Clone)]
pub struct DeferredFileWriter {
    inner: Arc<Mutex<Option<File>>>,
}

#[derive(Clone)]
pub struct DeferredFileHandle {
    inner: Arc<Mutex<Option<File>>>,
}

fn lock(inner: &Mutex<Option<File>>) -> MutexGuard<'_, Option<File>> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DeferredFileWriter {
    pub fn new() -> (Self, DeferredFileHandle) {
        let inner = Arc::new(Mutex::new(None));
        (
            Self {
                inner: inner.clone(),
            },
            DeferredFileHandle { inner },
        )
    }
}

impl DeferredFileHandle {
    /// Start appending to `path`.
    pub fn set_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *lock(&self.inner) = Some(file);
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        lock(&self.inner).is_some()
    }
}

pub struct DeferredWriter {
    inner: Arc<Mutex<Option<File>>>,
}

impl std::io::Write for DeferredWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DeferredFileWriter {
    type Writer = DeferredWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DeferredWriter {
            inner: self.inner.clone(),
        }
    }
}

// ── subscriber ───────────────────────────────────────────

/// Filter for the stderr layer. stdout carries command output and module
/// JSON, so logs never go there.
pub fn terminal_filter(verbose: u8, quiet: bool) -> EnvFilter {
    if quiet {
        return EnvFilter::new("off");
    }
    match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("qops=info")),
        1 => EnvFilter::new("qops=debug"),
        _ => EnvFilter::new("trace"),
    }
}

/// Install the global subscriber: a filtered stderr layer plus a file layer
/// that stays silent until the returned handle is given a path.
pub fn init(verbose: u8, quiet: bool) -> DeferredFileHandle {
    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(terminal_filter(verbose, quiet));

    let (file_writer, file_handle) = DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("qops=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    file_handle
}
