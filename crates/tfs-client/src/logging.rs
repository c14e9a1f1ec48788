//! Log output control
//!
//! The client installs a `tracing` subscriber whose filter and output can be
//! swapped at runtime: `set_level` reloads the `EnvFilter`, `set_file`
//! redirects the fmt layer's writer. `RUST_LOG` wins over the configured
//! level at startup.

use parking_lot::{Mutex, MutexGuard};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, LazyLock, OnceLock};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{
    EnvFilter, Registry, layer::SubscriberExt, reload, util::SubscriberInitExt,
};

use tfs_common::{Error, LogConfig, Result};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

static FILTER: OnceLock<FilterHandle> = OnceLock::new();
static SINK: LazyLock<LogSink> = LazyLock::new(LogSink::stderr);

/// Writer shared by every formatted event; the target can be replaced
#[derive(Clone)]
pub struct LogSink(Arc<Mutex<Box<dyn Write + Send>>>);

impl LogSink {
    fn stderr() -> Self {
        Self(Arc::new(Mutex::new(Box::new(io::stderr()))))
    }

    fn replace(&self, target: Box<dyn Write + Send>) {
        let mut current = self.0.lock();
        let _ = current.flush();
        *current = target;
    }
}

pub struct SinkWriter<'a>(MutexGuard<'a, Box<dyn Write + Send>>);

impl Write for SinkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = SinkWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter(self.0.lock())
    }
}

fn parse_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(level)
        .map_err(|e| Error::Configuration(format!("invalid log level {level:?}: {e}")))
}

/// Install the client's subscriber.
///
/// Fails with `Configuration` when another global subscriber is already set.
pub fn init(config: &LogConfig) -> Result<()> {
    if FILTER.get().is_some() {
        set_level(&config.level)?;
    } else {
        let filter = EnvFilter::try_from_default_env().or_else(|_| parse_filter(&config.level))?;
        let (filter, handle) = reload::Layer::new(filter);
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(SINK.clone()))
            .try_init()
            .map_err(|e| Error::Configuration(format!("logging already initialized: {e}")))?;
        let _ = FILTER.set(handle);
    }

    if let Some(file) = &config.file {
        set_file(file)?;
    }
    Ok(())
}

/// Replace the active filter. An empty level is ignored.
pub fn set_level(level: &str) -> Result<()> {
    if level.trim().is_empty() {
        return Ok(());
    }
    let filter = parse_filter(level)?;
    let handle = FILTER
        .get()
        .ok_or_else(|| Error::Configuration("client logging is not initialized".into()))?;
    handle
        .reload(filter)
        .map_err(|e| Error::internal(format!("reloading log filter: {e}")))?;
    tracing::info!(level, "log level changed");
    Ok(())
}

/// Append log output to `path`. An empty path is ignored.
pub fn set_file(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Ok(());
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    SINK.replace(Box::new(file));
    tracing::info!(path = %path.display(), "log output redirected");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filter() {
        assert!(parse_filter("debug").is_ok());
        assert!(parse_filter("tfs_client=trace,warn").is_ok());
        assert!(matches!(
            parse_filter("tfs_client=loud"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_empty_inputs_are_ignored() {
        assert!(set_level("").is_ok());
        assert!(set_file(Path::new("")).is_ok());
    }

    #[test]
    fn test_sink_redirect() {
        let sink = LogSink::stderr();
        let file = tempfile::NamedTempFile::new().unwrap();
        let target = OpenOptions::new().append(true).open(file.path()).unwrap();
        sink.replace(Box::new(target));

        sink.make_writer().write_all(b"hello\n").unwrap();
        sink.make_writer().flush().unwrap();
        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), "hello\n");
    }
}
