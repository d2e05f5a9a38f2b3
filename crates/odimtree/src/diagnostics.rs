//! Engine-scoped diagnostics routed through `tracing`.
//!
//! Each engine carries its own [`Diagnostics`] and runs every entry point
//! inside [`Diagnostics::scope`], so the sink can be silenced, redirected to
//! an explicit subscriber, or left to the global default without touching
//! other engines. Diagnostics never influence control flow.

use std::fmt;

use tracing::{dispatcher, Dispatch};

/// Severity levels of the legacy toolkit, mapped onto `tracing` levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Maps to TRACE.
    Spew,
    Debug,
    /// WARN with `deprecated = true`.
    Deprecated,
    Info,
    Warning,
    Error,
    /// ERROR with `critical = true`.
    Critical,
}

#[derive(Clone)]
enum Sink {
    /// Explicit dispatcher; `Dispatch::none()` when silent.
    Scoped(Dispatch),
    /// Whatever subscriber is current where the engine is called.
    Inherit,
}

#[derive(Clone)]
pub struct Diagnostics {
    sink: Sink,
}

impl Diagnostics {
    /// Discard every event.
    pub fn silent() -> Diagnostics {
        Diagnostics {
            sink: Sink::Scoped(Dispatch::none()),
        }
    }

    /// Forward to the thread or global default subscriber.
    pub fn inherit() -> Diagnostics {
        Diagnostics { sink: Sink::Inherit }
    }

    pub fn with_dispatch(dispatch: Dispatch) -> Diagnostics {
        Diagnostics {
            sink: Sink::Scoped(dispatch),
        }
    }

    /// Run `f` with this sink installed as the current dispatcher.
    pub fn scope<T>(&self, f: impl FnOnce() -> T) -> T {
        match &self.sink {
            Sink::Scoped(dispatch) => dispatcher::with_default(dispatch, f),
            Sink::Inherit => f(),
        }
    }

    /// Emit a message with a source location, for collaborators that report
    /// through the engine's sink.
    pub fn report(&self, severity: Severity, file: &str, line: u32, message: &str) {
        self.scope(|| match severity {
            Severity::Spew => tracing::trace!(source_file = file, source_line = line, "{message}"),
            Severity::Debug => tracing::debug!(source_file = file, source_line = line, "{message}"),
            Severity::Deprecated => {
                tracing::warn!(source_file = file, source_line = line, deprecated = true, "{message}")
            }
            Severity::Info => tracing::info!(source_file = file, source_line = line, "{message}"),
            Severity::Warning => tracing::warn!(source_file = file, source_line = line, "{message}"),
            Severity::Error => tracing::error!(source_file = file, source_line = line, "{message}"),
            Severity::Critical => {
                tracing::error!(source_file = file, source_line = line, critical = true, "{message}")
            }
        })
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Diagnostics::silent()
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sink = match self.sink {
            Sink::Scoped(_) => "scoped",
            Sink::Inherit => "inherit",
        };
        f.debug_struct("Diagnostics").field("sink", &sink).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if let Ok(mut inner) = self.0.lock() {
                inner.extend_from_slice(buf);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    fn capturing() -> (Diagnostics, Captured) {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        (Diagnostics::with_dispatch(Dispatch::new(subscriber)), captured)
    }

    #[test]
    fn severity_mapping() {
        let (diag, captured) = capturing();
        diag.report(Severity::Spew, "scan.rs", 10, "ray loop");
        diag.report(Severity::Deprecated, "scan.rs", 11, "old call");
        diag.report(Severity::Critical, "scan.rs", 12, "volume lost");
        let text = captured.text();
        assert!(text.contains("TRACE") && text.contains("ray loop"));
        assert!(text.contains("WARN") && text.contains("deprecated=true"));
        assert!(text.contains("ERROR") && text.contains("critical=true"));
        assert!(text.contains("scan.rs"));
    }

    #[test]
    fn silent_sink_swallows_events() {
        let (outer, captured) = capturing();
        outer.scope(|| {
            Diagnostics::silent().report(Severity::Error, "x.rs", 1, "hidden");
            tracing::info!("visible");
        });
        let text = captured.text();
        assert!(!text.contains("hidden"));
        assert!(text.contains("visible"));
    }

    #[test]
    fn inherit_uses_current_subscriber() {
        let (outer, captured) = capturing();
        outer.scope(|| Diagnostics::inherit().report(Severity::Info, "y.rs", 2, "forwarded"));
        assert!(captured.text().contains("forwarded"));
    }
}
