//! Subscriber setup for the `rebind` binary
//!
//! Human readable output on stderr. `RUST_LOG` overrides the level picked
//! from `-q`/`-v`, and identical warnings and errors are only printed once.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Output level selected on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Verbosity {
    /// Errors only
    Quiet,
    /// Progress and warnings
    #[default]
    Normal,
    /// Every processed record
    Verbose,
}

impl Verbosity {
    pub(crate) fn directive(self) -> &'static str {
        match self {
            Self::Quiet => "error",
            Self::Normal => "info",
            Self::Verbose => "debug",
        }
    }
}

/// Drops warnings and errors whose message was already emitted
///
/// Less severe events always pass, so per-record progress does not grow
/// the set of remembered messages.
#[derive(Debug, Default)]
pub(crate) struct DuplicateFilter {
    seen: Mutex<HashSet<String>>,
}

struct MessageVisitor(Option<String>);

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.0 = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = Some(format!("{value:?}"));
        }
    }
}

impl<S: Subscriber> Layer<S> for DuplicateFilter {
    fn event_enabled(&self, event: &Event<'_>, _ctx: Context<'_, S>) -> bool {
        if *event.metadata().level() > Level::WARN {
            return true;
        }
        let mut visitor = MessageVisitor(None);
        event.record(&mut visitor);
        match visitor.0 {
            Some(message) => self.seen.lock().insert(message),
            None => true,
        }
    }
}

/// Install the global subscriber
///
/// Does nothing if one is already installed.
pub(crate) fn init(verbosity: Verbosity) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.directive()));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(DuplicateFilter::default())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .without_time()
                .compact(),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counter(Arc<AtomicUsize>);

    impl<S: Subscriber> Layer<S> for Counter {
        fn on_event(&self, _event: &Event<'_>, _ctx: Context<'_, S>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn repeated_messages_are_dropped() {
        let count = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry()
            .with(DuplicateFilter::default())
            .with(Counter(Arc::clone(&count)));

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("Missing factory for module1 Factory");
            tracing::warn!("Missing factory for module1 Factory");
            tracing::warn!("Missing factory for module2 OtherFactory");
            tracing::info!(oid = 3, "Processing OID 0x03");
        });

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn repeated_progress_messages_pass() {
        let count = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry()
            .with(DuplicateFilter::default())
            .with(Counter(Arc::clone(&count)));

        tracing::subscriber::with_default(subscriber, || {
            for _ in 0..3 {
                tracing::info!("Processing OID 0x03");
                tracing::debug!("iterating records");
            }
            tracing::error!("Stopped processing, due to: boom");
            tracing::error!("Stopped processing, due to: boom");
        });

        assert_eq!(count.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn verbosity_levels() {
        assert_eq!(Verbosity::Quiet.directive(), "error");
        assert_eq!(Verbosity::default().directive(), "info");
        assert_eq!(Verbosity::Verbose.directive(), "debug");
    }
}
