//! Asynchronous log sink for pipeline workers.
//!
//! Worker threads must never block on logging IO, so messages go through
//! a bounded queue drained by one consumer thread that forwards them to
//! the `log` facade. When the queue reaches its high-water mark the
//! oldest message is dropped, and the number of dropped messages is
//! reported once the queue drains. A synchronous mode bypasses the queue
//! for deterministic tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::{log, Level};

/// Message severities, from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Severity {
    /// Errors.
    Error = 0,
    /// Warnings.
    Warning = 1,
    /// Informational messages.
    Info = 2,
    /// Verbose progress messages.
    Verbose = 3,
    /// Debug messages.
    Debug = 4,
}

impl Severity {
    fn to_level(self) -> Level {
        match self {
            Severity::Error => Level::Error,
            Severity::Warning => Level::Warn,
            Severity::Info => Level::Info,
            Severity::Verbose => Level::Debug,
            Severity::Debug => Level::Trace,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Severity::Error,
            1 => Severity::Warning,
            2 => Severity::Info,
            3 => Severity::Verbose,
            _ => Severity::Debug,
        }
    }
}

/// Reporter configuration.
#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// Queue high-water mark, in messages.
    pub queue_size: usize,
    /// When true, messages are forwarded from the caller's thread.
    pub synchronous: bool,
    /// Most verbose severity to let through.
    pub max_severity: Severity,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            queue_size: 512,
            synchronous: false,
            max_severity: Severity::Verbose,
        }
    }
}

struct Queue {
    messages: VecDeque<(Severity, String)>,
    shutdown: bool,
}

struct Inner {
    queue: Mutex<Queue>,
    cond: Condvar,
    high_water: usize,
    synchronous: bool,
    max_severity: AtomicU8,
    dropped: AtomicU64,
}

/// Cloneable handle to the shared report sink.
#[derive(Clone)]
pub struct Reporter {
    inner: Arc<Inner>,
}

/// Owner of the consumer thread; shuts the reporter down when told to.
pub struct ReporterThread {
    reporter: Reporter,
    consumer: Option<thread::JoinHandle<()>>,
}

impl Reporter {
    /// Create a reporter and its consumer thread (unless synchronous).
    pub fn new(config: ReporterConfig) -> ReporterThread {
        let inner = Arc::new(Inner {
            queue: Mutex::new(Queue {
                messages: VecDeque::with_capacity(config.queue_size),
                shutdown: false,
            }),
            cond: Condvar::new(),
            high_water: config.queue_size.max(1),
            synchronous: config.synchronous,
            max_severity: AtomicU8::new(config.max_severity as u8),
            dropped: AtomicU64::new(0),
        });

        let consumer = if config.synchronous {
            None
        } else {
            let consumer_inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("ts-report".into())
                .spawn(move || consume(consumer_inner))
                .ok()
        };

        ReporterThread {
            reporter: Reporter { inner },
            consumer,
        }
    }

    /// Most verbose severity currently let through.
    pub fn max_severity(&self) -> Severity {
        Severity::from_u8(self.inner.max_severity.load(Ordering::Relaxed))
    }

    /// Change the severity filter.
    pub fn set_max_severity(&self, severity: Severity) {
        self.inner.max_severity.store(severity as u8, Ordering::Relaxed);
    }

    /// Number of messages dropped at the high-water mark so far.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Queue one message. Never blocks in asynchronous mode.
    pub fn report(&self, severity: Severity, message: impl Into<String>) {
        if severity > self.max_severity() {
            return;
        }
        let message = message.into();
        if self.inner.synchronous {
            log!(severity.to_level(), "{message}");
            return;
        }
        let mut q = match self.inner.queue.lock() {
            Ok(q) => q,
            Err(_) => return,
        };
        if q.shutdown {
            return;
        }
        if q.messages.len() >= self.inner.high_water {
            q.messages.pop_front();
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
        q.messages.push_back((severity, message));
        drop(q);
        self.inner.cond.notify_one();
    }

    /// Report an error.
    pub fn error(&self, message: impl Into<String>) {
        self.report(Severity::Error, message);
    }

    /// Report a warning.
    pub fn warning(&self, message: impl Into<String>) {
        self.report(Severity::Warning, message);
    }

    /// Report an informational message.
    pub fn info(&self, message: impl Into<String>) {
        self.report(Severity::Info, message);
    }

    /// Report a verbose progress message.
    pub fn verbose(&self, message: impl Into<String>) {
        self.report(Severity::Verbose, message);
    }

    /// Report a debug message.
    pub fn debug(&self, message: impl Into<String>) {
        self.report(Severity::Debug, message);
    }
}

impl ReporterThread {
    /// Handle to hand out to producers.
    pub fn handle(&self) -> Reporter {
        self.reporter.clone()
    }

    /// Drain the queue and stop the consumer thread.
    pub fn shutdown(mut self) {
        if let Ok(mut q) = self.reporter.inner.queue.lock() {
            q.shutdown = true;
        }
        self.reporter.inner.cond.notify_all();
        if let Some(consumer) = self.consumer.take() {
            let _ = consumer.join();
        }
    }
}

fn consume(inner: Arc<Inner>) {
    loop {
        let (severity, message) = {
            let mut q = match inner.queue.lock() {
                Ok(q) => q,
                Err(_) => return,
            };
            loop {
                if let Some(msg) = q.messages.pop_front() {
                    break msg;
                }
                if q.shutdown {
                    let dropped = inner.dropped.swap(0, Ordering::Relaxed);
                    if dropped > 0 {
                        log::warn!("{dropped} log messages dropped");
                    }
                    return;
                }
                q = match inner.cond.wait(q) {
                    Ok(q) => q,
                    Err(_) => return,
                };
            }
        };
        log!(severity.to_level(), "{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_filter() {
        let rt = Reporter::new(ReporterConfig {
            synchronous: true,
            max_severity: Severity::Warning,
            ..ReporterConfig::default()
        });
        let rep = rt.handle();
        assert_eq!(rep.max_severity(), Severity::Warning);
        // Filtered messages never reach the queue or the sink.
        rep.info("suppressed");
        rep.set_max_severity(Severity::Debug);
        assert_eq!(rep.max_severity(), Severity::Debug);
        rt.shutdown();
    }

    #[test]
    fn test_drop_oldest_at_high_water() {
        // No consumer: messages pile up in the queue.
        let inner = Arc::new(Inner {
            queue: Mutex::new(Queue {
                messages: VecDeque::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
            high_water: 4,
            synchronous: false,
            max_severity: AtomicU8::new(Severity::Debug as u8),
            dropped: AtomicU64::new(0),
        });
        let rep = Reporter { inner };
        for i in 0..10 {
            rep.info(format!("message {i}"));
        }
        let q = rep.inner.queue.lock().unwrap();
        assert_eq!(q.messages.len(), 4);
        // Oldest messages were discarded first.
        assert_eq!(q.messages.front().unwrap().1, "message 6");
        drop(q);
        assert_eq!(rep.dropped(), 6);
    }

    #[test]
    fn test_consumer_shutdown_drains() {
        let rt = Reporter::new(ReporterConfig::default());
        let rep = rt.handle();
        for i in 0..100 {
            rep.verbose(format!("progress {i}"));
        }
        rt.shutdown();
    }
}
