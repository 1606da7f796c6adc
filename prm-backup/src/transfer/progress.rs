//! Byte-level progress reporting for archive appends and uploads.
//!
//! Progress is a side channel: observers are optional, are called
//! synchronously from the copy loop, and must return promptly.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Minimum delay between two progress events for the same file
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Progress snapshot for one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Name of the file being copied
    pub file_name: String,

    /// Bytes copied so far
    pub transferred: u64,

    /// Bytes expected in total
    pub total: u64,
}

impl ProgressEvent {
    /// Percentage complete (0-100)
    pub fn percent(&self) -> f64 {
        if self.total > 0 {
            ((self.transferred as f64 / self.total as f64) * 100.0).min(100.0)
        } else {
            100.0
        }
    }
}

/// Callback for progress updates
pub type ProgressObserver = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Observer that writes progress events to the debug log
pub fn logging_observer(stage: &'static str) -> ProgressObserver {
    Arc::new(move |event: &ProgressEvent| {
        tracing::debug!(
            stage,
            "{}: {} / {} ({:.1}%)",
            event.file_name,
            format_bytes(event.transferred),
            format_bytes(event.total),
            event.percent()
        );
    })
}

/// Rate-limits progress events for a single file.
///
/// Without an observer every call is a no-op.
pub struct ThrottledProgress {
    file_name: String,
    total: u64,
    interval: Duration,
    started: Instant,
    last_update: Instant,
    observer: Option<ProgressObserver>,
}

impl ThrottledProgress {
    /// Create a tracker that emits at most once per [`DEFAULT_INTERVAL`]
    pub fn new(file_name: impl Into<String>, total: u64, observer: Option<ProgressObserver>) -> Self {
        let now = Instant::now();
        Self {
            file_name: file_name.into(),
            total,
            interval: DEFAULT_INTERVAL,
            started: now,
            last_update: now,
            observer,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Record that `transferred` bytes have been copied so far
    pub fn advance(&mut self, transferred: u64) {
        if self.observer.is_none() {
            return;
        }
        let now = Instant::now();
        if now.duration_since(self.last_update) >= self.interval {
            self.last_update = now;
            self.emit(transferred);
        }
    }

    /// Final update once the copy completed
    pub fn finish(&mut self, transferred: u64) {
        self.emit(transferred);
    }

    /// Average speed in bytes/second since the tracker was created
    pub fn average_speed(&self, transferred: u64) -> u64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (transferred as f64 / elapsed) as u64
        } else {
            0
        }
    }

    fn emit(&self, transferred: u64) {
        if let Some(observer) = &self.observer {
            observer(&ProgressEvent {
                file_name: self.file_name.clone(),
                transferred,
                total: self.total,
            });
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::thread;

    fn recording_observer() -> (ProgressObserver, Arc<Mutex<Vec<ProgressEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let observer: ProgressObserver = Arc::new(move |event: &ProgressEvent| {
            sink.lock().unwrap().push(event.clone());
        });
        (observer, events)
    }

    #[test]
    fn test_event_percent() {
        let event = ProgressEvent {
            file_name: "a.txt".to_string(),
            transferred: 500,
            total: 1000,
        };
        assert!((event.percent() - 50.0).abs() < 0.01);

        let empty = ProgressEvent {
            file_name: "empty.txt".to_string(),
            transferred: 0,
            total: 0,
        };
        assert!((empty.percent() - 100.0).abs() < 0.01);
    }

    #[test]
    fn test_throttle_limits_updates() {
        let (observer, events) = recording_observer();
        let mut progress = ThrottledProgress::new("big.bin", 1000, Some(observer));

        for transferred in (100..=900).step_by(100) {
            progress.advance(transferred);
        }
        assert!(events.lock().unwrap().is_empty());

        progress.finish(1000);
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].transferred, 1000);
        assert_eq!(events[0].file_name, "big.bin");
    }

    #[test]
    fn test_throttle_emits_after_interval() {
        let (observer, events) = recording_observer();
        let mut progress = ThrottledProgress::new("slow.bin", 1000, Some(observer))
            .with_interval(Duration::from_millis(20));

        thread::sleep(Duration::from_millis(40));
        progress.advance(400);
        progress.advance(450);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].transferred, 400);
    }

    #[test]
    fn test_without_observer_is_noop() {
        let mut progress = ThrottledProgress::new("quiet.bin", 10, None);
        progress.advance(5);
        progress.finish(10);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(1024), "1.00 KB/s");
        assert_eq!(format_speed(1024 * 1024), "1.00 MB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3665), "1h 1m");
    }
}
