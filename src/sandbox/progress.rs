//! Human-readable progress lines streamed to the terminal while a sandbox
//! starts. Lines carry ANSI colour and overwrite the current row until a
//! step completes.

use std::time::{Duration, Instant};

/// Receives progress lines; may be called any number of times.
pub type StatusSink<'a> = dyn Fn(&str) + Send + Sync + 'a;

/// A sink that discards everything.
pub fn no_status(_: &str) {}

const CLEAR_LINE: &str = "\r\x1b[K";
const RESET: &str = "\x1b[0m";

/// Measures one provisioning attempt and renders its steps.
pub struct Progress<'a> {
    sink: &'a StatusSink<'a>,
    started: Instant,
}

impl<'a> Progress<'a> {
    pub fn new(sink: &'a StatusSink<'a>, started: Instant) -> Self {
        Self { sink, started }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Elapsed time rendered for display.
    pub fn elapsed_label(&self) -> String {
        format_elapsed(self.elapsed())
    }

    /// An in-flight step; the next line overwrites it.
    pub fn pending(&self, message: &str) {
        (self.sink)(&format!("{CLEAR_LINE}\x1b[33m[ ] {message}{RESET}"));
    }

    pub fn done(&self, message: &str) {
        (self.sink)(&format!("{CLEAR_LINE}\x1b[32m[✓] {message}{RESET}\r\n"));
    }

    pub fn failed(&self, message: &str) {
        (self.sink)(&format!("{CLEAR_LINE}\x1b[31m[✗] {message}{RESET}\r\n"));
    }

    pub fn warn(&self, message: &str) {
        (self.sink)(&format!("{CLEAR_LINE}\x1b[33m[!] {message}{RESET}\r\n"));
    }

}

/// Rounds to milliseconds: `850ms`, `2.5s`, `1m4.25s`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let millis = elapsed.as_millis();
    if millis < 1000 {
        return format!("{millis}ms");
    }

    let minutes = millis / 60_000;
    let rest = millis % 60_000;
    let seconds = format!("{}.{:03}", rest / 1000, rest % 1000);
    let seconds = seconds.trim_end_matches('0').trim_end_matches('.');

    if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}
