//! Runtime warning output.
//!
//! Diagnostics go through the `log` facade at the usual levels; the library
//! never installs a logger, so hosts choose their own backend. Separately,
//! user-facing runtime warnings (most notably the spin lock deadlock
//! watchdog) are written verbatim to a redirectable error stream, which
//! defaults to stderr.

use std::fmt;
use std::io::{self, Write};
use std::sync::Mutex;

static ERROR_STREAM: Mutex<Option<Box<dyn Write + Send>>> = Mutex::new(None);

/// Redirects runtime warnings to the given sink. Passing a fresh sink
/// replaces the previous one; the default is stderr.
pub fn set_error_stream(sink: Box<dyn Write + Send>) {
    *ERROR_STREAM.lock().unwrap() = Some(sink);
}

#[doc(hidden)]
pub fn write_error_stream(args: fmt::Arguments) {
    let mut guard = ERROR_STREAM.lock().unwrap();
    match guard.as_mut() {
        Some(sink) => {
            let _ = sink.write_fmt(args);
            let _ = sink.flush();
        }
        None => {
            let _ = io::stderr().write_fmt(args);
        }
    }
}

/// Writes one line, verbatim plus a trailing newline, to the error stream.
macro_rules! error_stream {
    ($($arg:tt)*) => {
        $crate::logger::write_error_stream(format_args!("{}\n", format_args!($($arg)*)))
    };
}

pub(crate) use error_stream;
