//! Framing of board replies.
//!
//! The board answers every line-group with a frame:
//!
//! ```text
//! OK:start
//! <zero or more data lines>
//! OK:ready
//! ```
//!
//! [`ResponseReader`] turns a stream of lines into one [`Response`] per frame,
//! lazily, bounding the wait for each frame by a per-message deadline.

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

pub const FRAME_START: &str = "OK:start";
pub const FRAME_READY: &str = "OK:ready";
pub const TIMEOUT_MSG: &str = "Timeout expired";

/// Default bound on the wait for a single reply frame.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// One completed reply frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Response {
    /// Lines between `OK:start` and `OK:ready`.
    pub data: Vec<String>,
    /// Every raw line seen since the previous frame, markers included.
    pub msg: Vec<String>,
}

/// Anything that can hand out received lines one at a time.
pub trait LineSource {
    /// Returns the next line, or `None` if nothing arrived within `timeout`.
    fn next_line(&mut self, timeout: Duration) -> io::Result<Option<String>>;
}

/// A fixed script of lines, used to replay captured traffic.
impl LineSource for VecDeque<String> {
    fn next_line(&mut self, _timeout: Duration) -> io::Result<Option<String>> {
        Ok(self.pop_front())
    }
}

impl<S: LineSource + ?Sized> LineSource for &mut S {
    fn next_line(&mut self, timeout: Duration) -> io::Result<Option<String>> {
        (**self).next_line(timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Scanning,
    Collecting,
}

/// Result of reading a fixed number of frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collected {
    pub expected: usize,
    pub responses: Vec<Response>,
    /// Set when the deadline expired; holds the data gathered so far and
    /// `msg: ["Timeout expired"]`.
    pub timed_out: Option<Response>,
}

impl Collected {
    pub fn is_complete(&self) -> bool {
        self.timed_out.is_none() && self.responses.len() == self.expected
    }
}

/// Frames lines from `source` into at most `expected` responses.
///
/// Iterating yields each frame as soon as its `OK:ready` arrives. The
/// iterator ends early, without error, when a frame does not complete before
/// the deadline; [`ResponseReader::timed_out`] then holds the partial frame.
pub struct ResponseReader<S> {
    source: S,
    deadline: Duration,
    remaining: usize,
    state: ReaderState,
    data: Vec<String>,
    msg: Vec<String>,
    timed_out: Option<Response>,
    finished: bool,
}

impl<S: LineSource> ResponseReader<S> {
    pub fn new(source: S, expected: usize, deadline: Duration) -> Self {
        Self {
            source,
            deadline,
            remaining: expected,
            state: ReaderState::Scanning,
            data: Vec::new(),
            msg: Vec::new(),
            timed_out: None,
            finished: false,
        }
    }

    /// Drains the reader into a [`Collected`].
    pub fn collect_all(mut self) -> io::Result<Collected> {
        let expected = self.remaining;
        let mut responses = Vec::with_capacity(expected);
        while let Some(response) = self.next() {
            responses.push(response?);
        }
        Ok(Collected {
            expected,
            responses,
            timed_out: self.timed_out.take(),
        })
    }

    fn expire(&mut self) {
        warn!(partial = self.data.len(), "reply frame did not complete in time");
        self.timed_out = Some(Response {
            data: mem::take(&mut self.data),
            msg: vec![TIMEOUT_MSG.to_string()],
        });
        self.finished = true;
    }
}

impl<S: LineSource> Iterator for ResponseReader<S> {
    type Item = io::Result<Response>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.remaining == 0 {
            return None;
        }
        let started = Instant::now();
        loop {
            let left = self.deadline.saturating_sub(started.elapsed());
            if left.is_zero() {
                self.expire();
                return None;
            }
            let line = match self.source.next_line(left) {
                Ok(Some(line)) => line,
                // An empty read counts as an expired deadline.
                Ok(None) => {
                    self.expire();
                    return None;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            };
            let line = line.trim().to_string();
            self.msg.push(line.clone());

            match self.state {
                ReaderState::Scanning if line.starts_with(FRAME_START) => {
                    self.state = ReaderState::Collecting;
                    self.data.clear();
                }
                ReaderState::Scanning => {}
                ReaderState::Collecting if line.starts_with(FRAME_READY) => {
                    self.state = ReaderState::Scanning;
                    self.remaining -= 1;
                    let response = Response {
                        data: mem::take(&mut self.data),
                        msg: mem::take(&mut self.msg),
                    };
                    debug!(data = ?response.data, "reply frame complete");
                    return Some(Ok(response));
                }
                ReaderState::Collecting => self.data.push(line),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(lines: &[&str]) -> VecDeque<String> {
        lines.iter().map(|l| l.to_string()).collect()
    }

    fn strings(lines: &[&str]) -> Vec<String> {
        lines.iter().map(|l| l.to_string()).collect()
    }

    /// Emits its lines, then reports silence after sleeping for the timeout.
    struct SlowSource {
        lines: VecDeque<String>,
    }

    impl LineSource for SlowSource {
        fn next_line(&mut self, timeout: Duration) -> io::Result<Option<String>> {
            match self.lines.pop_front() {
                Some(line) => Ok(Some(line)),
                None => {
                    std::thread::sleep(timeout);
                    Ok(None)
                }
            }
        }
    }

    #[test]
    fn single_frame() {
        let reader = ResponseReader::new(
            script(&["OK:start", "d1", "OK:ready"]),
            1,
            DEFAULT_REPLY_TIMEOUT,
        );
        let collected = reader.collect_all().unwrap();
        assert!(collected.is_complete());
        assert_eq!(
            collected.responses,
            vec![Response {
                data: strings(&["d1"]),
                msg: strings(&["OK:start", "d1", "OK:ready"]),
            }]
        );
    }

    #[test]
    fn msg_includes_noise_before_frame() {
        let mut reader = ResponseReader::new(
            script(&["booting", "OK:start", "OK:ready", "OK:start", "a", "b", "OK:ready"]),
            2,
            DEFAULT_REPLY_TIMEOUT,
        );
        let first = reader.next().unwrap().unwrap();
        assert!(first.data.is_empty());
        assert_eq!(first.msg, strings(&["booting", "OK:start", "OK:ready"]));
        let second = reader.next().unwrap().unwrap();
        assert_eq!(second.data, strings(&["a", "b"]));
        assert_eq!(second.msg, strings(&["OK:start", "a", "b", "OK:ready"]));
        assert!(reader.next().is_none());
    }

    #[test]
    fn ready_while_scanning_is_not_a_frame() {
        let collected = ResponseReader::new(
            script(&["OK:ready", "OK:start", "x", "OK:ready"]),
            1,
            DEFAULT_REPLY_TIMEOUT,
        )
        .collect_all()
        .unwrap();
        assert_eq!(collected.responses.len(), 1);
        assert_eq!(collected.responses[0].data, strings(&["x"]));
        assert_eq!(collected.responses[0].msg.len(), 4);
    }

    #[test]
    fn stops_after_expected_count() {
        let mut lines = script(&["OK:start", "OK:ready", "OK:start", "late", "OK:ready"]);
        let collected = ResponseReader::new(&mut lines, 1, DEFAULT_REPLY_TIMEOUT)
            .collect_all()
            .unwrap();
        assert!(collected.is_complete());
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn empty_read_truncates_with_partial_data() {
        let collected = ResponseReader::new(
            script(&["OK:start", "d1", "OK:ready", "OK:start", "half"]),
            3,
            DEFAULT_REPLY_TIMEOUT,
        )
        .collect_all()
        .unwrap();
        assert!(!collected.is_complete());
        assert_eq!(collected.responses.len(), 1);
        assert_eq!(
            collected.timed_out,
            Some(Response {
                data: strings(&["half"]),
                msg: strings(&[TIMEOUT_MSG]),
            })
        );
    }

    #[test]
    fn deadline_bounds_the_wait() {
        let source = SlowSource {
            lines: script(&["OK:start"]),
        };
        let deadline = Duration::from_millis(50);
        let started = Instant::now();
        let collected = ResponseReader::new(source, 1, deadline).collect_all().unwrap();
        assert!(collected.responses.is_empty());
        assert!(collected.timed_out.is_some());
        assert!(started.elapsed() < deadline + Duration::from_millis(500));
    }

    #[test]
    fn io_error_is_propagated() {
        struct Broken;
        impl LineSource for Broken {
            fn next_line(&mut self, _timeout: Duration) -> io::Result<Option<String>> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"))
            }
        }
        let result = ResponseReader::new(Broken, 1, DEFAULT_REPLY_TIMEOUT).collect_all();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
    }
}
