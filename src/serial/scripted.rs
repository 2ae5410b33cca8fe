//! In-memory gateway used by tests and demos (exposed unconditionally).
//!
//! Clones share state, so a test can keep one handle while the engine owns
//! another: queue lines, script replies to commands, inspect what was
//! written.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use super::interface::LineTransport;
use super::{Result, SerialError};

#[derive(Debug, Clone)]
enum Incoming {
    Line(String),
    Failure(String),
}

#[derive(Debug, Default)]
struct ScriptState {
    open: bool,
    fail_open: bool,
    read_timeout: Duration,
    incoming: VecDeque<Incoming>,
    replies: Vec<(String, Vec<String>)>,
    written: Vec<String>,
    lines_served: usize,
    clears: usize,
    opens: usize,
    closes: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a line for a future `read_line`.
    pub fn push_line(&self, line: impl Into<String>) {
        self.state().incoming.push_back(Incoming::Line(line.into()));
    }

    pub fn push_lines<I, S>(&self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state();
        state.incoming.extend(lines.into_iter().map(|l| Incoming::Line(l.into())));
    }

    /// Queue an I/O failure; the read that reaches it returns an error.
    pub fn push_failure(&self, message: impl Into<String>) {
        self.state().incoming.push_back(Incoming::Failure(message.into()));
    }

    /// Queue `lines` whenever exactly `command` is written.
    pub fn reply_to<I, S>(&self, command: impl Into<String>, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let lines = lines.into_iter().map(Into::into).collect();
        self.state().replies.push((command.into(), lines));
    }

    /// Make subsequent `open` calls fail.
    pub fn fail_open(&self, fail: bool) {
        self.state().fail_open = fail;
    }

    pub fn written(&self) -> Vec<String> {
        self.state().written.clone()
    }

    pub fn pending_lines(&self) -> usize {
        self.state().incoming.len()
    }

    pub fn lines_served(&self) -> usize {
        self.state().lines_served
    }

    pub fn clear_count(&self) -> usize {
        self.state().clears
    }

    pub fn open_count(&self) -> usize {
        self.state().opens
    }

    pub fn close_count(&self) -> usize {
        self.state().closes
    }
}

impl LineTransport for ScriptedTransport {
    fn open(&mut self) -> Result<()> {
        let mut state = self.state();
        if state.fail_open {
            return Err(SerialError::PortNotFound("scripted".to_string()));
        }
        state.open = true;
        state.opens += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.state();
        if state.open {
            state.open = false;
            state.closes += 1;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.state().read_timeout = timeout;
        Ok(())
    }

    fn read_line(&mut self) -> Result<Option<String>> {
        let timeout = {
            let mut state = self.state();
            if !state.open {
                return Err(SerialError::NotOpen);
            }
            match state.incoming.pop_front() {
                Some(Incoming::Line(line)) => {
                    state.lines_served += 1;
                    return Ok(Some(line));
                }
                Some(Incoming::Failure(message)) => {
                    return Err(SerialError::IoError(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        message,
                    )));
                }
                None => state.read_timeout,
            }
        };
        // Nothing arrived: behave like a port read timing out
        thread::sleep(timeout);
        Ok(None)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state();
        if !state.open {
            return Err(SerialError::NotOpen);
        }
        let command = String::from_utf8_lossy(data).into_owned();
        let replies: Vec<String> = state
            .replies
            .iter()
            .filter(|(expected, _)| *expected == command)
            .flat_map(|(_, lines)| lines.iter().cloned())
            .collect();
        state.incoming.extend(replies.into_iter().map(Incoming::Line));
        state.written.push(command);
        Ok(())
    }

    /// Counts the flush but keeps queued lines: they model frames that have
    /// not reached the port yet.
    fn clear_buffers(&mut self) -> Result<()> {
        self.state().clears += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_lines_and_replies() {
        let mut link = ScriptedTransport::new();
        let handle = link.clone();
        link.open().unwrap();
        link.set_read_timeout(Duration::from_millis(1)).unwrap();

        handle.push_line("first");
        handle.reply_to("1,4,9,88,163,0,255,255,255,255s", ["reply"]);
        link.write_all(b"1,4,9,88,163,0,255,255,255,255s").unwrap();

        assert_eq!(link.read_line().unwrap().as_deref(), Some("first"));
        assert_eq!(link.read_line().unwrap().as_deref(), Some("reply"));
        assert_eq!(link.read_line().unwrap(), None);
        assert_eq!(handle.written(), vec!["1,4,9,88,163,0,255,255,255,255s"]);
        assert_eq!(handle.lines_served(), 2);
    }

    #[test]
    fn test_scripted_failure_and_closed_state() {
        let mut link = ScriptedTransport::new();
        assert!(matches!(link.read_line(), Err(SerialError::NotOpen)));
        link.open().unwrap();
        link.push_failure("unplugged");
        assert!(matches!(link.read_line(), Err(SerialError::IoError(_))));

        link.fail_open(true);
        link.close().unwrap();
        assert!(link.open().is_err());
        assert_eq!(link.open_count(), 1);
        assert_eq!(link.close_count(), 1);
    }
}
