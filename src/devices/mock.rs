//! Scripted stand-in for an instrument link.
//!
//! Queries listed with [`MockTransport::respond`] get their canned line queued
//! when the command is written. Anything else is treated as fire-and-forget,
//! so reading after it times out just like a silent instrument would.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::rc::Rc;
use std::time::Duration;

use super::transport::Transport;

#[derive(Debug, Default)]
pub struct MockState {
    pub written: Vec<String>,
    pub reads: usize,
    pub timeout_history: Vec<Duration>,
    responses: HashMap<String, String>,
    queued: VecDeque<String>,
}

impl MockState {
    /// Commands written after the first occurrence of `command`.
    pub fn written_after(&self, command: &str) -> &[String] {
        match self.written.iter().position(|c| c == command) {
            Some(i) => &self.written[i + 1..],
            None => &[],
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Rc<RefCell<MockState>>,
    timeout: Duration,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            state: Rc::new(RefCell::new(MockState::default())),
            timeout: Duration::from_secs(2),
        }
    }

    pub fn respond(self, command: &str, response: &str) -> Self {
        self.state
            .borrow_mut()
            .responses
            .insert(command.to_string(), response.to_string());
        self
    }

    /// Shared view of what the session did, usable after the transport moved.
    pub fn state(&self) -> Rc<RefCell<MockState>> {
        Rc::clone(&self.state)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.written.push(line.to_string());
        if let Some(response) = state.responses.get(line).cloned() {
            state.queued.push_back(response);
        }
        Ok(())
    }

    fn read_line(&mut self) -> io::Result<String> {
        let mut state = self.state.borrow_mut();
        state.reads += 1;
        state.timeout_history.push(self.timeout);
        state.queued.pop_front().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no response within {:?}", self.timeout),
            )
        })
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.state.borrow_mut().queued.clear();
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }
}
