use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

/// The byte transport under the driver: a full-duplex link that accepts and
/// delivers newline-terminated ASCII lines. Serial and TCP implementations
/// live outside this crate; [`SimLink`] covers tests and simulation.
pub trait LineLink {
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// A complete received line, if one is available. Never blocks.
    fn try_read_line(&mut self) -> Option<String>;

    fn close(&mut self);
}

#[derive(Default)]
struct SimLinkState {
    /// lines written by the driver, awaiting inspection by the test
    written: VecDeque<String>,
    /// lines queued for the driver to read
    inbound: VecDeque<String>,
    closed: bool,
}

/// An in-memory [`LineLink`] wired to a [`SimLinkHandle`] playing the modem.
#[derive(Clone, Default)]
pub struct SimLink {
    state: Rc<RefCell<SimLinkState>>,
}

impl SimLink {
    pub fn new() -> SimLink {
        SimLink::default()
    }

    /// The modem side of this link.
    pub fn handle(&self) -> SimLinkHandle {
        SimLinkHandle {
            state: self.state.clone(),
        }
    }
}

impl LineLink for SimLink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link closed"));
        }
        state.written.push_back(line.to_string());
        Ok(())
    }

    fn try_read_line(&mut self) -> Option<String> {
        self.state.borrow_mut().inbound.pop_front()
    }

    fn close(&mut self) {
        self.state.borrow_mut().closed = true;
    }
}

/// Test-side controls for a [`SimLink`].
#[derive(Clone)]
pub struct SimLinkHandle {
    state: Rc<RefCell<SimLinkState>>,
}

impl SimLinkHandle {
    /// Queue a line for the driver to read on its next tick.
    pub fn inject(&self, line: &str) {
        self.state.borrow_mut().inbound.push_back(line.to_string());
    }

    /// Drain everything the driver has written so far.
    pub fn take_written(&self) -> Vec<String> {
        self.state.borrow_mut().written.drain(..).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }
}
