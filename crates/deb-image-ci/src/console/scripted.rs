//! An in-memory stand-in for a guest serial console.
//!
//! Used to exercise interaction scripts without booting anything: the guest side
//! runs a fixed list of steps on its own thread, emitting output and waiting for
//! host input, and records everything the host sent.

use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::console::Console;

#[derive(Debug, Clone)]
enum Step {
    Emit(Vec<u8>),
    AwaitInput(Vec<u8>),
    Delay(Duration),
    Close,
}

#[derive(Debug, Default, Clone)]
pub struct ScriptedGuest {
    steps: Vec<Step>,
}

impl ScriptedGuest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(mut self, text: impl AsRef<[u8]>) -> Self {
        self.steps.push(Step::Emit(text.as_ref().to_vec()));
        self
    }

    /// Block the guest until the host has sent `text` (consumed up to its end).
    pub fn await_input(mut self, text: impl AsRef<[u8]>) -> Self {
        self.steps.push(Step::AwaitInput(text.as_ref().to_vec()));
        self
    }

    pub fn delay(mut self, d: Duration) -> Self {
        self.steps.push(Step::Delay(d));
        self
    }

    /// Hang up: the host sees EOF. Without this the guest stays silent but open.
    pub fn close(mut self) -> Self {
        self.steps.push(Step::Close);
        self
    }

    /// Start the guest thread; returns the host-side halves of the stream.
    pub fn spawn(self) -> (GuestOutput, GuestInput, GuestHandle) {
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>();
        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>();
        let received = Arc::new(Mutex::new(Vec::new()));
        let handle = GuestHandle {
            received: Arc::clone(&received),
        };
        std::thread::spawn(move || run_guest(self.steps, out_tx, in_rx, received));
        (
            GuestOutput {
                rx: out_rx,
                pending: Vec::new(),
                pos: 0,
            },
            GuestInput { tx: in_tx },
            handle,
        )
    }

    pub fn spawn_console(self) -> (Console, GuestHandle) {
        let (output, input, handle) = self.spawn();
        (Console::new(output, input), handle)
    }
}

#[derive(Debug, Clone)]
pub struct GuestHandle {
    received: Arc<Mutex<Vec<u8>>>,
}

impl GuestHandle {
    /// Everything the host has written so far.
    pub fn received(&self) -> String {
        self.received
            .lock()
            .map(|g| String::from_utf8_lossy(&g).into_owned())
            .unwrap_or_default()
    }
}

/// Guest → host bytes.
pub struct GuestOutput {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
}

impl Read for GuestOutput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.pending.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Host → guest bytes.
pub struct GuestInput {
    tx: Sender<Vec<u8>>,
}

impl Write for GuestInput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "guest hung up"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn run_guest(
    steps: Vec<Step>,
    out: Sender<Vec<u8>>,
    input: Receiver<Vec<u8>>,
    received: Arc<Mutex<Vec<u8>>>,
) {
    let mut unconsumed: Vec<u8> = Vec::new();
    let take_input = |chunk: Vec<u8>, unconsumed: &mut Vec<u8>| {
        if let Ok(mut g) = received.lock() {
            g.extend_from_slice(&chunk);
        }
        unconsumed.extend_from_slice(&chunk);
    };

    for step in steps {
        match step {
            Step::Emit(bytes) => {
                if out.send(bytes).is_err() {
                    return;
                }
            }
            Step::Delay(d) => std::thread::sleep(d),
            Step::Close => return,
            Step::AwaitInput(want) if want.is_empty() => {}
            Step::AwaitInput(want) => loop {
                if let Some(pos) = unconsumed
                    .windows(want.len())
                    .position(|w| w == want.as_slice())
                {
                    unconsumed.drain(..pos + want.len());
                    break;
                }
                match input.recv() {
                    Ok(chunk) => take_input(chunk, &mut unconsumed),
                    Err(_) => return,
                }
            },
        }
    }

    // Stay open (silent) until the host drops its writer.
    while let Ok(chunk) = input.recv() {
        take_input(chunk, &mut unconsumed);
    }
}
