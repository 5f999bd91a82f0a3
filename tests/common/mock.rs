//! In-memory GPIO driver for integration tests.
//!
//! Records every call the crate makes into the kernel binding so tests can
//! assert on the full history without a real chip.

use sbc_gpio::backend::{ChipPort, GpioDriver, LineRequestPort};
use sbc_gpio::{ChipInfo, Direction, EdgeEvent, EdgeKind, Level, LineInfo, LineSettings};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Call record ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum HwCall {
    Request { offset: u32, settings: LineSettings },
    SetValue { offset: u32, level: Level },
    Release { offset: u32 },
    CloseChip,
}

// ── MockHardware ──────────────────────────────────────────────

pub struct MockHardware {
    names: Vec<String>,
    calls: Mutex<Vec<HwCall>>,
    inputs: Mutex<HashMap<u32, Level>>,
    pending: Mutex<HashMap<u32, VecDeque<EdgeEvent>>>,
    held: Mutex<HashSet<u32>>,
    seqno: Mutex<(u32, HashMap<u32, u32>)>,
    gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
    pub fail_open: bool,
}

impl MockHardware {
    pub fn new(names: &[&str]) -> Arc<Self> {
        Arc::new(Self::with_names(names))
    }

    pub fn with_names(names: &[&str]) -> Self {
        Self {
            names: names.iter().map(|n| n.to_string()).collect(),
            calls: Mutex::new(Vec::new()),
            inputs: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            held: Mutex::new(HashSet::new()),
            seqno: Mutex::new((0, HashMap::new())),
            gate: Mutex::new(None),
            fail_open: false,
        }
    }

    pub fn calls(&self) -> Vec<HwCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: HwCall) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn writes(&self, offset: u32) -> Vec<Level> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                HwCall::SetValue { offset: o, level } if o == offset => Some(level),
                _ => None,
            })
            .collect()
    }

    pub fn releases(&self, offset: u32) -> usize {
        self.calls()
            .iter()
            .filter(|call| **call == HwCall::Release { offset })
            .count()
    }

    pub fn set_input(&self, offset: u32, level: Level) {
        self.inputs.lock().unwrap().insert(offset, level);
    }

    /// Queues an edge as if the kernel had detected it.
    pub fn push_edge(&self, offset: u32, kind: EdgeKind) -> EdgeEvent {
        let mut counters = self.seqno.lock().unwrap();
        let (global, per_line) = &mut *counters;
        *global += 1;
        let line_seqno = per_line.entry(offset).or_insert(0);
        *line_seqno += 1;
        let event = EdgeEvent {
            kind,
            timestamp_ns: 1_000_000 * *global as u64,
            offset,
            seqno: *global,
            line_seqno: *line_seqno,
        };
        self.pending
            .lock()
            .unwrap()
            .entry(offset)
            .or_default()
            .push_back(event);
        event
    }

    pub fn pending_edges(&self, offset: u32) -> usize {
        self.pending
            .lock()
            .unwrap()
            .get(&offset)
            .map_or(0, VecDeque::len)
    }

    /// Makes the next line request stop inside the kernel call. It signals
    /// the first channel on entry and resumes once the second is sent to.
    pub fn gate_requests(&self) -> (Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (resume_tx, resume_rx) = mpsc::channel();
        *self.gate.lock().unwrap() = Some((entered_tx, resume_rx));
        (entered_rx, resume_tx)
    }

    /// Simulates another process holding `offset`.
    pub fn hold_externally(&self, offset: u32) {
        self.held.lock().unwrap().insert(offset);
    }
}

// ── Driver / chip / request ───────────────────────────────────

pub struct MockDriver(pub Arc<MockHardware>);

impl GpioDriver for MockDriver {
    fn open_chip(&self, path: &Path) -> io::Result<Box<dyn ChipPort>> {
        if self.0.fail_open {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} does not exist", path.display()),
            ));
        }
        Ok(Box::new(MockChip(Arc::clone(&self.0))))
    }
}

struct MockChip(Arc<MockHardware>);

impl Drop for MockChip {
    fn drop(&mut self) {
        self.0.record(HwCall::CloseChip);
    }
}

impl ChipPort for MockChip {
    fn info(&self) -> io::Result<ChipInfo> {
        Ok(ChipInfo {
            path: "/dev/gpiochip0".into(),
            name: "gpiochip0".to_string(),
            label: "mock-gpio".to_string(),
            num_lines: self.0.names.len() as u32,
        })
    }

    fn line_info(&self, offset: u32) -> io::Result<LineInfo> {
        let name = self
            .0
            .names
            .get(offset as usize)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "offset out of range"))?;
        Ok(LineInfo {
            offset,
            name: name.clone(),
            used: self.0.held.lock().unwrap().contains(&offset),
            ..LineInfo::default()
        })
    }

    fn request_line(
        &self,
        offset: u32,
        settings: &LineSettings,
        _consumer: &str,
    ) -> io::Result<Box<dyn LineRequestPort>> {
        let gate = self.0.gate.lock().unwrap().take();
        if let Some((entered, resume)) = gate {
            entered.send(()).unwrap();
            resume.recv().unwrap();
        }
        if offset as usize >= self.0.names.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "offset out of range"));
        }
        if !self.0.held.lock().unwrap().insert(offset) {
            return Err(io::Error::new(io::ErrorKind::ResourceBusy, "line busy"));
        }
        self.0.record(HwCall::Request {
            offset,
            settings: settings.clone(),
        });
        if settings.direction == Direction::Output {
            self.0.set_input(offset, settings.initial);
        }
        Ok(Box::new(MockRequest {
            hw: Arc::clone(&self.0),
            offset,
        }))
    }
}

struct MockRequest {
    hw: Arc<MockHardware>,
    offset: u32,
}

impl Drop for MockRequest {
    fn drop(&mut self) {
        self.hw.held.lock().unwrap().remove(&self.offset);
        self.hw.record(HwCall::Release {
            offset: self.offset,
        });
    }
}

impl LineRequestPort for MockRequest {
    fn value(&self, offset: u32) -> io::Result<Level> {
        Ok(self
            .hw
            .inputs
            .lock()
            .unwrap()
            .get(&offset)
            .copied()
            .unwrap_or_default())
    }

    fn set_value(&self, offset: u32, level: Level) -> io::Result<()> {
        self.hw.set_input(offset, level);
        self.hw.record(HwCall::SetValue { offset, level });
        Ok(())
    }

    fn wait_edge_events(&self, _timeout: Duration) -> io::Result<bool> {
        Ok(self.hw.pending_edges(self.offset) > 0)
    }

    fn read_edge_events(&self, buf: &mut Vec<EdgeEvent>, max: usize) -> io::Result<usize> {
        let mut pending = self.hw.pending.lock().unwrap();
        let Some(queue) = pending.get_mut(&self.offset) else {
            return Ok(0);
        };
        let count = queue.len().min(max);
        buf.extend(queue.drain(..count));
        Ok(count)
    }
}
