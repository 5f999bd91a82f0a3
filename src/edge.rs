//! Edge event ingestion.
//!
//! An input line requested with edge detection owns an [`EdgePipeline`]: a
//! bounded buffer refilled from the kernel by one non-blocking poll
//! primitive, [`EdgePipeline::next_event`]. Three consumers sit on top of
//! it:
//!
//! * [`InputLine::wait_for_edge`] awaits the next event with an optional
//!   timeout, sleeping cooperatively between polls.
//! * [`InputLine::on_edge`] registers a callback. The first registration
//!   spawns a periodic poll task that drains the buffer and fans each event
//!   out to every callback in registration order. Removing the last callback
//!   stops the task.
//! * [`InputLine::edge_events`] returns a [`Stream`] built from repeated
//!   short waits, which ends once the line is closed.

use std::{
    collections::VecDeque,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::Stream;
use log::{debug, warn};
use tokio::{
    runtime::Handle,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};

use crate::config::EdgeConfig;
use crate::error::{Error, Result};
use crate::gpio::{InputLine, LineCore};
use crate::resource::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    Rising,
    Falling,
}

/// A transition reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEvent {
    pub kind: EdgeKind,
    /// Monotonic clock, nanoseconds.
    pub timestamp_ns: u64,
    pub offset: u32,
    /// Sequence number across all lines of the request.
    pub seqno: u32,
    /// Sequence number on this line.
    pub line_seqno: u32,
}

/// Returning an error (or panicking) is logged and does not affect other
/// callbacks or later events.
pub type EdgeCallback = Arc<dyn Fn(&EdgeEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

pub(crate) struct EdgePipeline {
    capacity: usize,
    poll_interval: Duration,
    stream_wait: Duration,
    buffer: Mutex<VecDeque<EdgeEvent>>,
    callbacks: Mutex<Vec<(CallbackId, EdgeCallback)>>,
    poller: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl EdgePipeline {
    pub(crate) fn new(config: &EdgeConfig) -> Self {
        let capacity = config.buffer_capacity.max(1);
        Self {
            capacity,
            poll_interval: config.poll_interval(),
            stream_wait: config.stream_wait(),
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            callbacks: Mutex::new(Vec::new()),
            poller: Mutex::new(None),
            next_id: AtomicU64::new(0),
        }
    }

    /// Pops the next buffered event, refilling the buffer from the kernel
    /// without blocking when it is empty.
    fn next_event(&self, line: &LineCore) -> Result<Option<EdgeEvent>> {
        let mut buffer = lock(&self.buffer);
        if buffer.is_empty() {
            let mut fresh = Vec::with_capacity(self.capacity);
            line.with_request("edge read", |request| {
                if request.wait_edge_events(Duration::ZERO)? {
                    request.read_edge_events(&mut fresh, self.capacity)
                } else {
                    Ok(0)
                }
            })?;
            buffer.extend(fresh);
        }
        Ok(buffer.pop_front())
    }

    fn drain(&self, line: &LineCore) -> Result<Vec<EdgeEvent>> {
        let mut events = Vec::new();
        while events.len() < self.capacity {
            match self.next_event(line)? {
                Some(event) => events.push(event),
                None => break,
            }
        }
        Ok(events)
    }

    fn dispatch(&self, event: &EdgeEvent) {
        let callbacks = lock(&self.callbacks).clone();
        for (id, callback) in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    "edge callback {:?} on GPIO line {} failed: {:#}",
                    id, event.offset, err
                ),
                Err(_) => warn!(
                    "edge callback {:?} on GPIO line {} panicked",
                    id, event.offset
                ),
            }
        }
    }

    fn register(&self, line: &Arc<LineCore>, callback: EdgeCallback, runtime: &Handle) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut callbacks = lock(&self.callbacks);
        callbacks.push((id, callback));

        let mut poller = lock(&self.poller);
        if poller.is_none() {
            debug!("starting edge poll on GPIO line {}", line.offset());
            *poller = Some(runtime.spawn(poll_edges(Arc::clone(line), self.poll_interval)));
        }
        id
    }

    fn unregister(&self, id: CallbackId) -> bool {
        let mut callbacks = lock(&self.callbacks);
        let before = callbacks.len();
        callbacks.retain(|(registered, _)| *registered != id);
        let removed = callbacks.len() != before;

        if callbacks.is_empty() {
            if let Some(task) = lock(&self.poller).take() {
                task.abort();
            }
        }
        removed
    }

    fn callback_count(&self) -> usize {
        lock(&self.callbacks).len()
    }

    /// Stops polling and drops callbacks and buffered events.
    pub(crate) fn shutdown(&self) {
        lock(&self.callbacks).clear();
        if let Some(task) = lock(&self.poller).take() {
            task.abort();
        }
        lock(&self.buffer).clear();
    }
}

async fn poll_edges(line: Arc<LineCore>, period: Duration) {
    let Some(edges) = line.edges.as_ref() else {
        return;
    };
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if line.is_closed() {
            break;
        }
        match edges.drain(&line) {
            Ok(events) => {
                for event in &events {
                    edges.dispatch(event);
                }
            }
            Err(Error::ClosedHandle(_)) => break,
            Err(err) => warn!("edge poll on GPIO line {} failed: {}", line.offset(), err),
        }
    }
}

/// Waits for the next event. `Ok(None)` on timeout or when the line closes.
async fn wait_on(line: &LineCore, timeout: Option<Duration>) -> Result<Option<EdgeEvent>> {
    let edges = line
        .edges
        .as_ref()
        .ok_or(Error::EdgeDetectionDisabled(line.offset()))?;
    let deadline = timeout.map(|timeout| Instant::now() + timeout);

    loop {
        match edges.next_event(line) {
            Ok(Some(event)) => return Ok(Some(event)),
            Ok(None) => {}
            Err(Error::ClosedHandle(_)) => return Ok(None),
            Err(err) => return Err(err),
        }

        let pause = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                edges.poll_interval.min(deadline - now)
            }
            None => edges.poll_interval,
        };
        time::sleep(pause).await;
    }
}

impl InputLine {
    fn pipeline(&self) -> Result<&EdgePipeline> {
        let edges = self
            .core
            .edges
            .as_ref()
            .ok_or(Error::EdgeDetectionDisabled(self.core.offset()))?;
        self.core.ensure_open()?;
        Ok(edges)
    }

    /// Waits for the next edge.
    ///
    /// `None` waits indefinitely; `Some(Duration::ZERO)` checks once and
    /// returns immediately. Returns `Ok(None)` if the timeout elapses or the
    /// line is closed while waiting. Only the calling task is suspended.
    pub async fn wait_for_edge(&self, timeout: Option<Duration>) -> Result<Option<EdgeEvent>> {
        self.pipeline()?;
        wait_on(&self.core, timeout).await
    }

    /// Registers a callback invoked for every edge, in registration order.
    /// Must be called from within a tokio runtime.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use sbc_gpio::{Chip, EdgeDetection, InputConfig};
    ///
    /// # async fn run() -> sbc_gpio::Result<()> {
    /// let chip = Chip::open("/dev/gpiochip0")?;
    /// let button = chip.request_input(
    ///     27,
    ///     InputConfig::new().with_edge_detection(EdgeDetection::Falling),
    /// )?;
    /// let id = button.on_edge(|event| {
    ///     println!("pressed at {}", event.timestamp_ns);
    ///     Ok(())
    /// })?;
    /// button.remove_edge_callback(id)?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn on_edge<F>(&self, callback: F) -> Result<CallbackId>
    where
        F: Fn(&EdgeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let edges = self.pipeline()?;
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        Ok(edges.register(&self.core, Arc::new(callback), &runtime))
    }

    /// Returns `false` if `id` was not registered.
    pub fn remove_edge_callback(&self, id: CallbackId) -> Result<bool> {
        Ok(self.pipeline()?.unregister(id))
    }

    pub fn edge_callback_count(&self) -> usize {
        self.core
            .edges
            .as_ref()
            .map_or(0, EdgePipeline::callback_count)
    }

    /// A fresh stream of edges. Ends when the line is closed; an I/O error
    /// is yielded once and then ends the stream.
    pub fn edge_events(&self) -> Result<impl Stream<Item = Result<EdgeEvent>> + Send + 'static> {
        let wait = self.pipeline()?.stream_wait;
        let line = Arc::clone(&self.core);

        Ok(futures::stream::unfold(Some(line), move |line| async move {
            let line = line?;
            loop {
                if line.is_closed() {
                    return None;
                }
                match wait_on(&line, Some(wait)).await {
                    Ok(Some(event)) => return Some((Ok(event), Some(line))),
                    Ok(None) => continue,
                    Err(err) => return Some((Err(err), None)),
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn event(line_seqno: u32) -> EdgeEvent {
        EdgeEvent {
            kind: EdgeKind::Rising,
            timestamp_ns: 1_000 * line_seqno as u64,
            offset: 5,
            seqno: line_seqno,
            line_seqno,
        }
    }

    #[test]
    fn failing_callbacks_do_not_stop_dispatch() {
        let pipeline = EdgePipeline::new(&EdgeConfig::default());
        let delivered = Arc::new(AtomicUsize::new(0));

        let erroring: EdgeCallback =
            Arc::new(|_: &EdgeEvent| -> anyhow::Result<()> { Err(anyhow::anyhow!("bad handler")) });
        let panicking: EdgeCallback =
            Arc::new(|_: &EdgeEvent| -> anyhow::Result<()> { panic!("handler panicked") });
        let counting: EdgeCallback = {
            let delivered = Arc::clone(&delivered);
            Arc::new(move |_: &EdgeEvent| -> anyhow::Result<()> {
                delivered.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        {
            let mut callbacks = lock(&pipeline.callbacks);
            callbacks.push((CallbackId(0), erroring));
            callbacks.push((CallbackId(1), panicking));
            callbacks.push((CallbackId(2), counting));
        }

        pipeline.dispatch(&event(1));
        pipeline.dispatch(&event(2));

        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unregister_reports_unknown_ids() {
        let pipeline = EdgePipeline::new(&EdgeConfig::default());
        let noop: EdgeCallback = Arc::new(|_: &EdgeEvent| -> anyhow::Result<()> { Ok(()) });
        lock(&pipeline.callbacks).push((CallbackId(7), noop));

        assert!(!pipeline.unregister(CallbackId(8)));
        assert!(pipeline.unregister(CallbackId(7)));
        assert_eq!(pipeline.callback_count(), 0);
    }
}
