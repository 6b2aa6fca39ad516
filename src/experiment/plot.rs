//! Plotting channel.
//!
//! The sweep engine pushes every accepted point onto a bounded channel; a
//! [`PlotConsumer`] task on the other end keeps the curves and hands them to a
//! [`CurveRenderer`] after every change. The consumer owns no control logic, and a
//! consumer that has gone away never stops a measurement.

use super::point::SweepPoint;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Capacity of the plotting channel
pub const PLOT_CHANNEL_CAPACITY: usize = 1024;

/// How long the producer waits for room in a full channel before dropping a message
const PLOT_SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// Messages understood by the plotting consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum PlotMessage {
    /// One data row
    DataPoint(SweepPoint),
    /// Start a new foreground curve; the current one moves to the background
    ClearForeground,
    /// End of data; the consumer exits
    Terminate,
}

/// Drawing backend of the plotting consumer.
pub trait CurveRenderer: Send {
    /// Redraw with the current datasets.
    fn render(&mut self, foreground: &[SweepPoint], background: &[SweepPoint]);
}

/// Renderer that only logs the dataset sizes.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRenderer;

impl CurveRenderer for TracingRenderer {
    fn render(&mut self, foreground: &[SweepPoint], background: &[SweepPoint]) {
        debug!(
            "Plot: {} foreground point(s), {} background point(s)",
            foreground.len(),
            background.len()
        );
    }
}

/// Receiving end of the plotting channel.
pub struct PlotConsumer<R: CurveRenderer> {
    foreground: Vec<SweepPoint>,
    background: Vec<SweepPoint>,
    renderer: R,
}

impl<R: CurveRenderer> PlotConsumer<R> {
    /// Consumer with empty datasets.
    pub fn new(renderer: R) -> Self {
        Self {
            foreground: Vec::new(),
            background: Vec::new(),
            renderer,
        }
    }

    /// Points of the current curve
    pub fn foreground(&self) -> &[SweepPoint] {
        &self.foreground
    }

    /// Points of earlier curves
    pub fn background(&self) -> &[SweepPoint] {
        &self.background
    }

    /// The renderer
    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    /// Apply one message. Returns `false` on [`PlotMessage::Terminate`].
    pub fn handle(&mut self, message: PlotMessage) -> bool {
        match message {
            PlotMessage::DataPoint(point) => self.foreground.push(point),
            PlotMessage::ClearForeground => self.background.append(&mut self.foreground),
            PlotMessage::Terminate => return false,
        }
        self.renderer.render(&self.foreground, &self.background);
        true
    }

    /// Consume messages until `Terminate` or until every sender is gone.
    pub async fn run(mut self, mut rx: mpsc::Receiver<PlotMessage>) -> Self {
        while let Some(message) = rx.recv().await {
            if !self.handle(message) {
                break;
            }
        }
        self
    }
}

/// Sending end of the plotting channel.
#[derive(Debug, Clone)]
pub struct PlotSender {
    tx: mpsc::Sender<PlotMessage>,
}

impl PlotSender {
    /// Send a message, waiting briefly if the channel is full.
    ///
    /// A full or closed channel only costs the message, never the run.
    pub async fn send(&self, message: PlotMessage) {
        match self.tx.send_timeout(message, PLOT_SEND_TIMEOUT).await {
            Ok(()) => {}
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!("Plot channel full, dropping message");
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                debug!("Plot consumer gone, dropping message");
            }
        }
    }

    /// Send one data row.
    pub async fn point(&self, point: SweepPoint) {
        self.send(PlotMessage::DataPoint(point)).await;
    }

    /// Move the current curve to the background.
    pub async fn clear_foreground(&self) {
        self.send(PlotMessage::ClearForeground).await;
    }

    /// Tell the consumer to exit.
    pub async fn terminate(&self) {
        self.send(PlotMessage::Terminate).await;
    }
}

/// Bounded plotting channel.
pub fn plot_channel() -> (PlotSender, mpsc::Receiver<PlotMessage>) {
    let (tx, rx) = mpsc::channel(PLOT_CHANNEL_CAPACITY);
    (PlotSender { tx }, rx)
}

/// Start a consumer task. The task returns the consumer once it has terminated.
pub fn spawn_consumer<R: CurveRenderer + 'static>(renderer: R) -> (PlotSender, JoinHandle<PlotConsumer<R>>) {
    let (tx, rx) = plot_channel();
    let task = tokio::spawn(PlotConsumer::new(renderer).run(rx));
    (tx, task)
}
