use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Events driving the `watch` loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
  /// Periodic tick for query polling
  Tick,
  /// Ctrl-C
  Interrupt,
}

/// Event handler that produces events from a tick timer and the interrupt signal
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
  tasks: [JoinHandle<()>; 2],
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    let ticks = spawn_ticker(tick_rate, tx.clone(), Event::Tick);
    let interrupt = tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        let _ = tx.send(Event::Interrupt);
      }
    });

    Self {
      rx,
      tasks: [ticks, interrupt],
    }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

impl Drop for EventHandler {
  fn drop(&mut self) {
    for task in &self.tasks {
      task.abort();
    }
  }
}

/// A fixed-period timer whose ticks are collected without blocking.
///
/// The first tick arrives one `period` after creation. Dropping the ticker
/// cancels the timer task.
pub struct Ticker {
  rx: mpsc::UnboundedReceiver<()>,
  task: JoinHandle<()>,
}

impl Ticker {
  pub fn new(period: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self {
      rx,
      task: spawn_ticker(period, tx, ()),
    }
  }

  /// Drain pending ticks; true if at least one fired since the last call.
  pub fn try_tick(&mut self) -> bool {
    let mut fired = false;
    while self.rx.try_recv().is_ok() {
      fired = true;
    }
    fired
  }
}

impl Drop for Ticker {
  fn drop(&mut self) {
    self.task.abort();
  }
}

fn spawn_ticker<E: Copy + Send + 'static>(
  period: Duration,
  tx: mpsc::UnboundedSender<E>,
  event: E,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
      interval.tick().await;
      if tx.send(event).is_err() {
        break;
      }
    }
  })
}
