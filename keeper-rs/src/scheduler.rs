//! Durable one-shot timers, one handle per subscription id.
//!
//! A single task owns the timer table and sleeps until the earliest
//! deadline; commands arrive over a channel, firings leave as
//! [`TimerEvent`]s. A subscription holds at most one armed instant:
//! scheduling again for the same id replaces the previous deadline, and
//! cancellation is idempotent. The timer carries no payload beyond the id —
//! the orchestrator re-reads the subscription on firing and decides what
//! the instant means (reminder lead or payment due). The table is rebuilt
//! from the store on restart.

use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use crate::clock::Clock;
use crate::types::TimestampNs;

/// Emitted to the orchestrator when a timer fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerEvent {
    pub id: String,
    pub due_at: TimestampNs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmedTimer {
    pub id: String,
    pub at: TimestampNs,
}

#[derive(Debug)]
enum Command {
    Schedule { id: String, at: TimestampNs },
    Cancel { id: String },
    CancelAll,
    Snapshot { reply: oneshot::Sender<Vec<ArmedTimer>> },
}

/// Cheap clonable handle into the scheduler task.
///
/// Sends only fail once the scheduler has shut down, at which point there
/// is nothing left to arm; failures are ignored for that reason.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SchedulerHandle {
    /// Arm the timer for `id` at an absolute instant, replacing any
    /// existing handle for the same id.
    pub fn schedule(&self, id: impl Into<String>, at: TimestampNs) {
        let _ = self.tx.send(Command::Schedule { id: id.into(), at });
    }

    /// Drop the timer for `id`. Idempotent.
    pub fn cancel(&self, id: impl Into<String>) {
        let _ = self.tx.send(Command::Cancel { id: id.into() });
    }

    pub fn cancel_all(&self) {
        let _ = self.tx.send(Command::CancelAll);
    }

    /// Current armed timers, for metrics and invariant checks.
    pub async fn armed(&self) -> Vec<ArmedTimer> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Snapshot { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// Spawn the scheduler task; fired timers go to `events`.
pub fn spawn(clock: Clock, events: mpsc::UnboundedSender<TimerEvent>) -> SchedulerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(clock, rx, events));
    SchedulerHandle { tx }
}

async fn run(
    clock: Clock,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<TimerEvent>,
) {
    let mut table: HashMap<String, TimestampNs> = HashMap::new();

    loop {
        let next_deadline = table.values().copied().min();
        let sleep_target = next_deadline
            .map(|ns| clock.instant_at(ns))
            .unwrap_or_else(Instant::now);

        tokio::select! {
            cmd = commands.recv() => match cmd {
                None => break,
                Some(Command::Schedule { id, at }) => {
                    table.insert(id, at);
                }
                Some(Command::Cancel { id }) => {
                    table.remove(&id);
                }
                Some(Command::CancelAll) => {
                    table.clear();
                }
                Some(Command::Snapshot { reply }) => {
                    let mut armed: Vec<ArmedTimer> = table
                        .iter()
                        .map(|(id, at)| ArmedTimer {
                            id: id.clone(),
                            at: *at,
                        })
                        .collect();
                    armed.sort_by(|a, b| (a.at, &a.id).cmp(&(b.at, &b.id)));
                    let _ = reply.send(armed);
                }
            },
            _ = sleep_until(sleep_target), if next_deadline.is_some() => {
                let now = clock.now_ns();
                let mut due: Vec<(String, TimestampNs)> = table
                    .iter()
                    .filter(|(_, at)| **at <= now)
                    .map(|(id, at)| (id.clone(), *at))
                    .collect();
                due.sort_by(|a, b| (a.1, &a.0).cmp(&(b.1, &b.0)));
                for (id, at) in due {
                    table.remove(&id);
                    if events.send(TimerEvent { id, due_at: at }).is_err() {
                        // Orchestrator is gone; nothing left to drive.
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NANOS_PER_SEC;
    use std::time::Duration;

    fn setup() -> (Clock, SchedulerHandle, mpsc::UnboundedReceiver<TimerEvent>) {
        let clock = Clock::fixed(0);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn(clock.clone(), tx);
        (clock, handle, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_at_the_deadline() {
        let (clock, handle, mut rx) = setup();
        handle.schedule("sub_abcd", 3_600 * NANOS_PER_SEC);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.id, "sub_abcd");
        assert_eq!(event.due_at, 3_600 * NANOS_PER_SEC);
        assert!(clock.now_ns() >= 3_600 * NANOS_PER_SEC);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_the_existing_timer() {
        let (_clock, handle, mut rx) = setup();
        handle.schedule("sub_abcd", 100 * NANOS_PER_SEC);
        handle.schedule("sub_abcd", 200 * NANOS_PER_SEC);

        let armed = handle.armed().await;
        assert_eq!(armed.len(), 1, "one handle per id, the replacement");
        assert_eq!(armed[0].at, 200 * NANOS_PER_SEC);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.due_at, 200 * NANOS_PER_SEC);
        assert!(rx.try_recv().is_err(), "only the replacement fires");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent_and_stops_firing() {
        let (_clock, handle, mut rx) = setup();
        handle.schedule("sub_abcd", 50 * NANOS_PER_SEC);
        handle.cancel("sub_abcd");
        handle.cancel("sub_abcd");

        assert!(handle.armed().await.is_empty());
        tokio::time::advance(Duration::from_secs(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_leaves_other_ids_alone() {
        let (_clock, handle, _rx) = setup();
        handle.schedule("sub_abcd", 500 * NANOS_PER_SEC);
        handle.schedule("sub_zzzz", 600 * NANOS_PER_SEC);

        handle.cancel("sub_abcd");
        let armed = handle.armed().await;
        assert_eq!(armed.len(), 1);
        assert_eq!(armed[0].id, "sub_zzzz");
    }

    #[tokio::test(start_paused = true)]
    async fn due_timers_fire_in_deadline_order() {
        let (_clock, handle, mut rx) = setup();
        handle.schedule("sub_late", 300 * NANOS_PER_SEC);
        handle.schedule("sub_early", 100 * NANOS_PER_SEC);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.id, "sub_early");
        assert_eq!(second.id, "sub_late");
    }

    #[tokio::test(start_paused = true)]
    async fn past_deadlines_fire_immediately() {
        let (_clock, handle, mut rx) = setup();
        tokio::time::advance(Duration::from_secs(1_000)).await;
        handle.schedule("sub_abcd", 10 * NANOS_PER_SEC);

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("fires without waiting")
            .unwrap();
        assert_eq!(event.id, "sub_abcd");
    }
}
