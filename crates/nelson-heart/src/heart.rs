//! The scheduler: three stacked timers driving the daemon.

use parking_lot::RwLock;
use rand::RngCore;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

/// Scheduler configuration. Intervals are wall-clock periods,
/// beat < cycle < epoch.
#[derive(Debug, Clone)]
pub struct HeartConfig {
    /// Housekeeping tick period.
    pub beat_interval: Duration,
    /// Partial-reshuffle period.
    pub cycle_interval: Duration,
    /// Full-reshuffle period.
    pub epoch_interval: Duration,
}

impl Default for HeartConfig {
    fn default() -> Self {
        Self {
            beat_interval: Duration::from_secs(10),
            cycle_interval: Duration::from_secs(60),
            epoch_interval: Duration::from_secs(300),
        }
    }
}

/// Ticks emitted by the heart. When deadlines coincide, a beat is emitted
/// before a cycle before an epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartEvent {
    /// Housekeeping tick.
    Beat { at: u64 },
    /// Partial reshuffle due.
    Cycle { number: u64 },
    /// Full reshuffle due, with the fresh personality.
    Epoch { number: u64, personality: String },
}

/// Commands accepted by a running heart.
#[derive(Debug)]
pub enum HeartCommand {
    /// Stop the timers. The heart goes quiescent and `run()` returns;
    /// a later `run()` resumes with counters intact.
    Stop,
}

/// Scheduler clock state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartSnapshot {
    pub current_cycle: u64,
    pub current_epoch: u64,
    pub personality: String,
    pub start_date: u64,
    pub last_beat: Option<u64>,
    pub last_cycle: Option<u64>,
    pub last_epoch: Option<u64>,
}

/// Read-only view of the heart's clock, shareable with the status API.
#[derive(Clone)]
pub struct HeartMonitor(Arc<RwLock<HeartSnapshot>>);

impl HeartMonitor {
    /// Current clock state.
    pub fn snapshot(&self) -> HeartSnapshot {
        self.0.read().clone()
    }
}

/// A uniformly random identifier, regenerated each epoch. Used only as a
/// reshuffle tie-breaker, independent of the sampler's RNG.
pub fn generate_personality() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The scheduler.
pub struct Heart {
    config: HeartConfig,
    state: Arc<RwLock<HeartSnapshot>>,
    event_tx: mpsc::Sender<HeartEvent>,
    command_rx: Option<mpsc::Receiver<HeartCommand>>,
}

impl Heart {
    /// Create a heart. Returns the event stream and the command sender.
    pub fn new(
        config: HeartConfig,
    ) -> (Self, mpsc::Receiver<HeartEvent>, mpsc::Sender<HeartCommand>) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (command_tx, command_rx) = mpsc::channel(8);

        let state = Arc::new(RwLock::new(HeartSnapshot {
            current_cycle: 0,
            current_epoch: 0,
            personality: generate_personality(),
            start_date: now_ms(),
            last_beat: None,
            last_cycle: None,
            last_epoch: None,
        }));

        let heart = Self {
            config,
            state,
            event_tx,
            command_rx: Some(command_rx),
        };

        (heart, event_rx, command_tx)
    }

    /// Shareable read-only view of the clock.
    pub fn monitor(&self) -> HeartMonitor {
        HeartMonitor(Arc::clone(&self.state))
    }

    /// Run the timers until a `Stop` command arrives.
    ///
    /// Deadlines that pass while a tick is being consumed are skipped, not
    /// queued; the next natural deadline wins.
    pub async fn run(&mut self) {
        let mut command_rx = self
            .command_rx
            .take()
            .expect("heart is already running");

        let beat = self.config.beat_interval;
        let cycle = self.config.cycle_interval;
        let epoch = self.config.epoch_interval;

        let started = Instant::now();
        let mut next_beat = started + beat;
        let mut next_cycle = started + cycle;
        let mut next_epoch = started + epoch;

        info!(
            beat_s = beat.as_secs(),
            cycle_s = cycle.as_secs(),
            epoch_s = epoch.as_secs(),
            "Heart started"
        );

        loop {
            let next = next_beat.min(next_cycle).min(next_epoch);

            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(HeartCommand::Stop) | None => break,
                },

                _ = sleep_until(next) => {
                    let now = Instant::now();

                    if now >= next_beat {
                        while next_beat <= now {
                            next_beat += beat;
                        }
                        let at = now_ms();
                        self.state.write().last_beat = Some(at);
                        if self.event_tx.send(HeartEvent::Beat { at }).await.is_err() {
                            break;
                        }
                    }

                    if now >= next_cycle {
                        while next_cycle <= now {
                            next_cycle += cycle;
                        }
                        let number = {
                            let mut state = self.state.write();
                            state.current_cycle += 1;
                            state.last_cycle = Some(now_ms());
                            state.current_cycle
                        };
                        debug!(cycle = number, "Cycle tick");
                        if self.event_tx.send(HeartEvent::Cycle { number }).await.is_err() {
                            break;
                        }
                    }

                    if now >= next_epoch {
                        while next_epoch <= now {
                            next_epoch += epoch;
                        }
                        let (number, personality) = {
                            let mut state = self.state.write();
                            state.current_epoch += 1;
                            state.last_epoch = Some(now_ms());
                            state.personality = generate_personality();
                            (state.current_epoch, state.personality.clone())
                        };
                        info!(epoch = number, personality = %personality, "Epoch tick");
                        if self
                            .event_tx
                            .send(HeartEvent::Epoch { number, personality })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        }

        info!("Heart stopped");
        // Quiescent; a later run() resumes from the same counters.
        self.command_rx = Some(command_rx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> HeartConfig {
        HeartConfig {
            beat_interval: Duration::from_millis(100),
            cycle_interval: Duration::from_millis(200),
            epoch_interval: Duration::from_millis(400),
        }
    }

    #[test]
    fn test_personality_is_random_hex() {
        let a = generate_personality();
        let b = generate_personality();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_ordering_and_counters() {
        let (mut heart, mut events, _commands) = Heart::new(fast_config());
        let monitor = heart.monitor();
        tokio::spawn(async move { heart.run().await });

        // t=100ms
        assert!(matches!(events.recv().await.unwrap(), HeartEvent::Beat { .. }));
        // t=200ms: beat before cycle
        assert!(matches!(events.recv().await.unwrap(), HeartEvent::Beat { .. }));
        assert_eq!(
            events.recv().await.unwrap(),
            HeartEvent::Cycle { number: 1 }
        );
        // t=300ms
        assert!(matches!(events.recv().await.unwrap(), HeartEvent::Beat { .. }));
        // t=400ms: beat, cycle, epoch in that order
        assert!(matches!(events.recv().await.unwrap(), HeartEvent::Beat { .. }));
        assert_eq!(
            events.recv().await.unwrap(),
            HeartEvent::Cycle { number: 2 }
        );
        match events.recv().await.unwrap() {
            HeartEvent::Epoch {
                number,
                personality,
            } => {
                assert_eq!(number, 1);
                assert_eq!(personality.len(), 32);
            }
            other => panic!("expected Epoch, got {:?}", other),
        }

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.current_cycle, 2);
        assert_eq!(snapshot.current_epoch, 1);
        assert!(snapshot.last_beat.is_some());
        assert!(snapshot.last_epoch.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_epoch_regenerates_personality() {
        let (mut heart, mut events, _commands) = Heart::new(HeartConfig {
            beat_interval: Duration::from_millis(100),
            cycle_interval: Duration::from_millis(10_000),
            epoch_interval: Duration::from_millis(300),
        });
        let monitor = heart.monitor();
        let before = monitor.snapshot().personality;
        tokio::spawn(async move { heart.run().await });

        loop {
            if let HeartEvent::Epoch { personality, .. } = events.recv().await.unwrap() {
                assert_ne!(personality, before);
                assert_eq!(monitor.snapshot().personality, personality);
                break;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_quiesces_and_resume_keeps_counters() {
        let (mut heart, mut events, commands) = Heart::new(fast_config());
        let monitor = heart.monitor();

        let runner = tokio::spawn(async move {
            heart.run().await;
            heart
        });

        // Let one cycle pass, then stop.
        loop {
            if matches!(events.recv().await.unwrap(), HeartEvent::Cycle { .. }) {
                break;
            }
        }
        commands.send(HeartCommand::Stop).await.unwrap();
        let mut heart = runner.await.unwrap();

        let stopped_at = monitor.snapshot();
        assert_eq!(stopped_at.current_cycle, 1);

        // Resume; counters continue from where they were.
        tokio::spawn(async move { heart.run().await });
        loop {
            if let HeartEvent::Cycle { number } = events.recv().await.unwrap() {
                assert_eq!(number, 2);
                break;
            }
        }
    }
}
