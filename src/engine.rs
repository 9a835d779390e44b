//! Simulation driver: owns the life engine, runs the tick loop, arbitrates
//! player commands and publishes encoded snapshots.
//!
//! Scalar status (speed, run state) lives in atomics so fast paths never
//! contend with the engine mutex; everything that touches the live set goes
//! through one `std::sync::Mutex`, which is never held across an await.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::life::Life;
use crate::protocol::{Cell, ClientMessage, Command, ProtocolError, Snapshot};

const PAUSED: u32 = 0;
const PLAYING: u32 = 1;

const INITIAL_SPEED_MS: u32 = 100;

/// Capacity of the driver→hub snapshot channel.
const OUTPUT_QUEUE: usize = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("cannot set cell at ({x}, {y}): already alive")]
    Overlap { x: u16, y: u16 },

    #[error("cannot step while playing")]
    NextWhilePlaying,

    #[error("already playing")]
    AlreadyPlaying,

    #[error("already paused")]
    AlreadyPaused,

    #[error("speed has not changed")]
    SpeedUnchanged,
}

struct EngineInner {
    life: Life,
    // Reused across publishes; reallocated only when the live set outgrows them.
    snapshot: Snapshot,
    encode_buf: Vec<u8>,
}

pub struct Engine {
    inner: Mutex<EngineInner>,
    speed: AtomicU32,
    speed_changed: AtomicBool,
    state: AtomicU32,
    failed: AtomicBool,
    output_tx: mpsc::Sender<Bytes>,
}

impl Engine {
    /// Builds the driver and the receiving end of its snapshot channel.
    ///
    /// When `seed` decodes as a snapshot it restores run state, speed and
    /// every stored cell (including age); otherwise the world starts empty
    /// and paused. One initial snapshot is published either way so the first
    /// subscriber always has a frame.
    pub fn new(world_size: u32, seed: Option<&[u8]>) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_QUEUE);
        let engine = Arc::new(Self {
            inner: Mutex::new(EngineInner {
                life: Life::new(world_size),
                snapshot: Snapshot {
                    cells: Vec::with_capacity(world_size as usize / 4),
                    ..Snapshot::default()
                },
                encode_buf: Vec::new(),
            }),
            speed: AtomicU32::new(INITIAL_SPEED_MS),
            speed_changed: AtomicBool::new(false),
            state: AtomicU32::new(PAUSED),
            failed: AtomicBool::new(false),
            output_tx,
        });

        if let Some(seed) = seed {
            if let Err(e) = engine.apply_seed(seed) {
                warn!("stored seed did not decode, starting empty: {e}");
            }
        }
        engine.publish();

        (engine, output_rx)
    }

    pub fn playing(&self) -> bool {
        self.state.load(Ordering::SeqCst) == PLAYING
    }

    pub fn speed(&self) -> u32 {
        self.speed.load(Ordering::SeqCst)
    }

    /// True once a tick has panicked; the process should exit non-zero.
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Tick loop. Steps the world at the current speed while playing and
    /// re-arms the timer when the speed changes. Ends on cancellation, or
    /// cancels everything itself if a step panics (the engine state is
    /// undefined after that).
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = self.new_ticker();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if self.state.load(Ordering::SeqCst) == PLAYING {
                        let stepped = catch_unwind(AssertUnwindSafe(|| {
                            self.lock_inner().life.next_gen();
                        }));
                        if stepped.is_err() {
                            self.failed.store(true, Ordering::SeqCst);
                            error!("generation step panicked; stopping simulation");
                            cancel.cancel();
                            return;
                        }
                        self.publish();
                    }
                    if self.speed_changed.swap(false, Ordering::SeqCst) {
                        ticker = self.new_ticker();
                    }
                }
            }
        }
    }

    /// Decodes one client frame and applies it. On success a fresh snapshot
    /// is published so clients see the mutation even while paused; on error
    /// nothing is mutated or published.
    pub fn submit(&self, frame: &[u8]) -> Result<(), EngineError> {
        match ClientMessage::decode(frame)? {
            ClientMessage::Command(cmd) => self.handle_command(cmd)?,
            ClientMessage::SetCells(cells) => self.handle_set_cells(&cells)?,
            ClientMessage::SetSpeed(speed) => self.handle_set_speed(speed)?,
        }
        self.publish();
        Ok(())
    }

    fn handle_command(&self, cmd: Command) -> Result<(), EngineError> {
        match cmd {
            Command::Next => {
                if self.state.load(Ordering::SeqCst) == PLAYING {
                    return Err(EngineError::NextWhilePlaying);
                }
                self.lock_inner().life.next_gen();
            }
            Command::Play => {
                if self.state.swap(PLAYING, Ordering::SeqCst) == PLAYING {
                    return Err(EngineError::AlreadyPlaying);
                }
            }
            Command::Pause => {
                if self.state.swap(PAUSED, Ordering::SeqCst) == PAUSED {
                    return Err(EngineError::AlreadyPaused);
                }
            }
            Command::Clear => self.lock_inner().life.clear(),
            Command::Randomise => self.lock_inner().life.randomise(),
        }
        Ok(())
    }

    /// Two-phase placement: the whole batch is validated before any cell is
    /// inserted, so an overlap leaves the world untouched. Placements always
    /// enter at age 0 regardless of what the client sent.
    fn handle_set_cells(&self, cells: &[Cell]) -> Result<(), EngineError> {
        let mut inner = self.lock_inner();
        for cell in cells {
            if !inner.life.can_set_cell(cell.x, cell.y) {
                return Err(EngineError::Overlap {
                    x: cell.x,
                    y: cell.y,
                });
            }
        }
        for cell in cells {
            inner.life.set_cell(cell.x, cell.y, cell.color, 0);
        }
        Ok(())
    }

    fn handle_set_speed(&self, speed: u16) -> Result<(), EngineError> {
        let speed = u32::from(speed.max(1));
        if self.speed.swap(speed, Ordering::SeqCst) == speed {
            return Err(EngineError::SpeedUnchanged);
        }
        self.speed_changed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Encodes the current world once and hands the frame to the hub
    /// channel. Non-blocking: with the channel full the frame is dropped,
    /// the next tick will supersede it anyway.
    fn publish(&self) {
        let frame = {
            let mut inner = self.lock_inner();
            let playing = self.state.load(Ordering::SeqCst) == PLAYING;
            let speed = self.speed.load(Ordering::SeqCst) as u16;
            let EngineInner {
                life,
                snapshot,
                encode_buf,
            } = &mut *inner;
            snapshot.playing = playing;
            snapshot.speed = speed;
            snapshot.cells.clear();
            snapshot.cells.extend(life.cells().map(|c| Cell {
                x: c.x,
                y: c.y,
                color: c.color,
                age: c.age,
            }));
            snapshot.encode_into(encode_buf);
            Bytes::copy_from_slice(encode_buf)
        };
        if self.output_tx.try_send(frame).is_err() {
            debug!("snapshot channel full or closed; dropping frame");
        }
    }

    fn apply_seed(&self, seed: &[u8]) -> Result<(), ProtocolError> {
        let snapshot = Snapshot::decode(seed)?;
        self.state.store(
            if snapshot.playing { PLAYING } else { PAUSED },
            Ordering::SeqCst,
        );
        self.speed
            .store(u32::from(snapshot.speed.max(1)), Ordering::SeqCst);
        let mut inner = self.lock_inner();
        for cell in &snapshot.cells {
            inner.life.set_cell(cell.x, cell.y, cell.color, cell.age);
        }
        Ok(())
    }

    fn new_ticker(&self) -> tokio::time::Interval {
        let period = Duration::from_millis(u64::from(self.speed.load(Ordering::SeqCst)));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, EngineInner> {
        self.inner.lock().expect("engine mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const W: u32 = 16;

    async fn next_frame(rx: &mut mpsc::Receiver<Bytes>) -> Snapshot {
        let frame = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for a snapshot")
            .expect("snapshot channel closed");
        Snapshot::decode(&frame).expect("published frame must decode")
    }

    fn sorted_cells(snapshot: &Snapshot) -> Vec<Cell> {
        let mut cells = snapshot.cells.clone();
        cells.sort_unstable_by_key(|c| (c.x, c.y, c.color, c.age));
        cells
    }

    #[tokio::test]
    async fn initial_snapshot_is_empty_and_paused() {
        let (_engine, mut rx) = Engine::new(W, None);
        let snapshot = next_frame(&mut rx).await;
        assert!(!snapshot.playing);
        assert_eq!(snapshot.speed, 100);
        assert!(snapshot.cells.is_empty());
    }

    #[tokio::test]
    async fn set_cells_is_atomic_on_overlap() {
        let (engine, mut rx) = Engine::new(W, None);
        let _ = next_frame(&mut rx).await;

        let place = ClientMessage::SetCells(vec![Cell {
            x: 5,
            y: 5,
            color: 0x123456,
            age: 0,
        }]);
        engine.submit(&place.encode()).unwrap();
        let before = sorted_cells(&next_frame(&mut rx).await);

        let batch = ClientMessage::SetCells(vec![
            Cell {
                x: 5,
                y: 5,
                color: 0xaaaaaa,
                age: 0,
            },
            Cell {
                x: 6,
                y: 6,
                color: 0xbbbbbb,
                age: 0,
            },
        ]);
        assert_eq!(
            engine.submit(&batch.encode()),
            Err(EngineError::Overlap { x: 5, y: 5 })
        );

        // A failed submit publishes nothing; force a frame and compare.
        engine
            .submit(&ClientMessage::SetSpeed(70).encode())
            .unwrap();
        let after = next_frame(&mut rx).await;
        assert_eq!(sorted_cells(&after), before);
    }

    #[tokio::test]
    async fn placements_ignore_client_supplied_age() {
        let (engine, mut rx) = Engine::new(W, None);
        let _ = next_frame(&mut rx).await;

        let place = ClientMessage::SetCells(vec![Cell {
            x: 2,
            y: 3,
            color: 0xabcdef,
            age: 999,
        }]);
        engine.submit(&place.encode()).unwrap();
        let snapshot = next_frame(&mut rx).await;
        assert_eq!(snapshot.cells.len(), 1);
        assert_eq!(snapshot.cells[0].age, 0);
    }

    #[tokio::test]
    async fn play_pause_next_are_arbitrated() {
        let (engine, _rx) = Engine::new(W, None);

        engine
            .submit(&ClientMessage::Command(Command::Play).encode())
            .unwrap();
        assert!(engine.playing());
        assert_eq!(
            engine.submit(&ClientMessage::Command(Command::Play).encode()),
            Err(EngineError::AlreadyPlaying)
        );
        assert_eq!(
            engine.submit(&ClientMessage::Command(Command::Next).encode()),
            Err(EngineError::NextWhilePlaying)
        );

        engine
            .submit(&ClientMessage::Command(Command::Pause).encode())
            .unwrap();
        assert_eq!(
            engine.submit(&ClientMessage::Command(Command::Pause).encode()),
            Err(EngineError::AlreadyPaused)
        );
        engine
            .submit(&ClientMessage::Command(Command::Next).encode())
            .unwrap();
    }

    #[tokio::test]
    async fn unchanged_speed_is_rejected_without_rearming() {
        let (engine, _rx) = Engine::new(W, None);
        assert_eq!(
            engine.submit(&ClientMessage::SetSpeed(100).encode()),
            Err(EngineError::SpeedUnchanged)
        );
        assert!(!engine.speed_changed.load(Ordering::SeqCst));

        engine.submit(&ClientMessage::SetSpeed(50).encode()).unwrap();
        assert_eq!(engine.speed(), 50);
        assert!(engine.speed_changed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn zero_speed_is_clamped() {
        let (engine, _rx) = Engine::new(W, None);
        engine.submit(&ClientMessage::SetSpeed(0).encode()).unwrap();
        assert_eq!(engine.speed(), 1);
    }

    #[tokio::test]
    async fn malformed_frames_are_protocol_errors() {
        let (engine, _rx) = Engine::new(W, None);
        assert!(matches!(
            engine.submit(&[0x7f]),
            Err(EngineError::Protocol(ProtocolError::UnknownTag(0x7f)))
        ));
        assert!(matches!(
            engine.submit(&[]),
            Err(EngineError::Protocol(ProtocolError::TooShort { .. }))
        ));
    }

    #[tokio::test]
    async fn seed_restores_state_speed_and_ages() {
        let seed = Snapshot {
            playing: true,
            speed: 250,
            cells: vec![
                Cell {
                    x: 1,
                    y: 1,
                    color: 0x00ff00,
                    age: 7,
                },
                Cell {
                    x: 2,
                    y: 2,
                    color: 0xff0000,
                    age: 0,
                },
            ],
        }
        .encode();

        let (engine, mut rx) = Engine::new(W, Some(&seed));
        assert!(engine.playing());
        assert_eq!(engine.speed(), 250);
        let snapshot = next_frame(&mut rx).await;
        let cells = sorted_cells(&snapshot);
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].age, 7);
    }

    #[tokio::test]
    async fn corrupt_seed_starts_empty_and_paused() {
        let (engine, mut rx) = Engine::new(W, Some(&[0xde, 0xad]));
        assert!(!engine.playing());
        let snapshot = next_frame(&mut rx).await;
        assert!(snapshot.cells.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn playing_engine_advances_generations_on_ticks() {
        let seed = Snapshot {
            playing: true,
            speed: 100,
            cells: vec![
                Cell {
                    x: 5,
                    y: 5,
                    color: 0x00ff00,
                    age: 0,
                },
                Cell {
                    x: 5,
                    y: 6,
                    color: 0x00ff00,
                    age: 0,
                },
                Cell {
                    x: 5,
                    y: 7,
                    color: 0x00ff00,
                    age: 0,
                },
            ],
        }
        .encode();
        let (engine, mut rx) = Engine::new(W, Some(&seed));
        let initial = next_frame(&mut rx).await;
        assert!(initial.playing);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(engine.clone().run(cancel.clone()));

        // Blinker alternates orientation every generation.
        let first = sorted_cells(&next_frame(&mut rx).await);
        assert_eq!(
            first.iter().map(|c| (c.x, c.y)).collect::<Vec<_>>(),
            vec![(4, 6), (5, 6), (6, 6)]
        );
        let second = sorted_cells(&next_frame(&mut rx).await);
        assert_eq!(
            second.iter().map(|c| (c.x, c.y)).collect::<Vec<_>>(),
            vec![(5, 5), (5, 6), (5, 7)]
        );

        cancel.cancel();
        task.await.unwrap();
        assert!(!engine.failed());
    }

    #[tokio::test(start_paused = true)]
    async fn paused_engine_publishes_nothing_on_ticks() {
        let (engine, mut rx) = Engine::new(W, None);
        let _ = next_frame(&mut rx).await;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(engine.clone().run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        task.await.unwrap();
    }
}
