//! Causally-fresh analog reads.
//!
//! Periodic reports keep a cache of the latest value per analog pin, but that
//! cache can lag an actuation by a whole sampling interval. [`SynchronousSampler`]
//! instead asks the board for an immediate report of specific pins and waits,
//! for a bounded time, for the matching acknowledgment.
//!
//! The acknowledgment is applied by whoever drains the link (the background
//! poller or the waiting caller itself), under the same lock that guards the
//! cache, and the values handed back are copied out at that moment. A caller
//! therefore never sees some requested pins fresh and others stale.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::config::PollMode;
use crate::error::{Error, Result};
use crate::firmata;
use crate::link::Link;
use crate::pins::{self, ANALOG_PINS};

const PIN_COUNT: usize = 6;

type Values = [Option<f64>; PIN_COUNT];

/// Ticket of one synchronous read, alive from request to completion or timeout.
#[derive(Debug, Clone)]
pub struct OutstandingRead {
    pub mask: u8,
    pub deadline: Instant,
    /// Copy of the cache taken when the acknowledgment arrived.
    completed: Option<Values>,
}

impl OutstandingRead {
    pub fn is_complete(&self) -> bool {
        self.completed.is_some()
    }
}

#[derive(Debug, Default)]
struct Table {
    values: Values,
    outstanding: Option<OutstandingRead>,
}

/// Latest known value of every analog pin, plus the outstanding read if any.
#[derive(Debug, Default)]
pub struct SampleTable {
    inner: Mutex<Table>,
    done: Condvar,
}

impl SampleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets every cached value and any outstanding read.
    pub fn reset(&self) {
        *self.inner.lock() = Table::default();
    }

    pub fn latest(&self, pin: u8) -> Option<f64> {
        self.inner.lock().values.get(pin as usize).copied().flatten()
    }

    pub fn outstanding(&self) -> Option<OutstandingRead> {
        self.inner.lock().outstanding.clone()
    }

    pub fn record_periodic(&self, pin: u8, value: f64) {
        if let Some(slot) = self.inner.lock().values.get_mut(pin as usize) {
            *slot = Some(value);
        }
    }

    /// Applies an immediate-report acknowledgment.
    ///
    /// Completes the outstanding read only if the acknowledgment covers every
    /// pin it asked for.
    pub fn record_ack(&self, samples: &[(u8, f64)]) {
        let mut table = self.inner.lock();
        let mut acked = 0u8;
        for &(pin, value) in samples {
            if let Some(slot) = table.values.get_mut(pin as usize) {
                *slot = Some(value);
                acked |= 1 << pin;
            }
        }
        let values = table.values;
        match table.outstanding.as_mut() {
            Some(read) if read.completed.is_none() && read.mask & !acked == 0 => {
                read.completed = Some(values);
                self.done.notify_all();
            }
            Some(read) => debug!(
                requested = read.mask,
                acked, "acknowledgment does not match the outstanding read"
            ),
            None => debug!(acked, "unsolicited acknowledgment"),
        }
    }

    fn begin(&self, mask: u8, deadline: Instant) {
        self.inner.lock().outstanding = Some(OutstandingRead {
            mask,
            deadline,
            completed: None,
        });
    }

    /// True once the outstanding read is past its deadline, or gone.
    fn expired(&self, now: Instant) -> bool {
        self.inner
            .lock()
            .outstanding
            .as_ref()
            .map_or(true, |read| now >= read.deadline)
    }

    fn abandon(&self) {
        self.inner.lock().outstanding = None;
    }

    /// Waits up to `granularity` for completion; on completion consumes the
    /// ticket and returns the values of `pins`.
    fn wait_for(&self, pins: &[u8], granularity: Duration) -> Option<Vec<f64>> {
        let mut table = self.inner.lock();
        let complete = |t: &Table| t.outstanding.as_ref().map_or(false, |r| r.is_complete());
        if !complete(&*table) {
            self.done.wait_for(&mut table, granularity);
        }
        if !complete(&*table) {
            return None;
        }
        let snapshot = table.outstanding.take()?.completed?;
        pins.iter().map(|&p| snapshot[p as usize]).collect()
    }
}

/// Validates a sample request and returns its pin mask.
pub fn check_pins(pins: &[u8]) -> Result<u8> {
    if pins.is_empty() {
        return Err(Error::InvalidParam {
            command: "sample",
            reason: "at least one pin is required".to_string(),
        });
    }
    if let Some(&pin) = pins.iter().find(|&&p| !pins::is_analog(p)) {
        return Err(Error::Pin {
            command: "sample",
            pin: pin.to_string(),
            valid: ANALOG_PINS,
        });
    }
    Ok(pins::analog_mask(pins))
}

pub struct SynchronousSampler {
    table: Arc<SampleTable>,
    timeout: Duration,
    granularity: Duration,
}

impl SynchronousSampler {
    pub fn new(table: Arc<SampleTable>, timeout: Duration, granularity: Duration) -> Self {
        Self {
            table,
            timeout,
            granularity,
        }
    }

    pub fn table(&self) -> &Arc<SampleTable> {
        &self.table
    }

    /// Requests a fresh sample of `pins` and waits for it.
    ///
    /// Returns `Ok(None)` when the board did not acknowledge in time; that is
    /// a normal outcome, distinct from a failed link.
    pub fn read(&self, link: &Link, pins: &[u8]) -> Result<Option<Vec<f64>>> {
        let mask = check_pins(pins)?;
        self.table.begin(mask, Instant::now() + self.timeout);
        if let Err(e) = link.send(&firmata::report_analog_now_query(mask)) {
            self.table.abandon();
            return Err(e.into());
        }

        loop {
            if link.mode() == PollMode::Manual {
                if let Err(e) = link.poll_once() {
                    self.table.abandon();
                    return Err(e.into());
                }
            }
            if let Some(values) = self.table.wait_for(pins, self.granularity) {
                debug!(?pins, ?values, "fresh sample");
                return Ok(Some(values));
            }
            if self.table.expired(Instant::now()) {
                self.table.abandon();
                debug!(?pins, "no sample before timeout");
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{BoardSimulator, SimPort};
    use std::thread;

    fn manual_link(board: &Arc<Mutex<BoardSimulator>>, table: &Arc<SampleTable>) -> Link {
        Link::new(
            Box::new(SimPort::new(Arc::clone(board))),
            Arc::clone(table),
            PollMode::Manual,
        )
    }

    fn sampler(table: &Arc<SampleTable>) -> SynchronousSampler {
        SynchronousSampler::new(
            Arc::clone(table),
            Duration::from_millis(100),
            Duration::from_millis(1),
        )
    }

    #[test]
    fn ack_completes_only_when_it_covers_the_mask() {
        let table = SampleTable::new();
        table.begin(0b11, Instant::now());
        table.record_ack(&[(0, 0.25)]);
        assert!(!table.outstanding().unwrap().is_complete());
        table.record_ack(&[(0, 0.5), (1, 0.75)]);
        assert!(table.outstanding().unwrap().is_complete());
        assert_eq!(table.wait_for(&[0, 1], Duration::ZERO), Some(vec![0.5, 0.75]));
        assert!(table.outstanding().is_none());
    }

    #[test]
    fn completed_snapshot_ignores_later_periodic_reports() {
        let table = SampleTable::new();
        table.begin(0b11, Instant::now());
        table.record_ack(&[(0, 0.1), (1, 0.2)]);
        table.record_periodic(1, 0.9);
        assert_eq!(table.wait_for(&[0, 1], Duration::ZERO), Some(vec![0.1, 0.2]));
        assert_eq!(table.latest(1), Some(0.9));
    }

    #[test]
    fn ticket_deadline_decides_expiry() {
        let table = SampleTable::new();
        let now = Instant::now();
        assert!(table.expired(now));
        table.begin(0b1, now + Duration::from_millis(50));
        assert!(!table.expired(now));
        assert!(table.expired(now + Duration::from_millis(50)));
        assert_eq!(table.outstanding().unwrap().deadline, now + Duration::from_millis(50));
    }

    #[test]
    fn check_pins_returns_mask() {
        assert_eq!(check_pins(&[0, 2]).unwrap(), 0b101);
        assert!(matches!(check_pins(&[]), Err(Error::InvalidParam { .. })));
    }

    #[test]
    fn read_returns_fresh_values_from_board() {
        let board = Arc::new(Mutex::new(BoardSimulator::new()));
        board.lock().set_analog_input(0, 1023);
        board.lock().set_analog_input(1, 512);
        let table = Arc::new(SampleTable::new());
        let link = manual_link(&board, &table);

        let values = sampler(&table).read(&link, &[0, 1]).unwrap();
        assert_eq!(values, Some(vec![1.0, 0.5005]));
        assert_eq!(table.latest(0), Some(1.0));
    }

    #[test]
    fn silent_board_yields_no_sample_within_bound() {
        let board = Arc::new(Mutex::new(BoardSimulator::new()));
        board.lock().set_silent(true);
        let table = Arc::new(SampleTable::new());
        let link = manual_link(&board, &table);

        let started = Instant::now();
        let values = sampler(&table).read(&link, &[0, 1]).unwrap();
        assert_eq!(values, None);
        assert!(started.elapsed() < Duration::from_millis(600));
        assert!(table.outstanding().is_none());
    }

    #[test]
    fn read_from_background_poller() {
        let board = Arc::new(Mutex::new(BoardSimulator::new()));
        board.lock().set_analog_input(4, 0);
        let table = Arc::new(SampleTable::new());
        let link = Arc::new(Link::new(
            Box::new(SimPort::new(Arc::clone(&board))),
            Arc::clone(&table),
            PollMode::Background,
        ));
        let poller = crate::link::Poller::spawn(Arc::clone(&link)).unwrap();

        let values = sampler(&table).read(&link, &[4]).unwrap();
        assert_eq!(values, Some(vec![0.0]));
        poller.stop();
    }

    #[test]
    fn ack_from_another_thread_wakes_waiter() {
        let table = Arc::new(SampleTable::new());
        table.begin(0b1, Instant::now());
        let writer = Arc::clone(&table);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            writer.record_ack(&[(0, 0.3)]);
        });
        let mut got = None;
        for _ in 0..200 {
            got = table.wait_for(&[0], Duration::from_millis(1));
            if got.is_some() {
                break;
            }
        }
        handle.join().unwrap();
        assert_eq!(got, Some(vec![0.3]));
    }

    #[test]
    fn reject_non_analog_pins() {
        let board = Arc::new(Mutex::new(BoardSimulator::new()));
        let table = Arc::new(SampleTable::new());
        let link = manual_link(&board, &table);
        let err = sampler(&table).read(&link, &[0, 7]).unwrap_err();
        assert!(matches!(err, Error::Pin { command: "sample", ref pin, .. } if pin == "7"));
        assert!(board.lock().received().is_empty());
    }
}
