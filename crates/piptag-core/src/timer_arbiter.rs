//! Ownership of the shared capture/compare timer.
//!
//! The tag has one timer and one interrupt vector, shared by moisture
//! sensing, humidity sensor warm-up, timed sleeps and ambient light sensing.
//! A client takes a [`Reservation`] before touching the timer; the
//! reservation is the only way to wait on a timer event and releases the
//! timer when dropped.
//!
//! The interrupt handler calls [`TimerArbiter::on_interrupt`], which decides
//! from the current owner alone what the handler must shut down and wakes the
//! waiting client.

use core::cell::Cell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, with_timeout};
use log::{debug, error, warn};
use thiserror_no_std::Error;

use crate::hal::{CaptureTimer, TimerConfig};

/// Current owner of the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveWaiter {
    None,
    Moisture,
    HumidityInit,
    TimedSleep,
    AmbientLight,
}

/// Clients that may reserve the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Client {
    Moisture,
    HumidityInit,
    TimedSleep,
    AmbientLight,
}

impl From<Client> for ActiveWaiter {
    fn from(client: Client) -> Self {
        match client {
            Client::Moisture => ActiveWaiter::Moisture,
            Client::HumidityInit => ActiveWaiter::HumidityInit,
            Client::TimedSleep => ActiveWaiter::TimedSleep,
            Client::AmbientLight => ActiveWaiter::AmbientLight,
        }
    }
}

/// Event raised by the timer interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Capture input fired; carries the captured count.
    Capture(u16),
    /// Counter reached the compare value.
    Compare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled(TimerEvent),
    TimedOut,
}

/// Bookkeeping the platform interrupt handler must perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsrAction {
    StopTimer,
    StopTimerAndComparator,
    /// Nobody is waiting; clear the flag and return.
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ArbiterError {
    #[error("Timer held by {held:?}, requested by {requested:?}")]
    Contention {
        held: ActiveWaiter,
        requested: Client,
    },
}

pub struct TimerArbiter {
    waiter: Mutex<CriticalSectionRawMutex, Cell<ActiveWaiter>>,
    event: Signal<CriticalSectionRawMutex, TimerEvent>,
}

impl Default for TimerArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerArbiter {
    pub const fn new() -> Self {
        Self {
            waiter: Mutex::new(Cell::new(ActiveWaiter::None)),
            event: Signal::new(),
        }
    }

    pub fn active(&self) -> ActiveWaiter {
        self.waiter.lock(|waiter| waiter.get())
    }

    /// Take the timer for `client`.
    pub fn reserve(&self, client: Client) -> Result<Reservation<'_>, ArbiterError> {
        self.waiter.lock(|waiter| {
            let held = waiter.get();
            if held != ActiveWaiter::None {
                error!("Timer contention: held by {:?}, requested by {:?}", held, client);
                return Err(ArbiterError::Contention {
                    held,
                    requested: client,
                });
            }
            waiter.set(client.into());
            Ok(())
        })?;

        Ok(Reservation {
            arbiter: self,
            client,
        })
    }

    /// Interrupt entry point.
    pub fn on_interrupt(&self, event: TimerEvent) -> IsrAction {
        let action = match self.active() {
            ActiveWaiter::None => {
                warn!("Spurious timer interrupt: {:?}", event);
                return IsrAction::Ignore;
            }
            ActiveWaiter::Moisture => IsrAction::StopTimerAndComparator,
            ActiveWaiter::HumidityInit | ActiveWaiter::TimedSleep | ActiveWaiter::AmbientLight => {
                IsrAction::StopTimer
            }
        };
        self.event.signal(event);
        action
    }

    fn release(&self, client: Client) {
        self.waiter.lock(|waiter| {
            if waiter.get() == ActiveWaiter::from(client) {
                waiter.set(ActiveWaiter::None);
            }
        });
    }
}

/// Exclusive use of the timer. Released on drop.
pub struct Reservation<'a> {
    arbiter: &'a TimerArbiter,
    client: Client,
}

impl Reservation<'_> {
    pub fn client(&self) -> Client {
        self.client
    }

    /// Configure and start the timer, then suspend until the interrupt fires
    /// or `deadline` expires. The timer is stopped either way.
    pub async fn await_event<T: CaptureTimer>(
        &mut self,
        timer: &mut T,
        config: &TimerConfig,
        deadline: Option<Duration>,
    ) -> WaitOutcome {
        self.arbiter.event.reset();
        timer.configure(config);
        timer.start();

        let outcome = match deadline {
            Some(deadline) => match with_timeout(deadline, self.arbiter.event.wait()).await {
                Ok(event) => WaitOutcome::Signaled(event),
                Err(_) => {
                    warn!("{:?} wait timed out after {} ms", self.client, deadline.as_millis());
                    WaitOutcome::TimedOut
                }
            },
            None => WaitOutcome::Signaled(self.arbiter.event.wait().await),
        };

        timer.stop();
        debug!("{:?} wait finished: {:?}", self.client, outcome);
        outcome
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.arbiter.release(self.client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::ClockSource;
    use crate::testing::MockTimer;
    use embassy_futures::block_on;

    const SLEEP: TimerConfig = TimerConfig::compare(ClockSource::Vlo, 8, 15);

    #[test]
    fn test_second_reservation_is_rejected() {
        let arbiter = TimerArbiter::new();
        let _held = arbiter.reserve(Client::Moisture).unwrap();

        let err = arbiter.reserve(Client::TimedSleep).err();
        assert_eq!(
            err,
            Some(ArbiterError::Contention {
                held: ActiveWaiter::Moisture,
                requested: Client::TimedSleep,
            })
        );
        assert_eq!(arbiter.active(), ActiveWaiter::Moisture);
    }

    #[test]
    fn test_drop_releases() {
        let arbiter = TimerArbiter::new();
        {
            let _light = arbiter.reserve(Client::AmbientLight).unwrap();
            assert_eq!(arbiter.active(), ActiveWaiter::AmbientLight);
        }
        assert_eq!(arbiter.active(), ActiveWaiter::None);
        assert!(arbiter.reserve(Client::HumidityInit).is_ok());
    }

    #[test]
    fn test_isr_action_depends_on_owner() {
        let arbiter = TimerArbiter::new();
        assert_eq!(arbiter.on_interrupt(TimerEvent::Compare), IsrAction::Ignore);

        let moisture = arbiter.reserve(Client::Moisture).unwrap();
        assert_eq!(
            arbiter.on_interrupt(TimerEvent::Capture(12)),
            IsrAction::StopTimerAndComparator
        );
        drop(moisture);

        let _sleep = arbiter.reserve(Client::TimedSleep).unwrap();
        assert_eq!(arbiter.on_interrupt(TimerEvent::Compare), IsrAction::StopTimer);
    }

    #[test]
    fn test_await_event_returns_captured_count() {
        let arbiter = TimerArbiter::new();
        let mut timer = MockTimer::new(&arbiter);
        timer.script(Some(TimerEvent::Capture(321)));

        let mut reservation = arbiter.reserve(Client::AmbientLight).unwrap();
        let outcome = block_on(reservation.await_event(&mut timer, &SLEEP, None));

        assert_eq!(outcome, WaitOutcome::Signaled(TimerEvent::Capture(321)));
        assert_eq!(timer.configured(), Some(SLEEP));
        assert!(!timer.running(), "timer must be stopped after the wait");
    }

    #[test]
    fn test_await_event_deadline() {
        let arbiter = TimerArbiter::new();
        let mut timer = MockTimer::new(&arbiter);
        timer.script(None);

        let mut reservation = arbiter.reserve(Client::Moisture).unwrap();
        let outcome = block_on(reservation.await_event(
            &mut timer,
            &SLEEP,
            Some(Duration::from_millis(5)),
        ));

        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(!timer.running());
    }

    #[test]
    fn test_stale_event_does_not_leak_into_next_wait() {
        let arbiter = TimerArbiter::new();
        let mut timer = MockTimer::new(&arbiter);

        let mut reservation = arbiter.reserve(Client::TimedSleep).unwrap();
        arbiter.on_interrupt(TimerEvent::Compare);

        timer.script(None);
        let outcome = block_on(reservation.await_event(
            &mut timer,
            &SLEEP,
            Some(Duration::from_millis(5)),
        ));
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }
}
