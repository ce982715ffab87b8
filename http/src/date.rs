//! low resolution date time used for `date` response headers, refreshed by a
//! background task instead of a syscall per response.

use core::fmt::{self, Write};

use std::{
    cell::RefCell,
    rc::Rc,
    time::{Duration, SystemTime},
};

use httpdate::HttpDate;
use tokio::{
    task::JoinHandle,
    time::{interval, Instant},
};

/// the length of the byte representation of [HttpDate].
pub const DATE_VALUE_LENGTH: usize = 29;

/// source of the current date/time for response generation.
pub trait DateTime {
    /// closure receives the byte slice representation of [HttpDate].
    fn with_date<F, O>(&self, f: F) -> O
    where
        F: FnOnce(&[u8]) -> O;

    fn now(&self) -> Instant;
}

/// shared date state refreshed every 500 milliseconds by a local task.
pub struct DateTimeService {
    state: Rc<DateTimeHandle>,
    handle: JoinHandle<()>,
}

impl Drop for DateTimeService {
    fn drop(&mut self) {
        // stop the refresh task together with the service.
        self.handle.abort();
    }
}

impl Default for DateTimeService {
    fn default() -> Self {
        Self::new()
    }
}

impl DateTimeService {
    /// # Panics
    /// when called outside a tokio local task context.
    pub fn new() -> Self {
        let state = Rc::new(RefCell::new(DateTimeState::new()));
        let state_clone = Rc::clone(&state);

        let handle = tokio::task::spawn_local(async move {
            let mut interval = interval(Duration::from_millis(500));
            loop {
                let _ = interval.tick().await;
                *state_clone.borrow_mut() = DateTimeState::new();
            }
        });

        Self { state, handle }
    }

    #[inline]
    pub fn get(&self) -> &DateTimeHandle {
        &self.state
    }
}

pub type DateTimeHandle = RefCell<DateTimeState>;

#[derive(Copy, Clone)]
pub struct DateTimeState {
    date: [u8; DATE_VALUE_LENGTH],
    now: Instant,
}

impl DateTimeState {
    fn new() -> Self {
        let mut state = Self {
            date: [0; DATE_VALUE_LENGTH],
            now: Instant::now(),
        };
        let _ = write!(state, "{}", HttpDate::from(SystemTime::now()));
        state
    }
}

impl Write for DateTimeState {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.date.copy_from_slice(s.as_bytes());
        Ok(())
    }
}

impl DateTime for DateTimeHandle {
    #[inline]
    fn with_date<F, O>(&self, f: F) -> O
    where
        F: FnOnce(&[u8]) -> O,
    {
        f(&self.borrow().date)
    }

    #[inline]
    fn now(&self) -> Instant {
        self.borrow().now
    }
}

/// date source backed by plain system time. used where no refresh task runs,
/// e.g. in tests.
pub struct SystemClock;

impl DateTime for SystemClock {
    fn with_date<F, O>(&self, f: F) -> O
    where
        F: FnOnce(&[u8]) -> O,
    {
        let date = HttpDate::from(SystemTime::now()).to_string();
        f(date.as_bytes())
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}
