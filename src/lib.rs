mod config;
pub use config::SwitchConfig;

pub mod alias;
pub mod blinded;
pub mod onion;
pub mod store;
pub mod switch;
pub mod types;
pub mod wire;

mod errors;
pub use errors::{Error, Result};

pub mod serde_utils;

#[cfg(test)]
pub mod tests;

use std::time;

/// Milliseconds since the unix epoch. Tests may pin the clock with
/// [`set_mocked_time`]; the mock is thread-local, so parallel tests do not
/// observe each other's clocks.
pub fn now_timestamp_as_millis_u64() -> u64 {
    #[cfg(test)]
    {
        let mocked = MOCKED_TIME.with(|time| *time.borrow());
        if let Some(mocked_time) = mocked {
            return mocked_time;
        }
    }
    time::SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .expect("Duration since unix epoch")
        .as_millis() as u64
}

#[cfg(test)]
thread_local! {
    static MOCKED_TIME: std::cell::RefCell<Option<u64>> = const { std::cell::RefCell::new(None) };
}

#[cfg(test)]
pub fn set_mocked_time(time: u64) {
    MOCKED_TIME.with(|t| {
        *t.borrow_mut() = Some(time);
    });
}
