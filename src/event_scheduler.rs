//! Delayed dispatch for `<send delay="...">`/`<cancel>`, backed by the `timer` crate.\
//! One process-wide `timer::Timer` runs a background thread; `schedule_once` hands out a
//! `timer::Guard` per pending send, which the caller stores (`GlobalData.delayed_send`) and
//! drops to cancel.

use lazy_static::lazy_static;
use std::sync::Mutex;

lazy_static! {
    static ref SCHEDULER: Mutex<timer::Timer> = Mutex::new(timer::Timer::new());
}

/// Schedules `f` to run once, `delay_ms` from now. Returns `None` for non-positive delays;
/// callers that need "send now" semantics are expected to dispatch directly instead of
/// going through the scheduler.
pub fn schedule_once<F>(delay_ms: i64, f: F) -> Option<timer::Guard>
where
    F: 'static + FnMut() + Send,
{
    if delay_ms <= 0 {
        return None;
    }
    let timer = SCHEDULER.lock().unwrap();
    Some(timer.schedule_with_delay(chrono::Duration::milliseconds(delay_ms), f))
}
