use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Admits at most `capacity` acquisitions per window.
///
/// The window opens on the first acquisition after the previous one expired,
/// so a burst straddling a boundary can see up to twice the nominal rate.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    capacity: u32,
    window: Duration,
    state: Mutex<WindowState>,
}

#[derive(Debug)]
struct WindowState {
    started: Option<Instant>,
    used: u32,
}

impl FixedWindowLimiter {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            window,
            state: Mutex::new(WindowState {
                started: None,
                used: 0,
            }),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Waits until the current window has a free slot, then takes it.
    pub async fn acquire(&self) {
        loop {
            let mut state = self.state.lock().await;
            let now = Instant::now();

            let expired = match state.started {
                Some(start) => now.duration_since(start) >= self.window,
                None => true,
            };
            if expired {
                state.started = Some(now);
                state.used = 0;
            }

            if state.used < self.capacity {
                state.used += 1;
                return;
            }

            let reopen = state.started.map(|s| s + self.window).unwrap_or(now);
            drop(state);
            tokio::time::sleep_until(reopen).await;
        }
    }
}
