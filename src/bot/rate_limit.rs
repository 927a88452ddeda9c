use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_COMMANDS: usize = 10;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window command limiter, keyed by user id.
pub struct CommandLimiter {
    max: usize,
    window: Duration,
    hits: std::sync::Mutex<HashMap<i64, VecDeque<Instant>>>,
}

impl Default for CommandLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_COMMANDS, DEFAULT_WINDOW)
    }
}

impl CommandLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            hits: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Record a command; `false` when the user is over the limit.
    pub fn check(&self, user: i64) -> bool {
        self.check_at(user, Instant::now())
    }

    pub fn check_at(&self, user: i64, now: Instant) -> bool {
        // 锁中毒时放行，不让限流器拖垮命令处理
        let mut hits = match self.hits.lock() {
            Ok(guard) => guard,
            Err(_poisoned) => return true,
        };
        let window = hits.entry(user).or_default();
        while let Some(&oldest) = window.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= self.max {
            return false;
        }
        window.push_back(now);
        true
    }

    /// Drop users with no hits inside the window.
    pub fn prune_at(&self, now: Instant) {
        if let Ok(mut hits) = self.hits.lock() {
            let window = self.window;
            hits.retain(|_, q| {
                q.back()
                    .is_some_and(|&last| now.saturating_duration_since(last) < window)
            });
        }
    }

    /// Users currently holding a window.
    pub fn tracked(&self) -> usize {
        self.hits.lock().map(|hits| hits.len()).unwrap_or(0)
    }
}
