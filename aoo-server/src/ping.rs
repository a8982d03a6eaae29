//! Per-client ping policy.
//!
//! A client session advances `active → probing → inactive`: while active,
//! pings go out every `interval`; once a reply is missed the timer probes
//! `probe_count` times at `probe_interval`; if none of the probes is
//! answered the client counts as not responding and the server closes the
//! session.

#[derive(Debug, Clone, Copy)]
pub struct PingSettings {
    /// Ping interval while the client is responsive.
    pub interval: f64,
    /// Number of probes after a missed reply.
    pub probe_count: u32,
    /// Interval between probes.
    pub probe_interval: f64,
}

impl Default for PingSettings {
    fn default() -> Self {
        Self {
            interval: 5.0,
            probe_count: 5,
            probe_interval: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingState {
    Active,
    Probing,
    Inactive,
}

/// Outcome of one timer update.
#[derive(Debug, Clone, Copy)]
pub struct PingResult {
    /// A ping should be sent now.
    pub send_ping: bool,
    pub state: PingState,
    /// Seconds until the next scheduled action.
    pub wait: f64,
}

#[derive(Debug)]
pub struct PingTimer {
    state: PingState,
    last_ping: f64,
    last_pong: f64,
    probes_sent: u32,
}

impl PingTimer {
    pub fn new(now: f64) -> Self {
        Self {
            state: PingState::Active,
            last_ping: now,
            last_pong: now,
            probes_sent: 0,
        }
    }

    /// Record a pong from the client.
    pub fn pong(&mut self, now: f64) {
        self.last_pong = now;
        self.probes_sent = 0;
        self.state = PingState::Active;
    }

    pub fn state(&self) -> PingState {
        self.state
    }

    pub fn update(&mut self, now: f64, settings: &PingSettings) -> PingResult {
        let mut send_ping = false;
        match self.state {
            PingState::Active => {
                if self.last_ping > self.last_pong
                    && now - self.last_ping >= settings.probe_interval
                {
                    // reply missed, start probing
                    self.state = PingState::Probing;
                    self.probes_sent = 1;
                    self.last_ping = now;
                    send_ping = true;
                } else if now - self.last_ping >= settings.interval {
                    self.last_ping = now;
                    send_ping = true;
                }
            }
            PingState::Probing => {
                if now - self.last_ping >= settings.probe_interval {
                    if self.probes_sent >= settings.probe_count {
                        self.state = PingState::Inactive;
                    } else {
                        self.probes_sent += 1;
                        self.last_ping = now;
                        send_ping = true;
                    }
                }
            }
            PingState::Inactive => {}
        }
        let wait = match self.state {
            PingState::Active => {
                let next = if self.last_ping > self.last_pong {
                    self.last_ping + settings.probe_interval
                } else {
                    self.last_ping + settings.interval
                };
                (next - now).max(0.0)
            }
            PingState::Probing => (self.last_ping + settings.probe_interval - now).max(0.0),
            PingState::Inactive => f64::MAX,
        };
        PingResult {
            send_ping,
            state: self.state,
            wait,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS: PingSettings = PingSettings {
        interval: 5.0,
        probe_count: 3,
        probe_interval: 1.0,
    };

    #[test]
    fn test_regular_pings_while_responsive() {
        let mut timer = PingTimer::new(0.0);
        assert!(!timer.update(1.0, &SETTINGS).send_ping);
        let r = timer.update(5.0, &SETTINGS);
        assert!(r.send_ping);
        assert_eq!(r.state, PingState::Active);
        timer.pong(5.1);
        // interval restarts from the last ping
        assert!(!timer.update(6.0, &SETTINGS).send_ping);
        assert!(timer.update(10.0, &SETTINGS).send_ping);
    }

    #[test]
    fn test_probing_then_inactive() {
        let mut timer = PingTimer::new(0.0);
        assert!(timer.update(5.0, &SETTINGS).send_ping);
        // no pong: after probe_interval the timer starts probing
        let r = timer.update(6.0, &SETTINGS);
        assert!(r.send_ping);
        assert_eq!(r.state, PingState::Probing);
        // two more probes, then give up
        assert!(timer.update(7.0, &SETTINGS).send_ping);
        assert!(timer.update(8.0, &SETTINGS).send_ping);
        let r = timer.update(9.0, &SETTINGS);
        assert!(!r.send_ping);
        assert_eq!(r.state, PingState::Inactive);
    }

    #[test]
    fn test_pong_recovers_probing() {
        let mut timer = PingTimer::new(0.0);
        timer.update(5.0, &SETTINGS);
        let r = timer.update(6.0, &SETTINGS);
        assert_eq!(r.state, PingState::Probing);
        timer.pong(6.5);
        assert_eq!(timer.state(), PingState::Active);
        // and the regular schedule resumes
        let r = timer.update(7.0, &SETTINGS);
        assert_eq!(r.state, PingState::Active);
    }
}
