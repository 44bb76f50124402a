//! SLA monitoring.
//!
//! Observes job completion latencies per tier and emits scale signals to the
//! runner pool: warm floor up when a tier's P95 breaches its SLA budget,
//! down when a class sits under-utilized for a sustained window.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::SlaConfig;
use crate::pool::RunnerClass;
use crate::scheduler::job::Tier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleSignal {
    Up(RunnerClass),
    Down(RunnerClass),
}

const MIN_SAMPLES: usize = 8;

#[derive(Debug)]
pub struct SlaMonitor {
    cfg: SlaConfig,
    windows: HashMap<(Tier, RunnerClass), VecDeque<u64>>,
    low_since: HashMap<RunnerClass, DateTime<Utc>>,
}

impl SlaMonitor {
    pub fn new(cfg: SlaConfig) -> Self {
        Self {
            cfg,
            windows: HashMap::new(),
            low_since: HashMap::new(),
        }
    }

    /// Record a completed job's submission-to-completion latency.
    pub fn observe(&mut self, tier: Tier, class: RunnerClass, latency: Duration) {
        let window = self.windows.entry((tier, class)).or_default();
        if window.len() >= self.cfg.window {
            window.pop_front();
        }
        window.push_back(latency.as_millis() as u64);
    }

    /// Rolling percentile latency for a tier, across both classes.
    pub fn percentile(&self, tier: Tier, p: f64) -> Option<Duration> {
        let mut samples: Vec<u64> = self
            .windows
            .iter()
            .filter(|((t, _), _)| *t == tier)
            .flat_map(|(_, w)| w.iter().copied())
            .collect();
        if samples.is_empty() {
            return None;
        }
        samples.sort_unstable();
        let rank = ((samples.len() as f64 * p).ceil() as usize).clamp(1, samples.len()) - 1;
        Some(Duration::from_millis(samples[rank]))
    }

    fn p95_breached(&self, tier: Tier, class: RunnerClass) -> bool {
        let window = match self.windows.get(&(tier, class)) {
            Some(w) if w.len() >= MIN_SAMPLES => w,
            _ => return false,
        };
        let mut samples: Vec<u64> = window.iter().copied().collect();
        samples.sort_unstable();
        let rank = ((samples.len() as f64 * 0.95).ceil() as usize).clamp(1, samples.len()) - 1;
        let p95 = samples[rank] as f64;
        let budget = self.cfg.target(tier).as_millis() as f64 * self.cfg.scale_up_factor;
        p95 > budget
    }

    /// Evaluate scale signals from the latest latency windows and current
    /// pool utilization. Breached windows are cleared so one sustained
    /// breach produces one signal.
    pub fn scale_signals(
        &mut self,
        utilization: &HashMap<RunnerClass, f64>,
        now: DateTime<Utc>,
    ) -> Vec<ScaleSignal> {
        let mut signals = Vec::new();

        for class in RunnerClass::ALL {
            let breached = [Tier::Hot, Tier::Warm, Tier::Cold]
                .into_iter()
                .any(|tier| self.p95_breached(tier, class));
            if breached {
                for tier in [Tier::Hot, Tier::Warm, Tier::Cold] {
                    self.windows.remove(&(tier, class));
                }
                tracing::warn!(class = %class, "Tier P95 over budget, signaling scale-up");
                signals.push(ScaleSignal::Up(class));
                self.low_since.remove(&class);
                continue;
            }

            // A class with no live runners has nothing to scale down.
            let util = match utilization.get(&class) {
                Some(util) => *util,
                None => {
                    self.low_since.remove(&class);
                    continue;
                }
            };
            if util < self.cfg.low_water_utilization {
                let since = *self.low_since.entry(class).or_insert(now);
                let sustain = chrono::Duration::from_std(self.cfg.sustain)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30));
                if now - since >= sustain {
                    tracing::info!(class = %class, utilization = util, "Sustained low utilization, signaling scale-down");
                    signals.push(ScaleSignal::Down(class));
                    self.low_since.remove(&class);
                }
            } else {
                self.low_since.remove(&class);
            }
        }

        signals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(sla: SlaConfig) -> SlaMonitor {
        SlaMonitor::new(sla)
    }

    #[test]
    fn percentile_over_recorded_latencies() {
        let mut m = monitor(SlaConfig::default());
        for ms in [10u64, 20, 30, 40, 50, 60, 70, 80, 90, 100] {
            m.observe(Tier::Hot, RunnerClass::Linux, Duration::from_millis(ms));
        }
        let p50 = m.percentile(Tier::Hot, 0.5).unwrap();
        assert_eq!(p50, Duration::from_millis(50));
        let p95 = m.percentile(Tier::Hot, 0.95).unwrap();
        assert_eq!(p95, Duration::from_millis(100));
    }

    #[test]
    fn no_percentile_without_samples() {
        let m = monitor(SlaConfig::default());
        assert!(m.percentile(Tier::Warm, 0.95).is_none());
    }

    #[test]
    fn scale_up_on_p95_breach() {
        let mut cfg = SlaConfig::default();
        cfg.hot = Duration::from_millis(100);
        let mut m = monitor(cfg);
        // P95 well over 1.5 * 100ms.
        for _ in 0..MIN_SAMPLES {
            m.observe(Tier::Hot, RunnerClass::MacOs, Duration::from_millis(500));
        }
        let util = HashMap::from([(RunnerClass::MacOs, 0.9), (RunnerClass::Linux, 0.9)]);
        let signals = m.scale_signals(&util, Utc::now());
        assert!(signals.contains(&ScaleSignal::Up(RunnerClass::MacOs)));

        // Window cleared: no repeated signal from the same samples.
        let signals = m.scale_signals(&util, Utc::now());
        assert!(!signals.contains(&ScaleSignal::Up(RunnerClass::MacOs)));
    }

    #[test]
    fn no_scale_up_within_budget() {
        let mut cfg = SlaConfig::default();
        cfg.hot = Duration::from_millis(100);
        let mut m = monitor(cfg);
        for _ in 0..MIN_SAMPLES {
            m.observe(Tier::Hot, RunnerClass::Linux, Duration::from_millis(120));
        }
        let util = HashMap::from([(RunnerClass::Linux, 0.9)]);
        assert!(m
            .scale_signals(&util, Utc::now())
            .iter()
            .all(|s| !matches!(s, ScaleSignal::Up(_))));
    }

    #[test]
    fn scale_down_after_sustained_low_utilization() {
        let mut cfg = SlaConfig::default();
        cfg.sustain = Duration::from_secs(30);
        let mut m = monitor(cfg);
        let util = HashMap::from([(RunnerClass::Linux, 0.05), (RunnerClass::MacOs, 0.9)]);

        let start = Utc::now();
        // First observation only starts the clock.
        assert!(m.scale_signals(&util, start).is_empty());
        // Still inside the sustain window.
        assert!(m
            .scale_signals(&util, start + chrono::Duration::seconds(10))
            .is_empty());
        // Past the window: one down signal for the idle class.
        let signals = m.scale_signals(&util, start + chrono::Duration::seconds(40));
        assert_eq!(signals, vec![ScaleSignal::Down(RunnerClass::Linux)]);
    }

    #[test]
    fn class_without_live_runners_never_scales_down() {
        let mut cfg = SlaConfig::default();
        cfg.sustain = Duration::from_secs(30);
        let mut m = monitor(cfg);
        // MacOs has no live runners and is absent from the map.
        let util = HashMap::from([(RunnerClass::Linux, 0.8)]);

        let start = Utc::now();
        assert!(m.scale_signals(&util, start).is_empty());
        assert!(m
            .scale_signals(&util, start + chrono::Duration::seconds(60))
            .is_empty());
    }

    #[test]
    fn recovered_utilization_resets_the_clock() {
        let mut cfg = SlaConfig::default();
        cfg.sustain = Duration::from_secs(30);
        let mut m = monitor(cfg);
        let low = HashMap::from([(RunnerClass::Linux, 0.05)]);
        let high = HashMap::from([(RunnerClass::Linux, 0.8)]);

        let start = Utc::now();
        assert!(m.scale_signals(&low, start).is_empty());
        assert!(m
            .scale_signals(&high, start + chrono::Duration::seconds(20))
            .is_empty());
        // The earlier low stretch no longer counts.
        assert!(m
            .scale_signals(&low, start + chrono::Duration::seconds(40))
            .is_empty());
    }
}
