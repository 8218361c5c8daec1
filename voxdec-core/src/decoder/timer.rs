//! Per-utterance and cumulative decoding time.
//!
//! Both clocks only run between [`PerfTimer::start`] and
//! [`PerfTimer::stop`], i.e. inside decoder calls. CPU time is the calling
//! thread's CPU clock; wall time is elapsed real time.

use std::time::{Duration, Instant};

use cpu_time::ThreadTime;
use serde::{Deserialize, Serialize};

/// Clock readings taken by [`PerfTimer::start`].
#[derive(Debug, Clone, Copy)]
struct Running {
    wall: Instant,
    cpu: Duration,
}

#[derive(Debug, Default)]
pub struct PerfTimer {
    utt_cpu: Duration,
    utt_wall: Duration,
    total_cpu: Duration,
    total_wall: Duration,
    running: Option<Running>,
}

fn thread_cpu() -> Duration {
    ThreadTime::now().as_duration()
}

impl PerfTimer {
    /// Zeroes the per-utterance counters.
    pub fn reset_utt(&mut self) {
        self.utt_cpu = Duration::ZERO;
        self.utt_wall = Duration::ZERO;
        self.running = None;
    }

    pub fn start(&mut self) {
        if self.running.is_none() {
            // Wall first so the wall interval encloses the CPU interval.
            let wall = Instant::now();
            self.running = Some(Running { wall, cpu: thread_cpu() });
        }
    }

    pub fn stop(&mut self) {
        let Some(since) = self.running.take() else {
            return;
        };
        let cpu = thread_cpu().saturating_sub(since.cpu);
        let wall = since.wall.elapsed();
        self.utt_cpu += cpu;
        self.total_cpu += cpu;
        self.utt_wall += wall;
        self.total_wall += wall;
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn utt_cpu(&self) -> Duration {
        self.utt_cpu
    }

    pub fn utt_wall(&self) -> Duration {
        self.utt_wall
    }

    pub fn total_cpu(&self) -> Duration {
        self.total_cpu
    }

    pub fn total_wall(&self) -> Duration {
        self.total_wall
    }
}

/// Speech duration versus processing time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodeTiming {
    pub frames: usize,
    pub speech_secs: f64,
    pub cpu_secs: f64,
    pub wall_secs: f64,
}

impl DecodeTiming {
    /// CPU seconds per second of speech; 0 when no speech was decoded.
    pub fn rtf_cpu(&self) -> f64 {
        if self.speech_secs > 0.0 {
            self.cpu_secs / self.speech_secs
        } else {
            0.0
        }
    }

    pub fn rtf_wall(&self) -> f64 {
        if self.speech_secs > 0.0 {
            self.wall_secs / self.speech_secs
        } else {
            0.0
        }
    }
}
