//! Kernel timing over the profiled command queue.

use anyhow::Result;
use ocl::enums::ProfilingInfo;
use ocl::Event;

/// Wait for the event and return the device-side execution time in
/// milliseconds (end minus start timestamp).
pub fn event_elapsed_ms(event: &Event) -> Result<f64> {
    event.wait_for()?;
    let start = event.profiling_info(ProfilingInfo::Start)?.time()?;
    let end = event.profiling_info(ProfilingInfo::End)?.time()?;
    Ok(end.saturating_sub(start) as f64 / 1.0e6)
}

/// Accumulates named kernel timings and reports them as a share table.
#[derive(Default)]
pub struct ProfileSession {
    entries: Vec<(String, f64)>,
}

impl ProfileSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the event's timestamps and record them under `name`. A failed
    /// profiling query is recorded as a negative time so the report can flag
    /// it without losing the row.
    pub fn add(&mut self, name: &str, event: &Event) {
        let ms = event_elapsed_ms(event).unwrap_or(-1.0);
        self.entries.push((name.to_string(), ms));
    }

    pub fn record(&mut self, name: &str, ms: f64) {
        self.entries.push((name.to_string(), ms));
    }

    pub fn entries(&self) -> &[(String, f64)] {
        &self.entries
    }

    pub fn total_ms(&self) -> f64 {
        self.entries.iter().filter(|(_, ms)| *ms > 0.0).map(|(_, ms)| ms).sum()
    }

    pub fn report(&self) -> String {
        if self.entries.is_empty() {
            return "profile session: no entries\n".to_string();
        }
        let total = self.total_ms();
        let mut out = String::new();
        out.push_str(&format!("{:<36} {:>12} {:>9}\n", "kernel", "time (ms)", "share"));
        for (name, ms) in &self.entries {
            if *ms < 0.0 {
                out.push_str(&format!("{name:<36} {:>12} {:>9}\n", "failed", "-"));
                continue;
            }
            let pct = if total > 0.0 { ms / total * 100.0 } else { 0.0 };
            out.push_str(&format!("{name:<36} {ms:>12.3} {pct:>8.1}%\n"));
        }
        out.push_str(&format!("{:<36} {total:>12.3} {:>8.1}%\n", "total", 100.0));
        out
    }
}
