use crate::kernels::kind::KindMetrics;
use crate::Error;
use crate::Result;
use serde::Serialize;
use std::io::Write;

/// process resource snapshot carried in every batch log record
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Rusage {
    pub max_rss_kb: i64,
    pub user_time_sec: f64,
    pub sys_time_sec: f64,
}

impl Rusage {
    pub fn snapshot() -> Self {
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        let status = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
        if status != 0 {
            return Self::default();
        }
        let seconds = |time: libc::timeval| time.tv_sec as f64 + time.tv_usec as f64 * 1e-6;
        Self {
            max_rss_kb: usage.ru_maxrss,
            user_time_sec: seconds(usage.ru_utime),
            sys_time_sec: seconds(usage.ru_stime),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Scores {
    pub assigned_object_count: usize,
    pub score: f32,
    pub kl_divergence: f32,
}

/// model shape at a batch boundary: groups and features per nonempty
/// kind, plus the hyperparameters of the outer clustering
#[derive(Debug, Clone, Default, Serialize)]
pub struct Summary {
    pub topology_alpha: f32,
    pub topology_d: f32,
    pub category_counts: Vec<usize>,
    pub feature_counts: Vec<usize>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CatStatus {
    pub total_time_sec: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct KindStatus {
    pub total_count: usize,
    pub change_count: usize,
    pub birth_count: usize,
    pub death_count: usize,
    pub tare_time_sec: f64,
    pub score_time_sec: f64,
    pub sample_time_sec: f64,
    pub total_time_sec: f64,
}

impl From<&KindMetrics> for KindStatus {
    fn from(metrics: &KindMetrics) -> Self {
        Self {
            total_count: metrics.total_count,
            change_count: metrics.change_count,
            birth_count: metrics.birth_count,
            death_count: metrics.death_count,
            tare_time_sec: metrics.tare_time.as_secs_f64(),
            score_time_sec: metrics.score_time.as_secs_f64(),
            sample_time_sec: metrics.sample_time.as_secs_f64(),
            total_time_sec: metrics.total_time.as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct HyperStatus {
    pub total_time_sec: f64,
}

/// one record per batch boundary
#[derive(Debug, Clone, Default, Serialize)]
pub struct LogMessage {
    pub iter: u64,
    pub rusage: Rusage,
    pub summary: Summary,
    pub scores: Scores,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cat: Option<CatStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<KindStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hyper: Option<HyperStatus>,
}

/// the batch log sink: JSON lines to a file when a path is configured,
/// a no-op otherwise. injected into the driver rather than global.
pub struct Logger {
    out: Option<std::io::BufWriter<std::fs::File>>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::noop()
    }
}

impl Logger {
    pub fn noop() -> Self {
        Self { out: None }
    }

    pub fn create(path: &str) -> Result<Self> {
        let file = std::fs::File::create(path).map_err(Error::io(path))?;
        Ok(Self {
            out: Some(std::io::BufWriter::new(file)),
        })
    }

    pub fn log(&mut self, message: &LogMessage) -> Result<()> {
        log::info!(
            "iter {} rows {} score {:.2} kinds {}",
            message.iter,
            message.scores.assigned_object_count,
            message.scores.score,
            message.summary.feature_counts.len(),
        );
        if let Some(out) = self.out.as_mut() {
            let line = serde_json::to_string(message)
                .map_err(|e| Error::Parse(format!("log serialization: {}", e)))?;
            writeln!(out, "{}", line).map_err(Error::io("log file"))?;
            out.flush().map_err(Error::io("log file"))?;
        }
        Ok(())
    }
}
