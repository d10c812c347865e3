//! Metrics aggregation — windows over append-only RunMetrics.
//!
//! Serves `/studio/metrics`. Totals are always computed from the metric
//! rows, never cached on sessions.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use deliberation::{AgentId, RunMetric, RunPhase, RunStatus};

/// Aggregation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricsPeriod {
    #[serde(rename = "1h")]
    Hour,
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
}

impl MetricsPeriod {
    pub fn window(self) -> Duration {
        match self {
            Self::Hour => Duration::hours(1),
            Self::Day => Duration::hours(24),
            Self::Week => Duration::days(7),
            Self::Month => Duration::days(30),
        }
    }
}

impl std::str::FromStr for MetricsPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1h" => Ok(Self::Hour),
            "24h" => Ok(Self::Day),
            "7d" => Ok(Self::Week),
            "30d" => Ok(Self::Month),
            other => Err(format!("unknown period: {other} (expected 1h|24h|7d|30d)")),
        }
    }
}

impl std::fmt::Display for MetricsPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hour => write!(f, "1h"),
            Self::Day => write!(f, "24h"),
            Self::Week => write!(f, "7d"),
            Self::Month => write!(f, "30d"),
        }
    }
}

/// Per-agent rollup within a window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentBreakdown {
    pub agent_id: AgentId,
    pub calls: u64,
    pub success: u64,
    pub error: u64,
    pub timeout: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub mean_latency_ms: u64,
}

/// Per-phase rollup within a window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseBreakdown {
    pub phase: RunPhase,
    pub calls: u64,
    pub cost_usd: f64,
}

/// Aggregated view of a metrics window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub period: MetricsPeriod,
    pub window_start: DateTime<Utc>,
    pub total_calls: u64,
    pub success: u64,
    pub error: u64,
    pub timeout: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub mean_latency_ms: u64,
    pub by_agent: Vec<AgentBreakdown>,
    pub by_phase: Vec<PhaseBreakdown>,
}

/// Aggregate metric rows that fall inside the period ending at `now`.
pub fn aggregate(metrics: &[RunMetric], period: MetricsPeriod, now: DateTime<Utc>) -> MetricsSummary {
    let window_start = now - period.window();
    let in_window: Vec<&RunMetric> = metrics
        .iter()
        .filter(|m| m.created_at >= window_start && m.created_at <= now)
        .collect();

    let mut summary = MetricsSummary {
        period,
        window_start,
        total_calls: in_window.len() as u64,
        success: 0,
        error: 0,
        timeout: 0,
        total_tokens: 0,
        total_cost_usd: 0.0,
        mean_latency_ms: 0,
        by_agent: Vec::new(),
        by_phase: Vec::new(),
    };

    let mut latency_sum = 0u64;
    for metric in &in_window {
        match metric.status {
            RunStatus::Success => summary.success += 1,
            RunStatus::Error => summary.error += 1,
            RunStatus::Timeout => summary.timeout += 1,
        }
        summary.total_tokens += metric.tokens_in as u64 + metric.tokens_out as u64;
        summary.total_cost_usd += metric.cost_usd;
        latency_sum += metric.latency_ms;
    }
    if !in_window.is_empty() {
        summary.mean_latency_ms = latency_sum / in_window.len() as u64;
    }

    for agent in AgentId::ALL {
        let rows: Vec<&&RunMetric> = in_window.iter().filter(|m| m.agent_id == agent).collect();
        if rows.is_empty() {
            continue;
        }
        let mut breakdown = AgentBreakdown {
            agent_id: agent,
            calls: rows.len() as u64,
            success: 0,
            error: 0,
            timeout: 0,
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            mean_latency_ms: 0,
        };
        let mut agent_latency = 0u64;
        for metric in &rows {
            match metric.status {
                RunStatus::Success => breakdown.success += 1,
                RunStatus::Error => breakdown.error += 1,
                RunStatus::Timeout => breakdown.timeout += 1,
            }
            breakdown.tokens_in += metric.tokens_in as u64;
            breakdown.tokens_out += metric.tokens_out as u64;
            breakdown.cost_usd += metric.cost_usd;
            agent_latency += metric.latency_ms;
        }
        breakdown.mean_latency_ms = agent_latency / rows.len() as u64;
        summary.by_agent.push(breakdown);
    }

    for phase in [RunPhase::Analyze, RunPhase::Critique, RunPhase::Synthesize] {
        let rows: Vec<&&RunMetric> = in_window.iter().filter(|m| m.phase == phase).collect();
        if rows.is_empty() {
            continue;
        }
        summary.by_phase.push(PhaseBreakdown {
            phase,
            calls: rows.len() as u64,
            cost_usd: rows.iter().map(|m| m.cost_usd).sum(),
        });
    }

    summary
}
