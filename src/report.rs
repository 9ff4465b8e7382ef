use std::fmt::Write;

use serde::Serialize;

use crate::models::{FlagStatistics, PaymentSummary, QualityFlag, WorkerDailyPerformance, WorkerStanding};

pub fn build_report(
    summary: &PaymentSummary,
    flag_stats: &FlagStatistics,
    standings: &[WorkerStanding],
    open_flags: &[QualityFlag],
) -> String {
    let mut output = String::new();
    let scope = match summary.question_id {
        Some(id) => format!("question {id}"),
        None => "all questions".to_string(),
    };

    let _ = writeln!(output, "# Labeling Quality Report");
    let _ = writeln!(
        output,
        "Generated for {} ({} to {})",
        scope, summary.period_start, summary.period_end
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Payments");

    if summary.total_workers == 0 {
        let _ = writeln!(output, "No performance recorded for this period.");
    } else {
        let _ = writeln!(output, "- Workers paid: {}", summary.total_workers);
        let _ = writeln!(output, "- Base pay: {}", summary.total_base_pay);
        let _ = writeln!(output, "- Bonuses: {}", summary.total_bonuses);
        let _ = writeln!(output, "- Total: {}", summary.total_payment);
        let tiers = &summary.by_tier;
        let _ = writeln!(
            output,
            "- Worker-days by tier: excellent {}, good {}, fair {}, poor {}",
            tiers.excellent, tiers.good, tiers.fair, tiers.poor
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Leaderboard");

    if standings.is_empty() {
        let _ = writeln!(output, "No workers ranked for this period.");
    } else {
        for (rank, standing) in standings.iter().enumerate() {
            let _ = writeln!(
                output,
                "{}. {} avg score {}% over {} days, {} tasks, earned {}",
                rank + 1,
                standing.worker_id,
                standing.average_consensus_score,
                standing.days_worked,
                standing.total_tasks,
                standing.total_earnings
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Quality Flags");
    let _ = writeln!(
        output,
        "{} total, {} unresolved (high {}, medium {}, low {}; low consensus {}, high speed {}, manual {})",
        flag_stats.total,
        flag_stats.unresolved,
        flag_stats.by_severity.high,
        flag_stats.by_severity.medium,
        flag_stats.by_severity.low,
        flag_stats.by_type.low_consensus,
        flag_stats.by_type.high_speed,
        flag_stats.by_type.manual
    );

    if open_flags.is_empty() {
        let _ = writeln!(output, "No open flags.");
    } else {
        for flag in open_flags.iter().take(10) {
            let _ = writeln!(
                output,
                "- [{}] {} on question {} ({}): {}",
                flag.severity,
                flag.worker_id,
                flag.question_id,
                flag.flagged_at.format("%Y-%m-%d"),
                flag.description
            );
        }
    }

    output
}

#[derive(Serialize)]
struct PaymentRow<'a> {
    id: i64,
    worker_id: &'a str,
    question_id: i64,
    date: String,
    tasks_completed: i32,
    consensus_score: String,
    quality_tier: &'static str,
    base_pay: String,
    bonus_amount: String,
    total_payment: String,
    payment_status: &'static str,
    payment_reference: Option<&'a str>,
}

/// Write performance rows as a payroll CSV. Amounts keep their two decimals.
pub fn write_payments_csv<W: std::io::Write>(
    writer: W,
    rows: &[WorkerDailyPerformance],
) -> csv::Result<usize> {
    let mut out = csv::Writer::from_writer(writer);
    for row in rows {
        out.serialize(PaymentRow {
            id: row.id,
            worker_id: &row.worker_id,
            question_id: row.question_id,
            date: row.date.to_string(),
            tasks_completed: row.tasks_completed,
            consensus_score: row.consensus_score.to_string(),
            quality_tier: row.quality_tier.as_str(),
            base_pay: row.base_pay.to_string(),
            bonus_amount: row.bonus_amount.to_string(),
            total_payment: row.total_payment.to_string(),
            payment_status: row.payment_status.as_str(),
            payment_reference: row.payment_reference.as_deref(),
        })?;
    }
    out.flush()?;
    Ok(rows.len())
}
