//! M001..M004: hourly top-K query series.

use tracing::warn;

use super::data::{CheckData, HourlyData, HourlySummary};
use super::generator::CheckContext;
use super::metrics;
use super::{CheckId, ReportError};
use crate::topk::{HourlyTopK, TopKError, TopKResult};
use crate::window::column_for_metric;

/// Metric behind each hourly check; M003 adds a second one.
fn metrics_for(check: CheckId) -> (&'static str, Option<&'static str>) {
    match check {
        CheckId::M001 => (metrics::PGSS_EXEC_TIME, None),
        CheckId::M002 => (metrics::PGSS_CALLS, None),
        CheckId::M003 => (
            metrics::PGSS_BLOCK_READ_TIME,
            Some(metrics::PGSS_BLOCK_WRITE_TIME),
        ),
        _ => (metrics::PGSS_TEMP_WRITTEN, None),
    }
}

fn metric_label((first, second): (&str, Option<&str>)) -> String {
    let first = column_for_metric(first).0;
    match second {
        Some(second) => format!("{}+{}", first, column_for_metric(second).0),
        None => first,
    }
}

fn hourly_data(metric: String, hours: u32, step_s: i64, result: TopKResult) -> HourlyData {
    let total_tracked_queries = result.tracked_sum();
    let total_other = result.other_sum();
    HourlyData {
        metric,
        hours,
        step_s,
        timeline: result.timeline,
        queries: result.per_entity,
        other: result.other,
        summary: HourlySummary {
            total_tracked_queries,
            total_other,
            total: total_tracked_queries + total_other,
        },
    }
}

/// Builds one hourly check. Backend failures yield an empty series set; an
/// unsafe query id fails the check.
pub(crate) async fn build_hourly(
    ctx: &CheckContext<'_>,
    check: CheckId,
) -> Result<CheckData, ReportError> {
    let names = metrics_for(check);
    let metric = metric_label(names);
    let hours = ctx.config.hours;
    let step_s = ctx.config.step_s;
    let topk = HourlyTopK::new(ctx.source, ctx.config.top_k)
        .with_tolerance(ctx.config.reconcile_tolerance);

    let outcome = match names {
        (first, Some(second)) => {
            topk.run_sum2(&ctx.db_selector(first), &ctx.db_selector(second), ctx.end, hours, step_s)
                .await
        }
        (single, None) => topk.run(&ctx.db_selector(single), ctx.end, hours, step_s).await,
    };

    match outcome {
        Ok(result) => Ok(CheckData::Hourly(hourly_data(metric, hours, step_s, result))),
        Err(TopKError::Qid(e)) => Err(e.into()),
        Err(TopKError::Prom(e)) => {
            warn!(check = %check, error = %e, "hourly aggregation failed, reporting empty series");
            Ok(CheckData::Hourly(HourlyData {
                metric,
                hours,
                step_s,
                ..Default::default()
            }))
        }
    }
}
