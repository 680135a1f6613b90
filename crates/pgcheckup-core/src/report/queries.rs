//! K001/K003: pg_stat_statements counters over one window.

use super::data::{AggregatedData, CheckData, TimeRange, TopQueriesData, TopQuery};
use super::generator::CheckContext;
use super::metrics;
use crate::prom::expr::Selector;
use crate::window::{WindowTable, aggregate_window, column_for_metric};

async fn window(ctx: &CheckContext<'_>) -> WindowTable {
    let selectors: Vec<Selector> = metrics::WINDOW_METRICS
        .iter()
        .map(|m| ctx.db_selector(m))
        .collect();
    let start = ctx.end - ctx.config.window_s;
    aggregate_window(ctx.source, &selectors, start, ctx.end).await
}

pub(crate) async fn build_k001(ctx: &CheckContext<'_>) -> CheckData {
    let table = window(ctx).await;
    CheckData::Aggregated(AggregatedData {
        time_range: TimeRange::new(table.start, table.end),
        totals: table.totals(),
        databases: table.by_database(),
    })
}

pub(crate) async fn build_k003(ctx: &CheckContext<'_>) -> CheckData {
    let table = window(ctx).await;
    CheckData::TopQueries(top_queries(&table, ctx.config.top_queries_limit))
}

/// Rows with a query id, ordered by total execution time.
pub(crate) fn top_queries(table: &WindowTable, limit: usize) -> TopQueriesData {
    let (order_by, _) = column_for_metric(metrics::PGSS_EXEC_TIME);
    let key = |q: &TopQuery| q.metrics.get(&order_by).map(|d| d.diff).unwrap_or(0.0);

    let mut top: Vec<TopQuery> = table
        .rows
        .iter()
        .filter(|(row, _)| !row.queryid.is_empty())
        .map(|(row, metrics)| TopQuery {
            queryid: row.queryid.clone(),
            datname: row.datname.clone(),
            user: row.user.clone(),
            instance: row.instance.clone(),
            metrics: metrics.clone(),
        })
        .collect();
    top.sort_by(|a, b| {
        key(b)
            .total_cmp(&key(a))
            .then_with(|| a.queryid.cmp(&b.queryid))
    });
    top.truncate(limit);

    TopQueriesData {
        time_range: TimeRange::new(table.start, table.end),
        order_by,
        limit,
        top_queries: top,
    }
}
