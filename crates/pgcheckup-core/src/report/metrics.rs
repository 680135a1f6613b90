//! Metric names exported by the pgwatch-style collector.
//!
//! Every series carries `cluster` and `node_name`. Query-level series also
//! carry `datname`, `queryid`, `user` and `instance`.

// Settings: labels setting_name, setting_value, unit, category, context,
// vartype, source.
pub const SETTINGS: &str = "pgwatch_settings_configured";

// Instance / database gauges.
pub const IN_RECOVERY: &str = "pgwatch_db_stats_in_recovery_int";
pub const DB_SIZE: &str = "pgwatch_db_size_size_b";
pub const NUMBACKENDS: &str = "pgwatch_db_stats_numbackends";
pub const POSTMASTER_UPTIME: &str = "pgwatch_db_stats_postmaster_uptime_s";
pub const BLKS_HIT: &str = "pgwatch_db_stats_blks_hit";
pub const BLKS_READ: &str = "pgwatch_db_stats_blks_read";

// pg_stat_statements counters.
pub const PGSS_CALLS: &str = "pgwatch_pg_stat_statements_calls";
pub const PGSS_EXEC_TIME: &str = "pgwatch_pg_stat_statements_exec_time_total";
pub const PGSS_ROWS: &str = "pgwatch_pg_stat_statements_rows";
pub const PGSS_SHARED_HIT: &str = "pgwatch_pg_stat_statements_shared_bytes_hit_total";
pub const PGSS_SHARED_READ: &str = "pgwatch_pg_stat_statements_shared_bytes_read_total";
pub const PGSS_SHARED_WRITTEN: &str = "pgwatch_pg_stat_statements_shared_bytes_written_total";
pub const PGSS_SHARED_DIRTIED: &str = "pgwatch_pg_stat_statements_shared_bytes_dirtied_total";
pub const PGSS_TEMP_READ: &str = "pgwatch_pg_stat_statements_temp_bytes_read";
pub const PGSS_TEMP_WRITTEN: &str = "pgwatch_pg_stat_statements_temp_bytes_written";
pub const PGSS_BLOCK_READ_TIME: &str = "pgwatch_pg_stat_statements_block_read_total";
pub const PGSS_BLOCK_WRITE_TIME: &str = "pgwatch_pg_stat_statements_block_write_total";

/// Counters aggregated by the counter-window checks.
pub const WINDOW_METRICS: [&str; 11] = [
    PGSS_CALLS,
    PGSS_EXEC_TIME,
    PGSS_ROWS,
    PGSS_SHARED_HIT,
    PGSS_SHARED_READ,
    PGSS_SHARED_WRITTEN,
    PGSS_SHARED_DIRTIED,
    PGSS_TEMP_READ,
    PGSS_TEMP_WRITTEN,
    PGSS_BLOCK_READ_TIME,
    PGSS_BLOCK_WRITE_TIME,
];

/// Counters exported in per-query documents.
pub const PER_QUERY_METRICS: [&str; 6] = [
    PGSS_CALLS,
    PGSS_EXEC_TIME,
    PGSS_ROWS,
    PGSS_SHARED_HIT,
    PGSS_SHARED_READ,
    PGSS_TEMP_WRITTEN,
];

// Indexes: labels datname, schema_name, table_name, index_name.
pub const INVALID_INDEX_SIZE: &str = "pgwatch_pg_invalid_indexes_index_size_b";
pub const UNUSED_INDEX_SIZE: &str = "pgwatch_unused_indexes_index_size_bytes";
pub const UNUSED_INDEX_SCANS: &str = "pgwatch_unused_indexes_idx_scan";
// Also carries redundant_to.
pub const REDUNDANT_INDEX_SIZE: &str = "pgwatch_redundant_indexes_index_size_bytes";

// Bloat estimates: labels datname, schemaname, tblname (+ idxname for btree).
pub const TABLE_BLOAT_REAL_SIZE: &str = "pgwatch_pg_table_bloat_real_size";
pub const TABLE_BLOAT_SIZE: &str = "pgwatch_pg_table_bloat_bloat_size";
pub const TABLE_BLOAT_PCT: &str = "pgwatch_pg_table_bloat_bloat_pct";
pub const BTREE_BLOAT_REAL_SIZE: &str = "pgwatch_pg_btree_bloat_real_size";
pub const BTREE_BLOAT_SIZE: &str = "pgwatch_pg_btree_bloat_bloat_size";
pub const BTREE_BLOAT_PCT: &str = "pgwatch_pg_btree_bloat_bloat_pct";

// Wait event samples: labels datname, wait_event_type, wait_event, query_id.
pub const WAIT_EVENTS: &str = "pgwatch_wait_events_total";
