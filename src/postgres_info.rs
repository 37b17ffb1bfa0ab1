/// Server information sent beside the query statistics: the user schema
/// (columns, indexes, foreign keys) with per-table and per-index activity and
/// bloat estimates, plus version, settings, background writer, database,
/// lock and backend snapshots.
use crate::executor::{OnError, QueryError, QueryExecutor, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Relations of the user schema; system schemas and temporary tables are
/// never reported.
const USER_TABLES: &str = "c.relkind = 'r' \
     AND c.relpersistence <> 't' \
     AND n.nspname <> 'pg_catalog' \
     AND n.nspname <> 'information_schema' \
     AND n.nspname !~ '^pg_toast'";

const TABLE_STAT_COLUMNS: &[&str] = &[
    "seq_scan",
    "seq_tup_read",
    "idx_scan",
    "idx_tup_fetch",
    "n_tup_ins",
    "n_tup_upd",
    "n_tup_del",
    "n_tup_hot_upd",
    "n_live_tup",
    "n_dead_tup",
    "last_vacuum",
    "last_autovacuum",
    "last_analyze",
    "last_autoanalyze",
    "vacuum_count",
    "autovacuum_count",
    "analyze_count",
    "autoanalyze_count",
];

const TABLE_IO_COLUMNS: &[&str] = &[
    "heap_blks_read",
    "heap_blks_hit",
    "idx_blks_read",
    "idx_blks_hit",
    "toast_blks_read",
    "toast_blks_hit",
    "tidx_blks_read",
    "tidx_blks_hit",
];

const INDEX_STAT_COLUMNS: &[&str] = &["idx_scan", "idx_tup_read", "idx_tup_fetch"];
const INDEX_IO_COLUMNS: &[&str] = &["idx_blks_read", "idx_blks_hit"];

const DATABASE_COLUMNS: &[&str] = &[
    "datname",
    "numbackends",
    "xact_commit",
    "xact_rollback",
    "blks_read",
    "blks_hit",
    "tup_returned",
    "tup_fetched",
    "tup_inserted",
    "tup_updated",
    "tup_deleted",
    "conflicts",
    "stats_reset",
];

/// First release with pg_stat_checkpointer.
const CHECKPOINTER_VERSION: u32 = 170000;
/// First release with `pid`, `state` and `query` in pg_stat_activity.
const ACTIVITY_STATE_VERSION: u32 = 90200;
/// First release with wait events instead of the `waiting` flag.
const WAIT_EVENT_VERSION: u32 = 90600;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    pub default_value: String,
    pub not_null: String,
    pub position: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TableStats {
    pub seq_scan: String,
    pub seq_tup_read: String,
    pub idx_scan: String,
    pub idx_tup_fetch: String,
    pub n_tup_ins: String,
    pub n_tup_upd: String,
    pub n_tup_del: String,
    pub n_tup_hot_upd: String,
    pub n_live_tup: String,
    pub n_dead_tup: String,
    pub last_vacuum: String,
    pub last_autovacuum: String,
    pub last_analyze: String,
    pub last_autoanalyze: String,
    pub vacuum_count: String,
    pub autovacuum_count: String,
    pub analyze_count: String,
    pub autoanalyze_count: String,
    pub heap_blks_read: String,
    pub heap_blks_hit: String,
    pub idx_blks_read: String,
    pub idx_blks_hit: String,
    pub toast_blks_read: String,
    pub toast_blks_hit: String,
    pub tidx_blks_read: String,
    pub tidx_blks_hit: String,
    /// Estimated bytes lost to bloat, when the estimate covers the table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wasted_bytes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IndexStats {
    pub idx_scan: String,
    pub idx_tup_read: String,
    pub idx_tup_fetch: String,
    pub idx_blks_read: String,
    pub idx_blks_hit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wasted_bytes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Index {
    pub name: String,
    /// Attribute numbers of the indexed columns; 0 marks an expression.
    pub columns: Vec<i32>,
    pub size_bytes: String,
    pub is_primary: String,
    pub is_unique: String,
    pub is_valid: String,
    pub index_def: String,
    pub constraint_def: String,
    #[serde(flatten)]
    pub stats: Option<IndexStats>,
}

/// A foreign key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Constraint {
    pub name: String,
    pub constraint_def: String,
    pub columns: Vec<i32>,
    pub foreign_schema: String,
    pub foreign_table: String,
    pub foreign_columns: Vec<i32>,
}

/// One user table with everything known about it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSchema {
    pub schema_name: String,
    pub table_name: String,
    pub size_bytes: String,
    pub stats: Option<TableStats>,
    pub columns: Vec<Column>,
    pub indices: Vec<Index>,
    pub constraints: Vec<Constraint>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Setting {
    pub name: String,
    pub current_value: String,
    pub unit: String,
    pub boot_value: String,
    pub reset_value: String,
    pub source: String,
    pub sourcefile: String,
    pub sourceline: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BgWriterStats {
    pub checkpoints_timed: String,
    pub checkpoints_req: String,
    pub buffers_checkpoint: String,
    pub buffers_clean: String,
    pub maxwritten_clean: String,
    pub buffers_backend: String,
    pub buffers_backend_fsync: String,
    pub buffers_alloc: String,
    pub stats_reset: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DatabaseStats {
    pub datname: String,
    pub numbackends: String,
    pub xact_commit: String,
    pub xact_rollback: String,
    pub blks_read: String,
    pub blks_hit: String,
    pub tup_returned: String,
    pub tup_fetched: String,
    pub tup_inserted: String,
    pub tup_updated: String,
    pub tup_deleted: String,
    pub conflicts: String,
    pub stats_reset: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Lock {
    pub database: String,
    pub schema: String,
    pub relation: String,
    pub locktype: String,
    pub page: String,
    pub tuple: String,
    pub virtualxid: String,
    pub transactionid: String,
    pub virtualtransaction: String,
    pub pid: String,
    pub mode: String,
    pub granted: String,
}

/// One other session connected to the monitored database.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Backend {
    pub pid: String,
    pub username: String,
    pub application_name: String,
    pub client_addr: String,
    pub backend_start: String,
    pub xact_start: String,
    pub query_start: String,
    pub state: String,
    pub waiting: String,
    /// Current statement text, omitted on request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

/// The `postgres` section of the submitted data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostgresInfo {
    pub schema: Vec<TableSchema>,
    pub version: String,
    pub settings: Vec<Setting>,
    pub bgwriter: Vec<BgWriterStats>,
    pub database: Vec<DatabaseStats>,
    pub locks: Vec<Lock>,
    pub backends: Vec<Backend>,
}

// Raw rows keyed by schema and relation, before they are merged.

#[derive(Deserialize)]
struct ColumnRow {
    schema: String,
    table: String,
    tablesize: String,
    #[serde(flatten)]
    column: Column,
}

#[derive(Deserialize)]
struct IndexRow {
    schema: String,
    table: String,
    name: String,
    columns: String,
    size_bytes: String,
    is_primary: String,
    is_unique: String,
    is_valid: String,
    index_def: String,
    constraint_def: String,
}

#[derive(Deserialize)]
struct ConstraintRow {
    schema: String,
    table: String,
    name: String,
    constraint_def: String,
    columns: String,
    foreign_schema: String,
    foreign_table: String,
    foreign_columns: String,
}

#[derive(Deserialize)]
struct TableStatsRow {
    schema: String,
    table: String,
    #[serde(flatten)]
    stats: TableStats,
}

#[derive(Deserialize)]
struct IndexStatsRow {
    schema: String,
    index: String,
    #[serde(flatten)]
    stats: IndexStats,
}

#[derive(Deserialize)]
struct BloatRow {
    schemaname: String,
    tablename: String,
    iname: String,
    wastedbytes: String,
    wastedibytes: String,
}

fn key(schema: &str, relation: &str) -> String {
    format!("{schema}.{relation}")
}

/// Parse an attribute number list as printed for `int2vector` (`1 2`) or
/// `int2[]` (`{1,2}`). NULL (empty) is the empty list.
fn parse_attnums(column: &str, text: &str) -> Result<Vec<i32>, QueryError> {
    text.trim_matches(|c| c == '{' || c == '}')
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse().map_err(|_| QueryError::InvalidValue {
                column: column.to_string(),
                value: text.to_string(),
            })
        })
        .collect()
}

fn columns_query() -> String {
    format!(
        "SELECT n.nspname AS schema, c.relname AS table, \
         pg_catalog.pg_table_size(c.oid) AS tablesize, \
         a.attname AS name, \
         pg_catalog.format_type(a.atttypid, a.atttypmod) AS data_type, \
         (SELECT replace(pg_catalog.pg_get_expr(d.adbin, d.adrelid), chr(10), ' ') \
          FROM pg_catalog.pg_attrdef d \
          WHERE d.adrelid = a.attrelid AND d.adnum = a.attnum AND a.atthasdef) AS default_value, \
         a.attnotnull AS not_null, \
         a.attnum AS position \
         FROM pg_catalog.pg_class c \
         LEFT JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
         LEFT JOIN pg_catalog.pg_attribute a ON c.oid = a.attrelid \
         WHERE {USER_TABLES} AND a.attnum > 0 AND NOT a.attisdropped \
         ORDER BY n.nspname, c.relname, a.attnum"
    )
}

fn indexes_query() -> String {
    format!(
        "SELECT n.nspname AS schema, c.relname AS table, \
         i.indkey::text AS columns, \
         c2.relname AS name, \
         pg_catalog.pg_relation_size(c2.oid) AS size_bytes, \
         i.indisprimary AS is_primary, \
         i.indisunique AS is_unique, \
         i.indisvalid AS is_valid, \
         replace(pg_catalog.pg_get_indexdef(i.indexrelid, 0, TRUE), chr(10), ' ') AS index_def, \
         replace(pg_catalog.pg_get_constraintdef(con.oid, TRUE), chr(10), ' ') AS constraint_def \
         FROM pg_catalog.pg_class c, pg_catalog.pg_class c2, \
         pg_catalog.pg_namespace n, pg_catalog.pg_index i \
         LEFT JOIN pg_catalog.pg_constraint con ON (con.conrelid = i.indrelid \
         AND con.conindid = i.indexrelid AND con.contype IN ('p', 'u', 'x')) \
         WHERE {USER_TABLES} \
         AND c.oid = i.indrelid AND i.indexrelid = c2.oid AND n.oid = c.relnamespace \
         ORDER BY n.nspname, c.relname, i.indisprimary DESC, i.indisunique DESC, c2.relname"
    )
}

const CONSTRAINTS_QUERY: &str = "SELECT n.nspname AS schema, c.relname AS table, \
     r.conname AS name, \
     replace(pg_catalog.pg_get_constraintdef(r.oid, TRUE), chr(10), ' ') AS constraint_def, \
     r.conkey AS columns, \
     n2.nspname AS foreign_schema, \
     c2.relname AS foreign_table, \
     r.confkey AS foreign_columns \
     FROM pg_catalog.pg_class c \
     LEFT JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
     LEFT JOIN pg_catalog.pg_constraint r ON r.conrelid = c.oid \
     LEFT JOIN pg_catalog.pg_class c2 ON r.confrelid = c2.oid \
     LEFT JOIN pg_catalog.pg_namespace n2 ON n2.oid = c2.relnamespace \
     WHERE r.contype = 'f' \
     AND n.nspname <> 'pg_catalog' \
     AND n.nspname <> 'information_schema' \
     AND n.nspname !~ '^pg_toast' \
     ORDER BY n.nspname, c.relname, r.conname";

fn table_stats_query() -> String {
    let mut columns = vec![
        "s.schemaname AS schema".to_string(),
        "s.relname AS table".to_string(),
    ];
    columns.extend(TABLE_STAT_COLUMNS.iter().map(|c| format!("s.{c}")));
    columns.extend(TABLE_IO_COLUMNS.iter().map(|c| format!("sio.{c}")));
    format!(
        "SELECT {} FROM pg_stat_user_tables s \
         JOIN pg_statio_user_tables sio ON s.relid = sio.relid",
        columns.join(", ")
    )
}

fn index_stats_query() -> String {
    let mut columns = vec![
        "s.schemaname AS schema".to_string(),
        "s.indexrelname AS index".to_string(),
    ];
    columns.extend(INDEX_STAT_COLUMNS.iter().map(|c| format!("s.{c}")));
    columns.extend(INDEX_IO_COLUMNS.iter().map(|c| format!("sio.{c}")));
    format!(
        "SELECT {} FROM pg_stat_user_indexes s \
         JOIN pg_statio_user_indexes sio ON s.indexrelid = sio.indexrelid",
        columns.join(", ")
    )
}

/// Table and index bloat estimate, after the check_postgres `bloat` action:
/// expected pages from pg_stats widths compared with actual pages.
const BLOAT_QUERY: &str = "SELECT schemaname, tablename, iname, \
     CASE WHEN relpages < otta THEN 0 ELSE bs * (relpages - otta)::bigint END AS wastedbytes, \
     CASE WHEN ipages < iotta THEN 0 ELSE bs * (ipages - iotta)::bigint END AS wastedibytes \
     FROM ( \
       SELECT nn.nspname AS schemaname, cc.relname AS tablename, \
         COALESCE(cc.relpages, 0) AS relpages, COALESCE(bs, 0) AS bs, \
         COALESCE(CEIL((cc.reltuples * ((datahdr + ma - \
           (CASE WHEN datahdr % ma = 0 THEN ma ELSE datahdr % ma END)) + nullhdr2 + 4)) \
           / (bs - 20::float)), 0) AS otta, \
         COALESCE(c2.relname, '?') AS iname, COALESCE(c2.relpages, 0) AS ipages, \
         COALESCE(CEIL((c2.reltuples * (datahdr - 12)) / (bs - 20::float)), 0) AS iotta \
       FROM pg_class cc \
       JOIN pg_namespace nn ON cc.relnamespace = nn.oid AND nn.nspname <> 'information_schema' \
       LEFT JOIN ( \
         SELECT ma, bs, foo.nspname, foo.relname, \
           (datawidth + (hdr + ma - (CASE WHEN hdr % ma = 0 THEN ma ELSE hdr % ma END)))::numeric AS datahdr, \
           (maxfracsum * (nullhdr + ma - (CASE WHEN nullhdr % ma = 0 THEN ma ELSE nullhdr % ma END))) AS nullhdr2 \
         FROM ( \
           SELECT ns.nspname, tbl.relname, hdr, ma, bs, \
             SUM((1 - COALESCE(null_frac, 0)) * COALESCE(avg_width, 2048)) AS datawidth, \
             MAX(COALESCE(null_frac, 0)) AS maxfracsum, \
             hdr + (SELECT 1 + count(*) / 8 FROM pg_stats s2 \
                    WHERE null_frac <> 0 AND s2.schemaname = ns.nspname AND s2.tablename = tbl.relname) AS nullhdr \
           FROM pg_attribute att \
           JOIN pg_class tbl ON att.attrelid = tbl.oid \
           JOIN pg_namespace ns ON ns.oid = tbl.relnamespace \
           LEFT JOIN pg_stats s ON s.schemaname = ns.nspname AND s.tablename = tbl.relname \
             AND s.inherited = false AND s.attname = att.attname, \
           ( \
             SELECT current_setting('block_size')::numeric AS bs, 23 AS hdr, \
               CASE WHEN v ~ 'mingw32' OR v ~ '64-bit' THEN 8 ELSE 4 END AS ma \
             FROM (SELECT version() AS v) AS foo \
           ) AS constants \
           WHERE att.attnum > 0 AND tbl.relkind = 'r' \
           GROUP BY 1, 2, 3, 4, 5 \
         ) AS foo \
       ) AS rs ON cc.relname = rs.relname AND nn.nspname = rs.nspname \
       LEFT JOIN pg_index i ON indrelid = cc.oid \
       LEFT JOIN pg_class c2 ON c2.oid = i.indexrelid \
     ) AS sml";

const SETTINGS_QUERY: &str = "SELECT name, setting AS current_value, unit, \
     boot_val AS boot_value, reset_val AS reset_value, \
     source, sourcefile, sourceline FROM pg_settings";

const LOCKS_QUERY: &str = "SELECT d.datname AS database, n.nspname AS schema, \
     c.relname AS relation, l.locktype, l.page, l.tuple, l.virtualxid, \
     l.transactionid::text AS transactionid, l.virtualtransaction, l.pid, l.mode, l.granted \
     FROM pg_locks l \
     LEFT JOIN pg_catalog.pg_class c ON l.relation = c.oid \
     LEFT JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
     LEFT JOIN pg_catalog.pg_database d ON d.oid = l.database \
     WHERE l.pid <> pg_backend_pid()";

fn database_query() -> String {
    format!(
        "SELECT {} FROM pg_stat_database WHERE datname = current_database()",
        DATABASE_COLUMNS.join(", ")
    )
}

fn bgwriter_query(server_version: u32) -> &'static str {
    if server_version >= CHECKPOINTER_VERSION {
        "SELECT c.num_timed AS checkpoints_timed, c.num_requested AS checkpoints_req, \
         c.buffers_written AS buffers_checkpoint, b.buffers_clean, b.maxwritten_clean, \
         NULL AS buffers_backend, NULL AS buffers_backend_fsync, b.buffers_alloc, b.stats_reset \
         FROM pg_stat_bgwriter b, pg_stat_checkpointer c"
    } else {
        "SELECT checkpoints_timed, checkpoints_req, buffers_checkpoint, buffers_clean, \
         maxwritten_clean, buffers_backend, buffers_backend_fsync, buffers_alloc, stats_reset \
         FROM pg_stat_bgwriter"
    }
}

fn backends_query(server_version: u32) -> String {
    let (pid, state, waiting, query) = if server_version >= WAIT_EVENT_VERSION {
        ("pid", "state", "(wait_event IS NOT NULL)", "query")
    } else if server_version >= ACTIVITY_STATE_VERSION {
        ("pid", "state", "waiting", "query")
    } else {
        ("procpid", "NULL", "waiting", "current_query")
    };
    format!(
        "SELECT {pid} AS pid, usename AS username, application_name, \
         client_addr::text AS client_addr, backend_start, xact_start, query_start, \
         {state} AS state, {waiting} AS waiting, \
         replace({query}, chr(10), ' ') AS query \
         FROM pg_stat_activity \
         WHERE datname = current_database() AND {pid} <> pg_backend_pid()"
    )
}

async fn rows<E: QueryExecutor>(
    executor: &E,
    what: &'static str,
    query: &str,
) -> Result<Vec<Row>, QueryError> {
    tracing::debug!(what, "fetching postgres information");
    executor.execute(query, OnError::Halt).await
}

fn decode_all<T: serde::de::DeserializeOwned>(rows: &[Row]) -> Result<Vec<T>, QueryError> {
    rows.iter().map(|row| row.decode()).collect()
}

/// Merge the per-relation result sets into one entry per table, in the
/// order the columns query lists tables.
fn assemble_schema(
    columns: Vec<ColumnRow>,
    indexes: Vec<IndexRow>,
    constraints: Vec<ConstraintRow>,
    table_stats: Vec<TableStatsRow>,
    index_stats: Vec<IndexStatsRow>,
    bloat: Vec<BloatRow>,
) -> Result<Vec<TableSchema>, QueryError> {
    let mut table_stats: HashMap<String, TableStats> = table_stats
        .into_iter()
        .map(|r| (key(&r.schema, &r.table), r.stats))
        .collect();
    let mut index_stats: HashMap<String, IndexStats> = index_stats
        .into_iter()
        .map(|r| (key(&r.schema, &r.index), r.stats))
        .collect();

    for row in bloat {
        if let Some(stats) = table_stats.get_mut(&key(&row.schemaname, &row.tablename)) {
            stats.wasted_bytes = Some(row.wastedbytes);
        }
        if let Some(stats) = index_stats.get_mut(&key(&row.schemaname, &row.iname)) {
            stats.wasted_bytes = Some(row.wastedibytes);
        }
    }

    let mut tables: Vec<TableSchema> = Vec::new();
    let mut slots: HashMap<String, usize> = HashMap::new();

    for row in columns {
        let table = key(&row.schema, &row.table);
        let slot = match slots.get(&table) {
            Some(&slot) => slot,
            None => {
                tables.push(TableSchema {
                    stats: table_stats.remove(&table),
                    schema_name: row.schema,
                    table_name: row.table,
                    size_bytes: row.tablesize,
                    columns: Vec::new(),
                    indices: Vec::new(),
                    constraints: Vec::new(),
                });
                slots.insert(table, tables.len() - 1);
                tables.len() - 1
            }
        };
        tables[slot].columns.push(row.column);
    }

    for row in indexes {
        let Some(&slot) = slots.get(&key(&row.schema, &row.table)) else {
            tracing::debug!(index = %row.name, "skipping index of a table without columns");
            continue;
        };
        tables[slot].indices.push(Index {
            columns: parse_attnums("columns", &row.columns)?,
            stats: index_stats.remove(&key(&row.schema, &row.name)),
            name: row.name,
            size_bytes: row.size_bytes,
            is_primary: row.is_primary,
            is_unique: row.is_unique,
            is_valid: row.is_valid,
            index_def: row.index_def,
            constraint_def: row.constraint_def,
        });
    }

    for row in constraints {
        let Some(&slot) = slots.get(&key(&row.schema, &row.table)) else {
            tracing::debug!(constraint = %row.name, "skipping constraint of a table without columns");
            continue;
        };
        tables[slot].constraints.push(Constraint {
            columns: parse_attnums("columns", &row.columns)?,
            foreign_columns: parse_attnums("foreign_columns", &row.foreign_columns)?,
            name: row.name,
            constraint_def: row.constraint_def,
            foreign_schema: row.foreign_schema,
            foreign_table: row.foreign_table,
        });
    }

    Ok(tables)
}

/// Read every section of the postgres information. Any failing query ends
/// the run.
pub async fn fetch_postgres_info<E: QueryExecutor>(
    executor: &E,
    server_version: u32,
    include_query_text: bool,
) -> Result<PostgresInfo, QueryError> {
    let index_stats = decode_all(&rows(executor, "index stats", &index_stats_query()).await?)?;
    let table_stats = decode_all(&rows(executor, "table stats", &table_stats_query()).await?)?;
    let bloat = decode_all(&rows(executor, "bloat", BLOAT_QUERY).await?)?;
    let columns = decode_all(&rows(executor, "columns", &columns_query()).await?)?;
    let indexes = decode_all(&rows(executor, "indexes", &indexes_query()).await?)?;
    let constraints = decode_all(&rows(executor, "constraints", CONSTRAINTS_QUERY).await?)?;
    let schema = assemble_schema(columns, indexes, constraints, table_stats, index_stats, bloat)?;

    let version = rows(executor, "version", "SELECT version()")
        .await?
        .first()
        .and_then(|row| row.get("version"))
        .map(str::to_string)
        .ok_or_else(|| QueryError::MissingColumn {
            column: "version".to_string(),
        })?;

    let settings = decode_all(&rows(executor, "settings", SETTINGS_QUERY).await?)?;
    let bgwriter = decode_all(&rows(executor, "bgwriter", bgwriter_query(server_version)).await?)?;
    let database = decode_all(&rows(executor, "database", &database_query()).await?)?;
    let locks = decode_all(&rows(executor, "locks", LOCKS_QUERY).await?)?;
    let mut backends: Vec<Backend> =
        decode_all(&rows(executor, "backends", &backends_query(server_version)).await?)?;
    if !include_query_text {
        for backend in &mut backends {
            backend.query = None;
        }
    }

    tracing::debug!(
        tables = schema.len(),
        settings = settings.len(),
        backends = backends.len(),
        "fetched postgres information"
    );
    Ok(PostgresInfo {
        schema,
        version,
        settings,
        bgwriter,
        database,
        locks,
        backends,
    })
}
