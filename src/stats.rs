/// Statistics extraction: one joined query over pg_stat_plans and
/// pg_stat_plans_queries, decoded into typed rows and grouped into one
/// record per normalized query.
use crate::executor::psql::QUERY_MARKER;
use crate::executor::{OnError, QueryError, QueryExecutor, Row};
use serde::Serialize;
use std::collections::HashMap;

/// Counter columns present on both pg_stat_plans and pg_stat_plans_queries.
pub const COUNTER_COLUMNS: &[&str] = &[
    "userid",
    "dbid",
    "calls",
    "rows",
    "total_time",
    "shared_blks_hit",
    "shared_blks_read",
    "shared_blks_written",
    "local_blks_hit",
    "local_blks_written",
    "temp_blks_read",
    "temp_blks_written",
];

/// Query-level columns, read from pg_stat_plans_queries as `pq_<name>`.
pub const QUERY_COLUMNS: &[&str] = &[
    "plan_ids",
    "calls_per_plan",
    "avg_time_per_plan",
    "time_variance",
    "time_stddev",
];

/// Plan-level columns, read from pg_stat_plans as `p_<name>`.
pub const PLAN_COLUMNS: &[&str] = &[
    "planid",
    "had_our_search_path",
    "from_our_database",
    "query_valid",
    "last_startup_cost",
    "last_total_cost",
];

const QUERY_PREFIX: &str = "pq_";
const PLAN_PREFIX: &str = "p_";

/// Session setting the statistics query depends on: plans are explained as
/// JSON. Applied as a connection option by the executor.
pub const EXPLAIN_FORMAT_SETTING: (&str, &str) = ("pg_stat_plans.explain_format", "json");

/// Statement that clears the extension's counters after a submission.
pub const RESET_QUERY: &str = "SELECT pg_stat_plans_reset()";

/// Aggregate counters shared by queries and plans. Values are kept as the
/// server printed them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Counters {
    pub userid: String,
    pub dbid: String,
    pub calls: String,
    pub rows: String,
    pub total_time: String,
    pub shared_blks_hit: String,
    pub shared_blks_read: String,
    pub shared_blks_written: String,
    pub local_blks_hit: String,
    pub local_blks_written: String,
    pub temp_blks_read: String,
    pub temp_blks_written: String,
}

/// One captured execution plan of a normalized query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanRecord {
    pub planid: String,
    pub had_our_search_path: String,
    pub from_our_database: String,
    pub query_valid: String,
    pub last_startup_cost: String,
    pub last_total_cost: String,
    #[serde(flatten)]
    pub counters: Counters,
    /// EXPLAIN output (JSON text) for this plan.
    pub explain: String,
    /// Example statement with literal values, omitted on request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

/// One normalized query and every plan captured for it, in row order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryRecord {
    pub normalized_query: String,
    pub plan_ids: String,
    pub calls_per_plan: String,
    pub avg_time_per_plan: String,
    pub time_variance: String,
    pub time_stddev: String,
    #[serde(flatten)]
    pub counters: Counters,
    pub plans: Vec<PlanRecord>,
}

/// Reads the `<prefix><name>` columns of one row.
struct Fields<'a> {
    row: &'a Row,
    prefix: &'static str,
}

impl Fields<'_> {
    fn get(&self, name: &str) -> Result<String, QueryError> {
        let column = format!("{}{}", self.prefix, name);
        match self.row.get(&column) {
            Some(value) => Ok(value.to_string()),
            None => Err(QueryError::MissingColumn { column }),
        }
    }

    fn counters(&self) -> Result<Counters, QueryError> {
        Ok(Counters {
            userid: self.get("userid")?,
            dbid: self.get("dbid")?,
            calls: self.get("calls")?,
            rows: self.get("rows")?,
            total_time: self.get("total_time")?,
            shared_blks_hit: self.get("shared_blks_hit")?,
            shared_blks_read: self.get("shared_blks_read")?,
            shared_blks_written: self.get("shared_blks_written")?,
            local_blks_hit: self.get("local_blks_hit")?,
            local_blks_written: self.get("local_blks_written")?,
            temp_blks_read: self.get("temp_blks_read")?,
            temp_blks_written: self.get("temp_blks_written")?,
        })
    }
}

impl QueryRecord {
    /// Decode the query-level columns of a row; the plan list starts empty.
    fn from_row(row: &Row) -> Result<Self, QueryError> {
        let f = Fields {
            row,
            prefix: QUERY_PREFIX,
        };
        Ok(QueryRecord {
            normalized_query: f.get("normalized_query")?,
            plan_ids: f.get("plan_ids")?,
            calls_per_plan: f.get("calls_per_plan")?,
            avg_time_per_plan: f.get("avg_time_per_plan")?,
            time_variance: f.get("time_variance")?,
            time_stddev: f.get("time_stddev")?,
            counters: f.counters()?,
            plans: Vec::new(),
        })
    }
}

impl PlanRecord {
    fn from_row(row: &Row, include_query_text: bool) -> Result<Self, QueryError> {
        let f = Fields {
            row,
            prefix: PLAN_PREFIX,
        };
        Ok(PlanRecord {
            planid: f.get("planid")?,
            had_our_search_path: f.get("had_our_search_path")?,
            from_our_database: f.get("from_our_database")?,
            query_valid: f.get("query_valid")?,
            last_startup_cost: f.get("last_startup_cost")?,
            last_total_cost: f.get("last_total_cost")?,
            counters: f.counters()?,
            explain: f.get("explain")?,
            query: if include_query_text {
                Some(f.get("query")?)
            } else {
                None
            },
        })
    }
}

/// Escape literal text for use inside a PostgreSQL regular expression.
fn pg_regex_literal(text: &str) -> String {
    // ARE treats a backslash before any non-alphanumeric character as a
    // literal, which is all regex::escape emits.
    regex::escape(text)
}

/// Build the statistics query. It has no parameters; every value in it is
/// a constant of this module. It is a single statement and expects
/// `EXPLAIN_FORMAT_SETTING` to be in effect for the session.
pub fn statistics_query() -> String {
    let mut columns = vec![
        "replace(pg_stat_plans_explain(p.planid, p.userid, p.dbid), chr(10), ' ') AS p_explain"
            .to_string(),
        "replace(pq.normalized_query, chr(10), ' ') AS pq_normalized_query".to_string(),
        "replace(p.query, chr(10), ' ') AS p_query".to_string(),
    ];
    columns.extend(
        QUERY_COLUMNS
            .iter()
            .chain(COUNTER_COLUMNS)
            .map(|c| format!("pq.{c} AS {QUERY_PREFIX}{c}")),
    );
    columns.extend(
        PLAN_COLUMNS
            .iter()
            .chain(COUNTER_COLUMNS)
            .map(|c| format!("p.{c} AS {PLAN_PREFIX}{c}")),
    );

    let mut query = String::from("SELECT ");
    query.push_str(&columns.join(", "));
    query.push_str(" FROM pg_stat_plans p");
    query.push_str(" LEFT JOIN pg_stat_plans_queries pq ON p.planid = ANY (pq.plan_ids)");
    // EXPLAIN, COPY and SET statements cannot be explained
    query.push_str(r" WHERE p.query !~* '^\s*(EXPLAIN|COPY|SET)'");
    // neither can anything touching the system catalog
    query.push_str(r" AND p.query !~* '\spg_catalog\.'");
    query.push_str(r" AND p.query !~* '\spg_stat_plans\s'");
    query.push_str(&format!(
        " AND p.query !~* '^{}'",
        pg_regex_literal(QUERY_MARKER)
    ));
    query.push_str(" AND p.from_our_database = TRUE AND p.query_valid = TRUE");
    query.push_str(" AND p.planid = ANY (pq.plan_ids);");
    query
}

/// Group rows into one record per distinct normalized query.
///
/// Records come out in order of each key's first row; every row appends one
/// plan to its key's list, duplicates included.
pub fn aggregate(rows: &[Row], include_query_text: bool) -> Result<Vec<QueryRecord>, QueryError> {
    let mut records: Vec<QueryRecord> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for row in rows {
        let query = QueryRecord::from_row(row)?;
        let plan = PlanRecord::from_row(row, include_query_text)?;

        let slot = match index.get(&query.normalized_query) {
            Some(&slot) => slot,
            None => {
                tracing::debug!(normalized_query = %query.normalized_query, "processing query");
                index.insert(query.normalized_query.clone(), records.len());
                records.push(query);
                records.len() - 1
            }
        };
        records[slot].plans.push(plan);
    }

    Ok(records)
}

/// Run the statistics query and aggregate its rows. Any failure ends the run.
pub async fn fetch_query_records<E: QueryExecutor>(
    executor: &E,
    include_query_text: bool,
) -> Result<Vec<QueryRecord>, QueryError> {
    let rows = executor
        .execute(&statistics_query(), OnError::Halt)
        .await?;
    let records = aggregate(&rows, include_query_text)?;
    tracing::debug!(
        rows = rows.len(),
        queries = records.len(),
        "aggregated statistics"
    );
    Ok(records)
}
