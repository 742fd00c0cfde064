//! Quality reports over committed fact tables, exported as CSV.

use crate::error::{CheckError, CheckResult};
use gl_core::config::{CostSpikeReport, CoverageGapReport, RosterReport};
use gl_core::sql_utils::{escape_sql_string, quote_ident, quote_qualified};
use gl_core::{Config, CoreError, Layer};
use gl_db::Database;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Severity band of a roster mismatch, by percent difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum RosterSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl RosterSeverity {
    pub const ALL: [RosterSeverity; 4] = [
        RosterSeverity::Low,
        RosterSeverity::Medium,
        RosterSeverity::High,
        RosterSeverity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RosterSeverity::Low => "Low",
            RosterSeverity::Medium => "Medium",
            RosterSeverity::High => "High",
            RosterSeverity::Critical => "Critical",
        }
    }

    /// Upper bound of the band and whether it is inclusive
    fn upper_bound(&self) -> Option<(f64, bool)> {
        match self {
            RosterSeverity::Low => Some((20.0, false)),
            RosterSeverity::Medium => Some((50.0, false)),
            RosterSeverity::High => Some((100.0, true)),
            RosterSeverity::Critical => None,
        }
    }

    pub fn from_pct(pct: f64) -> Self {
        Self::ALL
            .into_iter()
            .find(|s| match s.upper_bound() {
                Some((bound, true)) => pct <= bound,
                Some((bound, false)) => pct < bound,
                None => true,
            })
            .unwrap_or(RosterSeverity::Critical)
    }

    /// The banding as a SQL `CASE` over `expr`.
    fn case_sql(expr: &str) -> String {
        let mut sql = String::from("CASE");
        for severity in Self::ALL {
            match severity.upper_bound() {
                Some((bound, inclusive)) => {
                    let op = if inclusive { "<=" } else { "<" };
                    sql.push_str(&format!(
                        " WHEN {expr} {op} {bound} THEN '{}'",
                        severity.as_str()
                    ));
                }
                None => sql.push_str(&format!(" ELSE '{}'", severity.as_str())),
            }
        }
        sql.push_str(" END");
        sql
    }
}

impl fmt::Display for RosterSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn columns(cols: &[String], prefix: Option<&str>) -> String {
    cols.iter()
        .map(|c| match prefix {
            Some(p) => format!("{p}.{}", quote_ident(c)),
            None => quote_ident(c),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn same_group(cols: &[String], left: &str, right: &str) -> String {
    cols.iter()
        .map(|c| {
            let q = quote_ident(c);
            format!("{left}.{q} IS NOT DISTINCT FROM {right}.{q}")
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn require_groups(name: &str, group_by: &[String]) -> CheckResult<()> {
    if group_by.is_empty() {
        return Err(CheckError::InvalidReport {
            name: name.to_string(),
            message: "group_by must name at least one column".into(),
        });
    }
    Ok(())
}

/// Uncovered spans between stitched coverage intervals, per group.
///
/// Overlapping or adjacent intervals are merged; consecutive segments with
/// the same carrier are stitched into one interval first.
pub fn coverage_gaps_sql(report: &CoverageGapReport, table: &str) -> CheckResult<String> {
    require_groups("coverage_gaps", &report.group_by)?;
    if report.min_gap_days < 0 {
        return Err(CheckError::InvalidThreshold(format!(
            "min_gap_days must not be negative, got {}",
            report.min_gap_days
        )));
    }
    let g = columns(&report.group_by, None);
    let sg = columns(&report.group_by, Some("s"));
    let join = same_group(&report.group_by, "p", "s");
    let start = quote_ident(&report.start_column);
    let end = quote_ident(&report.end_column);
    let carrier = quote_ident(&report.carrier_column);
    let t = quote_qualified(table);
    let min_gap = report.min_gap_days;
    Ok(format!(
        "WITH plans AS (
    SELECT {g}, {carrier} AS carrier,
           CAST({start} AS DATE) AS start_date, CAST({end} AS DATE) AS end_date
    FROM {t}
    WHERE {start} IS NOT NULL AND {end} IS NOT NULL
),
boundaries AS (
    SELECT {g}, start_date AS d FROM plans
    UNION
    SELECT {g}, end_date + 1 AS d FROM plans
),
segments AS (
    SELECT {g}, d AS seg_start,
           LEAD(d) OVER (PARTITION BY {g} ORDER BY d) - 1 AS seg_end
    FROM boundaries
),
labeled AS (
    SELECT {sg}, s.seg_start, s.seg_end, MIN(p.carrier) AS carrier
    FROM segments AS s
    JOIN plans AS p
      ON {join}
     AND p.start_date <= s.seg_start
     AND p.end_date >= s.seg_end
    WHERE s.seg_end IS NOT NULL
    GROUP BY {sg}, s.seg_start, s.seg_end
),
flags AS (
    SELECT *,
           CASE
               WHEN LAG(carrier) OVER (PARTITION BY {g} ORDER BY seg_start) = carrier
                AND LAG(seg_end) OVER (PARTITION BY {g} ORDER BY seg_start) + 1 = seg_start
               THEN 0 ELSE 1
           END AS new_group
    FROM labeled
),
grouped AS (
    SELECT *, SUM(new_group) OVER (PARTITION BY {g} ORDER BY seg_start) AS grp
    FROM flags
),
stitched AS (
    SELECT {g}, carrier, MIN(seg_start) AS start_date, MAX(seg_end) AS end_date
    FROM grouped
    GROUP BY {g}, carrier, grp
),
ordered AS (
    SELECT *,
           LEAD(start_date) OVER (PARTITION BY {g} ORDER BY start_date) AS next_start,
           LEAD(carrier) OVER (PARTITION BY {g} ORDER BY start_date) AS next_carrier
    FROM stitched
)
SELECT {g},
       end_date + 1 AS gap_start,
       next_start - 1 AS gap_end,
       next_start - end_date - 1 AS gap_length_days,
       carrier AS previous_carrier,
       next_carrier
FROM ordered
WHERE next_start IS NOT NULL
  AND next_start - end_date - 1 > {min_gap}
ORDER BY {g}, gap_start"
    ))
}

/// Trailing-window totals that grew by more than `threshold` over the
/// preceding window, per group.
pub fn cost_spikes_sql(report: &CostSpikeReport, table: &str) -> CheckResult<String> {
    require_groups("cost_spikes", &report.group_by)?;
    if !report.threshold.is_finite() || report.threshold <= 0.0 {
        return Err(CheckError::InvalidThreshold(format!(
            "cost spike threshold must be finite and positive, got {}",
            report.threshold
        )));
    }
    if report.window_days <= 0 {
        return Err(CheckError::InvalidThreshold(format!(
            "window_days must be positive, got {}",
            report.window_days
        )));
    }
    let g = columns(&report.group_by, None);
    let d1g = columns(&report.group_by, Some("d1"));
    let join = same_group(&report.group_by, "d2", "d1");
    let date = quote_ident(&report.date_column);
    let amount = quote_ident(&report.amount_column);
    let t = quote_qualified(table);
    let w = report.window_days;
    let back = w - 1;
    let prev_start = 2 * w - 1;
    let threshold = report.threshold;
    Ok(format!(
        "WITH daily AS (
    SELECT {g}, CAST({date} AS DATE) AS service_date,
           SUM(CAST({amount} AS DOUBLE)) AS daily_cost
    FROM {t}
    WHERE {date} IS NOT NULL
    GROUP BY {g}, CAST({date} AS DATE)
),
windows AS (
    SELECT {d1g},
           d1.service_date - {back} AS window_start,
           d1.service_date AS window_end,
           (SELECT SUM(d2.daily_cost) FROM daily AS d2
             WHERE {join}
               AND d2.service_date BETWEEN d1.service_date - {back} AND d1.service_date
           ) AS current_window_cost,
           (SELECT SUM(d2.daily_cost) FROM daily AS d2
             WHERE {join}
               AND d2.service_date BETWEEN d1.service_date - {prev_start}
                                       AND d1.service_date - {w}
           ) AS previous_window_cost
    FROM daily AS d1
)
SELECT *,
       (current_window_cost - previous_window_cost) / previous_window_cost AS pct_change
FROM windows
WHERE previous_window_cost > 0
  AND (current_window_cost - previous_window_cost) / previous_window_cost > {threshold}
ORDER BY {g}, window_end"
    ))
}

/// Observed row count per group against configured expectations.
pub fn roster_sql(report: &RosterReport, table: &str) -> CheckResult<String> {
    if report.expected.is_empty() {
        return Err(CheckError::InvalidReport {
            name: "roster_mismatch".into(),
            message: "expected counts are empty".into(),
        });
    }
    if let Some((group, n)) = report.expected.iter().find(|(_, n)| **n <= 0) {
        return Err(CheckError::InvalidReport {
            name: "roster_mismatch".into(),
            message: format!("expected count for '{group}' must be positive, got {n}"),
        });
    }
    let values = report
        .expected
        .iter()
        .map(|(group, n)| format!("('{}', {n})", escape_sql_string(group)))
        .collect::<Vec<_>>()
        .join(", ");
    let col = quote_ident(&report.group_column);
    let t = quote_qualified(table);
    let severity = RosterSeverity::case_sql("raw_pct");
    Ok(format!(
        "WITH expected_counts AS (
    SELECT * FROM (VALUES {values}) AS e(group_value, expected)
),
observed_counts AS (
    SELECT CAST({col} AS VARCHAR) AS group_value, COUNT(*) AS observed
    FROM {t}
    GROUP BY 1
),
compared AS (
    SELECT ec.group_value, ec.expected, COALESCE(oc.observed, 0) AS observed,
           ABS(COALESCE(oc.observed, 0) - ec.expected) * 100.0 / ec.expected AS raw_pct
    FROM expected_counts AS ec
    LEFT JOIN observed_counts AS oc ON ec.group_value = oc.group_value
)
SELECT group_value AS {col}, expected, observed,
       ROUND(raw_pct, 2) AS pct_diff,
       {severity} AS severity
FROM compared
ORDER BY group_value"
    ))
}

/// One exported report
#[derive(Debug, Clone, Serialize)]
pub struct ReportOutput {
    pub name: &'static str,
    pub path: PathBuf,
    pub rows: usize,
}

/// Builds and exports the configured reports.
pub struct ReportRunner<'a> {
    db: &'a dyn Database,
    config: &'a Config,
}

impl<'a> ReportRunner<'a> {
    pub fn new(db: &'a dyn Database, config: &'a Config) -> Self {
        Self { db, config }
    }

    fn fact_table(&self, name: &str) -> CheckResult<String> {
        let table = self
            .config
            .table(name)
            .ok_or_else(|| CoreError::TableNotFound {
                name: name.to_string(),
            })?;
        Ok(table.target_for(Layer::Fact, &self.config.layers))
    }

    /// `(name, sql)` for every configured report, in a fixed order.
    pub fn queries(&self) -> CheckResult<Vec<(&'static str, String)>> {
        let reports = &self.config.reports;
        let mut queries = Vec::new();
        if let Some(r) = &reports.coverage_gaps {
            queries.push(("coverage_gaps", coverage_gaps_sql(r, &self.fact_table(&r.table)?)?));
        }
        if let Some(r) = &reports.cost_spikes {
            queries.push(("cost_spikes", cost_spikes_sql(r, &self.fact_table(&r.table)?)?));
        }
        if let Some(r) = &reports.roster_mismatch {
            queries.push(("roster_mismatch", roster_sql(r, &self.fact_table(&r.table)?)?));
        }
        Ok(queries)
    }

    /// Export every configured report to `<out_dir>/<name>.csv`.
    pub async fn run(&self, out_dir: &Path) -> CheckResult<Vec<ReportOutput>> {
        let mut outputs = Vec::new();
        for (name, sql) in self.queries()? {
            let path = out_dir.join(format!("{name}.csv"));
            let rows = self.db.export_csv(&sql, &path).await?;
            log::info!("Report {name}: {rows} row(s) -> {}", path.display());
            outputs.push(ReportOutput { name, path, rows });
        }
        Ok(outputs)
    }
}

#[cfg(test)]
#[path = "reports_test.rs"]
mod tests;
