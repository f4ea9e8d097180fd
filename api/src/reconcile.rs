use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;

/// Scan page size. Bounds memory per pass and keeps the pass resumable; a
/// group split across page boundaries converges on the next run because the
/// whole pass is idempotent.
pub const RECONCILE_BATCH_SIZE: i64 = 2000;

const DEFAULT_INTERVAL_SECS: u64 = 300;

const SCAN_SQL: &str = r#"
    SELECT f.id, f.user_id, f.question_id, f.color, f.modified_at,
           v.question_bank_entry_id AS entry_id
    FROM question_flags f
    JOIN question_versions v ON v.question_id = f.question_id
    ORDER BY f.user_id ASC, v.question_bank_entry_id ASC, f.modified_at ASC, f.id ASC
    LIMIT $1 OFFSET $2
"#;

/// One flag row joined against the version lineage.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FlagScanRow {
    pub id: i64,
    pub user_id: i64,
    pub question_id: i64,
    pub color: String,
    pub modified_at: DateTime<Utc>,
    pub entry_id: i64,
}

/// Existing flag state for one question inside a group.
#[derive(Debug, Clone)]
pub struct MemberRow {
    pub row_id: i64,
    pub color: String,
    pub modified_at: DateTime<Utc>,
}

/// All flags one user holds across the versions of one logical question,
/// plus the canonical (latest-wins) state to propagate.
#[derive(Debug)]
pub struct FlagGroup {
    pub user_id: i64,
    pub entry_id: i64,
    pub latest_color: String,
    pub latest_modified_at: DateTime<Utc>,
    pub members: HashMap<i64, MemberRow>,
}

/// A write the engine wants to make. Updates only where state differs, so a
/// clean second pass plans nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Update {
        row_id: i64,
        color: String,
        modified_at: DateTime<Utc>,
    },
    Insert {
        user_id: i64,
        question_id: i64,
        color: String,
        modified_at: DateTime<Utc>,
    },
}

/// Counters for one full pass, logged and returned by the admin trigger.
#[derive(Debug, Default, Serialize, utoipa::ToSchema)]
pub struct ReconcileStats {
    pub batches: u32,
    pub groups: u32,
    /// Groups whose lineage lookup returned no siblings
    pub skipped_groups: u32,
    pub updated: u64,
    pub inserted: u64,
}

/// Group a scan page by (user_id, question_bank_entry_id), tracking the
/// latest-modified row as canonical. The scan is ordered ascending by
/// (modified_at, id) and the comparison is `>=`, so equal timestamps
/// resolve deterministically to the highest row id.
pub fn group_rows(rows: &[FlagScanRow]) -> Vec<FlagGroup> {
    let mut groups: Vec<FlagGroup> = Vec::new();
    let mut index: HashMap<(i64, i64), usize> = HashMap::new();

    for row in rows {
        let key = (row.user_id, row.entry_id);
        let slot = *index.entry(key).or_insert_with(|| {
            groups.push(FlagGroup {
                user_id: row.user_id,
                entry_id: row.entry_id,
                latest_color: row.color.clone(),
                latest_modified_at: row.modified_at,
                members: HashMap::new(),
            });
            groups.len() - 1
        });

        let group = &mut groups[slot];
        if row.modified_at >= group.latest_modified_at {
            group.latest_modified_at = row.modified_at;
            group.latest_color = row.color.clone();
        }
        group.members.insert(
            row.question_id,
            MemberRow {
                row_id: row.id,
                color: row.color.clone(),
                modified_at: row.modified_at,
            },
        );
    }

    groups
}

/// Plan the writes that bring every sibling question in line with the
/// group's canonical state: update stale rows, insert missing ones, leave
/// matching rows alone.
pub fn plan_group_writes(group: &FlagGroup, siblings: &[i64]) -> Vec<WriteOp> {
    let mut ops = Vec::new();

    for &question_id in siblings {
        match group.members.get(&question_id) {
            Some(member) => {
                if member.color != group.latest_color
                    || member.modified_at != group.latest_modified_at
                {
                    ops.push(WriteOp::Update {
                        row_id: member.row_id,
                        color: group.latest_color.clone(),
                        modified_at: group.latest_modified_at,
                    });
                }
            }
            None => ops.push(WriteOp::Insert {
                user_id: group.user_id,
                question_id,
                color: group.latest_color.clone(),
                modified_at: group.latest_modified_at,
            }),
        }
    }

    ops
}

/// Run one full reconciliation pass over the flag table.
///
/// Per-group failures are logged and skipped so one bad group never aborts
/// the pass; only scan-level storage failures propagate.
pub async fn run(pool: &PgPool) -> Result<ReconcileStats, sqlx::Error> {
    let mut stats = ReconcileStats::default();
    let mut offset = 0i64;

    loop {
        let rows: Vec<FlagScanRow> = sqlx::query_as(SCAN_SQL)
            .bind(RECONCILE_BATCH_SIZE)
            .bind(offset)
            .fetch_all(pool)
            .await?;
        if rows.is_empty() {
            break;
        }
        stats.batches += 1;

        for group in group_rows(&rows) {
            stats.groups += 1;
            match reconcile_group(pool, &group).await {
                Ok(GroupOutcome::Skipped) => stats.skipped_groups += 1,
                Ok(GroupOutcome::Applied { updated, inserted }) => {
                    stats.updated += updated;
                    stats.inserted += inserted;
                }
                Err(err) => {
                    tracing::warn!(
                        user_id = group.user_id,
                        entry_id = group.entry_id,
                        error = %err,
                        "skipping flag group after storage error"
                    );
                }
            }
        }

        offset += RECONCILE_BATCH_SIZE;
    }

    Ok(stats)
}

enum GroupOutcome {
    Skipped,
    Applied { updated: u64, inserted: u64 },
}

async fn reconcile_group(pool: &PgPool, group: &FlagGroup) -> Result<GroupOutcome, sqlx::Error> {
    let siblings: Vec<i64> =
        sqlx::query_scalar("SELECT question_id FROM question_versions WHERE question_bank_entry_id = $1")
            .bind(group.entry_id)
            .fetch_all(pool)
            .await?;
    if siblings.is_empty() {
        return Ok(GroupOutcome::Skipped);
    }

    let mut updated = 0u64;
    let mut inserted = 0u64;

    for op in plan_group_writes(group, &siblings) {
        match op {
            WriteOp::Update {
                row_id,
                color,
                modified_at,
            } => {
                // The timestamp guard lets a racing toggle with a newer
                // timestamp win; reconcile re-converges next pass.
                let result = sqlx::query(
                    "UPDATE question_flags SET color = $1, modified_at = $2 \
                     WHERE id = $3 AND modified_at <= $2",
                )
                .bind(&color)
                .bind(modified_at)
                .bind(row_id)
                .execute(pool)
                .await?;
                updated += result.rows_affected();
            }
            WriteOp::Insert {
                user_id,
                question_id,
                color,
                modified_at,
            } => {
                let result = sqlx::query(
                    "INSERT INTO question_flags (user_id, question_id, color, created_at, modified_at) \
                     VALUES ($1, $2, $3, $4, $4) \
                     ON CONFLICT (user_id, question_id) DO NOTHING",
                )
                .bind(user_id)
                .bind(question_id)
                .bind(&color)
                .bind(modified_at)
                .execute(pool)
                .await?;
                inserted += result.rows_affected();
            }
        }
    }

    Ok(GroupOutcome::Applied { updated, inserted })
}

/// Spawn the background scheduler: run a pass every
/// `ESSAYLAB_RECONCILE_INTERVAL_SECS` (default 300). The first tick fires
/// immediately, which is harmless because the pass is idempotent.
pub fn spawn_scheduler(pool: PgPool) {
    let interval_secs = std::env::var("ESSAYLAB_RECONCILE_INTERVAL_SECS")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(DEFAULT_INTERVAL_SECS);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            match run(&pool).await {
                Ok(stats) => tracing::info!(
                    batches = stats.batches,
                    groups = stats.groups,
                    skipped = stats.skipped_groups,
                    updated = stats.updated,
                    inserted = stats.inserted,
                    "flag reconciliation pass complete"
                ),
                Err(err) => tracing::error!(error = %err, "flag reconciliation pass failed"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};

    use super::{FlagScanRow, WriteOp, group_rows, plan_group_writes};

    fn ts(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    fn row(
        id: i64,
        user_id: i64,
        question_id: i64,
        color: &str,
        modified: i64,
        entry_id: i64,
    ) -> FlagScanRow {
        FlagScanRow {
            id,
            user_id,
            question_id,
            color: color.to_string(),
            modified_at: ts(modified),
            entry_id,
        }
    }

    /// Apply a plan to an in-memory copy of the rows, returning the rows as
    /// they would look after the pass (for idempotence checks).
    fn apply(rows: &[FlagScanRow], ops: &[WriteOp], entry_id: i64, next_id: i64) -> Vec<FlagScanRow> {
        let mut out: Vec<FlagScanRow> = rows.to_vec();
        let mut next_id = next_id;
        for op in ops {
            match op {
                WriteOp::Update {
                    row_id,
                    color,
                    modified_at,
                } => {
                    for existing in &mut out {
                        if existing.id == *row_id {
                            existing.color = color.clone();
                            existing.modified_at = *modified_at;
                        }
                    }
                }
                WriteOp::Insert {
                    user_id,
                    question_id,
                    color,
                    modified_at,
                } => {
                    out.push(FlagScanRow {
                        id: next_id,
                        user_id: *user_id,
                        question_id: *question_id,
                        color: color.clone(),
                        modified_at: *modified_at,
                        entry_id,
                    });
                    next_id += 1;
                }
            }
        }
        out.sort_by_key(|r| (r.user_id, r.entry_id, r.modified_at, r.id));
        out
    }

    #[test]
    fn siblings_converge_on_latest_flag() {
        // Questions 101/102/103 share entry 500 for user 7; 101 red@100,
        // 103 blue@200, 102 unflagged.
        let rows = vec![
            row(1, 7, 101, "red", 100, 500),
            row(2, 7, 103, "blue", 200, 500),
        ];
        let groups = group_rows(&rows);
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.latest_color, "blue");
        assert_eq!(group.latest_modified_at, ts(200));

        let ops = plan_group_writes(group, &[101, 102, 103]);
        assert_eq!(ops.len(), 2);
        assert!(ops.contains(&WriteOp::Update {
            row_id: 1,
            color: "blue".to_string(),
            modified_at: ts(200),
        }));
        assert!(ops.contains(&WriteOp::Insert {
            user_id: 7,
            question_id: 102,
            color: "blue".to_string(),
            modified_at: ts(200),
        }));
    }

    #[test]
    fn second_pass_plans_nothing() {
        let rows = vec![
            row(1, 7, 101, "red", 100, 500),
            row(2, 7, 103, "blue", 200, 500),
        ];
        let siblings = [101, 102, 103];
        let first_plan = plan_group_writes(&group_rows(&rows)[0], &siblings);
        assert!(!first_plan.is_empty());

        let converged = apply(&rows, &first_plan, 500, 3);
        let second_plan = plan_group_writes(&group_rows(&converged)[0], &siblings);
        assert!(second_plan.is_empty(), "pass two must plan zero writes");
    }

    #[test]
    fn latest_wins_across_the_group() {
        let rows = vec![
            row(1, 3, 10, "blue", 50, 900),
            row(2, 3, 11, "red", 75, 900),
            row(3, 3, 12, "blue", 60, 900),
        ];
        let group = &group_rows(&rows)[0];
        assert_eq!(group.latest_color, "red");

        let converged = apply(&rows, &plan_group_writes(group, &[10, 11, 12]), 900, 4);
        assert!(converged.iter().all(|r| r.color == "red" && r.modified_at == ts(75)));
    }

    #[test]
    fn equal_timestamps_resolve_to_highest_id() {
        // Scan order is (modified_at, id) ascending; `>=` keeps the last.
        let rows = vec![
            row(5, 1, 20, "blue", 100, 700),
            row(9, 1, 21, "red", 100, 700),
        ];
        let group = &group_rows(&rows)[0];
        assert_eq!(group.latest_color, "red");
    }

    #[test]
    fn groups_are_split_per_user_and_entry() {
        let rows = vec![
            row(1, 1, 10, "blue", 10, 100),
            row(2, 1, 20, "red", 20, 200),
            row(3, 2, 10, "red", 30, 100),
        ];
        let groups = group_rows(&rows);
        assert_eq!(groups.len(), 3);
    }

    #[test]
    fn empty_lineage_plans_nothing() {
        let rows = vec![row(1, 7, 101, "red", 100, 500)];
        let ops = plan_group_writes(&group_rows(&rows)[0], &[]);
        assert!(ops.is_empty());
    }
}
