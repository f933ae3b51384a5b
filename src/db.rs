use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{ProgressionError, Result};
use crate::import;
use crate::models::{
    ProgressDocument, ProgressionHistoryEntry, ProgressionRule, ProgressionStatus,
    RejectedAttempt, ScheduleType, StudentProgressRecord, DEFAULT_LEVEL_INCREMENT,
};
use crate::repository::{CreateOutcome, HistoryRecorder, ProgressRepository, Roster};
use crate::rules::{select_active, RuleStore};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }
}

fn non_negative(column: &str, value: i32) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| ProgressionError::persistence(format!("{column} is negative: {value}")))
}

fn column_u32(row: &PgRow, column: &str) -> Result<u32> {
    non_negative(column, row.try_get(column)?)
}

fn column_opt_u32(row: &PgRow, column: &str) -> Result<Option<u32>> {
    let value: Option<i32> = row.try_get(column)?;
    value.map(|value| non_negative(column, value)).transpose()
}

fn parse_column<T: std::str::FromStr<Err = String>>(row: &PgRow, column: &str) -> Result<T> {
    let value: String = row.try_get(column)?;
    value.parse::<T>().map_err(ProgressionError::Persistence)
}

fn rule_from_row(row: &PgRow) -> Result<ProgressionRule> {
    Ok(ProgressionRule {
        id: row.try_get("id")?,
        schedule_type: parse_column(row, "schedule_type")?,
        required_periods: column_u32(row, "required_periods")?,
        progression_month: column_u32(row, "progression_month")?,
        progression_day: column_u32(row, "progression_day")?,
        period_names: row.try_get("period_names")?,
        level_increment: column_u32(row, "level_increment")?,
        max_level: column_opt_u32(row, "max_level")?,
        is_active: row.try_get("is_active")?,
    })
}

fn document_from_row(row: &PgRow) -> Result<ProgressDocument> {
    Ok(ProgressDocument {
        id: row.try_get("id")?,
        student_id: row.try_get("student_id")?,
        current_level: row.try_get("current_level")?,
        schedule_type: row.try_get("schedule_type")?,
        periods_completed: row.try_get("periods_completed")?,
        progression_status: row.try_get("progression_status")?,
    })
}

fn history_from_row(row: &PgRow) -> Result<ProgressionHistoryEntry> {
    Ok(ProgressionHistoryEntry {
        id: row.try_get("id")?,
        student_id: row.try_get("student_id")?,
        schedule_type: parse_column(row, "schedule_type")?,
        from_level: column_u32(row, "from_level")?,
        to_level: column_u32(row, "to_level")?,
        progression_type: parse_column(row, "progression_type")?,
        progression_date: row.try_get("progression_date")?,
        performed_by: row.try_get("performed_by")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

fn rejection_from_row(row: &PgRow) -> Result<RejectedAttempt> {
    Ok(RejectedAttempt {
        id: row.try_get("id")?,
        student_id: row.try_get("student_id")?,
        schedule_type: parse_column(row, "schedule_type")?,
        level: column_u32(row, "level")?,
        reason: row.try_get("reason")?,
        performed_by: row.try_get("performed_by")?,
        attempted_at: row.try_get("attempted_at")?,
    })
}

const PROGRESS_COLUMNS: &str = "id, student_id, current_level, schedule_type, \
     periods_completed, progression_status";

const RULE_COLUMNS: &str = "id, schedule_type, required_periods, progression_month, \
     progression_day, period_names, level_increment, max_level, is_active";

#[async_trait]
impl RuleStore for PgStore {
    async fn active_rule(&self, schedule_type: ScheduleType) -> Result<ProgressionRule> {
        let rows = sqlx::query(&format!(
            "SELECT {RULE_COLUMNS} FROM level_progression.rules \
             WHERE schedule_type = $1 AND is_active"
        ))
        .bind(schedule_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        let rules = rows
            .iter()
            .map(rule_from_row)
            .collect::<Result<Vec<_>>>()?;
        select_active(&rules, schedule_type)
            .cloned()
            .ok_or(ProgressionError::RuleNotFound(schedule_type))
    }

    async fn list_rules(&self) -> Result<Vec<ProgressionRule>> {
        let rows = sqlx::query(&format!(
            "SELECT {RULE_COLUMNS} FROM level_progression.rules \
             ORDER BY schedule_type, is_active DESC, updated_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(rule_from_row).collect()
    }

    async fn save_rule(&self, rule: &ProgressionRule) -> Result<()> {
        rule.validate()?;
        let mut tx = self.pool.begin().await?;

        if rule.is_active {
            sqlx::query(
                r#"
                UPDATE level_progression.rules
                SET is_active = FALSE, updated_at = now()
                WHERE schedule_type = $1 AND id <> $2 AND is_active
                "#,
            )
            .bind(rule.schedule_type.as_str())
            .bind(rule.id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO level_progression.rules
            (id, schedule_type, required_periods, progression_month, progression_day,
             period_names, level_increment, max_level, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE
            SET required_periods = EXCLUDED.required_periods,
                progression_month = EXCLUDED.progression_month,
                progression_day = EXCLUDED.progression_day,
                period_names = EXCLUDED.period_names,
                level_increment = EXCLUDED.level_increment,
                max_level = EXCLUDED.max_level,
                is_active = EXCLUDED.is_active,
                updated_at = now()
            "#,
        )
        .bind(rule.id)
        .bind(rule.schedule_type.as_str())
        .bind(rule.required_periods as i32)
        .bind(rule.progression_month as i32)
        .bind(rule.progression_day as i32)
        .bind(&rule.period_names)
        .bind(rule.level_increment as i32)
        .bind(rule.max_level.map(|level| level as i32))
        .bind(rule.is_active)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ProgressRepository for PgStore {
    async fn get(&self, id: Uuid) -> Result<Option<ProgressDocument>> {
        let row = sqlx::query(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM level_progression.student_progress WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn list_by_schedule_type(
        &self,
        schedule_type: ScheduleType,
    ) -> Result<Vec<ProgressDocument>> {
        let rows = sqlx::query(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM level_progression.student_progress \
             WHERE lower(trim(schedule_type)) = $1 \
             ORDER BY student_id, current_level"
        ))
        .bind(schedule_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(document_from_row).collect()
    }

    async fn create_if_absent(&self, record: &StudentProgressRecord) -> Result<CreateOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO level_progression.student_progress
            (id, student_id, current_level, schedule_type, periods_completed, progression_status)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (student_id, current_level) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(&record.student_id)
        .bind(record.current_level as i32)
        .bind(record.schedule_type.as_str())
        .bind(&record.periods_completed)
        .bind(record.progression_status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() > 0 {
            CreateOutcome::Created
        } else {
            CreateOutcome::AlreadyExists
        })
    }

    async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: &[ProgressionStatus],
        next: ProgressionStatus,
    ) -> Result<bool> {
        let expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
        let result = sqlx::query(
            r#"
            UPDATE level_progression.student_progress
            SET progression_status = $1, updated_at = now()
            WHERE id = $2 AND progression_status = ANY($3)
            "#,
        )
        .bind(next.as_str())
        .bind(id)
        .bind(&expected)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match ProgressRepository::get(self, id).await? {
            Some(_) => Ok(false),
            None => Err(ProgressionError::RecordNotFound(id)),
        }
    }

    async fn delete_if_pristine(&self, id: Uuid, origin: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM level_progression.student_progress
            WHERE id = $1
              AND progression_status = 'not_eligible'
              AND cardinality(periods_completed) = 0
              AND NOT EXISTS (
                  SELECT 1 FROM level_progression.student_progress
                  WHERE id = $2 AND progression_status = 'progressed'
              )
            "#,
        )
        .bind(id)
        .bind(origin)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl HistoryRecorder for PgStore {
    async fn append(&self, entry: &ProgressionHistoryEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO level_progression.history
            (id, student_id, schedule_type, from_level, to_level, progression_type,
             progression_date, performed_by, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.student_id)
        .bind(entry.schedule_type.as_str())
        .bind(entry.from_level as i32)
        .bind(entry.to_level as i32)
        .bind(entry.progression_type.as_str())
        .bind(entry.progression_date)
        .bind(&entry.performed_by)
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_rejection(&self, attempt: &RejectedAttempt) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO level_progression.rejected_attempts
            (id, student_id, schedule_type, level, reason, performed_by, attempted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(attempt.id)
        .bind(&attempt.student_id)
        .bind(attempt.schedule_type.as_str())
        .bind(attempt.level as i32)
        .bind(&attempt.reason)
        .bind(&attempt.performed_by)
        .bind(attempt.attempted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ProgressionHistoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, student_id, schedule_type, from_level, to_level, progression_type,
                   progression_date, performed_by, recorded_at
            FROM level_progression.history
            ORDER BY recorded_at DESC, progression_date DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(history_from_row).collect()
    }

    async fn recent_rejections(&self, limit: usize) -> Result<Vec<RejectedAttempt>> {
        let rows = sqlx::query(
            r#"
            SELECT id, student_id, schedule_type, level, reason, performed_by, attempted_at
            FROM level_progression.rejected_attempts
            ORDER BY attempted_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(rejection_from_row).collect()
    }
}

#[async_trait]
impl Roster for PgStore {
    async fn student_name(&self, student_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT full_name FROM level_progression.students WHERE student_id = $1")
            .bind(student_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get("full_name")))
    }
}

async fn upsert_student(pool: &PgPool, student_id: &str, full_name: &str) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO level_progression.students (student_id, full_name)
        VALUES ($1, $2)
        ON CONFLICT (student_id) DO UPDATE
        SET full_name = EXCLUDED.full_name
        "#,
    )
    .bind(student_id)
    .bind(full_name)
    .execute(pool)
    .await?;
    Ok(())
}

/// Inserts an enrolment, or appends newly completed periods to the existing
/// record at that level. Progressed records are never touched.
async fn upsert_progress(pool: &PgPool, record: &StudentProgressRecord) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO level_progression.student_progress AS sp
        (id, student_id, current_level, schedule_type, periods_completed, progression_status)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (student_id, current_level) DO UPDATE
        SET periods_completed = sp.periods_completed || ARRAY(
                SELECT u.p FROM unnest(EXCLUDED.periods_completed) WITH ORDINALITY AS u(p, n)
                WHERE NOT (u.p = ANY(sp.periods_completed))
                ORDER BY u.n
            ),
            updated_at = now()
        WHERE sp.progression_status <> 'progressed'
        "#,
    )
    .bind(record.id)
    .bind(&record.student_id)
    .bind(record.current_level as i32)
    .bind(record.schedule_type.as_str())
    .bind(&record.periods_completed)
    .bind(record.progression_status.as_str())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let store = PgStore::new(pool.clone());
    let rules = vec![
        ProgressionRule {
            id: Uuid::parse_str("6c1f2a8e-4b0d-4d6e-9a51-0f3b7c2d9e10")?,
            schedule_type: ScheduleType::Regular,
            required_periods: 3,
            progression_month: 9,
            progression_day: 1,
            period_names: vec![
                "First Trimester".to_string(),
                "Second Trimester".to_string(),
                "Third Trimester".to_string(),
            ],
            level_increment: DEFAULT_LEVEL_INCREMENT,
            max_level: Some(400),
            is_active: true,
        },
        ProgressionRule {
            id: Uuid::parse_str("a2d94c37-81e5-4f0a-b6c8-5e7d13f9a246")?,
            schedule_type: ScheduleType::Weekend,
            required_periods: 2,
            progression_month: 1,
            progression_day: 15,
            period_names: vec!["First Semester".to_string(), "Second Semester".to_string()],
            level_increment: DEFAULT_LEVEL_INCREMENT,
            max_level: Some(400),
            is_active: true,
        },
    ];
    for rule in &rules {
        store
            .save_rule(rule)
            .await
            .with_context(|| format!("failed to seed {} rule", rule.schedule_type))?;
    }

    let enrolments = vec![
        (
            "UG/2024/0117",
            "Abena Mensah",
            ScheduleType::Regular,
            100,
            vec!["First Trimester", "Second Trimester", "Third Trimester"],
        ),
        (
            "UG/2024/0243",
            "Kwame Boateng",
            ScheduleType::Regular,
            100,
            vec!["First Trimester", "Second Trimester"],
        ),
        (
            "UG/2022/0088",
            "Efua Asante",
            ScheduleType::Regular,
            400,
            vec!["First Trimester", "Second Trimester", "Third Trimester"],
        ),
        (
            "WK/2023/0031",
            "Yaw Owusu",
            ScheduleType::Weekend,
            200,
            vec!["First Semester", "Second Semester"],
        ),
        (
            "EV/2025/0009",
            "Akosua Darko",
            ScheduleType::Evening,
            100,
            vec!["First Semester"],
        ),
    ];

    for (student_id, full_name, schedule_type, level, periods) in enrolments {
        upsert_student(pool, student_id, full_name).await?;
        let mut record = StudentProgressRecord::enrol(student_id, level, schedule_type);
        record.periods_completed = periods.into_iter().map(str::to_string).collect();
        upsert_progress(pool, &record).await?;
    }

    Ok(())
}

pub async fn import_rules(
    pool: &PgPool,
    csv_path: &std::path::Path,
) -> anyhow::Result<(usize, Vec<String>)> {
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("cannot open {}", csv_path.display()))?;
    let parsed = import::read_rules(file)?;
    let store = PgStore::new(pool.clone());
    for rule in &parsed.rows {
        store.save_rule(rule).await?;
    }
    Ok((parsed.rows.len(), parsed.rejected))
}

pub async fn import_csv(
    pool: &PgPool,
    csv_path: &std::path::Path,
) -> anyhow::Result<(usize, Vec<String>)> {
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("cannot open {}", csv_path.display()))?;
    let parsed = import::read_enrolments(file)?;
    let mut written = 0usize;

    for row in &parsed.rows {
        upsert_student(pool, &row.record.student_id, &row.full_name).await?;
        if upsert_progress(pool, &row.record).await? {
            written += 1;
        }
    }

    Ok((written, parsed.rejected))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_column_values_are_storage_errors() {
        assert_eq!(non_negative("max_level", 400).unwrap(), 400);
        assert!(matches!(
            non_negative("max_level", -1),
            Err(ProgressionError::Persistence(message)) if message == "max_level is negative: -1"
        ));
    }
}
