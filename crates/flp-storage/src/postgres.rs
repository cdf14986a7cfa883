use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flp_core::{FitTier, PipelineStatus};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::tracker::{LeadPatch, TrackedLead, TrackerBackend, TrackerError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tracked_leads (
    record_id           UUID PRIMARY KEY,
    identity            TEXT NOT NULL UNIQUE,
    title               TEXT NOT NULL,
    budget_text         TEXT NOT NULL,
    campaign            TEXT NOT NULL,
    confidence          DOUBLE PRECISION NOT NULL,
    fit_tier            TEXT NOT NULL,
    best_profile        TEXT,
    status              TEXT,
    date_added          TIMESTAMPTZ NOT NULL,
    last_seen           TIMESTAMPTZ NOT NULL,
    status_updated_at   TIMESTAMPTZ,
    proposal_date       TIMESTAMPTZ,
    proposal_word_count INTEGER
);
CREATE INDEX IF NOT EXISTS tracked_leads_date_added_idx ON tracked_leads (date_added);
"#;

const SELECT_COLUMNS: &str = r#"
SELECT record_id, identity, title, budget_text, campaign, confidence, fit_tier,
       best_profile, status, date_added, last_seen, status_updated_at,
       proposal_date, proposal_word_count
  FROM tracked_leads
"#;

impl From<sqlx::Error> for TrackerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => TrackerError::NotFound("row".into()),
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                TrackerError::Connectivity(err.to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                TrackerError::Decode(err.to_string())
            }
            other => TrackerError::Storage(anyhow::Error::new(other)),
        }
    }
}

/// Tracker stored in a Postgres `tracked_leads` table.
#[derive(Debug, Clone)]
pub struct PgTracker {
    pool: PgPool,
}

impl PgTracker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .map_err(|e| anyhow::anyhow!("connecting to postgres: {e}"))?;
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!("creating tracked_leads schema: {e}"))?;
        Ok(())
    }
}

fn row_to_lead(row: &PgRow) -> Result<TrackedLead, TrackerError> {
    let record_id: Uuid = row.try_get("record_id")?;
    let fit_tier: String = row.try_get("fit_tier")?;
    let status: Option<String> = row.try_get("status")?;
    let word_count: Option<i32> = row.try_get("proposal_word_count")?;
    Ok(TrackedLead {
        record_id: record_id.to_string(),
        identity: row.try_get("identity")?,
        title: row.try_get("title")?,
        budget_text: row.try_get("budget_text")?,
        campaign: row.try_get("campaign")?,
        confidence: row.try_get("confidence")?,
        fit_tier: fit_tier.parse::<FitTier>().map_err(TrackerError::Decode)?,
        best_profile: row.try_get("best_profile")?,
        status: status
            .map(|s| s.parse::<PipelineStatus>())
            .transpose()
            .map_err(TrackerError::Decode)?,
        date_added: row.try_get("date_added")?,
        last_seen: row.try_get("last_seen")?,
        status_updated_at: row.try_get("status_updated_at")?,
        proposal_date: row.try_get("proposal_date")?,
        proposal_word_count: word_count.map(|n| n.max(0) as u32),
    })
}

/// Word counts past `INTEGER` range are stored saturated.
fn word_count_column(words: u32) -> i32 {
    i32::try_from(words).unwrap_or(i32::MAX)
}

fn parse_record_id(record_id: &str) -> Result<Uuid, TrackerError> {
    Uuid::parse_str(record_id).map_err(|_| TrackerError::NotFound(record_id.to_string()))
}

#[async_trait]
impl TrackerBackend for PgTracker {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn query_since(&self, since: DateTime<Utc>) -> Result<Vec<TrackedLead>, TrackerError> {
        let sql = format!("{SELECT_COLUMNS} WHERE date_added >= $1 ORDER BY date_added");
        let rows = sqlx::query(&sql).bind(since).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_lead).collect()
    }

    async fn query_by_identity(&self, identity: &str) -> Result<Option<TrackedLead>, TrackerError> {
        let sql = format!("{SELECT_COLUMNS} WHERE identity = $1");
        let row = sqlx::query(&sql)
            .bind(identity)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_lead).transpose()
    }

    async fn query_all(&self) -> Result<Vec<TrackedLead>, TrackerError> {
        let sql = format!("{SELECT_COLUMNS} ORDER BY date_added");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_lead).collect()
    }

    async fn create(&self, lead: &TrackedLead) -> Result<String, TrackerError> {
        let record_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO tracked_leads (
                record_id, identity, title, budget_text, campaign, confidence, fit_tier,
                best_profile, status, date_added, last_seen, status_updated_at,
                proposal_date, proposal_word_count
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(record_id)
        .bind(&lead.identity)
        .bind(&lead.title)
        .bind(&lead.budget_text)
        .bind(&lead.campaign)
        .bind(lead.confidence)
        .bind(lead.fit_tier.as_str())
        .bind(&lead.best_profile)
        .bind(lead.status.map(|s| s.as_str()))
        .bind(lead.date_added)
        .bind(lead.last_seen)
        .bind(lead.status_updated_at)
        .bind(lead.proposal_date)
        .bind(lead.proposal_word_count.map(word_count_column))
        .execute(&self.pool)
        .await?;
        Ok(record_id.to_string())
    }

    async fn patch(&self, record_id: &str, patch: &LeadPatch) -> Result<(), TrackerError> {
        let id = parse_record_id(record_id)?;
        let score = patch.score.as_ref();
        let result = sqlx::query(
            r#"
            UPDATE tracked_leads
               SET last_seen           = COALESCE($2, last_seen),
                   campaign            = COALESCE($3, campaign),
                   confidence          = COALESCE($4, confidence),
                   fit_tier            = COALESCE($5, fit_tier),
                   best_profile        = CASE WHEN $6 THEN $7 ELSE best_profile END,
                   status              = COALESCE($8, status),
                   status_updated_at   = COALESCE($9, status_updated_at),
                   proposal_date       = COALESCE($10, proposal_date),
                   proposal_word_count = COALESCE($11, proposal_word_count)
             WHERE record_id = $1
            "#,
        )
        .bind(id)
        .bind(patch.last_seen)
        .bind(&patch.campaign)
        .bind(score.map(|s| s.confidence))
        .bind(score.map(|s| s.fit_tier.as_str()))
        .bind(score.is_some())
        .bind(score.and_then(|s| s.best_profile.clone()))
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.status_updated_at)
        .bind(patch.proposal_date)
        .bind(patch.proposal_word_count.map(word_count_column))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TrackerError::NotFound(record_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_counts_saturate_at_column_range() {
        assert_eq!(word_count_column(420), 420);
        assert_eq!(word_count_column(u32::MAX), i32::MAX);
    }

    #[test]
    fn malformed_record_id_is_not_found() {
        assert!(matches!(
            parse_record_id("not-a-uuid"),
            Err(TrackerError::NotFound(_))
        ));
        assert!(parse_record_id(&Uuid::new_v4().to_string()).is_ok());
    }

    #[test]
    fn pool_exhaustion_is_retryable_connectivity() {
        let err = TrackerError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, TrackerError::Connectivity(_)));
        assert!(err.is_retryable());
    }
}
