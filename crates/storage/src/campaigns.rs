use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqlitePool};
use thiserror::Error;

use safebox_core::campaign::CampaignDraft;
use safebox_core::types::{Campaign, DeliveryMode, DeliveryStatus};

use crate::workers::push_in;
use crate::{decode_enum, decode_json, encode_json, to_rfc3339, violation, Violation};

const CAMPAIGN_COLUMNS: &str = "id, name, description, branch, delivery_mode, selected_areas, \
     contract_types, start_date, end_date, active, created_by, created_at, updated_at";

/// A validated draft plus its author.
#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub draft: CampaignDraft,
    pub created_by: Option<i64>,
}

/// List selector for campaigns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignState {
    Active,
    Inactive,
    /// Active with today inside its date range.
    Current,
}

impl CampaignState {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "active" | "activas" => Some(Self::Active),
            "inactive" | "inactivas" => Some(Self::Inactive),
            "current" | "vigentes" => Some(Self::Current),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CampaignError {
    #[error("campaign not found")]
    NotFound,
    #[error("branch does not exist")]
    MissingReference,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn map_write_error(err: sqlx::Error) -> CampaignError {
    match violation(&err) {
        Some((Violation::ForeignKey, _)) => CampaignError::MissingReference,
        _ => CampaignError::Database(err),
    }
}

fn map_campaign(row: &SqliteRow) -> Result<Campaign, sqlx::Error> {
    Ok(Campaign {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        branch: row.try_get("branch")?,
        delivery_mode: decode_enum(row, "delivery_mode")?,
        selected_areas: decode_json(row, "selected_areas")?,
        contract_types: decode_json(row, "contract_types")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        active: row.try_get("active")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Restricts a query over `workers w` to the campaign's audience.
fn push_audience(builder: &mut QueryBuilder<'_, Sqlite>, campaign: &Campaign) {
    builder
        .push(" AND w.active = 1 AND w.branch = ")
        .push_bind(campaign.branch.clone());
    push_in(
        builder,
        "w.contract_type",
        campaign.contract_types.iter().map(|c| c.as_str().to_string()),
    );
    if campaign.delivery_mode == DeliveryMode::Group {
        push_in(builder, "w.area", campaign.selected_areas.iter().cloned());
    }
}

fn has_audience(campaign: &Campaign) -> bool {
    !campaign.contract_types.is_empty()
        && (campaign.delivery_mode == DeliveryMode::General || !campaign.selected_areas.is_empty())
}

/// Repository for delivery campaigns.
#[derive(Clone)]
pub struct CampaignRepository {
    pool: SqlitePool,
}

impl CampaignRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Newest first. `today` is only consulted for [`CampaignState::Current`].
    pub async fn list(
        &self,
        state: Option<CampaignState>,
        today: NaiveDate,
    ) -> Result<Vec<Campaign>, CampaignError> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE 1 = 1"));
        match state {
            Some(CampaignState::Active) => {
                builder.push(" AND active = 1");
            }
            Some(CampaignState::Inactive) => {
                builder.push(" AND active = 0");
            }
            Some(CampaignState::Current) => {
                builder
                    .push(" AND active = 1 AND start_date <= ")
                    .push_bind(today)
                    .push(" AND end_date >= ")
                    .push_bind(today);
            }
            None => {}
        }
        builder.push(" ORDER BY created_at DESC, id DESC");

        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(map_campaign).collect::<Result<_, _>>()?)
    }

    pub async fn find(&self, id: i64) -> Result<Option<Campaign>, CampaignError> {
        let row = sqlx::query(&format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(map_campaign).transpose()?)
    }

    pub async fn get(&self, id: i64) -> Result<Campaign, CampaignError> {
        self.find(id).await?.ok_or(CampaignError::NotFound)
    }

    pub async fn insert(
        &self,
        campaign: &NewCampaign,
        now: DateTime<Utc>,
    ) -> Result<Campaign, CampaignError> {
        let draft = &campaign.draft;
        let stamp = to_rfc3339(now);
        let row = sqlx::query(&format!(
            "INSERT INTO campaigns \
             (name, description, branch, delivery_mode, selected_areas, contract_types, \
              start_date, end_date, active, created_by, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING {CAMPAIGN_COLUMNS}"
        ))
        .bind(&draft.name)
        .bind(&draft.description)
        .bind(&draft.branch)
        .bind(draft.delivery_mode.as_str())
        .bind(encode_json(&draft.selected_areas)?)
        .bind(encode_json(&draft.contract_types)?)
        .bind(draft.start_date)
        .bind(draft.end_date)
        .bind(draft.active)
        .bind(campaign.created_by)
        .bind(&stamp)
        .bind(&stamp)
        .fetch_all(&self.pool)
        .await
        .map_err(map_write_error)?
        .into_iter()
        .next()
        .ok_or(sqlx::Error::RowNotFound)?;
        Ok(map_campaign(&row)?)
    }

    pub async fn update(
        &self,
        id: i64,
        draft: &CampaignDraft,
        now: DateTime<Utc>,
    ) -> Result<Campaign, CampaignError> {
        let row = sqlx::query(&format!(
            "UPDATE campaigns SET name = ?, description = ?, branch = ?, delivery_mode = ?, \
             selected_areas = ?, contract_types = ?, start_date = ?, end_date = ?, active = ?, \
             updated_at = ? WHERE id = ? RETURNING {CAMPAIGN_COLUMNS}"
        ))
        .bind(&draft.name)
        .bind(&draft.description)
        .bind(&draft.branch)
        .bind(draft.delivery_mode.as_str())
        .bind(encode_json(&draft.selected_areas)?)
        .bind(encode_json(&draft.contract_types)?)
        .bind(draft.start_date)
        .bind(draft.end_date)
        .bind(draft.active)
        .bind(to_rfc3339(now))
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_write_error)?
        .into_iter()
        .next()
        .ok_or(CampaignError::NotFound)?;
        Ok(map_campaign(&row)?)
    }

    pub async fn set_active(
        &self,
        id: i64,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<Campaign, CampaignError> {
        let row = sqlx::query(&format!(
            "UPDATE campaigns SET active = ?, updated_at = ? WHERE id = ? RETURNING {CAMPAIGN_COLUMNS}"
        ))
        .bind(active)
        .bind(to_rfc3339(now))
        .bind(id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .next()
        .ok_or(CampaignError::NotFound)?;
        Ok(map_campaign(&row)?)
    }

    pub async fn delete(&self, id: i64) -> Result<(), CampaignError> {
        let result = sqlx::query("DELETE FROM campaigns WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CampaignError::NotFound);
        }
        Ok(())
    }

    /// Active workers of the campaign branch with a listed contract, and a listed area in group mode.
    pub async fn count_eligible(&self, campaign: &Campaign) -> Result<i64, CampaignError> {
        if !has_audience(campaign) {
            return Ok(0);
        }
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) AS total FROM workers w WHERE 1 = 1");
        push_audience(&mut builder, campaign);
        let row = builder.build().fetch_one(&self.pool).await?;
        Ok(row.try_get("total")?)
    }

    /// Delivered boxes to eligible workers with `delivered_at` in `[from, to)`.
    ///
    /// Callers convert the campaign's local date range into UTC bounds.
    pub async fn count_deliveries_made(
        &self,
        campaign: &Campaign,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64, CampaignError> {
        if !has_audience(campaign) {
            return Ok(0);
        }
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT COUNT(*) AS total FROM deliveries d JOIN workers w ON w.id = d.worker_id \
             WHERE d.status = ",
        );
        builder
            .push_bind(DeliveryStatus::Delivered.as_str())
            .push(" AND d.delivered_at >= ")
            .push_bind(to_rfc3339(from))
            .push(" AND d.delivered_at < ")
            .push_bind(to_rfc3339(to));
        push_audience(&mut builder, campaign);
        let row = builder.build().fetch_one(&self.pool).await?;
        Ok(row.try_get("total")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{insert_box, insert_worker, setup_db, ts};
    use crate::NewDelivery;
    use safebox_core::types::ContractType;

    fn draft(name: &str, start: &str, end: &str) -> CampaignDraft {
        CampaignDraft {
            name: name.into(),
            description: None,
            branch: "casablanca".into(),
            delivery_mode: DeliveryMode::Group,
            selected_areas: vec!["produccion_manufactura".into()],
            contract_types: vec![ContractType::Indefinite],
            start_date: start.parse().expect("date"),
            end_date: end.parse().expect("date"),
            active: true,
        }
    }

    #[tokio::test]
    async fn stores_json_columns_and_filters_by_state() {
        let (db, _dir) = setup_db().await;
        let repo = db.campaigns();
        let now = ts("2025-05-01T12:00:00Z");

        let spring = repo
            .insert(
                &NewCampaign {
                    draft: draft("Spring", "2025-04-01", "2025-05-31"),
                    created_by: None,
                },
                now,
            )
            .await
            .expect("insert");
        assert_eq!(spring.selected_areas, vec!["produccion_manufactura".to_string()]);
        assert_eq!(spring.contract_types, vec![ContractType::Indefinite]);

        let winter = repo
            .insert(
                &NewCampaign {
                    draft: draft("Winter", "2025-07-01", "2025-07-31"),
                    created_by: None,
                },
                now + chrono::Duration::minutes(1),
            )
            .await
            .expect("insert");

        let today: NaiveDate = "2025-05-10".parse().expect("date");
        let current = repo
            .list(Some(CampaignState::Current), today)
            .await
            .expect("list");
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].id, spring.id);

        let all = repo.list(None, today).await.expect("list");
        assert_eq!(all[0].id, winter.id, "newest first");

        repo.set_active(winter.id, false, now).await.expect("finish");
        let inactive = repo
            .list(Some(CampaignState::Inactive), today)
            .await
            .expect("list");
        assert_eq!(inactive.len(), 1);

        let mut missing = draft("Lost", "2025-04-01", "2025-05-31");
        missing.branch = "nowhere".into();
        let err = repo
            .insert(
                &NewCampaign {
                    draft: missing,
                    created_by: None,
                },
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CampaignError::MissingReference));

        repo.delete(spring.id).await.expect("delete");
        assert!(matches!(repo.get(spring.id).await, Err(CampaignError::NotFound)));
    }

    #[tokio::test]
    async fn counts_audience_and_deliveries_in_range() {
        let (db, _dir) = setup_db().await;
        let repo = db.campaigns();
        let now = ts("2025-05-01T12:00:00Z");
        let campaign = repo
            .insert(
                &NewCampaign {
                    draft: draft("Spring", "2025-04-01", "2025-05-31"),
                    created_by: None,
                },
                now,
            )
            .await
            .expect("insert");

        let served = insert_worker(&db, "11111111-1", "casablanca", ContractType::Indefinite).await;
        insert_worker(&db, "22222222-2", "casablanca", ContractType::Indefinite).await;
        insert_worker(&db, "33333333-3", "casablanca", ContractType::FixedTerm).await;
        insert_worker(&db, "44444444-4", "valparaiso_bif", ContractType::Indefinite).await;
        let lot = insert_box(&db, "CAS-01", "casablanca", ContractType::Indefinite, 20).await;

        assert_eq!(repo.count_eligible(&campaign).await.expect("eligible"), 2);

        db.deliveries()
            .record(
                &NewDelivery {
                    worker_id: served.id,
                    box_id: lot.id,
                    ..NewDelivery::default()
                },
                ts("2025-05-02T15:00:00Z"),
            )
            .await
            .expect("record");

        let made = repo
            .count_deliveries_made(
                &campaign,
                ts("2025-04-01T04:00:00Z"),
                ts("2025-06-01T04:00:00Z"),
            )
            .await
            .expect("made");
        assert_eq!(made, 1);
        let outside = repo
            .count_deliveries_made(
                &campaign,
                ts("2025-06-01T04:00:00Z"),
                ts("2025-07-01T04:00:00Z"),
            )
            .await
            .expect("made");
        assert_eq!(outside, 0);
    }
}
