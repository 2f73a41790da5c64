use async_trait::async_trait;
use tracing::debug;

use crate::cache::{
    Fingerprint, IndexError, LookupIndex, LookupRecord, ensure_parent, normalize_identifier,
};

use super::{PostgresLookupIndex, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct LookupRow {
    base_cache_key: String,
    parent_identifier: String,
    supplementary_identifier: Option<String>,
}

impl From<LookupRow> for LookupRecord {
    fn from(row: LookupRow) -> Self {
        Self {
            base_cache_key: Fingerprint::from_hex(row.base_cache_key),
            parent_identifier: row.parent_identifier,
            supplementary_identifier: row.supplementary_identifier,
        }
    }
}

#[async_trait]
impl LookupIndex for PostgresLookupIndex {
    async fn insert(
        &self,
        key: &Fingerprint,
        parent_identifier: &str,
        supplementary_identifier: Option<&str>,
    ) -> Result<(), IndexError> {
        ensure_parent(parent_identifier)?;

        let result = sqlx::query(
            r#"
            INSERT INTO cached_page_records (base_cache_key, parent_identifier, supplementary_identifier)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(key.as_str())
        .bind(parent_identifier)
        .bind(normalize_identifier(supplementary_identifier))
        .execute(self.pool())
        .await;

        match result.map_err(map_sqlx_error) {
            Ok(_) => Ok(()),
            Err(IndexError::Duplicate { constraint }) => {
                debug!(cache_key = %key, constraint = %constraint, "Lookup record already present");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn query(
        &self,
        parent_identifier: &str,
        supplementary_identifier: Option<&str>,
    ) -> Result<Vec<LookupRecord>, IndexError> {
        let rows = sqlx::query_as::<_, LookupRow>(
            r#"
            SELECT base_cache_key, parent_identifier, supplementary_identifier
            FROM cached_page_records
            WHERE parent_identifier = $1
              AND ($2::text IS NULL OR supplementary_identifier = $2)
            "#,
        )
        .bind(parent_identifier)
        .bind(normalize_identifier(supplementary_identifier))
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(LookupRecord::from).collect())
    }

    async fn remove(
        &self,
        key: &Fingerprint,
        parent_identifier: &str,
        supplementary_identifier: Option<&str>,
    ) -> Result<(), IndexError> {
        sqlx::query(
            r#"
            DELETE FROM cached_page_records
            WHERE base_cache_key = $1
              AND parent_identifier = $2
              AND supplementary_identifier IS NOT DISTINCT FROM $3
            "#,
        )
        .bind(key.as_str())
        .bind(parent_identifier)
        .bind(normalize_identifier(supplementary_identifier))
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }
}
