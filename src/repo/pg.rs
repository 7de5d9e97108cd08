use chrono::NaiveDateTime;
use diesel::dsl::min;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, PooledConnection};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::Text;
use uuid::Uuid;

use super::{
    AssetRepository, AttemptDecision, DocumentRepository, OrganisationRepository,
    OrphanCandidate, RateLimitRepository, SessionRepository, StoreError, StoreResult,
};
use crate::db::PgPool;
use crate::models::{
    Asset, AssetChanges, Document, DocumentMetadataChanges, DocumentTransition, NewAsset,
    NewDocument, NewOrganisation, NewRateLimitAttempt, NewSession, Organisation, ReleasedKeys,
    Session, UploadStatus,
};
use crate::schema::{assets, documents, organisations, rate_limit_attempts, sessions};

type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

/// Postgres-backed repository. Each call checks a connection out of the pool
/// for its own duration only.
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn conn(&self) -> StoreResult<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|err| StoreError::Pool(err.to_string()))
    }
}

fn map_unique(err: DieselError) -> StoreError {
    match err {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
            StoreError::UniqueViolation(info.message().to_string())
        }
        other => StoreError::Database(other),
    }
}

fn pending_statuses() -> Vec<&'static str> {
    UploadStatus::PENDING.iter().map(|s| s.as_str()).collect()
}

fn released((storage_key, pending_storage_key): (String, Option<String>)) -> ReleasedKeys {
    ReleasedKeys {
        storage_key,
        pending_storage_key,
    }
}

#[derive(AsChangeset)]
#[diesel(table_name = organisations)]
struct SecretChanges {
    admin_secret_hash: Option<String>,
    access_code_hash: Option<String>,
    updated_at: NaiveDateTime,
}

impl OrganisationRepository for PgRepository {
    fn insert_organisation(&self, new: NewOrganisation) -> StoreResult<Organisation> {
        let mut conn = self.conn()?;
        diesel::insert_into(organisations::table)
            .values(&new)
            .get_result(&mut conn)
            .map_err(map_unique)
    }

    fn find_organisation(&self, id: Uuid) -> StoreResult<Option<Organisation>> {
        let mut conn = self.conn()?;
        Ok(organisations::table
            .find(id)
            .first(&mut conn)
            .optional()?)
    }

    fn find_organisation_by_slug(&self, slug: &str) -> StoreResult<Option<Organisation>> {
        let mut conn = self.conn()?;
        Ok(organisations::table
            .filter(organisations::slug.eq(slug))
            .first(&mut conn)
            .optional()?)
    }

    fn update_organisation_secrets(
        &self,
        id: Uuid,
        admin_secret_hash: Option<String>,
        access_code_hash: Option<String>,
        now: NaiveDateTime,
    ) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        let updated = diesel::update(organisations::table.find(id))
            .set(SecretChanges {
                admin_secret_hash,
                access_code_hash,
                updated_at: now,
            })
            .execute(&mut conn)?;
        Ok(updated > 0)
    }
}

impl SessionRepository for PgRepository {
    fn insert_session(&self, new: NewSession) -> StoreResult<Session> {
        let mut conn = self.conn()?;
        diesel::insert_into(sessions::table)
            .values(&new)
            .get_result(&mut conn)
            .map_err(map_unique)
    }

    fn find_session_by_hash(&self, token_hash: &str) -> StoreResult<Option<Session>> {
        let mut conn = self.conn()?;
        Ok(sessions::table
            .filter(sessions::token_hash.eq(token_hash))
            .first(&mut conn)
            .optional()?)
    }

    fn delete_session_by_hash(&self, token_hash: &str) -> StoreResult<usize> {
        let mut conn = self.conn()?;
        Ok(
            diesel::delete(sessions::table.filter(sessions::token_hash.eq(token_hash)))
                .execute(&mut conn)?,
        )
    }

    fn delete_expired_sessions(&self, org_id: Uuid, now: NaiveDateTime) -> StoreResult<usize> {
        let mut conn = self.conn()?;
        Ok(diesel::delete(
            sessions::table
                .filter(sessions::org_id.eq(org_id))
                .filter(sessions::expires_at.le(now)),
        )
        .execute(&mut conn)?)
    }

    fn touch_session(&self, session_id: Uuid, now: NaiveDateTime) -> StoreResult<()> {
        let mut conn = self.conn()?;
        diesel::update(sessions::table.find(session_id))
            .set(sessions::last_seen_at.eq(now))
            .execute(&mut conn)?;
        Ok(())
    }
}

impl AssetRepository for PgRepository {
    fn insert_asset(&self, new: NewAsset) -> StoreResult<Asset> {
        let mut conn = self.conn()?;
        diesel::insert_into(assets::table)
            .values(&new)
            .get_result(&mut conn)
            .map_err(map_unique)
    }

    fn find_asset(&self, org_id: Uuid, asset_id: Uuid) -> StoreResult<Option<Asset>> {
        let mut conn = self.conn()?;
        Ok(assets::table
            .filter(assets::id.eq(asset_id))
            .filter(assets::org_id.eq(org_id))
            .first(&mut conn)
            .optional()?)
    }

    fn find_asset_by_id(&self, asset_id: Uuid) -> StoreResult<Option<Asset>> {
        let mut conn = self.conn()?;
        Ok(assets::table.find(asset_id).first(&mut conn).optional()?)
    }

    fn find_asset_by_public_token(&self, token: &str) -> StoreResult<Option<Asset>> {
        let mut conn = self.conn()?;
        Ok(assets::table
            .filter(assets::public_token.eq(token))
            .first(&mut conn)
            .optional()?)
    }

    fn list_assets(&self, org_id: Uuid) -> StoreResult<Vec<Asset>> {
        let mut conn = self.conn()?;
        Ok(assets::table
            .filter(assets::org_id.eq(org_id))
            .order(assets::created_at.desc())
            .load(&mut conn)?)
    }

    fn update_asset(
        &self,
        org_id: Uuid,
        asset_id: Uuid,
        changes: AssetChanges,
    ) -> StoreResult<Option<Asset>> {
        let mut conn = self.conn()?;
        Ok(diesel::update(
            assets::table
                .filter(assets::id.eq(asset_id))
                .filter(assets::org_id.eq(org_id)),
        )
        .set(changes)
        .get_result(&mut conn)
        .optional()?)
    }

    fn delete_asset(&self, org_id: Uuid, asset_id: Uuid) -> StoreResult<Option<Vec<String>>> {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;
        let keys = conn.transaction(|conn| {
            let found = assets::table
                .filter(assets::id.eq(asset_id))
                .filter(assets::org_id.eq(org_id))
                .select(assets::id)
                .for_update()
                .first::<Uuid>(conn)
                .optional()?;
            if found.is_none() {
                return Ok::<_, DieselError>(None);
            }

            let removed: Vec<(String, Option<String>)> =
                diesel::delete(documents::table.filter(documents::asset_id.eq(asset_id)))
                    .returning((documents::storage_key, documents::pending_storage_key))
                    .get_results(conn)?;
            diesel::delete(assets::table.find(asset_id)).execute(conn)?;

            Ok(Some(
                removed
                    .into_iter()
                    .flat_map(|row| released(row).into_keys())
                    .collect(),
            ))
        })?;
        Ok(keys)
    }
}

impl DocumentRepository for PgRepository {
    fn count_documents_for_asset(&self, asset_id: Uuid) -> StoreResult<i64> {
        let mut conn = self.conn()?;
        Ok(documents::table
            .filter(documents::asset_id.eq(asset_id))
            .count()
            .get_result(&mut conn)?)
    }

    fn count_documents_for_org(&self, org_id: Uuid) -> StoreResult<i64> {
        let mut conn = self.conn()?;
        Ok(documents::table
            .filter(documents::org_id.eq(org_id))
            .count()
            .get_result(&mut conn)?)
    }

    fn insert_document(&self, new: NewDocument) -> StoreResult<Document> {
        let mut conn = self.conn()?;
        diesel::insert_into(documents::table)
            .values(&new)
            .get_result(&mut conn)
            .map_err(map_unique)
    }

    fn find_document(&self, org_id: Uuid, document_id: Uuid) -> StoreResult<Option<Document>> {
        let mut conn = self.conn()?;
        Ok(documents::table
            .filter(documents::id.eq(document_id))
            .filter(documents::org_id.eq(org_id))
            .first(&mut conn)
            .optional()?)
    }

    fn find_document_by_id(&self, document_id: Uuid) -> StoreResult<Option<Document>> {
        let mut conn = self.conn()?;
        Ok(documents::table
            .find(document_id)
            .first(&mut conn)
            .optional()?)
    }

    fn list_documents_for_asset(&self, asset_id: Uuid) -> StoreResult<Vec<Document>> {
        let mut conn = self.conn()?;
        Ok(documents::table
            .filter(documents::asset_id.eq(asset_id))
            .order(documents::created_at.desc())
            .load(&mut conn)?)
    }

    fn list_ready_documents_for_asset(&self, asset_id: Uuid) -> StoreResult<Vec<Document>> {
        let mut conn = self.conn()?;
        Ok(documents::table
            .filter(documents::asset_id.eq(asset_id))
            .filter(documents::upload_status.eq(UploadStatus::Ready.as_str()))
            .order(documents::uploaded_at.desc())
            .load(&mut conn)?)
    }

    fn transition_document(&self, transition: &DocumentTransition) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        let updated = diesel::update(
            documents::table
                .filter(documents::id.eq(transition.document_id))
                .filter(documents::org_id.eq(transition.org_id))
                .filter(documents::upload_status.eq(transition.from.as_str()))
                .filter(documents::storage_key.eq(&transition.expected_storage_key)),
        )
        .set(transition.changes.clone())
        .execute(&mut conn)
        .map_err(map_unique)?;
        Ok(updated == 1)
    }

    fn update_ready_document_metadata(
        &self,
        org_id: Uuid,
        document_id: Uuid,
        changes: DocumentMetadataChanges,
    ) -> StoreResult<Option<Document>> {
        let mut conn = self.conn()?;
        Ok(diesel::update(
            documents::table
                .filter(documents::id.eq(document_id))
                .filter(documents::org_id.eq(org_id))
                .filter(documents::upload_status.eq(UploadStatus::Ready.as_str())),
        )
        .set(changes)
        .get_result(&mut conn)
        .optional()?)
    }

    fn delete_document(
        &self,
        org_id: Uuid,
        document_id: Uuid,
    ) -> StoreResult<Option<ReleasedKeys>> {
        let mut conn = self.conn()?;
        let row = diesel::delete(
            documents::table
                .filter(documents::id.eq(document_id))
                .filter(documents::org_id.eq(org_id)),
        )
        .returning((documents::storage_key, documents::pending_storage_key))
        .get_result::<(String, Option<String>)>(&mut conn)
        .optional()?;
        Ok(row.map(released))
    }

    fn find_orphaned_documents(
        &self,
        cutoff: NaiveDateTime,
    ) -> StoreResult<Vec<OrphanCandidate>> {
        let mut conn = self.conn()?;
        let rows: Vec<(Uuid, String)> = documents::table
            .filter(documents::upload_status.eq_any(pending_statuses()))
            .filter(documents::status_changed_at.lt(cutoff))
            .order(documents::status_changed_at.asc())
            .select((documents::id, documents::storage_key))
            .load(&mut conn)?;
        Ok(rows
            .into_iter()
            .map(|(document_id, storage_key)| OrphanCandidate {
                document_id,
                storage_key,
            })
            .collect())
    }

    fn delete_orphaned_document(
        &self,
        document_id: Uuid,
        cutoff: NaiveDateTime,
    ) -> StoreResult<Option<ReleasedKeys>> {
        let mut conn = self.conn()?;
        let row = diesel::delete(
            documents::table
                .filter(documents::id.eq(document_id))
                .filter(documents::upload_status.eq_any(pending_statuses()))
                .filter(documents::status_changed_at.lt(cutoff)),
        )
        .returning((documents::storage_key, documents::pending_storage_key))
        .get_result::<(String, Option<String>)>(&mut conn)
        .optional()?;
        Ok(row.map(released))
    }
}

impl RateLimitRepository for PgRepository {
    fn record_attempt_if_allowed(
        &self,
        key: &str,
        window_start: NaiveDateTime,
        max_attempts: i64,
        now: NaiveDateTime,
    ) -> StoreResult<AttemptDecision> {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;
        let decision = conn.transaction(|conn| {
            // Serialises concurrent checks for the same key until commit.
            diesel::sql_query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind::<Text, _>(key)
                .execute(conn)?;

            let in_window: i64 = rate_limit_attempts::table
                .filter(rate_limit_attempts::key.eq(key))
                .filter(rate_limit_attempts::created_at.gt(window_start))
                .count()
                .get_result(conn)?;

            if in_window >= max_attempts {
                let oldest: Option<NaiveDateTime> = rate_limit_attempts::table
                    .filter(rate_limit_attempts::key.eq(key))
                    .filter(rate_limit_attempts::created_at.gt(window_start))
                    .select(min(rate_limit_attempts::created_at))
                    .get_result(conn)?;
                return Ok::<_, DieselError>(AttemptDecision::Denied {
                    oldest: oldest.unwrap_or(now),
                });
            }

            diesel::insert_into(rate_limit_attempts::table)
                .values(&NewRateLimitAttempt {
                    key,
                    created_at: now,
                })
                .execute(conn)?;
            Ok(AttemptDecision::Allowed)
        })?;
        Ok(decision)
    }

    fn purge_attempts_before(&self, cutoff: NaiveDateTime) -> StoreResult<usize> {
        let mut conn = self.conn()?;
        Ok(
            diesel::delete(
                rate_limit_attempts::table.filter(rate_limit_attempts::created_at.lt(cutoff)),
            )
            .execute(&mut conn)?,
        )
    }
}
