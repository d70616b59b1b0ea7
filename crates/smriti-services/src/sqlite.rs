//! SQLite-backed relational store via `tokio-rusqlite`.
//!
//! All calls run on the connection's dedicated thread, so writes are
//! serialized; the UNIQUE constraints on `tenants.email` and
//! `photos(tenant_id, storage_key)` back that up across processes.

use crate::store::{FaceOwner, NewTenant, RelationalStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, ErrorCode, OptionalExtension, Row};
use smriti_core::{
    FaceIndexRecord, IndexStatus, PhotoAsset, PhotoId, ServiceError, Tenant, TenantId,
};
use std::collections::BTreeSet;
use std::path::Path;
use tokio_rusqlite::Connection;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NOT NULL UNIQUE,
    passkey TEXT NOT NULL UNIQUE,
    client_passkey TEXT NOT NULL UNIQUE,
    storage_prefix TEXT NOT NULL UNIQUE,
    collection_id TEXT NOT NULL UNIQUE,
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS photos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id INTEGER NOT NULL,
    storage_key TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    is_highlight INTEGER NOT NULL DEFAULT 0,
    UNIQUE (tenant_id, storage_key),
    FOREIGN KEY (tenant_id) REFERENCES tenants(id)
);

-- One row per (photo, face); a photo with no face has no rows but
-- status 'no_face'.
CREATE TABLE IF NOT EXISTS face_records (
    photo_id INTEGER NOT NULL,
    face_id TEXT NOT NULL,
    PRIMARY KEY (photo_id, face_id),
    FOREIGN KEY (photo_id) REFERENCES photos(id)
);

CREATE INDEX IF NOT EXISTS idx_photos_tenant ON photos(tenant_id);
CREATE INDEX IF NOT EXISTS idx_face_records_face ON face_records(face_id);
"#;

const TENANT_COLUMNS: &str =
    "id, email, passkey, client_passkey, storage_prefix, collection_id, active, created_at";
const PHOTO_COLUMNS: &str = "id, tenant_id, storage_key, status, is_highlight";

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ServiceError> {
        let conn = Connection::open(path.as_ref()).await.map_err(db_error)?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, ServiceError> {
        let conn = Connection::open_in_memory().await.map_err(db_error)?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, ServiceError> {
        conn.call(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(db_error)?;
        tracing::debug!("sqlite store ready");
        Ok(Self { conn })
    }
}

fn db_error(e: tokio_rusqlite::Error) -> ServiceError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => sqlite_error(e),
        tokio_rusqlite::Error::ConnectionClosed => {
            ServiceError::Transient("database connection closed".into())
        }
        other => ServiceError::Transient(other.to_string()),
    }
}

fn sqlite_error(e: rusqlite::Error) -> ServiceError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) => match err.code {
            ErrorCode::ConstraintViolation => ServiceError::Conflict(e.to_string()),
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                ServiceError::Transient(e.to_string())
            }
            _ => ServiceError::Rejected(e.to_string()),
        },
        rusqlite::Error::QueryReturnedNoRows => ServiceError::NotFound(e.to_string()),
        _ => ServiceError::Rejected(e.to_string()),
    }
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn tenant_from_row(row: &Row<'_>) -> rusqlite::Result<Tenant> {
    let created_at: String = row.get(7)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| conversion_error(7, format!("created_at: {e}")))?
        .with_timezone(&Utc);
    Ok(Tenant {
        id: row.get(0)?,
        email: row.get(1)?,
        passkey: row.get(2)?,
        client_passkey: row.get(3)?,
        storage_prefix: row.get(4)?,
        collection_id: row.get(5)?,
        active: row.get(6)?,
        created_at,
    })
}

fn photo_from_row(row: &Row<'_>) -> rusqlite::Result<PhotoAsset> {
    let status: String = row.get(3)?;
    let status = IndexStatus::parse(&status)
        .ok_or_else(|| conversion_error(3, format!("unknown index status {status:?}")))?;
    Ok(PhotoAsset {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        storage_key: row.get(2)?,
        status,
        is_highlight: row.get(4)?,
    })
}

fn select_photo(
    conn: &rusqlite::Connection,
    tenant_id: TenantId,
    storage_key: &str,
) -> rusqlite::Result<Option<PhotoAsset>> {
    conn.query_row(
        &format!("SELECT {PHOTO_COLUMNS} FROM photos WHERE tenant_id = ?1 AND storage_key = ?2"),
        params![tenant_id, storage_key],
        photo_from_row,
    )
    .optional()
}

fn select_face_record(
    conn: &rusqlite::Connection,
    photo_id: PhotoId,
) -> rusqlite::Result<Option<FaceIndexRecord>> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM photos WHERE id = ?1",
            params![photo_id],
            |row| row.get(0),
        )
        .optional()?;
    let recorded = matches!(
        status.as_deref().and_then(IndexStatus::parse),
        Some(IndexStatus::Indexed | IndexStatus::NoFace)
    );
    if !recorded {
        return Ok(None);
    }
    let mut stmt = conn.prepare("SELECT face_id FROM face_records WHERE photo_id = ?1")?;
    let face_ids = stmt
        .query_map(params![photo_id], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<BTreeSet<String>>>()?;
    Ok(Some(FaceIndexRecord {
        photo_asset_id: photo_id,
        face_ids,
    }))
}

impl SqliteStore {
    async fn tenant_where(
        &self,
        clause: &'static str,
        value: String,
    ) -> Result<Option<Tenant>, ServiceError> {
        self.conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE {clause} = ?1"),
                        params![value],
                        tenant_from_row,
                    )
                    .optional()?)
            })
            .await
            .map_err(db_error)
    }
}

#[async_trait]
impl RelationalStore for SqliteStore {
    async fn insert_tenant(&self, tenant: NewTenant) -> Result<Tenant, ServiceError> {
        let created_at = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO tenants (email, passkey, client_passkey, storage_prefix, collection_id, active, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
                    params![
                        tenant.email,
                        tenant.passkey,
                        tenant.client_passkey,
                        tenant.storage_prefix,
                        tenant.collection_id,
                        created_at
                    ],
                )?;
                let id = tx.last_insert_rowid();
                let row = tx.query_row(
                    &format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = ?1"),
                    params![id],
                    tenant_from_row,
                )?;
                tx.commit()?;
                Ok(row)
            })
            .await
            .map_err(db_error)
    }

    async fn tenant_by_email(&self, email: &str) -> Result<Option<Tenant>, ServiceError> {
        self.tenant_where("email", email.to_string()).await
    }

    async fn tenant_by_passkey(&self, passkey: &str) -> Result<Option<Tenant>, ServiceError> {
        self.tenant_where("passkey", passkey.to_string()).await
    }

    async fn tenant_by_id(&self, id: TenantId) -> Result<Option<Tenant>, ServiceError> {
        self.conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = ?1"),
                        params![id],
                        tenant_from_row,
                    )
                    .optional()?)
            })
            .await
            .map_err(db_error)
    }

    async fn set_tenant_active(&self, id: TenantId, active: bool) -> Result<bool, ServiceError> {
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE tenants SET active = ?1 WHERE id = ?2",
                    params![active, id],
                )?;
                Ok(n > 0)
            })
            .await
            .map_err(db_error)
    }

    async fn upsert_photo(
        &self,
        tenant_id: TenantId,
        storage_key: &str,
    ) -> Result<PhotoAsset, ServiceError> {
        let storage_key = storage_key.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO photos (tenant_id, storage_key) VALUES (?1, ?2)
                     ON CONFLICT (tenant_id, storage_key) DO NOTHING",
                    params![tenant_id, storage_key],
                )?;
                let failed: Option<PhotoId> = tx
                    .query_row(
                        "SELECT id FROM photos WHERE tenant_id = ?1 AND storage_key = ?2 AND status = 'failed'",
                        params![tenant_id, storage_key],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(id) = failed {
                    tx.execute("DELETE FROM face_records WHERE photo_id = ?1", params![id])?;
                    tx.execute(
                        "UPDATE photos SET status = 'pending' WHERE id = ?1",
                        params![id],
                    )?;
                }
                let photo = select_photo(&tx, tenant_id, &storage_key)?
                    .ok_or(rusqlite::Error::QueryReturnedNoRows)?;
                tx.commit()?;
                Ok(photo)
            })
            .await
            .map_err(db_error)
    }

    async fn photo(
        &self,
        tenant_id: TenantId,
        photo_id: PhotoId,
    ) -> Result<Option<PhotoAsset>, ServiceError> {
        self.conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {PHOTO_COLUMNS} FROM photos WHERE tenant_id = ?1 AND id = ?2"),
                        params![tenant_id, photo_id],
                        photo_from_row,
                    )
                    .optional()?)
            })
            .await
            .map_err(db_error)
    }

    async fn photos(&self, tenant_id: TenantId) -> Result<Vec<PhotoAsset>, ServiceError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PHOTO_COLUMNS} FROM photos WHERE tenant_id = ?1 ORDER BY storage_key"
                ))?;
                let rows = stmt
                    .query_map(params![tenant_id], photo_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(db_error)
    }

    async fn toggle_highlight(
        &self,
        tenant_id: TenantId,
        storage_key: &str,
    ) -> Result<PhotoAsset, ServiceError> {
        let storage_key = storage_key.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let updated = tx.execute(
                    "UPDATE photos SET is_highlight = NOT is_highlight WHERE tenant_id = ?1 AND storage_key = ?2",
                    params![tenant_id, storage_key],
                )?;
                if updated == 0 {
                    tx.execute(
                        "INSERT INTO photos (tenant_id, storage_key, is_highlight) VALUES (?1, ?2, 1)",
                        params![tenant_id, storage_key],
                    )?;
                }
                let photo = select_photo(&tx, tenant_id, &storage_key)?
                    .ok_or(rusqlite::Error::QueryReturnedNoRows)?;
                tx.commit()?;
                Ok(photo)
            })
            .await
            .map_err(db_error)
    }

    async fn face_record(&self, photo_id: PhotoId) -> Result<Option<FaceIndexRecord>, ServiceError> {
        self.conn
            .call(move |conn| Ok(select_face_record(conn, photo_id)?))
            .await
            .map_err(db_error)
    }

    async fn record_faces(
        &self,
        photo_id: PhotoId,
        face_ids: BTreeSet<String>,
    ) -> Result<FaceIndexRecord, ServiceError> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                if let Some(existing) = select_face_record(&tx, photo_id)? {
                    return Ok(existing);
                }
                for face_id in &face_ids {
                    tx.execute(
                        "INSERT OR IGNORE INTO face_records (photo_id, face_id) VALUES (?1, ?2)",
                        params![photo_id, face_id],
                    )?;
                }
                let status = if face_ids.is_empty() {
                    IndexStatus::NoFace
                } else {
                    IndexStatus::Indexed
                };
                let n = tx.execute(
                    "UPDATE photos SET status = ?1 WHERE id = ?2",
                    params![status.as_str(), photo_id],
                )?;
                if n == 0 {
                    return Err(rusqlite::Error::QueryReturnedNoRows.into());
                }
                tx.commit()?;
                Ok(FaceIndexRecord {
                    photo_asset_id: photo_id,
                    face_ids,
                })
            })
            .await
            .map_err(db_error)
    }

    async fn mark_failed(&self, photo_id: PhotoId) -> Result<(), ServiceError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE photos SET status = 'failed' WHERE id = ?1 AND status = 'pending'",
                    params![photo_id],
                )?;
                Ok(())
            })
            .await
            .map_err(db_error)
    }

    async fn face_owners(&self, face_ids: Vec<String>) -> Result<Vec<FaceOwner>, ServiceError> {
        if face_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.conn
            .call(move |conn| {
                let mut owners = Vec::with_capacity(face_ids.len());
                // Stay well below SQLite's bound-parameter limit.
                for chunk in face_ids.chunks(500) {
                    let placeholders = vec!["?"; chunk.len()].join(", ");
                    let mut stmt = conn.prepare(&format!(
                        "SELECT f.face_id, p.id, p.tenant_id, p.status
                         FROM face_records f JOIN photos p ON p.id = f.photo_id
                         WHERE f.face_id IN ({placeholders})"
                    ))?;
                    let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                        let status: String = row.get(3)?;
                        Ok(FaceOwner {
                            face_id: row.get(0)?,
                            photo_asset_id: row.get(1)?,
                            tenant_id: row.get(2)?,
                            status: IndexStatus::parse(&status).ok_or_else(|| {
                                conversion_error(3, format!("unknown index status {status:?}"))
                            })?,
                        })
                    })?;
                    for row in rows {
                        owners.push(row?);
                    }
                }
                Ok(owners)
            })
            .await
            .map_err(db_error)
    }
}
