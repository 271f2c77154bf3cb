use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use spacesync_core::{
    ids::*,
    model::Space,
    operations::{Operation, OperationPayload},
    SpaceField, SpaceFieldValue,
};

use crate::error::StorageError;
use crate::traits::{CachedSpace, OperationStore, QueuedOperation, SpaceCache};

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    fn read_fields(&self, space_id: SpaceId) -> Result<Space, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT field_key, value FROM space_fields WHERE space_id = ?1")?;
        let rows = stmt.query_map(rusqlite::params![space_id.as_bytes().as_slice()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut space = Space::empty(space_id);
        for row in rows {
            let (key, bytes) = row?;
            let value = SpaceFieldValue::from_msgpack(&bytes)?;
            if value.field() != SpaceField::parse(&key)? {
                return Err(StorageError::Serialization(format!(
                    "field {key} holds a {} value",
                    value.field().as_str()
                )));
            }
            value.apply_to(&mut space);
        }
        Ok(space)
    }
}

fn upsert_space_row(
    tx: &rusqlite::Transaction,
    space_id: SpaceId,
    cached_at: i64,
) -> Result<(), StorageError> {
    tx.execute(
        "INSERT INTO spaces (space_id, cached_at) VALUES (?1, ?2)
         ON CONFLICT(space_id) DO UPDATE SET cached_at = excluded.cached_at",
        rusqlite::params![space_id.as_bytes().as_slice(), cached_at],
    )?;
    Ok(())
}

fn upsert_field(
    tx: &rusqlite::Transaction,
    space_id: SpaceId,
    value: &SpaceFieldValue,
) -> Result<(), StorageError> {
    let bytes = value.to_msgpack()?;
    tx.execute(
        "INSERT INTO space_fields (space_id, field_key, value) VALUES (?1, ?2, ?3)
         ON CONFLICT(space_id, field_key) DO UPDATE SET value = excluded.value",
        rusqlite::params![
            space_id.as_bytes().as_slice(),
            value.field().as_str(),
            bytes,
        ],
    )?;
    Ok(())
}

impl SpaceCache for SqliteStorage {
    fn write_field(
        &mut self,
        space_id: SpaceId,
        value: &SpaceFieldValue,
        cached_at: i64,
    ) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        upsert_space_row(&tx, space_id, cached_at)?;
        upsert_field(&tx, space_id, value)?;
        tx.commit()?;
        debug!(space = %space_id, field = value.field().as_str(), "cached space field");
        Ok(())
    }

    fn save_space(&mut self, space: &Space, cached_at: i64) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        upsert_space_row(&tx, space.id, cached_at)?;
        tx.execute(
            "UPDATE spaces SET removed_at = NULL WHERE space_id = ?1",
            rusqlite::params![space.id.as_bytes().as_slice()],
        )?;
        for value in SpaceFieldValue::split(space) {
            upsert_field(&tx, space.id, &value)?;
        }
        tx.commit()?;
        debug!(space = %space.id, cards = space.cards.len(), "saved space snapshot");
        Ok(())
    }

    fn load_space(&self, space_id: SpaceId) -> Result<Option<CachedSpace>, StorageError> {
        let cached_at: Option<i64> = self
            .conn
            .query_row(
                "SELECT cached_at FROM spaces WHERE space_id = ?1 AND removed_at IS NULL",
                rusqlite::params![space_id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;

        match cached_at {
            Some(cached_at) => Ok(Some(CachedSpace {
                space: self.read_fields(space_id)?,
                cached_at,
            })),
            None => Ok(None),
        }
    }

    fn remove_space(&mut self, space_id: SpaceId, removed_at: i64) -> Result<(), StorageError> {
        let changed = self.conn.execute(
            "UPDATE spaces SET removed_at = ?1 WHERE space_id = ?2",
            rusqlite::params![removed_at, space_id.as_bytes().as_slice()],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(space_id.to_string()));
        }
        Ok(())
    }

    fn restore_space(&mut self, space_id: SpaceId) -> Result<(), StorageError> {
        let changed = self.conn.execute(
            "UPDATE spaces SET removed_at = NULL WHERE space_id = ?1",
            rusqlite::params![space_id.as_bytes().as_slice()],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(space_id.to_string()));
        }
        Ok(())
    }

    fn remove_space_permanent(&mut self, space_id: SpaceId) -> Result<(), StorageError> {
        self.conn.execute(
            "DELETE FROM spaces WHERE space_id = ?1",
            rusqlite::params![space_id.as_bytes().as_slice()],
        )?;
        Ok(())
    }

    fn all_spaces(&self) -> Result<Vec<CachedSpace>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT space_id, cached_at FROM spaces WHERE removed_at IS NULL ORDER BY cached_at, rowid",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut result = Vec::with_capacity(rows.len());
        for (id_bytes, cached_at) in rows {
            let space_id = SpaceId::from_bytes(to_array::<16>(id_bytes, "space_id")?);
            result.push(CachedSpace {
                space: self.read_fields(space_id)?,
                cached_at,
            });
        }
        Ok(result)
    }
}

impl OperationStore for SqliteStorage {
    fn push_operation(&mut self, operation: &Operation) -> Result<i64, StorageError> {
        let payload = operation.payload.to_msgpack()?;
        self.conn.execute(
            "INSERT INTO op_queue (op_id, op_name, payload, enqueued_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                operation.op_id.as_bytes().as_slice(),
                operation.name(),
                payload,
                operation.enqueued_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn pending_operations(&self) -> Result<Vec<QueuedOperation>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT seq, op_id, payload, enqueued_at FROM op_queue ORDER BY seq")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut result = Vec::with_capacity(rows.len());
        for (seq, op_id_bytes, payload_bytes, enqueued_at) in rows {
            let op_id = OpId::from_bytes(to_array::<16>(op_id_bytes, "op_id")?);
            let payload = OperationPayload::from_msgpack(&payload_bytes)?;
            result.push(QueuedOperation {
                seq,
                operation: Operation {
                    op_id,
                    payload,
                    enqueued_at,
                },
            });
        }
        Ok(result)
    }

    fn remove_operations_through(&mut self, seq: i64) -> Result<usize, StorageError> {
        let removed = self
            .conn
            .execute("DELETE FROM op_queue WHERE seq <= ?1", rusqlite::params![seq])?;
        Ok(removed)
    }

    fn pending_count(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM op_queue", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
