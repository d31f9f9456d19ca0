//! Session storage - typed persistence for provider work contexts.

use anyhow::Result;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::sync::Arc;

use agentflow_models::Session;

const SESSION_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");

/// Session persistence over the shared redb database.
#[derive(Clone)]
pub struct SessionStorage {
    db: Arc<Database>,
}

impl SessionStorage {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(SESSION_TABLE)?;
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Insert or update a session. Durable once this returns.
    pub fn put(&self, session: &Session) -> Result<()> {
        let data = serde_json::to_vec(session)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SESSION_TABLE)?;
            table.insert(session.id.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Session>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SESSION_TABLE)?;

        match table.get(id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(SESSION_TABLE)?;
            table.remove(id)?.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }

    pub fn list(&self) -> Result<Vec<Session>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SESSION_TABLE)?;

        let mut sessions = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            sessions.push(serde_json::from_slice(value.value())?);
        }
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_db() -> Arc<Database> {
        Arc::new(
            Database::builder()
                .create_with_backend(redb::backends::InMemoryBackend::new())
                .unwrap(),
        )
    }

    #[test]
    fn test_put_and_get_session() {
        let storage = SessionStorage::new(setup_db()).unwrap();

        let session = Session::new("proj-1", "repo-key", "claude");
        storage.put(&session).unwrap();

        let loaded = storage.get(&session.id).unwrap().unwrap();
        assert_eq!(loaded, session);
    }

    #[test]
    fn test_get_missing_session() {
        let storage = SessionStorage::new(setup_db()).unwrap();
        assert!(storage.get("nope").unwrap().is_none());
    }

    #[test]
    fn test_delete_session() {
        let storage = SessionStorage::new(setup_db()).unwrap();

        let session = Session::new("proj-1", "repo-key", "claude");
        storage.put(&session).unwrap();
        assert!(storage.delete(&session.id).unwrap());
        assert!(storage.get(&session.id).unwrap().is_none());
        assert!(!storage.delete(&session.id).unwrap());
    }

    #[test]
    fn test_list_sessions() {
        let storage = SessionStorage::new(setup_db()).unwrap();

        storage.put(&Session::new("p1", "r1", "claude")).unwrap();
        storage.put(&Session::new("p2", "r2", "gemini")).unwrap();

        assert_eq!(storage.list().unwrap().len(), 2);
    }
}
