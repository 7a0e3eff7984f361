use rusqlite::{params, OptionalExtension};

use super::StoreTx;
use crate::relay_metadata::RelayMetadata;
use crate::Error;

impl StoreTx<'_> {
    pub fn relay_metadata_fetched_at(&self, address: &str) -> Result<Option<u64>, Error> {
        let value: Option<Option<i64>> = self
            .tx
            .query_row(
                "SELECT metadata_fetched_at FROM relays WHERE address = ?1",
                params![address],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.flatten().map(|at| at as u64))
    }

    pub fn save_relay_metadata(
        &self,
        address: &str,
        metadata: &RelayMetadata,
        fetched_at: u64,
    ) -> Result<(), Error> {
        let supported_nips = serde_json::to_string(&metadata.supported_nips)?;
        self.tx.execute(
            "INSERT INTO relays (address, name, description, pubkey, contact, supported_nips, software, version, metadata_fetched_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(address) DO UPDATE SET \
               name = excluded.name, \
               description = excluded.description, \
               pubkey = excluded.pubkey, \
               contact = excluded.contact, \
               supported_nips = excluded.supported_nips, \
               software = excluded.software, \
               version = excluded.version, \
               metadata_fetched_at = excluded.metadata_fetched_at",
            params![
                address,
                metadata.name,
                metadata.description,
                metadata.pubkey,
                metadata.contact,
                supported_nips,
                metadata.software,
                metadata.version,
                fetched_at as i64
            ],
        )?;
        Ok(())
    }

    pub fn relay_metadata(&self, address: &str) -> Result<Option<RelayMetadata>, Error> {
        let row = self
            .tx
            .query_row(
                "SELECT name, description, pubkey, contact, supported_nips, software, version \
                 FROM relays WHERE address = ?1",
                params![address],
                |row| {
                    Ok((
                        RelayMetadata {
                            name: row.get(0)?,
                            description: row.get(1)?,
                            pubkey: row.get(2)?,
                            contact: row.get(3)?,
                            supported_nips: Vec::new(),
                            software: row.get(5)?,
                            version: row.get(6)?,
                        },
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((mut metadata, nips)) => {
                if let Some(nips) = nips {
                    metadata.supported_nips = serde_json::from_str(&nips)?;
                }
                Ok(Some(metadata))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn test_relay_metadata_upsert() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(
            store.read(|tx| tx.relay_metadata_fetched_at("wss://a")).unwrap(),
            None
        );

        let mut metadata = RelayMetadata {
            name: Some("a".to_string()),
            supported_nips: vec![1, 11],
            ..RelayMetadata::default()
        };
        store
            .write(|tx| tx.save_relay_metadata("wss://a", &metadata, 100))
            .unwrap();
        metadata.name = Some("renamed".to_string());
        store
            .write(|tx| tx.save_relay_metadata("wss://a", &metadata, 200))
            .unwrap();

        let stored = store.read(|tx| tx.relay_metadata("wss://a")).unwrap().unwrap();
        assert_eq!(stored, metadata);
        assert_eq!(
            store.read(|tx| tx.relay_metadata_fetched_at("wss://a")).unwrap(),
            Some(200)
        );
    }
}
