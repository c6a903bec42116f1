use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::domain::{TrackingNumber, TrackingRecord};

/// Storage abstraction so the ledger can run against any backing store.
pub trait TrackingStore: Send + Sync {
    fn insert(&self, record: TrackingRecord) -> Result<(), StoreError>;
    fn update(&self, record: TrackingRecord) -> Result<(), StoreError>;
    fn fetch(&self, tracking_number: &TrackingNumber) -> Result<Option<TrackingRecord>, StoreError>;
    fn all(&self) -> Result<Vec<TrackingRecord>, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record already exists")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryTrackingStore {
    records: Arc<Mutex<HashMap<TrackingNumber, TrackingRecord>>>,
}

impl TrackingStore for InMemoryTrackingStore {
    fn insert(&self, record: TrackingRecord) -> Result<(), StoreError> {
        let mut guard = self.records.lock().unwrap_or_else(|err| err.into_inner());
        if guard.contains_key(&record.tracking_number) {
            return Err(StoreError::Conflict);
        }
        guard.insert(record.tracking_number.clone(), record);
        Ok(())
    }

    fn update(&self, record: TrackingRecord) -> Result<(), StoreError> {
        let mut guard = self.records.lock().unwrap_or_else(|err| err.into_inner());
        match guard.get_mut(&record.tracking_number) {
            Some(existing) => {
                *existing = record;
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    fn fetch(&self, tracking_number: &TrackingNumber) -> Result<Option<TrackingRecord>, StoreError> {
        let guard = self.records.lock().unwrap_or_else(|err| err.into_inner());
        Ok(guard.get(tracking_number).cloned())
    }

    fn all(&self) -> Result<Vec<TrackingRecord>, StoreError> {
        let guard = self.records.lock().unwrap_or_else(|err| err.into_inner());
        Ok(guard.values().cloned().collect())
    }
}
