use chrono::{DateTime, Utc};

use super::domain::{Capabilities, RelayFacility, RelayId};

/// Facilities in registration order. Registration order breaks ties in
/// selection, so the list is never reordered.
#[derive(Debug, Clone, Default)]
pub struct RelayRegistry {
    relays: Vec<RelayFacility>,
}

impl RelayRegistry {
    /// Production print network.
    pub fn default_network(now: DateTime<Utc>) -> Self {
        let mut registry = Self::default();
        for relay in [
            RelayFacility::new(
                "DHA_CENTRAL",
                "DHA Central Printing Hub",
                "Pretoria",
                10_000,
                1,
                Capabilities::from_tags(["PASSPORT", "ID_CARD", "PERMIT", "CERTIFICATE"]),
                now,
            ),
            RelayFacility::new(
                "GWP_MAIN",
                "Government Warehouse & Printing",
                "Johannesburg",
                50_000,
                2,
                Capabilities::All,
                now,
            ),
            RelayFacility::new(
                "REGIONAL_WEST",
                "Western Cape Regional Facility",
                "Cape Town",
                5_000,
                3,
                Capabilities::from_tags(["PERMIT", "CERTIFICATE", "EVISA"]),
                now,
            ),
            RelayFacility::new(
                "REGIONAL_EAST",
                "KwaZulu-Natal Regional Facility",
                "Durban",
                5_000,
                3,
                Capabilities::from_tags(["PERMIT", "CERTIFICATE"]),
                now,
            ),
        ] {
            registry.register(relay);
        }
        registry
    }

    /// Adds a facility; returns `false` if the id is already registered.
    pub fn register(&mut self, relay: RelayFacility) -> bool {
        if self.get(&relay.id).is_some() {
            return false;
        }
        self.relays.push(relay);
        true
    }

    pub fn get(&self, id: &RelayId) -> Option<&RelayFacility> {
        self.relays.iter().find(|relay| &relay.id == id)
    }

    pub fn get_mut(&mut self, id: &RelayId) -> Option<&mut RelayFacility> {
        self.relays.iter_mut().find(|relay| &relay.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RelayFacility> {
        self.relays.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RelayFacility> {
        self.relays.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    /// Picks the facility for a document: the preferred one when it is online
    /// and capable, otherwise the capable online facility with the lowest
    /// load score.
    pub fn select(&self, document_type: &str, preferred: Option<&RelayId>) -> Option<&RelayFacility> {
        if let Some(relay) = preferred
            .and_then(|id| self.get(id))
            .filter(|relay| relay.accepts(document_type))
        {
            return Some(relay);
        }

        self.relays
            .iter()
            .filter(|relay| relay.accepts(document_type))
            .fold(None, |best: Option<&RelayFacility>, candidate| match best {
                Some(current) if current.load_score() <= candidate.load_score() => Some(current),
                _ => Some(candidate),
            })
    }
}
