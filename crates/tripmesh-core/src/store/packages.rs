//! Trip packages
//!
//! A trip package is a full offline snapshot of one group (group row, all
//! cached expenses, computed balances) assembled from cached rows. It is a
//! convenience bundle, not a separate source of truth; `trip_package`
//! rebuilds it when the stored copy is past the staleness window.

use std::time::Duration;

use redb::ReadableTable;
use tracing::debug;

use super::{Store, TRIP_PACKAGES_TABLE};
use crate::error::MeshError;
use crate::types::{GroupId, TripPackage};

impl Store {
    /// Persist a trip package, replacing any previous snapshot for the group.
    pub fn save_trip_package(&self, package: &TripPackage) -> Result<(), MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(TRIP_PACKAGES_TABLE)?;
            let data = serde_json::to_vec(package)?;
            table.insert(package.group_id.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the stored trip package for a group, stale or not.
    pub fn load_trip_package(&self, group_id: &GroupId) -> Result<Option<TripPackage>, MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(TRIP_PACKAGES_TABLE)?;

        match table.get(group_id.as_str())? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    /// Rebuild the package for a group from cached rows and persist it.
    ///
    /// Fails with `GroupNotFound` when the group itself has never been cached.
    pub fn rebuild_trip_package(&self, group_id: &GroupId) -> Result<TripPackage, MeshError> {
        let group = self
            .load_group(group_id)?
            .ok_or_else(|| MeshError::GroupNotFound(group_id.to_string()))?;
        let expenses = self.expenses_for_group(group_id)?;

        let package = TripPackage::build(group, expenses);
        self.save_trip_package(&package)?;
        debug!(group = %group_id, expenses = package.expenses.len(), "Rebuilt trip package");
        Ok(package)
    }

    /// The package for a group, rebuilding when missing or older than the
    /// staleness window.
    pub fn trip_package(
        &self,
        group_id: &GroupId,
        staleness: Duration,
    ) -> Result<TripPackage, MeshError> {
        match self.load_trip_package(group_id)? {
            Some(package) if !package.is_stale(staleness) => Ok(package),
            _ => self.rebuild_trip_package(group_id),
        }
    }

    /// Drop every stored trip package.
    pub fn clear_trip_packages(&self) -> Result<(), MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(TRIP_PACKAGES_TABLE)?;
            let keys: Vec<String> = table
                .iter()?
                .map(|entry| entry.map(|(k, _)| k.value().to_string()))
                .collect::<Result<_, _>>()?;
            for key in keys {
                table.remove(key.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::store::test_util::create_test_store;
    use crate::types::{CachedExpense, CachedGroup, ExpenseSplit, GroupId, MemberId};

    fn seed_group(store: &crate::store::Store) {
        store
            .save_group(&CachedGroup {
                id: GroupId::new("g1"),
                name: "Lisbon".to_string(),
                cached_at: 0,
            })
            .unwrap();
        store
            .save_expense(&CachedExpense::new(
                GroupId::new("g1"),
                "Dinner",
                120,
                MemberId::new("m1"),
                vec![
                    ExpenseSplit {
                        member_id: MemberId::new("m1"),
                        amount: 60,
                    },
                    ExpenseSplit {
                        member_id: MemberId::new("m2"),
                        amount: 60,
                    },
                ],
            ))
            .unwrap();
    }

    #[test]
    fn test_rebuild_and_load() {
        let (store, _temp) = create_test_store();
        seed_group(&store);

        let package = store.rebuild_trip_package(&GroupId::new("g1")).unwrap();
        assert_eq!(package.expenses.len(), 1);
        assert_eq!(package.balance.len(), 2);

        let loaded = store
            .load_trip_package(&GroupId::new("g1"))
            .unwrap()
            .unwrap();
        assert_eq!(loaded, package);
    }

    #[test]
    fn test_unknown_group_fails() {
        let (store, _temp) = create_test_store();
        let err = store.rebuild_trip_package(&GroupId::new("nope"));
        assert!(err.is_err());
    }

    #[test]
    fn test_fresh_package_is_reused() {
        let (store, _temp) = create_test_store();
        seed_group(&store);

        let first = store
            .trip_package(&GroupId::new("g1"), Duration::from_secs(3600))
            .unwrap();
        let second = store
            .trip_package(&GroupId::new("g1"), Duration::from_secs(3600))
            .unwrap();
        // Same snapshot, no rebuild
        assert_eq!(first.cached_at, second.cached_at);
    }

    #[test]
    fn test_stale_package_is_rebuilt() {
        let (store, _temp) = create_test_store();
        seed_group(&store);

        let mut package = store.rebuild_trip_package(&GroupId::new("g1")).unwrap();
        package.cached_at -= 25 * 60 * 60 * 1000;
        store.save_trip_package(&package).unwrap();

        let refreshed = store
            .trip_package(&GroupId::new("g1"), Duration::from_secs(24 * 60 * 60))
            .unwrap();
        assert!(refreshed.cached_at > package.cached_at);
    }
}
