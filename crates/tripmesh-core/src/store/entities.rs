//! Cached entity collections
//!
//! Groups, expenses, members, and document metadata are denormalized
//! last-write-wins copies keyed by their own id. Expenses and members carry a
//! `group_id` secondary index, documents an owner index, so range scans per
//! group/owner do not walk the whole table.
//!
//! Upserts keep the index in step with the row: when a put moves a row to a
//! different index value, the stale index entry is removed in the same
//! transaction.

use redb::{ReadableMultimapTable, ReadableTable};

use super::{
    Store, DOCUMENTS_TABLE, DOCUMENT_OWNER_IDX, EXPENSES_TABLE, EXPENSE_GROUP_IDX, GROUPS_TABLE,
    MEMBERS_TABLE, MEMBER_GROUP_IDX,
};
use crate::error::MeshError;
use crate::types::{
    CachedDocument, CachedExpense, CachedGroup, CachedMember, ExpenseId, GroupId, MemberId,
};

impl Store {
    // ═══════════════════════════════════════════════════════════════════════
    // Group Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Upsert a cached group row.
    pub fn save_group(&self, group: &CachedGroup) -> Result<(), MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(GROUPS_TABLE)?;
            let data = serde_json::to_vec(group)?;
            table.insert(group.id.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load a cached group by id. Returns `None` if not cached.
    pub fn load_group(&self, group_id: &GroupId) -> Result<Option<CachedGroup>, MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(GROUPS_TABLE)?;

        match table.get(group_id.as_str())? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    /// List all cached groups.
    pub fn list_groups(&self) -> Result<Vec<CachedGroup>, MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(GROUPS_TABLE)?;

        let mut groups = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            groups.push(serde_json::from_slice(value.value())?);
        }
        Ok(groups)
    }

    /// Delete a cached group row (expenses/members are removed separately).
    pub fn delete_group(&self, group_id: &GroupId) -> Result<(), MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(GROUPS_TABLE)?;
            table.remove(group_id.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Drop every cached group row.
    pub fn clear_groups(&self) -> Result<(), MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(GROUPS_TABLE)?;
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

    // ═══════════════════════════════════════════════════════════════════════
    // Expense Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Upsert a cached expense, maintaining the group index.
    pub fn save_expense(&self, expense: &CachedExpense) -> Result<(), MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(EXPENSES_TABLE)?;
            let mut index = write_txn.open_multimap_table(EXPENSE_GROUP_IDX)?;

            // Drop the stale index entry if the row moved between groups
            if let Some(existing) = table.get(expense.id.as_str())? {
                let old: CachedExpense = serde_json::from_slice(existing.value())?;
                if old.group_id != expense.group_id {
                    index.remove(old.group_id.as_str(), expense.id.as_str())?;
                }
            }

            let data = serde_json::to_vec(expense)?;
            table.insert(expense.id.as_str(), data.as_slice())?;
            index.insert(expense.group_id.as_str(), expense.id.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load a cached expense by id. Returns `None` if not cached.
    pub fn load_expense(&self, expense_id: &ExpenseId) -> Result<Option<CachedExpense>, MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(EXPENSES_TABLE)?;

        match table.get(expense_id.as_str())? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    /// All cached expenses for a group, via the secondary index,
    /// ordered by expense id (ULIDs sort by creation time).
    pub fn expenses_for_group(&self, group_id: &GroupId) -> Result<Vec<CachedExpense>, MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let index = read_txn.open_multimap_table(EXPENSE_GROUP_IDX)?;
        let table = read_txn.open_table(EXPENSES_TABLE)?;

        let mut expenses = Vec::new();
        for id in index.get(group_id.as_str())? {
            let id = id?;
            if let Some(v) = table.get(id.value())? {
                expenses.push(serde_json::from_slice::<CachedExpense>(v.value())?);
            }
        }
        expenses.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        Ok(expenses)
    }

    /// All cached expenses across every group.
    pub fn list_expenses(&self) -> Result<Vec<CachedExpense>, MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(EXPENSES_TABLE)?;

        let mut expenses = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            expenses.push(serde_json::from_slice(value.value())?);
        }
        Ok(expenses)
    }

    /// Delete a cached expense and its index entry.
    pub fn delete_expense(&self, expense_id: &ExpenseId) -> Result<(), MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(EXPENSES_TABLE)?;
            let mut index = write_txn.open_multimap_table(EXPENSE_GROUP_IDX)?;

            let removed = table.remove(expense_id.as_str())?;
            if let Some(existing) = removed {
                let old: CachedExpense = serde_json::from_slice(existing.value())?;
                index.remove(old.group_id.as_str(), expense_id.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Drop every cached expense and the whole group index.
    pub fn clear_expenses(&self) -> Result<(), MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(EXPENSES_TABLE)?;
            let mut index = write_txn.open_multimap_table(EXPENSE_GROUP_IDX)?;

            let mut rows = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                let expense: CachedExpense = serde_json::from_slice(value.value())?;
                rows.push((key.value().to_string(), expense.group_id));
            }
            for (id, group) in rows {
                table.remove(id.as_str())?;
                index.remove(group.as_str(), id.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Member Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Upsert a cached member, maintaining the group index.
    pub fn save_member(&self, member: &CachedMember) -> Result<(), MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(MEMBERS_TABLE)?;
            let mut index = write_txn.open_multimap_table(MEMBER_GROUP_IDX)?;

            if let Some(existing) = table.get(member.id.as_str())? {
                let old: CachedMember = serde_json::from_slice(existing.value())?;
                if old.group_id != member.group_id {
                    index.remove(old.group_id.as_str(), member.id.as_str())?;
                }
            }

            let data = serde_json::to_vec(member)?;
            table.insert(member.id.as_str(), data.as_slice())?;
            index.insert(member.group_id.as_str(), member.id.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load a cached member by id. Returns `None` if not cached.
    pub fn load_member(&self, member_id: &MemberId) -> Result<Option<CachedMember>, MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(MEMBERS_TABLE)?;

        match table.get(member_id.as_str())? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    /// All cached members of a group, via the secondary index.
    pub fn members_for_group(&self, group_id: &GroupId) -> Result<Vec<CachedMember>, MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let index = read_txn.open_multimap_table(MEMBER_GROUP_IDX)?;
        let table = read_txn.open_table(MEMBERS_TABLE)?;

        let mut members = Vec::new();
        for id in index.get(group_id.as_str())? {
            let id = id?;
            if let Some(v) = table.get(id.value())? {
                members.push(serde_json::from_slice::<CachedMember>(v.value())?);
            }
        }
        Ok(members)
    }

    /// Delete a cached member and its index entry.
    pub fn delete_member(&self, member_id: &MemberId) -> Result<(), MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(MEMBERS_TABLE)?;
            let mut index = write_txn.open_multimap_table(MEMBER_GROUP_IDX)?;

            let removed = table.remove(member_id.as_str())?;
            if let Some(existing) = removed {
                let old: CachedMember = serde_json::from_slice(existing.value())?;
                index.remove(old.group_id.as_str(), member_id.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Drop every cached member and the whole group index.
    pub fn clear_members(&self) -> Result<(), MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(MEMBERS_TABLE)?;
            let mut index = write_txn.open_multimap_table(MEMBER_GROUP_IDX)?;

            let mut rows = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                let member: CachedMember = serde_json::from_slice(value.value())?;
                rows.push((key.value().to_string(), member.group_id));
            }
            for (id, group) in rows {
                table.remove(id.as_str())?;
                index.remove(group.as_str(), id.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Document Metadata Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Upsert cached document metadata, maintaining the owner index.
    pub fn save_document(&self, doc: &CachedDocument) -> Result<(), MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(DOCUMENTS_TABLE)?;
            let mut index = write_txn.open_multimap_table(DOCUMENT_OWNER_IDX)?;

            if let Some(existing) = table.get(doc.id.as_str())? {
                let old: CachedDocument = serde_json::from_slice(existing.value())?;
                if old.owner_id != doc.owner_id {
                    index.remove(old.owner_id.as_str(), doc.id.as_str())?;
                }
            }

            let data = serde_json::to_vec(doc)?;
            table.insert(doc.id.as_str(), data.as_slice())?;
            index.insert(doc.owner_id.as_str(), doc.id.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load cached document metadata by id. Returns `None` if not cached.
    pub fn load_document(&self, doc_id: &str) -> Result<Option<CachedDocument>, MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(DOCUMENTS_TABLE)?;

        match table.get(doc_id)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    /// All cached documents owned by a member, via the owner index.
    pub fn documents_for_owner(&self, owner: &MemberId) -> Result<Vec<CachedDocument>, MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let index = read_txn.open_multimap_table(DOCUMENT_OWNER_IDX)?;
        let table = read_txn.open_table(DOCUMENTS_TABLE)?;

        let mut docs = Vec::new();
        for id in index.get(owner.as_str())? {
            let id = id?;
            if let Some(v) = table.get(id.value())? {
                docs.push(serde_json::from_slice::<CachedDocument>(v.value())?);
            }
        }
        Ok(docs)
    }

    /// Delete cached document metadata and its index entry.
    pub fn delete_document(&self, doc_id: &str) -> Result<(), MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(DOCUMENTS_TABLE)?;
            let mut index = write_txn.open_multimap_table(DOCUMENT_OWNER_IDX)?;

            let removed = table.remove(doc_id)?;
            if let Some(existing) = removed {
                let old: CachedDocument = serde_json::from_slice(existing.value())?;
                index.remove(old.owner_id.as_str(), doc_id)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Drop every cached document and the whole owner index.
    pub fn clear_documents(&self) -> Result<(), MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(DOCUMENTS_TABLE)?;
            let mut index = write_txn.open_multimap_table(DOCUMENT_OWNER_IDX)?;

            let mut rows = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                let doc: CachedDocument = serde_json::from_slice(value.value())?;
                rows.push((key.value().to_string(), doc.owner_id));
            }
            for (id, owner) in rows {
                table.remove(id.as_str())?;
                index.remove(owner.as_str(), id.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::store::test_util::create_test_store;
    use crate::types::{
        CachedDocument, CachedExpense, CachedGroup, CachedMember, ExpenseSplit, GroupId, MemberId,
    };

    fn sample_expense(group: &str) -> CachedExpense {
        CachedExpense::new(
            GroupId::new(group),
            "Ferry tickets",
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
        )
    }

    #[test]
    fn test_save_and_load_group() {
        let (store, _temp) = create_test_store();

        let group = CachedGroup {
            id: GroupId::new("g1"),
            name: "Lisbon trip".to_string(),
            cached_at: 0,
        };
        store.save_group(&group).unwrap();

        let loaded = store.load_group(&GroupId::new("g1")).unwrap().unwrap();
        assert_eq!(loaded.name, "Lisbon trip");
        assert!(store.load_group(&GroupId::new("other")).unwrap().is_none());
    }

    #[test]
    fn test_expense_group_index() {
        let (store, _temp) = create_test_store();

        let e1 = sample_expense("g1");
        let e2 = sample_expense("g1");
        let e3 = sample_expense("g2");
        store.save_expense(&e1).unwrap();
        store.save_expense(&e2).unwrap();
        store.save_expense(&e3).unwrap();

        let g1 = store.expenses_for_group(&GroupId::new("g1")).unwrap();
        assert_eq!(g1.len(), 2);
        let g2 = store.expenses_for_group(&GroupId::new("g2")).unwrap();
        assert_eq!(g2.len(), 1);
        assert_eq!(g2[0].id, e3.id);
    }

    #[test]
    fn test_expense_upsert_moves_index() {
        let (store, _temp) = create_test_store();

        let mut expense = sample_expense("g1");
        store.save_expense(&expense).unwrap();

        expense.group_id = GroupId::new("g2");
        store.save_expense(&expense).unwrap();

        assert!(store
            .expenses_for_group(&GroupId::new("g1"))
            .unwrap()
            .is_empty());
        assert_eq!(
            store.expenses_for_group(&GroupId::new("g2")).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_delete_expense_cleans_index() {
        let (store, _temp) = create_test_store();

        let expense = sample_expense("g1");
        store.save_expense(&expense).unwrap();
        store.delete_expense(&expense.id).unwrap();

        assert!(store.load_expense(&expense.id).unwrap().is_none());
        assert!(store
            .expenses_for_group(&GroupId::new("g1"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_expenses_ordered_by_id() {
        let (store, _temp) = create_test_store();

        let first = sample_expense("g1");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = sample_expense("g1");
        // Insert out of order; the scan re-sorts by id
        store.save_expense(&second).unwrap();
        store.save_expense(&first).unwrap();

        let expenses = store.expenses_for_group(&GroupId::new("g1")).unwrap();
        assert_eq!(expenses[0].id, first.id);
        assert_eq!(expenses[1].id, second.id);
    }

    #[test]
    fn test_clear_expenses_empties_table_and_index() {
        let (store, _temp) = create_test_store();

        store.save_expense(&sample_expense("g1")).unwrap();
        store.save_expense(&sample_expense("g2")).unwrap();
        assert_eq!(store.list_expenses().unwrap().len(), 2);

        store.clear_expenses().unwrap();
        assert!(store.list_expenses().unwrap().is_empty());
        assert!(store
            .expenses_for_group(&GroupId::new("g1"))
            .unwrap()
            .is_empty());
        assert!(store
            .expenses_for_group(&GroupId::new("g2"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_members_for_group() {
        let (store, _temp) = create_test_store();

        let member = CachedMember {
            id: MemberId::new("m1"),
            group_id: GroupId::new("g1"),
            display_name: "Alice".to_string(),
        };
        store.save_member(&member).unwrap();

        let members = store.members_for_group(&GroupId::new("g1")).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].display_name, "Alice");

        store.delete_member(&member.id).unwrap();
        assert!(store
            .members_for_group(&GroupId::new("g1"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_documents_for_owner() {
        let (store, _temp) = create_test_store();

        let doc = CachedDocument {
            id: "d1".to_string(),
            owner_id: MemberId::new("m1"),
            name: "passport.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            size: 4096,
            uploaded_at: 0,
        };
        store.save_document(&doc).unwrap();

        let docs = store.documents_for_owner(&MemberId::new("m1")).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].name, "passport.pdf");

        store.delete_document("d1").unwrap();
        assert!(store
            .documents_for_owner(&MemberId::new("m1"))
            .unwrap()
            .is_empty());
    }
}
