use std::collections::HashSet;

use dashmap::DashMap;
use tracing::instrument;

use session_domain::{Result, StoreError};

use crate::types::{
    new_id, Branch, BranchComparison, BranchMerge, BranchNode, BranchStats, BranchStatus,
    MergeStrategy, Message,
};

use super::BranchStore;

/// In-memory branch DAG. Messages are keyed by branch id, mirroring the
/// SQL backend's `messages.branch_id` column.
pub struct MemoryBranchStore {
    branches: DashMap<String, Branch>,
    messages: DashMap<String, Vec<Message>>,
}

impl MemoryBranchStore {
    pub fn new() -> Self {
        Self {
            branches: DashMap::new(),
            messages: DashMap::new(),
        }
    }

    fn own_messages(&self, branch_id: &str) -> Vec<Message> {
        self.messages.get(branch_id).map(|v| v.clone()).unwrap_or_default()
    }

    fn has_primary(&self, session_id: &str) -> bool {
        self.branches
            .iter()
            .any(|b| b.session_id == session_id && b.is_primary)
    }

    /// Path from `id` (index 0) up to the root, with cycle detection
    /// (spec §4.6 "Cycle detection is required on the ancestor walk").
    fn ancestor_chain(&self, id: &str) -> Result<Vec<Branch>> {
        let mut path = Vec::new();
        let mut visited = HashSet::new();
        let mut cur = self.get(id)?;
        loop {
            if !visited.insert(cur.id.clone()) {
                break;
            }
            let parent_id = cur.parent_branch_id.clone();
            path.push(cur.clone());
            match parent_id {
                Some(pid) => cur = self.get(&pid)?,
                None => break,
            }
        }
        Ok(path)
    }
}

impl Default for MemoryBranchStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BranchStore for MemoryBranchStore {
    #[instrument(skip(self, branch), fields(session_id = %branch.session_id))]
    fn create(&self, branch: Branch) -> Result<Branch> {
        if let Some(parent_id) = &branch.parent_branch_id {
            if !self.branches.contains_key(parent_id) {
                return Err(StoreError::NotFound(format!("branch {parent_id}")));
            }
        }
        if branch.is_primary && self.has_primary(&branch.session_id) {
            return Err(StoreError::Conflict(format!(
                "session {} already has a primary branch",
                branch.session_id
            )));
        }
        self.branches.insert(branch.id.clone(), branch.clone());
        Ok(branch)
    }

    fn get(&self, id: &str) -> Result<Branch> {
        self.branches
            .get(id)
            .map(|b| b.clone())
            .ok_or_else(|| StoreError::NotFound(format!("branch {id}")))
    }

    fn fork(&self, parent_id: &str, branch_point: i64, name: &str) -> Result<Branch> {
        let parent = self.get(parent_id)?;
        let branch = Branch::fork(parent.session_id, parent.id, branch_point, name);
        self.create(branch)
    }

    #[instrument(skip(self, message), fields(branch_id))]
    fn append_message(&self, branch_id: &str, mut message: Message) -> Result<Message> {
        let mut branch = self.get(branch_id)?;
        if !branch.is_writable() {
            return Err(StoreError::Conflict(format!(
                "branch {branch_id} is {} and rejects appends",
                branch.status.as_str()
            )));
        }
        message.id = new_id();
        message.branch_id = Some(branch_id.to_string());
        message.created_at = chrono::Utc::now();

        let mut entry = self.messages.entry(branch_id.to_string()).or_default();
        // Continue the parent's sequence scale from `branch_point` rather than
        // restarting at 1, so `merge`'s `sequence_num > branch_point` filter
        // (same absolute scale) keeps exactly the messages appended after the fork.
        let next_seq = entry.last().map(|m| m.sequence_num + 1).unwrap_or(branch.branch_point + 1);
        message.sequence_num = next_seq;
        entry.push(message.clone());
        drop(entry);

        branch.updated_at = chrono::Utc::now();
        self.branches.insert(branch_id.to_string(), branch);
        Ok(message.deep_clone())
    }

    fn get_branch_history(&self, id: &str, limit: i64) -> Result<Vec<Message>> {
        // path[0] = target, path[last] = root.
        let path = self.ancestor_chain(id)?;
        let mut tagged: Vec<(usize, Message)> = Vec::new();
        for (depth, branch) in path.iter().enumerate() {
            if depth == 0 {
                for m in self.own_messages(&branch.id) {
                    tagged.push((0, m));
                }
            } else {
                let child = &path[depth - 1];
                for m in self.own_messages(&branch.id) {
                    if m.sequence_num <= child.branch_point {
                        tagged.push((depth, m));
                    }
                }
            }
        }
        // Deepest ancestor (furthest from target) first, then newer
        // children, target's own messages last (spec §4.6 "GetBranchHistory").
        tagged.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.sequence_num.cmp(&b.1.sequence_num)));
        let all: Vec<Message> = tagged.into_iter().map(|(_, m)| m).collect();
        if limit <= 0 {
            return Ok(all);
        }
        let limit = limit as usize;
        let start = all.len().saturating_sub(limit);
        Ok(all[start..].to_vec())
    }

    fn get_own_messages(&self, id: &str, limit: i64) -> Result<Vec<Message>> {
        self.get(id)?;
        let all = self.own_messages(id);
        if limit <= 0 {
            return Ok(all);
        }
        let limit = limit as usize;
        let start = all.len().saturating_sub(limit);
        Ok(all[start..].to_vec())
    }

    #[instrument(skip(self))]
    fn merge(&self, source_id: &str, target_id: &str, strategy: MergeStrategy) -> Result<BranchMerge> {
        let mut source = self.get(source_id)?;
        if source.is_primary {
            return Err(StoreError::Conflict("primary branch cannot be merged".into()));
        }
        if source.status != BranchStatus::Active {
            return Err(StoreError::Conflict(format!(
                "source branch {source_id} is not active"
            )));
        }
        let mut target = self.get(target_id)?;

        let target_max_seq = self
            .own_messages(target_id)
            .last()
            .map(|m| m.sequence_num)
            .unwrap_or(0);

        let to_copy: Vec<Message> = self
            .own_messages(source_id)
            .into_iter()
            .filter(|m| m.sequence_num > source.branch_point)
            .collect();

        let now = chrono::Utc::now();
        let mut target_entry = self.messages.entry(target_id.to_string()).or_default();
        let source_seq_start = to_copy.first().map(|m| m.sequence_num);
        let source_seq_end = to_copy.last().map(|m| m.sequence_num);
        let message_count = to_copy.len() as i64;
        for (offset, mut m) in to_copy.into_iter().enumerate() {
            m.id = new_id();
            m.branch_id = Some(target_id.to_string());
            m.sequence_num = target_max_seq + offset as i64 + 1;
            target_entry.push(m);
        }
        drop(target_entry);

        source.status = BranchStatus::Merged;
        source.merged_at = Some(now);
        source.updated_at = now;
        target.updated_at = now;
        self.branches.insert(source_id.to_string(), source);
        self.branches.insert(target_id.to_string(), target);

        let record = BranchMerge {
            id: new_id(),
            source_branch_id: source_id.to_string(),
            target_branch_id: target_id.to_string(),
            strategy,
            source_sequence_start: source_seq_start.unwrap_or(0),
            source_sequence_end: source_seq_end,
            target_sequence_insert: target_max_seq + 1,
            message_count,
            metadata: Default::default(),
            merged_at: now,
            merged_by: None,
        };
        Ok(record)
    }

    fn archive(&self, id: &str) -> Result<()> {
        let mut branch = self.get(id)?;
        if branch.is_primary {
            return Err(StoreError::Conflict("primary branch cannot be archived".into()));
        }
        branch.status = BranchStatus::Archived;
        branch.updated_at = chrono::Utc::now();
        self.branches.insert(id.to_string(), branch);
        Ok(())
    }

    fn delete(&self, id: &str, delete_messages: bool) -> Result<()> {
        let branch = self.get(id)?;
        if branch.is_primary {
            return Err(StoreError::Conflict("primary branch cannot be deleted".into()));
        }
        if delete_messages {
            self.messages.remove(id);
        }
        self.branches.remove(id);
        Ok(())
    }

    fn get_branch_tree(&self, session_id: &str) -> Result<Vec<BranchNode>> {
        let root = self
            .branches
            .iter()
            .find(|b| b.session_id == session_id && b.parent_branch_id.is_none())
            .map(|b| b.clone())
            .ok_or_else(|| StoreError::NotFound(format!("root branch for session {session_id}")))?;

        let mut out = Vec::new();
        let mut stack = vec![(root, 0usize)];
        while let Some((branch, depth)) = stack.pop() {
            let children: Vec<Branch> = self
                .branches
                .iter()
                .filter(|b| b.parent_branch_id.as_deref() == Some(branch.id.as_str()))
                .map(|b| b.clone())
                .collect();
            out.push(BranchNode { branch: branch.clone(), depth });
            for child in children {
                stack.push((child, depth + 1));
            }
        }
        out.sort_by_key(|n| n.depth);
        Ok(out)
    }

    fn get_full_branch_path(&self, id: &str) -> Result<Vec<Branch>> {
        let mut path = self.ancestor_chain(id)?;
        path.reverse();
        Ok(path)
    }

    fn compare(&self, source_id: &str, target_id: &str) -> Result<BranchComparison> {
        let source_ahead = self.own_messages(source_id).len() as i64;
        let target_ahead = self.own_messages(target_id).len() as i64;

        let source_path = self.ancestor_chain(source_id)?;
        let target_path = self.ancestor_chain(target_id)?;
        let source_ids: HashSet<&str> = source_path.iter().map(|b| b.id.as_str()).collect();
        let common_ancestor = target_path
            .iter()
            .find(|b| source_ids.contains(b.id.as_str()))
            .map(|b| b.id.clone());

        Ok(BranchComparison { source_ahead, target_ahead, common_ancestor })
    }

    fn stats(&self, id: &str) -> Result<BranchStats> {
        self.get(id)?;
        let own = self.own_messages(id);
        let own_count = own.len() as i64;
        let last_message_at = own.last().map(|m| m.created_at);
        let child_branch_count = self
            .branches
            .iter()
            .filter(|b| b.parent_branch_id.as_deref() == Some(id))
            .count() as i64;
        let total_with_inherited = self.get_branch_history(id, 0)?.len() as i64;
        Ok(BranchStats { own_count, child_branch_count, total_with_inherited, last_message_at })
    }

    fn ensure_primary_branch(&self, session_id: &str) -> Result<Branch> {
        if let Some(existing) = self
            .branches
            .iter()
            .find(|b| b.session_id == session_id && b.is_primary)
        {
            return Ok(existing.clone());
        }
        self.create(Branch::new_primary(session_id))
    }

    fn migrate_session_to_branches(&self, session_id: &str, mut orphan_messages: Vec<Message>) -> Result<Branch> {
        let primary = self.ensure_primary_branch(session_id)?;
        orphan_messages.sort_by_key(|m| m.created_at);

        let mut entry = self.messages.entry(primary.id.clone()).or_default();
        let mut next_seq = entry.last().map(|m| m.sequence_num + 1).unwrap_or(primary.branch_point + 1);
        for mut m in orphan_messages {
            m.branch_id = Some(primary.id.clone());
            m.sequence_num = next_seq;
            next_seq += 1;
            entry.push(m);
        }
        Ok(primary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, Role};

    fn msg(branch: &str, content: &str) -> Message {
        let mut m = Message::new("session", "c", "cid", Direction::Inbound, Role::User, content);
        m.branch_id = Some(branch.to_string());
        m
    }

    #[test]
    fn fork_inherits_lazily_without_copying() {
        let store = MemoryBranchStore::new();
        let primary = store.create(Branch::new_primary("s1")).unwrap();
        for i in 0..5 {
            store.append_message(&primary.id, msg(&primary.id, &format!("m{i}"))).unwrap();
        }
        let feature = store.fork(&primary.id, 3, "feature").unwrap();
        assert_eq!(store.get_own_messages(&feature.id, 0).unwrap().len(), 0);

        let history = store.get_branch_history(&feature.id, 0).unwrap();
        // messages 1..=3 inherited from primary (branch_point=3), none from feature yet.
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn scenario_fork_then_append_then_history_is_ordered_root_first() {
        let store = MemoryBranchStore::new();
        let primary = store.create(Branch::new_primary("s1")).unwrap();
        for i in 0..3 {
            store.append_message(&primary.id, msg(&primary.id, &format!("root{i}"))).unwrap();
        }
        let feature = store.fork(&primary.id, 3, "feature").unwrap();
        store.append_message(&feature.id, msg(&feature.id, "leaf0")).unwrap();

        let history = store.get_branch_history(&feature.id, 0).unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history.last().unwrap().content, "leaf0");
    }

    #[test]
    fn one_primary_per_session_is_enforced() {
        let store = MemoryBranchStore::new();
        store.create(Branch::new_primary("s1")).unwrap();
        let err = store.create(Branch::new_primary("s1")).unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[test]
    fn merge_copies_past_branch_point_and_marks_source_merged() {
        let store = MemoryBranchStore::new();
        let primary = store.create(Branch::new_primary("s1")).unwrap();
        for i in 0..2 {
            store.append_message(&primary.id, msg(&primary.id, &format!("root{i}"))).unwrap();
        }
        let feature = store.fork(&primary.id, 2, "feature").unwrap();
        for i in 0..3 {
            store.append_message(&feature.id, msg(&feature.id, &format!("feat{i}"))).unwrap();
        }
        let record = store.merge(&feature.id, &primary.id, MergeStrategy::Continue).unwrap();
        assert_eq!(record.message_count, 3);

        let merged_source = store.get(&feature.id).unwrap();
        assert_eq!(merged_source.status, BranchStatus::Merged);

        let target_own = store.get_own_messages(&primary.id, 0).unwrap();
        assert_eq!(target_own.len(), 5);
        assert_eq!(target_own[2].sequence_num, 3);
    }

    #[test]
    fn primary_cannot_be_archived_or_deleted() {
        let store = MemoryBranchStore::new();
        let primary = store.create(Branch::new_primary("s1")).unwrap();
        assert!(store.archive(&primary.id).is_err());
        assert!(store.delete(&primary.id, false).is_err());
    }

    #[test]
    fn merged_branch_rejects_further_appends() {
        let store = MemoryBranchStore::new();
        let primary = store.create(Branch::new_primary("s1")).unwrap();
        let feature = store.fork(&primary.id, 0, "feature").unwrap();
        store.merge(&feature.id, &primary.id, MergeStrategy::Continue).unwrap();
        let err = store.append_message(&feature.id, msg(&feature.id, "late")).unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[test]
    fn branch_tree_assigns_depth_from_root() {
        let store = MemoryBranchStore::new();
        let primary = store.create(Branch::new_primary("s1")).unwrap();
        let child = store.fork(&primary.id, 0, "child").unwrap();
        let _grandchild = store.fork(&child.id, 0, "grandchild").unwrap();

        let tree = store.get_branch_tree("s1").unwrap();
        assert_eq!(tree.len(), 3);
        assert_eq!(tree[0].depth, 0);
        assert_eq!(tree.last().unwrap().depth, 2);
    }

    #[test]
    fn migrate_session_to_branches_numbers_chronologically() {
        let store = MemoryBranchStore::new();
        let mut later = Message::new("s1", "c", "cid", Direction::Inbound, Role::User, "later");
        later.created_at = chrono::Utc::now();
        let mut earlier = Message::new("s1", "c", "cid", Direction::Inbound, Role::User, "earlier");
        earlier.created_at = later.created_at - chrono::Duration::seconds(10);

        let primary = store.migrate_session_to_branches("s1", vec![later, earlier]).unwrap();
        let history = store.get_own_messages(&primary.id, 0).unwrap();
        assert_eq!(history[0].content, "earlier");
        assert_eq!(history[1].content, "later");
        assert_eq!(history[0].sequence_num, 1);
        assert_eq!(history[1].sequence_num, 2);
    }
}
