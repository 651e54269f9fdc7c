//! Pending submissions awaiting a successful turn

use serde::{Deserialize, Serialize};

/// Separator used when queued inputs form one instruction
pub const INSTRUCTION_SEPARATOR: &str = "; ";

/// Where a submission came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    /// Typed text input
    Text,
    /// Recognized speech
    Voice,
    /// Button press without text
    Button,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Text => "text",
            TriggerSource::Voice => "voice",
            TriggerSource::Button => "button",
        }
    }
}

/// One queued input
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedInput {
    /// Unique within its queue, increasing in submission order
    pub id: u64,
    pub text: String,
    pub source: TriggerSource,
}

/// Ordered inputs waiting to be incorporated into a turn
///
/// Inputs leave the queue only through [`SubmissionQueue::remove_ids`], which
/// the coordinator calls after the turn that consumed them succeeded.
#[derive(Clone, Debug, Default)]
pub struct SubmissionQueue {
    entries: Vec<QueuedInput>,
    next_id: u64,
}

impl SubmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an input and return its id
    pub fn push(&mut self, text: impl Into<String>, source: TriggerSource) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(QueuedInput {
            id,
            text: text.into(),
            source,
        });
        id
    }

    /// Snapshot of the current contents: ids and joined instruction
    pub fn snapshot(&self) -> (Vec<u64>, String) {
        let ids = self.entries.iter().map(|e| e.id).collect();
        (ids, self.instruction())
    }

    /// Queue contents joined into one instruction, blank entries skipped
    pub fn instruction(&self) -> String {
        self.entries
            .iter()
            .map(|e| e.text.trim())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join(INSTRUCTION_SEPARATOR)
    }

    /// Remove exactly the given entries, keeping everything else in order
    pub fn remove_ids(&mut self, ids: &[u64]) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !ids.contains(&e.id));
        before - self.entries.len()
    }

    pub fn texts(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.text.clone()).collect()
    }

    pub fn entries(&self) -> &[QueuedInput] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruction_joins_in_order() {
        let mut queue = SubmissionQueue::new();
        queue.push("add a cube", TriggerSource::Text);
        queue.push("make it red", TriggerSource::Voice);

        let (ids, instruction) = queue.snapshot();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(instruction, "add a cube; make it red");
    }

    #[test]
    fn test_remove_only_snapshot_ids() {
        let mut queue = SubmissionQueue::new();
        queue.push("a", TriggerSource::Text);
        queue.push("b", TriggerSource::Text);
        let (ids, _) = queue.snapshot();
        queue.push("c", TriggerSource::Text);

        assert_eq!(queue.remove_ids(&ids), 2);
        assert_eq!(queue.texts(), vec!["c".to_string()]);
    }

    #[test]
    fn test_duplicate_texts_are_distinct_entries() {
        let mut queue = SubmissionQueue::new();
        let first = queue.push("same", TriggerSource::Text);
        queue.push("same", TriggerSource::Text);

        queue.remove_ids(&[first]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.entries()[0].id, 1);
    }

    #[test]
    fn test_button_entries_do_not_add_separators() {
        let mut queue = SubmissionQueue::new();
        queue.push("", TriggerSource::Button);
        queue.push("about lighting", TriggerSource::Text);
        queue.push("", TriggerSource::Button);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.instruction(), "about lighting");
    }

    #[test]
    fn test_empty_queue() {
        let queue = SubmissionQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.instruction(), "");
    }
}
