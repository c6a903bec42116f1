use super::domain::{JobId, JobPriority};

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    job_id: JobId,
    priority: JobPriority,
}

/// Per-facility job queue ordered by ascending priority value, FIFO within
/// one priority.
#[derive(Debug, Clone, Default)]
pub struct JobQueue {
    entries: Vec<QueueEntry>,
}

impl JobQueue {
    /// Inserts ahead of the first strictly less urgent job and returns the
    /// 1-based position.
    pub fn insert(&mut self, job_id: JobId, priority: JobPriority) -> usize {
        let index = self
            .entries
            .iter()
            .position(|entry| priority < entry.priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(index, QueueEntry { job_id, priority });
        index + 1
    }

    pub fn remove(&mut self, job_id: &JobId) -> bool {
        match self.entries.iter().position(|entry| &entry.job_id == job_id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// 1-based position of `job_id`.
    pub fn position(&self, job_id: &JobId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| &entry.job_id == job_id)
            .map(|index| index + 1)
    }

    pub fn head(&self, count: usize) -> Vec<JobId> {
        self.entries
            .iter()
            .take(count)
            .map(|entry| entry.job_id.clone())
            .collect()
    }

    pub fn job_ids(&self) -> impl Iterator<Item = &JobId> {
        self.entries.iter().map(|entry| &entry.job_id)
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

    fn id(value: &str) -> JobId {
        JobId(value.to_string())
    }

    #[test]
    fn equal_priorities_keep_submission_order() {
        let mut queue = JobQueue::default();
        queue.insert(id("a"), JobPriority::Standard);
        queue.insert(id("b"), JobPriority::Standard);
        queue.insert(id("c"), JobPriority::Standard);

        let order: Vec<&str> = queue.job_ids().map(|job| job.0.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn urgent_jobs_jump_ahead_of_less_urgent_ones() {
        let mut queue = JobQueue::default();
        queue.insert(id("low"), JobPriority::Low);
        queue.insert(id("std"), JobPriority::Standard);
        assert_eq!(queue.insert(id("high-1"), JobPriority::High), 1);
        assert_eq!(queue.insert(id("high-2"), JobPriority::High), 2);
        assert_eq!(queue.insert(id("emergency"), JobPriority::Emergency), 1);

        let order: Vec<&str> = queue.job_ids().map(|job| job.0.as_str()).collect();
        assert_eq!(order, vec!["emergency", "high-1", "high-2", "std", "low"]);
        assert_eq!(queue.position(&id("low")), Some(5));
    }

    #[test]
    fn remove_reports_missing_jobs() {
        let mut queue = JobQueue::default();
        queue.insert(id("a"), JobPriority::Standard);
        assert!(queue.remove(&id("a")));
        assert!(!queue.remove(&id("a")));
        assert!(queue.is_empty());
        assert_eq!(queue.head(3), Vec::<JobId>::new());
    }
}
