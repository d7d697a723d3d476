//! Read-only projection of the task list for presentation layers.
//!
//! The model is an ordered list of rows the manager appends to as downloads
//! are added. It is never authoritative: byte counts and finished flags are
//! pushed into it from task events, and status strings are resolved from the
//! owning task at snapshot time.

use std::path::Path;

use crate::download::task::TaskId;

/// One row of the download list.
#[derive(Debug, Clone)]
pub struct ModelRow {
    pub id: TaskId,
    pub file_name: String,
    pub received: u64,
    pub total: u64,
    pub finished: bool,
    /// Display state ("Queued", "Active", "Paused", "Done", "Error",
    /// "Canceled"); filled at snapshot time.
    pub status: String,
    pub queue_name: String,
    pub category: String,
}

impl ModelRow {
    /// Fractional progress in `[0, 1]`; 0 while the total is unknown.
    #[must_use]
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let p = self.received as f64 / self.total as f64;
            p.min(1.0)
        }
    }
}

/// Sortable row fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    FileName,
    BytesReceived,
    BytesTotal,
    QueueName,
    Category,
    Status,
}

impl std::str::FromStr for SortField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fileName" => Ok(Self::FileName),
            "bytesReceived" => Ok(Self::BytesReceived),
            "bytesTotal" => Ok(Self::BytesTotal),
            "queueName" => Ok(Self::QueueName),
            "category" => Ok(Self::Category),
            "status" => Ok(Self::Status),
            _ => Err(format!("unknown sort field: {s}")),
        }
    }
}

/// Ordered projection of all downloads.
#[derive(Debug, Default)]
pub struct DownloadModel {
    rows: Vec<ModelRow>,
}

impl DownloadModel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Appends a row for a newly created task.
    pub fn add(&mut self, id: TaskId, file_path: &Path, queue_name: &str, category: &str) {
        self.rows.push(ModelRow {
            id,
            file_name: file_path.display().to_string(),
            received: 0,
            total: 0,
            finished: false,
            status: String::new(),
            queue_name: queue_name.to_string(),
            category: category.to_string(),
        });
    }

    fn row_mut(&mut self, id: TaskId) -> Option<&mut ModelRow> {
        self.rows.iter_mut().find(|r| r.id == id)
    }

    pub fn update_progress(&mut self, id: TaskId, received: u64, total: u64) {
        if let Some(row) = self.row_mut(id) {
            row.received = received;
            row.total = total;
        }
    }

    pub fn set_finished(&mut self, id: TaskId, finished: bool) {
        if let Some(row) = self.row_mut(id) {
            row.finished = finished;
        }
    }

    pub fn update_metadata(&mut self, id: TaskId, queue_name: &str, category: &str) {
        if let Some(row) = self.row_mut(id) {
            row.queue_name = queue_name.to_string();
            row.category = category.to_string();
        }
    }

    pub fn update_file_name(&mut self, id: TaskId, file_path: &Path) {
        if let Some(row) = self.row_mut(id) {
            row.file_name = file_path.display().to_string();
        }
    }

    pub fn remove(&mut self, id: TaskId) {
        self.rows.retain(|r| r.id != id);
    }

    #[must_use]
    pub fn is_finished(&self, id: TaskId) -> bool {
        self.rows.iter().any(|r| r.id == id && r.finished)
    }

    /// Task ids of all rows marked finished.
    #[must_use]
    pub fn finished_ids(&self) -> Vec<TaskId> {
        self.rows.iter().filter(|r| r.finished).map(|r| r.id).collect()
    }

    /// Stably sorts rows by `field`. `status_of` resolves the live display
    /// state for a row's task.
    pub fn sort_by(&mut self, field: SortField, ascending: bool, status_of: impl Fn(TaskId) -> String) {
        self.rows.sort_by(|a, b| {
            let ordering = match field {
                SortField::FileName => a.file_name.to_lowercase().cmp(&b.file_name.to_lowercase()),
                SortField::BytesReceived => a.received.cmp(&b.received),
                SortField::BytesTotal => a.total.cmp(&b.total),
                SortField::QueueName => a.queue_name.to_lowercase().cmp(&b.queue_name.to_lowercase()),
                SortField::Category => a.category.to_lowercase().cmp(&b.category.to_lowercase()),
                SortField::Status => status_of(a.id)
                    .to_lowercase()
                    .cmp(&status_of(b.id).to_lowercase()),
            };
            if ascending { ordering } else { ordering.reverse() }
        });
    }

    /// Clones the rows, resolving live status strings.
    #[must_use]
    pub fn snapshot(&self, status_of: impl Fn(TaskId) -> String) -> Vec<ModelRow> {
        self.rows
            .iter()
            .map(|row| {
                let mut row = row.clone();
                row.status = status_of(row.id);
                row
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn model_with_rows() -> DownloadModel {
        let mut model = DownloadModel::new();
        model.add(TaskId(1), &PathBuf::from("/d/beta.bin"), "General", "Other");
        model.add(TaskId(2), &PathBuf::from("/d/alpha.bin"), "Media", "Video");
        model.add(TaskId(3), &PathBuf::from("/d/gamma.bin"), "General", "Audio");
        model
    }

    #[test]
    fn test_rows_keep_insertion_order() {
        let model = model_with_rows();
        let rows = model.snapshot(|_| String::new());
        assert_eq!(rows[0].id, TaskId(1));
        assert_eq!(rows[1].id, TaskId(2));
        assert_eq!(rows[2].id, TaskId(3));
    }

    #[test]
    fn test_sort_by_file_name() {
        let mut model = model_with_rows();
        model.sort_by(SortField::FileName, true, |_| String::new());
        let rows = model.snapshot(|_| String::new());
        assert_eq!(rows[0].file_name, "/d/alpha.bin");
        assert_eq!(rows[2].file_name, "/d/gamma.bin");

        model.sort_by(SortField::FileName, false, |_| String::new());
        let rows = model.snapshot(|_| String::new());
        assert_eq!(rows[0].file_name, "/d/gamma.bin");
    }

    #[test]
    fn test_sort_by_status_uses_resolver() {
        let mut model = model_with_rows();
        model.sort_by(SortField::Status, true, |id| match id {
            TaskId(1) => "Paused".to_string(),
            TaskId(2) => "Active".to_string(),
            _ => "Done".to_string(),
        });
        let rows = model.snapshot(|_| String::new());
        assert_eq!(rows[0].id, TaskId(2));
        assert_eq!(rows[1].id, TaskId(3));
        assert_eq!(rows[2].id, TaskId(1));
    }

    #[test]
    fn test_progress_fraction() {
        let mut model = model_with_rows();
        model.update_progress(TaskId(1), 50, 200);
        let rows = model.snapshot(|_| String::new());
        assert!((rows[0].progress() - 0.25).abs() < f64::EPSILON);
        // Unknown total reports zero progress.
        assert!((rows[1].progress()).abs() < f64::EPSILON);
    }

    #[test]
    fn test_remove_and_finished_ids() {
        let mut model = model_with_rows();
        model.set_finished(TaskId(2), true);
        assert_eq!(model.finished_ids(), vec![TaskId(2)]);
        model.remove(TaskId(2));
        assert_eq!(model.len(), 2);
        assert!(model.finished_ids().is_empty());
    }
}
