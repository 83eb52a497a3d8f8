//! In-memory view of one scope's tasks
//!
//! Grows monotonically: newly created tasks are prepended and bump the
//! cached total, older pages are appended on demand. No IO happens here;
//! the orchestrator feeds it what the store returns.

use crate::model::GenerationTask;

#[derive(Debug, Clone)]
pub struct WorkingSet {
    scope: String,
    page_size: usize,
    tasks: Vec<GenerationTask>,
    total: usize,
    pages_loaded: usize,
    exhausted: bool,
}

impl WorkingSet {
    /// Start a session with the store's count and first page.
    pub fn open(
        scope: impl Into<String>,
        page_size: usize,
        total: usize,
        first_page: Vec<GenerationTask>,
    ) -> Self {
        let mut set = Self {
            scope: scope.into(),
            page_size: page_size.max(1),
            tasks: Vec::new(),
            total,
            pages_loaded: 0,
            exhausted: false,
        };
        set.merge_page(first_page);
        set
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn tasks(&self) -> &[GenerationTask] {
        &self.tasks
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn pages_loaded(&self) -> usize {
        self.pages_loaded
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Page number the next `load_more` should request.
    pub fn next_page(&self) -> usize {
        self.pages_loaded + 1
    }

    pub fn get(&self, id: &str) -> Option<&GenerationTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Add a task created in this session. Counts toward the total without
    /// a store round trip.
    pub fn prepend(&mut self, task: GenerationTask) {
        if let Some(existing) = self.tasks.iter_mut().find(|t| t.id == task.id) {
            *existing = task;
            return;
        }
        self.tasks.insert(0, task);
        self.total += 1;
    }

    /// Append a page from the store, skipping records already held. Returns
    /// how many were new.
    ///
    /// An empty page ends pagination even if the cached total says more
    /// exists; the store wins.
    pub fn merge_page(&mut self, page: Vec<GenerationTask>) -> usize {
        self.pages_loaded += 1;
        if page.is_empty() {
            self.exhausted = true;
            return 0;
        }

        let before = self.tasks.len();
        for task in page {
            if !self.tasks.iter().any(|t| t.id == task.id) {
                self.tasks.push(task);
            }
        }
        if self.pages_loaded * self.page_size >= self.total {
            self.exhausted = true;
        }
        self.tasks.len() - before
    }

    /// Swap in a newer copy of a task held here. Returns false if absent.
    pub fn replace(&mut self, task: &GenerationTask) -> bool {
        match self.tasks.iter_mut().find(|t| t.id == task.id) {
            Some(slot) => {
                *slot = task.clone();
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<GenerationTask> {
        let index = self.tasks.iter().position(|t| t.id == id)?;
        self.total = self.total.saturating_sub(1);
        Some(self.tasks.remove(index))
    }
}
