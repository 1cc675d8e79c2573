//! Per-run bookkeeping of what the engine did.

/// What reconciling one source event amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Created { event_id: String },
    Updated { event_id: String },
    /// The mirror already reflected the source.
    Unchanged { event_id: String },
    /// An untagged title+time duplicate was claimed as the mirror.
    Adopted { event_id: String },
    /// A failed insert turned out to race with an existing mirror.
    RaceResolved { event_id: String },
    Deleted { event_id: String },
    /// Cancelled at the source with no mirror in the target.
    NoMirror,
    /// The service refused the insert as a duplicate.
    DuplicateIgnored,
}

/// Action plus the title+time duplicates removed on the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub action: Action,
    pub duplicates_removed: usize,
}

impl From<Action> for Reconciled {
    fn from(action: Action) -> Self {
        Reconciled {
            action,
            duplicates_removed: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceReport {
    pub source_id: String,
    pub pages: usize,
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub adopted: usize,
    pub deleted: usize,
    pub duplicates_removed: usize,
    pub ignored: usize,
    pub cursor_resets: usize,
}

impl SourceReport {
    pub fn new(source_id: &str) -> Self {
        SourceReport {
            source_id: source_id.to_string(),
            ..Default::default()
        }
    }

    pub fn record(&mut self, reconciled: &Reconciled) {
        self.duplicates_removed += reconciled.duplicates_removed;
        match reconciled.action {
            Action::Created { .. } => self.created += 1,
            Action::Updated { .. } | Action::RaceResolved { .. } => self.updated += 1,
            Action::Unchanged { .. } => self.unchanged += 1,
            Action::Adopted { .. } => self.adopted += 1,
            Action::Deleted { .. } => self.deleted += 1,
            Action::NoMirror | Action::DuplicateIgnored => self.ignored += 1,
        }
    }

    /// Target mutations this source caused.
    pub fn mutations(&self) -> usize {
        self.created + self.updated + self.adopted + self.deleted + self.duplicates_removed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub sources: Vec<SourceReport>,
    /// The run stopped early on a termination signal.
    pub cancelled: bool,
}

impl SyncReport {
    /// (created, updated, deleted) across sources. Adoptions count as
    /// updates, removed duplicates as deletions.
    pub fn counts(&self) -> (usize, usize, usize) {
        self.sources.iter().fold((0, 0, 0), |(c, u, d), s| {
            (
                c + s.created,
                u + s.updated + s.adopted,
                d + s.deleted + s.duplicates_removed,
            )
        })
    }

    pub fn unchanged(&self) -> usize {
        self.sources.iter().map(|s| s.unchanged).sum()
    }
}
