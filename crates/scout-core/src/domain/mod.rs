//! Domain model (IDs, params, status, results, events).

pub mod events;
pub mod ids;
pub mod outcome;
pub mod spec;
pub mod state;

pub use events::{TaskEvent, TaskEventKind};
pub use ids::{ParseIdError, TaskId};
pub use outcome::{Citation, ResearchResult};
pub use spec::{ParamsError, Priority, ResearchParams, SearchEngine, normalize_url, validate_question};
pub use state::TaskStatus;
