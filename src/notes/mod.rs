//! Notes on disk: frontmatter parsing, the status state machine and the
//! lifecycle manager that owns every write.

mod frontmatter;
mod lifecycle;
mod status;

pub use frontmatter::{KNOWN_KEYS, Note, is_known_key};
pub use lifecycle::{
    LifecycleError, LifecycleResult, NoteDelta, NoteLifecycleManager, TransitionRecord,
};
pub use status::NoteStatus;
