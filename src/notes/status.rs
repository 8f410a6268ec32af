//! Note status state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteStatus {
    Inbox,
    Promoted,
    Published,
    Archived,
}

impl NoteStatus {
    pub const ALL: [NoteStatus; 4] = [
        NoteStatus::Inbox,
        NoteStatus::Promoted,
        NoteStatus::Published,
        NoteStatus::Archived,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NoteStatus::Inbox => "inbox",
            NoteStatus::Promoted => "promoted",
            NoteStatus::Published => "published",
            NoteStatus::Archived => "archived",
        }
    }

    /// Statuses reachable from `self` in one step.
    pub fn allowed_targets(self) -> &'static [NoteStatus] {
        match self {
            NoteStatus::Inbox => &[NoteStatus::Promoted, NoteStatus::Archived],
            NoteStatus::Promoted => &[
                NoteStatus::Published,
                NoteStatus::Inbox,
                NoteStatus::Archived,
            ],
            NoteStatus::Published => &[NoteStatus::Archived],
            NoteStatus::Archived => &[NoteStatus::Inbox],
        }
    }

    pub fn can_transition_to(self, target: NoteStatus) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// Frontmatter key stamped when a note enters this status.
    pub fn timestamp_field(self) -> Option<&'static str> {
        match self {
            NoteStatus::Promoted => Some("processed_date"),
            NoteStatus::Published => Some("promoted_date"),
            NoteStatus::Archived => Some("archived_date"),
            NoteStatus::Inbox => None,
        }
    }
}

impl fmt::Display for NoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NoteStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inbox" => Ok(NoteStatus::Inbox),
            "promoted" => Ok(NoteStatus::Promoted),
            "published" => Ok(NoteStatus::Published),
            "archived" => Ok(NoteStatus::Archived),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use NoteStatus::*;
        let allowed = [
            (Inbox, Promoted),
            (Inbox, Archived),
            (Promoted, Published),
            (Promoted, Inbox),
            (Promoted, Archived),
            (Published, Archived),
            (Archived, Inbox),
        ];
        for from in NoteStatus::ALL {
            for to in NoteStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_parse_status() {
        assert_eq!("Inbox".parse::<NoteStatus>(), Ok(NoteStatus::Inbox));
        assert_eq!(" published ".parse::<NoteStatus>(), Ok(NoteStatus::Published));
        assert!("draft".parse::<NoteStatus>().is_err());
    }
}
