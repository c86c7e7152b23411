//! Owner-token authorization.
//!
//! This is a weak model on purpose: callers present an arbitrary token string
//! and the only check is an exact, case-sensitive comparison with the token the
//! document was created with. No identity is verified here.

use std::fmt;

use serde::Serialize;

use crate::index::{Owner, Record};

/// Something a caller wants to do with a document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    ViewMetadata,
    ViewContent,
    Edit,
    Delete,
    Rename,
    Move,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::ViewMetadata => "view metadata of",
            Action::ViewContent => "view",
            Action::Edit => "edit",
            Action::Delete => "delete",
            Action::Rename => "rename",
            Action::Move => "move",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allowed
    }
}

pub fn authorize(record: &Record, supplied_token: Option<&str>, action: Action) -> Decision {
    let token = match &record.owner {
        Owner::Shared => return Decision::Allowed,
        Owner::Restricted(token) => token,
    };
    match action {
        Action::ViewMetadata => Decision::Allowed,
        // personal documents are never bulk-relocated
        Action::Move => Decision::Denied,
        Action::ViewContent | Action::Edit | Action::Delete | Action::Rename => {
            if supplied_token == Some(token.as_str()) {
                Decision::Allowed
            } else {
                Decision::Denied
            }
        }
    }
}
