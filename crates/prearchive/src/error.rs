use xnatctl_session::SessionError;

use crate::entry::{PrearchiveKey, PrearchiveStatus};

#[derive(Debug, thiserror::Error)]
pub enum PrearchiveError {
    #[error("cannot {action} prearchive entry {key} in state {from}")]
    InvalidTransition {
        key: PrearchiveKey,
        from: PrearchiveStatus,
        action: &'static str,
    },

    #[error("prearchive entry {0} not found")]
    NotFound(PrearchiveKey),

    #[error(transparent)]
    Session(#[from] SessionError),
}
