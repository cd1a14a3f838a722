use thiserror::Error;

use crate::{LayerId, UserId};

/// A reducer precondition that did not hold.
///
/// Always recoverable: the server turns it into a rejection, the client
/// into a warning. It never leaves a half-applied state behind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unknown user: {0}")]
    UnknownUser(UserId),
    #[error("layer with id {0} not found")]
    UnknownLayer(LayerId),
    #[error("layer {0} is not a tile layer")]
    NotAGridLayer(LayerId),
    #[error("user {0} has no cursor")]
    NoCursor(UserId),
    #[error("user already exists: {0}")]
    DuplicateUser(UserId),
    #[error("index {index} is out of bounds for layer {layer_id} (len {len})")]
    OutOfBoundsIndex {
        layer_id: LayerId,
        index: usize,
        len: usize,
    },
}
